//! Test utilities for driving real handler processes
//!
//! `sh` stands in for the interpreter: the runtime is `sh`, so a child is
//! started as `sh -u <companion> <handler> <entry point>` and the companion
//! is a small shell script written to a temporary directory.

#![allow(dead_code)]

use offline_core::HandlerIdentity;
use offline_python::{LineTerminator, OutputSink, RunnerConfig, RunnerService};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Replies to every request with the request itself as payload
pub const ECHO_COMPANION: &str = r#"
while IFS= read -r line; do
  echo "booting"
  printf '{"__offline_payload__": %s}\n' "$line"
done
"#;

/// Replies with the child's pid and the arguments it was started with
pub const IDENTITY_COMPANION: &str = r#"
while IFS= read -r line; do
  printf '{"__offline_payload__": {"pid": %s, "handler": "%s", "entry": "%s"}}\n' "$$" "$1" "$2"
done
"#;

/// Records handler output
#[derive(Debug, Default)]
pub struct CollectingSink {
    stdout: Mutex<Vec<String>>,
    stderr: Mutex<Vec<String>>,
}

impl CollectingSink {
    pub fn stdout(&self) -> Vec<String> {
        self.stdout.lock().unwrap().clone()
    }

    pub fn stderr(&self) -> Vec<String> {
        self.stderr.lock().unwrap().clone()
    }

    /// Wait until `line` shows up on the relayed stdout
    pub async fn wait_for_stdout(&self, line: &str) -> bool {
        wait_until(|| self.stdout().iter().any(|l| l == line)).await
    }

    /// Wait until anything shows up on the relayed stderr
    pub async fn wait_for_any_stderr(&self) -> bool {
        wait_until(|| !self.stderr().is_empty()).await
    }

    /// Wait until `line` shows up on the relayed stderr
    pub async fn wait_for_stderr(&self, line: &str) -> bool {
        wait_until(|| self.stderr().iter().any(|l| l == line)).await
    }
}

impl OutputSink for CollectingSink {
    fn stdout_line(&self, _handler: &HandlerIdentity, line: &str) {
        self.stdout.lock().unwrap().push(line.to_string());
    }

    fn stderr_text(&self, _handler: &HandlerIdentity, text: &str) {
        self.stderr.lock().unwrap().push(text.to_string());
    }
}

pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// A runner service backed by a shell companion script
pub struct TestRunner {
    pub service: RunnerService,
    pub sink: Arc<CollectingSink>,
    dir: TempDir,
}

impl TestRunner {
    pub fn start(companion: &str) -> Self {
        Self::start_with(companion, |_| {})
    }

    pub fn start_with(companion: &str, configure: impl FnOnce(&mut RunnerConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("companion.sh");
        std::fs::write(&script, companion).unwrap();

        let mut config = RunnerConfig {
            runtime: "sh".to_string(),
            companion_script: script,
            working_dir: Some(dir.path().to_path_buf()),
            invocation_timeout_ms: 10_000,
            line_terminator: LineTerminator::Lf,
            ..Default::default()
        };
        configure(&mut config);

        let sink = Arc::new(CollectingSink::default());
        let service = RunnerService::with_sink(config, sink.clone());

        Self { service, sink, dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn dir_path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}
