//! Runner configuration

use crate::codec::LineTerminator;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Settings shared by every handler the runner starts
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    /// Requested interpreter, e.g. `python3.11`
    #[serde(default = "default_runtime")]
    pub runtime: String,

    /// Script that loads the handler inside the child and prints the
    /// payload frame
    #[serde(default = "default_companion_script")]
    pub companion_script: PathBuf,

    /// Directory handler paths are resolved against; the host's cwd if unset
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Per-invocation timeout, `0` waits forever
    #[serde(default = "default_invocation_timeout_ms")]
    pub invocation_timeout_ms: u64,

    #[serde(default)]
    pub line_terminator: LineTerminator,

    /// Variables layered over the host environment for every child
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            companion_script: default_companion_script(),
            working_dir: None,
            invocation_timeout_ms: default_invocation_timeout_ms(),
            line_terminator: LineTerminator::default(),
            environment: HashMap::new(),
        }
    }
}

fn default_runtime() -> String {
    "python3".to_string()
}

fn default_companion_script() -> PathBuf {
    PathBuf::from("invoke.py")
}

fn default_invocation_timeout_ms() -> u64 {
    30_000
}

impl RunnerConfig {
    pub fn invocation_timeout(&self) -> Option<Duration> {
        (self.invocation_timeout_ms > 0).then(|| Duration::from_millis(self.invocation_timeout_ms))
    }

    pub fn working_dir(&self) -> PathBuf {
        match &self.working_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Companion script path, absolute when configured relative
    pub fn companion_script_path(&self) -> PathBuf {
        if self.companion_script.is_absolute() {
            self.companion_script.clone()
        } else {
            self.working_dir().join(&self.companion_script)
        }
    }
}
