//! Handler process lifecycle
//!
//! Starts handler processes through the host shell and guarantees they are
//! terminated. Each child is owned by a reaper task; the supervisor keeps a
//! kill switch per child. Dropping the supervisor, or calling
//! [`ProcessSupervisor::shutdown`], kills every child it started.

use crate::runtime::{LaunchSpec, RuntimeDescriptor};
use dashmap::DashMap;
use offline_core::{HandlerIdentity, Platform};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// Process start errors
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Executable not found: {executable}")]
    ExecutableNotFound {
        executable: String,
        #[source]
        source: which::Error,
    },

    #[error("Failed to start process: {0}")]
    Io(#[from] std::io::Error),

    #[error("Process started without a piped {0}")]
    MissingStream(&'static str),

    #[error("Supervisor is shutting down")]
    ShuttingDown,
}

/// Exit description published once a child has been reaped
pub type ExitState = Option<String>;

/// A freshly started handler process.
///
/// The OS handle stays with the supervisor; the caller gets the stdio
/// streams and an exit notification.
#[derive(Debug)]
pub struct SpawnedChild {
    pub pid: Option<u32>,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
    pub exit: watch::Receiver<ExitState>,
}

struct KillSwitch {
    kill: oneshot::Sender<()>,
    exit: watch::Receiver<ExitState>,
}

type Children = DashMap<u64, KillSwitch>;

/// Starts handler processes and tears them down
pub struct ProcessSupervisor {
    companion_script: PathBuf,
    working_dir: PathBuf,
    children: Arc<Children>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl ProcessSupervisor {
    pub fn new(companion_script: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            companion_script: companion_script.into(),
            working_dir: working_dir.into(),
            children: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Resolve how `identity` would be launched, without starting it
    pub fn launch_spec(
        &self,
        descriptor: &RuntimeDescriptor,
        identity: &HandlerIdentity,
        env: &HashMap<String, String>,
    ) -> LaunchSpec {
        LaunchSpec::resolve(
            descriptor,
            &self.companion_script,
            &self.working_dir,
            identity,
            env,
        )
    }

    /// Start the handler process for `identity`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        &self,
        descriptor: &RuntimeDescriptor,
        identity: &HandlerIdentity,
        env: &HashMap<String, String>,
    ) -> Result<SpawnedChild, SpawnError> {
        let launch = self.launch_spec(descriptor, identity, env);
        self.spawn_launch(&launch, identity)
    }

    /// Start a process from an already resolved launch
    pub fn spawn_launch(
        &self,
        launch: &LaunchSpec,
        identity: &HandlerIdentity,
    ) -> Result<SpawnedChild, SpawnError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SpawnError::ShuttingDown);
        }

        which::which_in(&launch.program, launch.path_var(), &launch.working_dir).map_err(
            |source| SpawnError::ExecutableNotFound {
                executable: launch.program.clone(),
                source,
            },
        )?;

        let (shell, shell_args) = shell_invocation(launch);
        debug!(
            handler = %identity,
            shell = %shell,
            args = ?shell_args,
            "Spawning handler process"
        );

        let mut child = Command::new(shell)
            .args(&shell_args)
            .env_clear()
            .envs(&launch.env)
            .current_dir(&launch.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id();
        let stdin = child.stdin.take().ok_or(SpawnError::MissingStream("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::MissingStream("stdout"))?;
        let stderr = child.stderr.take().ok_or(SpawnError::MissingStream("stderr"))?;

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.children.insert(
            id,
            KillSwitch {
                kill: kill_tx,
                exit: exit_rx.clone(),
            },
        );
        tokio::spawn(reap(
            id,
            child,
            identity.clone(),
            kill_rx,
            exit_tx,
            Arc::downgrade(&self.children),
        ));

        info!(
            handler = %identity,
            pid = ?pid,
            program = %launch.program,
            "Started handler process"
        );

        Ok(SpawnedChild {
            pid,
            stdin,
            stdout,
            stderr,
            exit: exit_rx,
        })
    }

    /// Number of children still running
    pub fn running(&self) -> usize {
        self.children.len()
    }

    /// Kill every child and wait until each has been reaped.
    ///
    /// Later spawns fail with [`SpawnError::ShuttingDown`].
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let ids: Vec<u64> = self.children.iter().map(|entry| *entry.key()).collect();
        let mut pending = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, switch)) = self.children.remove(&id) {
                let _ = switch.kill.send(());
                pending.push(switch.exit);
            }
        }

        if !pending.is_empty() {
            info!(count = pending.len(), "Stopping handler processes");
        }
        for mut exit in pending {
            let _ = exit.wait_for(Option::is_some).await;
        }
    }
}

/// Own `child` until it exits or is told to die
async fn reap(
    id: u64,
    mut child: Child,
    identity: HandlerIdentity,
    kill: oneshot::Receiver<()>,
    exit: watch::Sender<ExitState>,
    children: Weak<Children>,
) {
    let pid = child.id();

    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill => None,
    };

    let status = match exited {
        Some(status) => status,
        None => {
            debug!(handler = %identity, pid = ?pid, "Killing handler process");
            if let Err(e) = child.start_kill() {
                warn!(handler = %identity, error = %e, "Failed to kill handler process");
            }
            child.wait().await
        }
    };

    let state = match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("wait failed: {e}"),
    };

    if let Some(children) = children.upgrade() {
        children.remove(&id);
    }

    info!(handler = %identity, pid = ?pid, status = %state, "Handler process exited");
    let _ = exit.send(Some(state));
}

/// Wrap the launch in the host shell
fn shell_invocation(launch: &LaunchSpec) -> (&'static str, Vec<String>) {
    let command_line = std::iter::once(launch.program.as_str())
        .chain(launch.args.iter().map(String::as_str))
        .map(|arg| quote(arg, launch.platform))
        .collect::<Vec<_>>()
        .join(" ");

    match launch.platform {
        Platform::Windows => ("cmd", vec!["/C".to_string(), command_line]),
        // exec so the kill switch reaches the interpreter, not the shell
        Platform::Unix => ("sh", vec!["-c".to_string(), format!("exec {command_line}")]),
    }
}

fn quote(arg: &str, platform: Platform) -> String {
    let plain = !arg.is_empty()
        && arg.chars().all(|c| {
            c.is_ascii_alphanumeric()
                || "-_./=:@+,".contains(c)
                || (c == '\\' && platform == Platform::Windows)
        });
    if plain {
        return arg.to_string();
    }

    match platform {
        Platform::Windows => format!("\"{}\"", arg.replace('"', "\"\"")),
        Platform::Unix => format!("'{}'", arg.replace('\'', r"'\''")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn launch(program: &str, args: &[&str], platform: Platform) -> LaunchSpec {
        LaunchSpec {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
            working_dir: PathBuf::from("."),
            platform,
        }
    }

    #[test]
    fn test_shell_invocation_unix() {
        let spec = launch(
            "python3",
            &["-u", "/opt/invoke.py", "handlers/it's here", "main"],
            Platform::Unix,
        );
        let (shell, args) = shell_invocation(&spec);

        assert_eq!(shell, "sh");
        assert_eq!(args[0], "-c");
        assert_eq!(
            args[1],
            r"exec python3 -u /opt/invoke.py 'handlers/it'\''s here' main"
        );
    }

    #[test]
    fn test_shell_invocation_windows() {
        let spec = launch("python.exe", &["-u", "C:\\My Code\\invoke.py"], Platform::Windows);
        let (shell, args) = shell_invocation(&spec);

        assert_eq!(shell, "cmd");
        assert_eq!(args, vec!["/C", "python.exe -u \"C:\\My Code\\invoke.py\""]);
    }

    #[test]
    fn test_quote_empty_argument() {
        assert_eq!(quote("", Platform::Unix), "''");
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let supervisor = ProcessSupervisor::new("invoke.py", Path::new("."));
        let descriptor = RuntimeDescriptor::new("definitely-not-an-interpreter-7f3a.1")
            .with_platform(Platform::Unix);

        let result = supervisor.spawn(
            &descriptor,
            &HandlerIdentity::new("app", "handler"),
            &HashMap::new(),
        );
        assert!(matches!(
            result,
            Err(SpawnError::ExecutableNotFound { ref executable, .. })
                if executable == "definitely-not-an-interpreter-7f3a"
        ));
        assert_eq!(supervisor.running(), 0);
    }

    #[tokio::test]
    async fn test_spawn_after_shutdown_fails() {
        let supervisor = ProcessSupervisor::new("invoke.py", ".");
        supervisor.shutdown().await;

        let result = supervisor.spawn(
            &RuntimeDescriptor::new("python3"),
            &HandlerIdentity::new("app", "handler"),
            &HashMap::new(),
        );
        assert!(matches!(result, Err(SpawnError::ShuttingDown)));
    }
}
