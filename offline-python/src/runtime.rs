//! Runtime resolution
//!
//! Turns a requested interpreter version into the executable, argument list
//! and environment a handler process is started with.

use offline_core::{HandlerIdentity, Platform};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Flag asking the interpreter for unbuffered stdio
pub const UNBUFFERED_FLAG: &str = "-u";

/// Executable used on Windows regardless of the requested version
pub const WINDOWS_EXECUTABLE: &str = "python.exe";

/// Marker variable set by an activated virtual environment
pub const VIRTUAL_ENV_VAR: &str = "VIRTUAL_ENV";

pub const PATH_VAR: &str = "PATH";

/// Requested interpreter plus the platform it runs on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuntimeDescriptor {
    pub runtime: String,
    pub platform: Platform,
}

impl RuntimeDescriptor {
    /// Descriptor for the host platform
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            platform: Platform::host(),
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Executable name for this runtime.
    ///
    /// Only the segment before the first dot is used, so `python3.9`
    /// resolves to `python3`.
    pub fn executable(&self) -> String {
        match self.platform {
            Platform::Windows => WINDOWS_EXECUTABLE.to_string(),
            Platform::Unix => self
                .runtime
                .split('.')
                .next()
                .unwrap_or_default()
                .to_string(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.runtime
    }
}

/// Everything needed to start one handler process
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: PathBuf,
    pub platform: Platform,
}

impl LaunchSpec {
    /// Resolve the launch for `identity` against the host environment
    pub fn resolve(
        descriptor: &RuntimeDescriptor,
        companion_script: &Path,
        working_dir: &Path,
        identity: &HandlerIdentity,
        overrides: &HashMap<String, String>,
    ) -> Self {
        Self::resolve_with_env(
            descriptor,
            companion_script,
            working_dir,
            identity,
            std::env::vars(),
            overrides,
        )
    }

    /// Resolve the launch against an explicit host environment
    pub fn resolve_with_env(
        descriptor: &RuntimeDescriptor,
        companion_script: &Path,
        working_dir: &Path,
        identity: &HandlerIdentity,
        host_env: impl IntoIterator<Item = (String, String)>,
        overrides: &HashMap<String, String>,
    ) -> Self {
        let args = vec![
            UNBUFFERED_FLAG.to_string(),
            companion_script.to_string_lossy().into_owned(),
            relative_handler_path(working_dir, &identity.module_path),
            identity.entry_point.clone(),
        ];

        Self {
            program: descriptor.executable(),
            args,
            env: child_environment(host_env, overrides, descriptor.platform),
            working_dir: working_dir.to_path_buf(),
            platform: descriptor.platform,
        }
    }

    pub fn path_var(&self) -> Option<&str> {
        self.env.get(PATH_VAR).map(String::as_str)
    }
}

/// Express the handler module path relative to the working directory
pub fn relative_handler_path(working_dir: &Path, module_path: &str) -> String {
    let path = Path::new(module_path);
    if path.is_absolute() {
        if let Some(relative) = pathdiff::diff_paths(path, working_dir) {
            return relative.to_string_lossy().into_owned();
        }
    }
    module_path.to_string()
}

/// Host environment merged with `overrides` (overrides win).
///
/// When a virtual environment is active its executable directory is
/// prepended to `PATH`.
pub fn child_environment(
    host_env: impl IntoIterator<Item = (String, String)>,
    overrides: &HashMap<String, String>,
    platform: Platform,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = host_env.into_iter().collect();
    env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

    if let Some(venv) = env.get(VIRTUAL_ENV_VAR).filter(|v| !v.is_empty()) {
        let bin_dir = Path::new(venv).join(platform.venv_bin_dir());
        let bin_dir = bin_dir.to_string_lossy().into_owned();
        let path = match env.get(PATH_VAR) {
            Some(existing) => format!("{}{}{}", bin_dir, platform.path_delimiter(), existing),
            None => bin_dir,
        };
        env.insert(PATH_VAR.to_string(), path);
    }

    env
}
