//! Handler identity and host platform

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one invocable handler: the module path plus the entry point
/// inside it.
///
/// Two invocations with equal identities share a child process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandlerIdentity {
    pub module_path: String,
    pub entry_point: String,
}

impl HandlerIdentity {
    pub fn new(module_path: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self {
            module_path: module_path.into(),
            entry_point: entry_point.into(),
        }
    }

    /// Parse a `path/to/module.function` handler string.
    ///
    /// The entry point is everything after the last dot.
    pub fn parse(handler: &str) -> Option<Self> {
        let (module_path, entry_point) = handler.rsplit_once('.')?;
        if module_path.is_empty() || entry_point.is_empty() {
            return None;
        }
        Some(Self::new(module_path, entry_point))
    }
}

impl fmt::Display for HandlerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module_path, self.entry_point)
    }
}

/// Platform family the host (and therefore the child) runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Windows,
    Unix,
}

impl Platform {
    /// Platform of the running host
    pub fn host() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Unix
        }
    }

    /// Line terminator conventionally emitted on this platform
    pub fn line_terminator(self) -> &'static str {
        match self {
            Self::Windows => "\r\n",
            Self::Unix => "\n",
        }
    }

    /// Separator between entries of a PATH-like variable
    pub fn path_delimiter(self) -> char {
        match self {
            Self::Windows => ';',
            Self::Unix => ':',
        }
    }

    /// Subdirectory of a virtual environment that holds its executables
    pub fn venv_bin_dir(self) -> &'static str {
        match self {
            Self::Windows => "Scripts",
            Self::Unix => "bin",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_handler_string() {
        let identity = HandlerIdentity::parse("src/handlers/users.get_user").unwrap();
        assert_eq!(identity.module_path, "src/handlers/users");
        assert_eq!(identity.entry_point, "get_user");
        assert_eq!(identity.to_string(), "src/handlers/users.get_user");
    }

    #[test]
    fn test_parse_rejects_incomplete_handler() {
        assert!(HandlerIdentity::parse("no_dot").is_none());
        assert!(HandlerIdentity::parse(".handler").is_none());
        assert!(HandlerIdentity::parse("module.").is_none());
    }

    #[test]
    fn test_identity_equality() {
        let a = HandlerIdentity::new("app", "handler");
        let b = HandlerIdentity::new("app", "handler");
        let c = HandlerIdentity::new("app", "other");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_platform_conventions() {
        assert_eq!(Platform::Windows.venv_bin_dir(), "Scripts");
        assert_eq!(Platform::Unix.venv_bin_dir(), "bin");
        assert_eq!(Platform::Windows.path_delimiter(), ';');
        assert_eq!(Platform::Unix.path_delimiter(), ':');
        assert_eq!(Platform::Unix.line_terminator(), "\n");
    }
}
