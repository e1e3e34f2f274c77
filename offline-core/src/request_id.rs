//! Invocation ID generation

use std::fmt;
use uuid::Uuid;

/// Identifier attached to one invocation for log correlation.
///
/// It never crosses the process boundary; the child protocol carries no ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InvocationId(String);

impl InvocationId {
    /// Generate a new invocation ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string()[..12].to_string())
    }

    /// Create an invocation ID with a specific value (for testing)
    pub fn with_id(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
