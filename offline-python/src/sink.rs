//! Host log sink for handler output

use offline_core::HandlerIdentity;
use tracing::{info, warn};

/// Destination for everything a handler prints that is not its result
pub trait OutputSink: Send + Sync {
    /// One pass-through line from the handler's stdout
    fn stdout_line(&self, handler: &HandlerIdentity, line: &str);

    /// Diagnostic text from the handler's stderr
    fn stderr_text(&self, handler: &HandlerIdentity, text: &str);
}

/// Relays handler output through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl OutputSink for TracingSink {
    fn stdout_line(&self, handler: &HandlerIdentity, line: &str) {
        info!(target: "handler::stdout", handler = %handler, "{}", line);
    }

    fn stderr_text(&self, handler: &HandlerIdentity, text: &str) {
        warn!(target: "handler::stderr", handler = %handler, "{}", text);
    }
}
