//! Invocation request and error types

use crate::lifecycle::SpawnError;
use offline_core::{ErrorCode, ErrorResponse, HandlerIdentity};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("Failed to start handler process: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Handler {handler} returned no payload: {reason}")]
    Protocol {
        handler: HandlerIdentity,
        reason: String,
    },

    #[error("Handler process for {handler} exited ({status})")]
    ChildExited {
        handler: HandlerIdentity,
        status: String,
    },

    #[error("Invocation timeout after {0:?}")]
    Timeout(Duration),

    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] serde_json::Error),

    #[error("Invocation cancelled")]
    Cancelled,
}

impl InvocationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Spawn(_) => ErrorCode::SpawnFailed,
            Self::Protocol { .. } => ErrorCode::ProtocolViolation,
            Self::ChildExited { .. } => ErrorCode::ChildExited,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::Cancelled => ErrorCode::Cancelled,
        }
    }

    /// Caller-facing error object
    pub fn to_response(&self, handler: &HandlerIdentity) -> ErrorResponse {
        ErrorResponse::new(self.code(), self.to_string()).with_handler(handler.to_string())
    }
}

/// One request line written to the child's stdin
#[derive(Debug, Clone, Serialize)]
pub struct InvocationRequest {
    pub event: Value,
    pub context: Value,
}

impl InvocationRequest {
    pub fn new(event: Value, context: Value) -> Self {
        Self { event, context }
    }

    /// Serialize as a single line of JSON, without the terminator
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_is_one_line() {
        let request = InvocationRequest::new(
            json!({"a": 1, "text": "multi\nline"}),
            json!({"id": "x"}),
        );
        let line = request.to_line().unwrap();

        assert!(!line.contains('\n'));
        let parsed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, json!({"event": {"a": 1, "text": "multi\nline"}, "context": {"id": "x"}}));
    }

    #[test]
    fn test_error_codes() {
        let handler = HandlerIdentity::new("app", "handler");
        let error = InvocationError::Protocol {
            handler: handler.clone(),
            reason: "output ended".to_string(),
        };
        assert_eq!(error.code(), ErrorCode::ProtocolViolation);

        let response = error.to_response(&handler);
        assert_eq!(response.handler.as_deref(), Some("app.handler"));
        assert_eq!(
            InvocationError::Timeout(Duration::from_secs(1)).code(),
            ErrorCode::Timeout
        );
    }
}
