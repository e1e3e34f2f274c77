//! Error codes and the JSON error shape reported to callers

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Failure classes of an invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    SpawnFailed,
    ProtocolViolation,
    ChildExited,
    Timeout,
    InvalidRequest,
    Cancelled,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpawnFailed => "Runtime.SpawnError",
            Self::ProtocolViolation => "Runtime.ProtocolError",
            Self::ChildExited => "Runtime.ExitError",
            Self::Timeout => "Runtime.Timeout",
            Self::InvalidRequest => "Runtime.InvalidRequest",
            Self::Cancelled => "Runtime.Cancelled",
        }
    }

    /// Exit code used by command-line hosts when an invocation fails
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidRequest => 2,
            Self::SpawnFailed => 3,
            Self::ProtocolViolation => 4,
            Self::ChildExited => 5,
            Self::Timeout => 6,
            Self::Cancelled => 130,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Invocation failure as seen by the caller
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    pub handler: Option<String>,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            handler: None,
        }
    }

    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    /// Format as a JSON error object
    pub fn to_json(&self) -> String {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct JsonError<'a> {
            error_type: &'static str,
            error_message: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            handler: Option<&'a str>,
        }

        let error = JsonError {
            error_type: self.code.as_str(),
            error_message: &self.message,
            handler: self.handler.as_deref(),
        };

        serde_json::to_string(&error).unwrap_or_else(|_| {
            format!(
                r#"{{"errorType":"{}","errorMessage":"{}"}}"#,
                self.code.as_str(),
                self.message
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_json_format() {
        let error = ErrorResponse::new(ErrorCode::ProtocolViolation, "no payload frame")
            .with_handler("app.handler");

        let json: serde_json::Value = serde_json::from_str(&error.to_json()).unwrap();
        assert_eq!(json["errorType"], "Runtime.ProtocolError");
        assert_eq!(json["errorMessage"], "no payload frame");
        assert_eq!(json["handler"], "app.handler");
    }

    #[test]
    fn test_error_json_omits_missing_handler() {
        let error = ErrorResponse::new(ErrorCode::Timeout, "timed out");
        assert!(!error.to_json().contains("handler"));
    }

    #[test]
    fn test_display() {
        let error = ErrorResponse::new(ErrorCode::SpawnFailed, "python3 not found");
        assert_eq!(error.to_string(), "Runtime.SpawnError: python3 not found");
    }
}
