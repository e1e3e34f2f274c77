//! Core types shared by the offline handler runner
//!
//! This crate provides the vocabulary used on both sides of the invocation
//! engine: handler identities, host platform detection, invocation ids and
//! the JSON error shape reported to callers.

pub mod error;
pub mod identity;
pub mod request_id;

pub use error::{ErrorCode, ErrorResponse};
pub use identity::{HandlerIdentity, Platform};
pub use request_id::InvocationId;
