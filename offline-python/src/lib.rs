//! Out-of-process handler invocation
//!
//! Runs Python handlers in long-lived child processes, talking to them over
//! stdin/stdout. Each handler identity gets one child; requests to it are
//! serialized, and the single result line is picked out of whatever else
//! the handler prints.

pub mod codec;
pub mod config;
pub mod invocation;
pub mod invoker;
pub mod lifecycle;
pub mod registry;
pub mod runtime;
pub mod service;
pub mod sink;

pub use codec::{classify, Frame, LineCodec, LineTerminator, MAX_LINE_BYTES, PAYLOAD_KEY};
pub use config::RunnerConfig;
pub use invocation::{InvocationError, InvocationRequest};
pub use invoker::{Invoker, ProcessHandle};
pub use lifecycle::{ProcessSupervisor, SpawnError};
pub use registry::ProcessRegistry;
pub use runtime::RuntimeDescriptor;
pub use service::{RunnerService, RunnerServiceError};
pub use sink::{OutputSink, TracingSink};
