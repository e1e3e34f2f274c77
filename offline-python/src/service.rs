//! Runner service
//!
//! Wires configuration, the process supervisor and the registry together
//! and hands out invokers.

use crate::config::RunnerConfig;
use crate::invocation::InvocationError;
use crate::invoker::Invoker;
use crate::lifecycle::ProcessSupervisor;
use crate::registry::ProcessRegistry;
use crate::runtime::RuntimeDescriptor;
use crate::sink::{OutputSink, TracingSink};
use offline_core::HandlerIdentity;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum RunnerServiceError {
    #[error("Invalid handler format: {0}")]
    InvalidHandler(String),

    #[error("Invocation error: {0}")]
    Invocation(#[from] InvocationError),
}

/// Runs handlers out of process
pub struct RunnerService {
    config: RunnerConfig,
    descriptor: RuntimeDescriptor,
    registry: Arc<ProcessRegistry>,
}

impl RunnerService {
    pub fn new(config: RunnerConfig) -> Self {
        Self::with_sink(config, Arc::new(TracingSink))
    }

    /// Service relaying handler output to `sink`
    pub fn with_sink(config: RunnerConfig, sink: Arc<dyn OutputSink>) -> Self {
        let supervisor = Arc::new(ProcessSupervisor::new(
            config.companion_script_path(),
            config.working_dir(),
        ));
        let registry = Arc::new(ProcessRegistry::new(
            supervisor,
            sink,
            config.line_terminator,
        ));

        info!(
            runtime = %config.runtime,
            companion_script = %config.companion_script_path().display(),
            timeout = ?config.invocation_timeout(),
            "Runner service ready"
        );

        Self {
            descriptor: RuntimeDescriptor::new(config.runtime.clone()),
            config,
            registry,
        }
    }

    /// Invoker for `identity` using the configured runtime and environment
    pub fn invoker(&self, identity: HandlerIdentity) -> Invoker {
        Invoker::new(
            self.registry.clone(),
            identity,
            self.descriptor.clone(),
            self.config.environment.clone(),
        )
        .with_timeout(self.config.invocation_timeout())
    }

    /// Invoke a `module/path.entry_point` handler once
    pub async fn invoke(
        &self,
        handler: &str,
        event: Value,
        context: Value,
    ) -> Result<Value, RunnerServiceError> {
        let identity = HandlerIdentity::parse(handler)
            .ok_or_else(|| RunnerServiceError::InvalidHandler(handler.to_string()))?;
        Ok(self.invoker(identity).invoke(event, context).await?)
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Stop every handler process
    pub async fn shutdown(&self) {
        self.registry.supervisor().shutdown().await;
        self.registry.prune();
    }
}
