//! offline - run Python handlers locally
//!
//! Invokes a handler in a long-lived child process and prints each result
//! as one line of JSON on stdout. Logs, including everything the handler
//! prints, go to stderr.

mod config;

use anyhow::{anyhow, Context};
use clap::Parser;
use offline_core::HandlerIdentity;
use offline_python::{InvocationError, LineTerminator, RunnerConfig, RunnerService};
use serde_json::Value;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "offline")]
#[command(about = "Run Python handlers locally, out of process", long_about = None)]
struct Args {
    /// Handler to invoke, as `path/to/module.function`
    handler: String,

    /// Event passed to the handler (JSON)
    #[arg(long, default_value = "{}")]
    event: String,

    /// Read the event from a JSON file instead
    #[arg(long, conflicts_with = "event")]
    event_file: Option<PathBuf>,

    /// Context passed to the handler (JSON)
    #[arg(long, default_value = "{}")]
    context: String,

    /// Interpreter version, e.g. python3.11
    #[arg(long, env = "OFFLINE_RUNTIME")]
    runtime: Option<String>,

    /// Companion script that loads and calls the handler
    #[arg(long, env = "OFFLINE_COMPANION_SCRIPT")]
    companion_script: Option<PathBuf>,

    /// Directory handler paths are relative to
    #[arg(long, env = "OFFLINE_WORKING_DIR")]
    working_dir: Option<PathBuf>,

    /// Per-invocation timeout in milliseconds (0 waits forever)
    #[arg(long, env = "OFFLINE_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Line terminator the handler emits: platform, lf or crlf
    #[arg(long, env = "OFFLINE_LINE_TERMINATOR")]
    line_terminator: Option<String>,

    /// Extra environment for the handler process (KEY=VALUE, repeatable)
    #[arg(short = 'e', long = "env", value_parser = parse_key_value)]
    env: Vec<(String, String)>,

    /// Invoke the handler this many times against the same process
    #[arg(long, default_value = "1")]
    repeat: u32,

    /// Configuration file (defaults to ./offline.toml when present)
    #[arg(long, env = "OFFLINE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "OFFLINE_LOG_LEVEL")]
    log_level: String,
}

impl Args {
    /// Layer command-line settings over the loaded configuration
    fn apply(&self, config: &mut RunnerConfig) -> anyhow::Result<()> {
        if let Some(runtime) = &self.runtime {
            config.runtime.clone_from(runtime);
        }
        if let Some(script) = &self.companion_script {
            config.companion_script.clone_from(script);
        }
        if let Some(dir) = &self.working_dir {
            config.working_dir = Some(dir.clone());
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.invocation_timeout_ms = timeout_ms;
        }
        if let Some(terminator) = &self.line_terminator {
            config.line_terminator = LineTerminator::from_str(terminator)
                .ok_or_else(|| anyhow!("unknown line terminator '{terminator}'"))?;
        }
        config.environment.extend(self.env.iter().cloned());
        Ok(())
    }

    fn event(&self) -> anyhow::Result<Value> {
        match &self.event_file {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                serde_json::from_str(&text).context("event file is not valid JSON")
            }
            None => serde_json::from_str(&self.event).context("--event is not valid JSON"),
        }
    }

    fn context(&self) -> anyhow::Result<Value> {
        serde_json::from_str(&self.context).context("--context is not valid JSON")
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing on stderr; stdout carries results only
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "offline={0},offline_python={0},handler={0}",
                    args.log_level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let identity = HandlerIdentity::parse(&args.handler)
        .ok_or_else(|| anyhow!("invalid handler '{}', expected path/module.function", args.handler))?;
    let event = args.event()?;
    let context = args.context()?;

    let mut runner_config = config::load(args.config.as_deref())?;
    args.apply(&mut runner_config)?;

    info!(handler = %identity, runtime = %runner_config.runtime, repeat = args.repeat, "Invoking handler");

    let service = RunnerService::new(runner_config);
    let invoker = service.invoker(identity.clone());

    let mut exit_code = 0;
    for _ in 0..args.repeat {
        let outcome = tokio::select! {
            outcome = invoker.invoke(event.clone(), context.clone()) => outcome,
            _ = tokio::signal::ctrl_c() => Err(InvocationError::Cancelled),
        };

        match outcome {
            Ok(value) => println!("{}", serde_json::to_string(&value)?),
            Err(e) => {
                let response = e.to_response(&identity);
                error!(handler = %identity, error = %e, "Invocation failed");
                println!("{}", response.to_json());
                exit_code = response.code.exit_code();
                break;
            }
        }
    }

    service.shutdown().await;

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
