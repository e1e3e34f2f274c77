//! Configuration loading

use anyhow::Context;
use offline_python::RunnerConfig;
use std::path::Path;

/// Load configuration from file and environment.
///
/// Without an explicit path an `offline.toml` in the working directory is
/// used when present. `OFFLINE_*` environment variables override the file.
pub fn load(path: Option<&Path>) -> anyhow::Result<RunnerConfig> {
    let file = match path {
        Some(path) => config::File::from(path),
        None => config::File::with_name("offline").required(false),
    };

    let config = config::Config::builder()
        .add_source(file)
        .add_source(config::Environment::with_prefix("OFFLINE").try_parsing(true))
        .build()
        .context("failed to load configuration")?;

    Ok(config.try_deserialize::<RunnerConfig>()?)
}
