//! Configuration loading

use anyhow::Result;
use std::path::Path;
use tracing::info;

use crate::Config;

/// Load configuration from config file or environment variables
///
/// Config file search order:
/// 1. `JAMZ_CONFIG_PATH` environment variable (explicit path)
/// 2. ./config.yaml (current working directory)
/// 3. /config/config.yaml (Kubernetes mount path)
/// 4. Fall back to environment variables only
///
/// Runs before logging is initialised, so progress goes to stderr.
pub fn load_config() -> Result<Config> {
    load_config_from(std::env::var("JAMZ_CONFIG_PATH").ok().as_deref())
}

/// Same as [`load_config`] with an explicit path taking the place of
/// `JAMZ_CONFIG_PATH`
pub fn load_config_from(explicit: Option<&str>) -> Result<Config> {
    let config_path = explicit
        .filter(|p| Path::new(p).exists())
        .map(str::to_string)
        .or_else(|| {
            ["config.yaml", "/config/config.yaml"]
                .into_iter()
                .find(|p| Path::new(p).exists())
                .map(str::to_string)
        });

    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        Config::from_file(&path)
            .map_err(|e| anyhow::anyhow!("Failed to load {path}: {e}"))?
    } else {
        eprintln!("No config file found, using environment variables");
        Config::from_env().map_err(|e| anyhow::anyhow!("Failed to load config: {e}"))?
    };

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config validation error: {error}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    Ok(config)
}

/// Log the effective settings once logging is up
pub fn log_summary(config: &Config) {
    info!(
        http_address = %config.http_address(),
        environment = %config.server.environment,
        workers = config.media.worker_count,
        rtc_ports = %format!("{}-{}", config.media.rtc_min_port, config.media.rtc_max_port),
        signaling_enabled = config.signaling.enabled,
        "Configuration loaded and validated"
    );
}
