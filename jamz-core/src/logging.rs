use std::path::Path;
use tracing::Level;
use tracing_appender::rolling;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Initialize structured logging based on configuration
///
/// JSON for production, pretty for development. `RUST_LOG` overrides the
/// configured level. With `file_path` set, output goes to that file instead of
/// stdout.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let log_level = parse_log_level(&config.level)?;

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.format.as_str() == "json" {
        let json_layer = fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_line_number(true)
            .with_file(true);

        if let Some(file_path) = &config.file_path {
            let (dir, name) = split_log_path(file_path)?;
            registry
                .with(json_layer.with_writer(rolling::never(dir, name)))
                .try_init()?;
        } else {
            registry.with(json_layer).try_init()?;
        }
    } else {
        let pretty_layer = fmt::layer()
            .pretty()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
            .with_line_number(true)
            .with_file(false);

        if let Some(file_path) = &config.file_path {
            let (dir, name) = split_log_path(file_path)?;
            registry
                .with(
                    pretty_layer
                        .with_ansi(false)
                        .with_writer(rolling::never(dir, name)),
                )
                .try_init()?;
        } else {
            registry.with(pretty_layer).try_init()?;
        }
    }

    Ok(())
}

/// Parse log level string to tracing Level
fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}

fn split_log_path(file_path: &str) -> anyhow::Result<(&Path, &std::ffi::OsStr)> {
    let path = Path::new(file_path);
    let name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("Log file path has no file name: {file_path}"))?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    Ok((dir, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(parse_log_level("trace").is_ok());
        assert!(parse_log_level("debug").is_ok());
        assert!(parse_log_level("info").is_ok());
        assert!(parse_log_level("warn").is_ok());
        assert!(parse_log_level("error").is_ok());
        assert!(parse_log_level("invalid").is_err());
    }

    #[test]
    fn test_split_log_path() {
        let (dir, name) = split_log_path("/var/log/jamz.log").unwrap();
        assert_eq!(dir, Path::new("/var/log"));
        assert_eq!(name, "jamz.log");

        let (dir, name) = split_log_path("jamz.log").unwrap();
        assert_eq!(dir, Path::new("."));
        assert_eq!(name, "jamz.log");

        assert!(split_log_path("/").is_err());
    }
}
