//! Ambient `tracing` bootstrap.
//!
//! This is the operational/developer-facing logging layer, distinct from
//! [`crate::audit::AuditLog`] (the spec's queryable, bounded audit trail).
//! Every component emits a `tracing` event at the same call sites it
//! appends an audit event.

use crate::config::{LogConfig, LogFormat};
use tracing::Level;
use tracing_subscriber::{EnvFilter, Layer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Installed global subscriber guard. Dropping it is a no-op; kept for
/// symmetry with setups that hold a `WorkerGuard` for non-blocking writers.
pub struct TelemetryGuard;

/// Initialize the global `tracing` subscriber from [`LogConfig`].
///
/// # Errors
/// Returns an error if `config.level` isn't a recognized level name.
pub fn init(config: &LogConfig) -> anyhow::Result<TelemetryGuard> {
    let level = parse_level(&config.level)?;
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    match config.format {
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .with_filter(env_filter);
            tracing_subscriber::registry().with(layer).try_init().ok();
        }
        LogFormat::Pretty => {
            let layer = tracing_subscriber::fmt::layer()
                .pretty()
                .with_target(true)
                .with_filter(env_filter);
            tracing_subscriber::registry().with(layer).try_init().ok();
        }
    }

    tracing::info!(level = %config.level, format = ?config.format, "telemetry initialized");
    Ok(TelemetryGuard)
}

fn parse_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => anyhow::bail!("invalid log level: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_level_accepts_known_names_case_insensitively() {
        assert!(matches!(parse_level("INFO"), Ok(Level::INFO)));
        assert!(matches!(parse_level("trace"), Ok(Level::TRACE)));
        assert!(parse_level("noisy").is_err());
    }
}
