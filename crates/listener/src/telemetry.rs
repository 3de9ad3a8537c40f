// Telemetry Module
//
// Structured logging setup for the listener. Log events carry `task_id` and
// `run_id` fields; failures that need a human set `alert_operator = true`.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Stat recorded when the first run of a task is picked up
pub const TIME_TO_REACH_WORKER: &str = "tasks.time.to_reach_worker";

/// Configuration for logging
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup event
    pub service_name: String,
    /// Whether to enable console logging
    pub enable_console: bool,
    /// Log filter (e.g., "info", "debug", "dockhand_listener=debug")
    pub log_filter: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "dockhand-listener".to_string(),
            enable_console: true,
            log_filter: None,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `SERVICE_NAME`: Service name (default: "dockhand-listener")
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "dockhand-listener".to_string()),
            enable_console: true,
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
        }
    }
}

/// Build the log filter, falling back to `info` for a missing or invalid one
pub fn build_filter(log_filter: Option<&str>) -> EnvFilter {
    log_filter
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Install the global subscriber
///
/// Returns false when a global subscriber was already installed.
///
/// # Example
///
/// ```ignore
/// use dockhand_listener::telemetry::{init_telemetry, TelemetryConfig};
///
/// #[tokio::main]
/// async fn main() {
///     init_telemetry(TelemetryConfig::from_env());
///     // ... start the listener
/// }
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> bool {
    let filter = build_filter(config.log_filter.as_deref());

    let console_layer = if config.enable_console {
        Some(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_filter(filter),
        )
    } else {
        None
    };

    let installed = tracing_subscriber::registry()
        .with(console_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(service = %config.service_name, "Logging initialized");
    }

    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "dockhand-listener");
        assert!(config.enable_console);
        assert!(config.log_filter.is_none());
    }

    #[test]
    fn test_invalid_filter_falls_back_to_info() {
        assert_eq!(build_filter(Some("dockhand_listener=loud")).to_string(), "info");
        assert_eq!(build_filter(None).to_string(), "info");
        assert_eq!(
            build_filter(Some("dockhand_listener=debug")).to_string(),
            "dockhand_listener=debug"
        );
    }
}
