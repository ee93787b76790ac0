//! Structured logging setup.

use crate::settings::GatewaySettings;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the global tracing subscriber.
///
/// The filter honors `RUST_LOG` when set, otherwise the configured
/// `LOG_LEVEL`. With `json_logs` the output is one JSON object per line.
/// Calling this more than once is a no-op.
pub fn init(settings: &GatewaySettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.to_lowercase()));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if settings.json_logs {
        registry.with(fmt::layer().json().with_current_span(false)).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };

    if result.is_ok() {
        tracing::info!(
            log_level = %settings.log_level,
            json_logs = settings.json_logs,
            "logging configured"
        );
    }
}
