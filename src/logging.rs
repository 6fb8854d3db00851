use tracing_subscriber::{fmt::time::Uptime, EnvFilter};

const DEFAULT_FILTER: &str = "dirty_pig=info";

#[derive(Debug, thiserror::Error)]
#[error("failed to initialize tracing subscriber: {0}")]
pub struct TracingInitError(String);

/// Installs the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing(json: bool) -> Result<(), TracingInitError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_timer(Uptime::default());

    let result = if json {
        builder.with_ansi(false).json().try_init()
    } else {
        builder.compact().try_init()
    };
    result.map_err(|err| TracingInitError(err.to_string()))
}

/// `true` when `DIRTY_PIG_LOG_JSON` is set to `1` or `true`.
pub fn json_from_env() -> bool {
    std::env::var("DIRTY_PIG_LOG_JSON")
        .map(|raw| matches!(raw.trim(), "1" | "true" | "TRUE"))
        .unwrap_or(false)
}
