use tracing_subscriber::EnvFilter;

/// Initialize structured logging with tracing-subscriber.
///
/// `RUST_LOG` wins when set; otherwise `log_level` (as given by `LOG_LEVEL`) applies.
pub fn init(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(log_level)));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

/// Accepts tracing level names as well as the `WARNING`/`CRITICAL` spellings
/// common in deployment env files.
pub fn filter_directive(log_level: &str) -> String {
    let lower = log_level.trim().to_ascii_lowercase();
    let level = match lower.as_str() {
        "" => "info",
        "warning" => "warn",
        "critical" | "fatal" => "error",
        other => other,
    };
    format!("{level},sqlx=warn")
}
