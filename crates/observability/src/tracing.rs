//! Tracing subscriber initialization.
//!
//! JSON lines by default, filtered through `RUST_LOG`. `MEMKIT_LOG_FORMAT`
//! switches to a compact human-readable format.

use tracing_subscriber::EnvFilter;

/// Environment variable selecting the log output format.
pub const ENV_LOG_FORMAT: &str = "MEMKIT_LOG_FORMAT";

const DEFAULT_FILTER: &str = "info";
const TEST_FILTER: &str = "memkit_infra=debug,memkit_events=debug";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Compact,
}

impl LogFormat {
    /// `json` or `compact` (case-insensitive); anything else is `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Some(LogFormat::Json),
            "compact" => Some(LogFormat::Compact),
            _ => None,
        }
    }

    pub fn from_env() -> Self {
        std::env::var(ENV_LOG_FORMAT)
            .ok()
            .and_then(|v| Self::parse(&v))
            .unwrap_or_default()
    }
}

fn filter_or(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Initialize logging in the format chosen by `MEMKIT_LOG_FORMAT`.
pub fn init() {
    init_with(LogFormat::from_env());
}

/// Initialize logging in `format`. Later calls are no-ops.
pub fn init_with(format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter_or(DEFAULT_FILTER))
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    let _ = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
}

/// Compact logs captured by the test harness, adapters at `debug`.
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_or(TEST_FILTER))
        .with_test_writer()
        .compact()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_formats() {
        assert_eq!(LogFormat::parse("json"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse(" Compact "), Some(LogFormat::Compact));
        assert_eq!(LogFormat::parse("xml"), None);
    }

    #[test]
    fn init_is_idempotent() {
        init_test();
        init_with(LogFormat::Json);
        init();
    }
}
