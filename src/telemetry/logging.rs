//! Logging configuration and initialization.
//!
//! RUST_LOG takes priority over any programmatic configuration; without
//! either, the default is info level in the human-readable format.

use tracing_subscriber::EnvFilter;

/// Logging configuration supplied by the host.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
    /// Output format: pretty, compact, json
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Initializes the logging system. Safe to call more than once; later
/// calls are ignored.
pub fn init_logging(config: Option<&LogConfig>) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = config.map(|c| normalize_level(&c.level)).unwrap_or("info");
        EnvFilter::new(level)
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match config.map(|c| c.format.as_str()) {
        Some("json") => builder.json().try_init(),
        Some("compact") => builder.compact().try_init(),
        _ => builder.try_init(),
    };
    // Err here means a subscriber is already installed
    let _ = result;
}

fn normalize_level(level: &str) -> &'static str {
    match level.to_ascii_lowercase().as_str() {
        "error" => "error",
        "warn" => "warn",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_level() {
        assert_eq!(normalize_level("error"), "error");
        assert_eq!(normalize_level("WARN"), "warn");
        assert_eq!(normalize_level("Debug"), "debug");
        assert_eq!(normalize_level("trace"), "trace");
        assert_eq!(normalize_level("verbose"), "info");
    }

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, "pretty");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_logging(None);
        init_logging(Some(&LogConfig::default()));
    }
}
