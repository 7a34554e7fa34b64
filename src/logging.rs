use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, LoggingSection};

/// Filter directives: `RUST_LOG` when set, otherwise the configured level.
pub fn filter_directives(logging: &LoggingSection, rust_log: Option<String>) -> String {
    rust_log
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| logging.level.clone())
}

/// Install the global subscriber. Logs go to stderr so stdout stays free for
/// command output. Calling this twice is a no-op.
pub fn init_tracing(logging: &LoggingSection) {
    let filter = EnvFilter::new(filter_directives(logging, std::env::var("RUST_LOG").ok()));
    let registry = tracing_subscriber::registry().with(filter);
    let result = match logging.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rust_log_wins_over_config() {
        let logging = LoggingSection {
            level: "warn".into(),
            format: LogFormat::Pretty,
        };
        assert_eq!(filter_directives(&logging, None), "warn");
        assert_eq!(filter_directives(&logging, Some("vizflow=debug".into())), "vizflow=debug");
        assert_eq!(filter_directives(&logging, Some("  ".into())), "warn");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        let logging = LoggingSection::default();
        init_tracing(&logging);
        init_tracing(&logging);
    }
}
