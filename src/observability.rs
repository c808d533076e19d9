//! Observability utilities.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::types::ObservabilityConfig;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Environment variable selecting the log format (`json` or `text`).
pub const LOG_FORMAT_ENV: &str = "TOOLEXEC_LOG_FORMAT";

/// Initialize the tracing subscriber once for the process with default
/// settings.
///
/// Log format defaults to plain text and can be switched to JSON via
/// `TOOLEXEC_LOG_FORMAT=json`. Filter defaults to `info` if `RUST_LOG` is unset.
pub fn init_tracing() {
    init_tracing_with(&ObservabilityConfig::default());
}

/// Initialize the tracing subscriber once for the process.
///
/// `RUST_LOG` overrides `config.log_level` and `TOOLEXEC_LOG_FORMAT`
/// overrides `config.json_logs`. Later calls are no-ops.
pub fn init_tracing_with(config: &ObservabilityConfig) {
    TRACING_INIT.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.log_level))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let json = json_format(std::env::var(LOG_FORMAT_ENV).ok().as_deref(), config.json_logs);

        let result = if json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .try_init()
        };

        if let Err(err) = result {
            eprintln!("tracing init skipped: {err}");
        }
    });
}

fn json_format(env: Option<&str>, configured: bool) -> bool {
    match env {
        Some(v) if v.eq_ignore_ascii_case("json") => true,
        Some(v) if v.eq_ignore_ascii_case("text") => false,
        _ => configured,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_tracing_is_idempotent() {
        init_tracing();
        init_tracing_with(&ObservabilityConfig {
            log_level: "debug".into(),
            json_logs: true,
        });
    }

    #[test]
    fn env_format_overrides_config() {
        assert!(json_format(Some("JSON"), false));
        assert!(!json_format(Some("text"), true));
        assert!(json_format(None, true));
        assert!(!json_format(Some("yaml"), false));
    }
}
