/*!
 * Logging and tracing initialization
 *
 * The default filter covers the gateway and its resilience crate at the
 * configured level. Audit events (target `switchyard::audit`) stay at `info`
 * or finer, so lowering the level to `warn` does not silence the audit trail
 * when it is routed to the log.
 *
 * File output is one flat JSON object per event: the event's own fields
 * (`server_id`, `attempt`, ...) at the top level, plus a `span` object with
 * the enclosing dispatch's `tenant`, `capability` and `request_id`.
 */

use std::fs::OpenOptions;
use std::path::Path;
use tracing::{Level, Subscriber};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::audit::AUDIT_TARGET;
use crate::config::LoggingConfig;
use crate::error::{GatewayError, Result};

/// Level after applying `verbose`
pub fn effective_level(config: &LoggingConfig) -> Level {
    if config.verbose {
        Level::DEBUG
    } else {
        config.level.to_tracing_level()
    }
}

/// Filter directives used when `RUST_LOG` is unset
pub fn default_filter(level: Level) -> String {
    let audit = level.max(Level::INFO);
    format!("switchyard={level},switchyard_core_resilience={level},{AUDIT_TARGET}={audit}")
}

/// Initialize structured logging based on configuration
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter(effective_level(config))))
        .map_err(|e| GatewayError::Config(format!("Failed to create log filter: {}", e)))?;

    match config.file {
        Some(ref log_path) => init_file_logging(log_path, env_filter),
        None => init_stdout_logging(env_filter),
    }
}

fn init_stdout_logging(env_filter: EnvFilter) -> Result<()> {
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::NONE)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| GatewayError::Config(format!("Failed to install logger: {}", e)))
}

fn init_file_logging(log_path: &Path, env_filter: EnvFilter) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|e| GatewayError::Config(format!("Failed to open log file: {}", e)))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer(file))
        .try_init()
        .map_err(|e| GatewayError::Config(format!("Failed to install logger: {}", e)))
}

/// Flat JSON lines with the current span's fields under `span`
fn json_layer<S, W>(writer: W) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_ansi(false)
        .with_span_events(FmtSpan::NONE)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(false)
}

/// Initialize logging for tests, once per process
#[cfg(test)]
pub fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter(Level::DEBUG)));

        let fmt_layer = fmt::layer().with_test_writer().with_target(false).compact();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .ok();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;
    use serde_json::Value;
    use tempfile::TempDir;

    #[test]
    fn test_verbose_overrides_log_level() {
        let config = LoggingConfig {
            level: LogLevel::Error,
            file: None,
            verbose: true,
        };
        assert_eq!(effective_level(&config), Level::DEBUG);

        let config = LoggingConfig {
            verbose: false,
            ..config
        };
        assert_eq!(effective_level(&config), Level::ERROR);
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::Error.to_tracing_level(), Level::ERROR);
        assert_eq!(LogLevel::Warn.to_tracing_level(), Level::WARN);
        assert_eq!(LogLevel::Info.to_tracing_level(), Level::INFO);
        assert_eq!(LogLevel::Debug.to_tracing_level(), Level::DEBUG);
        assert_eq!(LogLevel::Trace.to_tracing_level(), Level::TRACE);
    }

    #[test]
    fn test_default_filter_keeps_audit_at_info() {
        let quiet = default_filter(Level::WARN);
        assert_eq!(
            quiet,
            "switchyard=WARN,switchyard_core_resilience=WARN,switchyard::audit=INFO"
        );
        assert!(EnvFilter::try_new(&quiet).is_ok());

        let chatty = default_filter(Level::TRACE);
        assert!(chatty.ends_with("switchyard::audit=TRACE"));
    }

    #[test]
    fn test_json_lines_are_flat_with_dispatch_span() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("switchyard.log");
        let file = std::fs::File::create(&path).unwrap();
        let subscriber = tracing_subscriber::registry().with(json_layer(file));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!(
                "dispatch",
                tenant = "acme",
                capability = "search",
                request_id = "r-1"
            );
            let _entered = span.enter();
            tracing::warn!(server_id = "a", attempt = 2u32, "Backend transport failure");
        });

        let contents = std::fs::read_to_string(&path).unwrap();
        let line: Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(line["message"], "Backend transport failure");
        assert_eq!(line["server_id"], "a");
        assert_eq!(line["attempt"], 2);
        assert_eq!(line["span"]["name"], "dispatch");
        assert_eq!(line["span"]["tenant"], "acme");
        assert_eq!(line["span"]["request_id"], "r-1");
        assert!(line.get("spans").is_none());
        assert!(line.get("fields").is_none());
    }

    #[test]
    fn test_init_test_logging_is_idempotent() {
        init_test_logging();
        init_test_logging();
        tracing::debug!("logging initialized twice without panicking");
    }
}
