//! Logging setup for the search service.
//!
//! The effective filter comes from three sources, strongest first: CLI `-v`
//! flags (mapped through [`verbosity_level`]), the `RUST_LOG` environment
//! variable, and the `log_level` key of the server config. [`init`] resolves
//! that precedence once at startup and installs a stderr subscriber; worker
//! and shard diagnostics all flow through it as structured tracing events.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::error::EngineError;

/// Map repeated `-v` flags onto a level directive.
///
/// `None` means no CLI override: resolution falls through to `RUST_LOG`
/// and then the configured level. One `-v` quiets info noise down to
/// warnings; four or more turn on full payload tracing.
pub fn verbosity_level(tier: u8) -> Option<&'static str> {
    match tier {
        0 => None,
        1 => Some("warn"),
        2 => Some("info"),
        3 => Some("debug"),
        _ => Some("trace"),
    }
}

/// Install the global stderr subscriber.
///
/// `configured` is the level from the config file (possibly already
/// overridden by `TTTS_LOG_LEVEL`); `cli_level` is the flag-derived
/// override, which also beats `RUST_LOG`. Fails when the winning directive
/// cannot be parsed or a subscriber is already installed.
pub fn init(configured: &str, cli_level: Option<&str>) -> Result<(), EngineError> {
    let env_directive = std::env::var("RUST_LOG").ok();
    let filter = resolve_filter(configured, cli_level, env_directive.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| EngineError::Logger(format!("subscriber already installed: {e}")))
}

/// Apply the precedence order: CLI flags, then `RUST_LOG`, then the
/// configured level. Tests inject `env_directive` instead of touching the
/// process environment.
fn resolve_filter(
    configured: &str,
    cli_level: Option<&str>,
    env_directive: Option<&str>,
) -> Result<EnvFilter, EngineError> {
    if let Some(level) = cli_level {
        return EnvFilter::try_new(level)
            .map_err(|e| EngineError::Logger(format!("bad CLI level '{level}': {e}")));
    }
    if let Some(directive) = env_directive {
        if let Ok(filter) = EnvFilter::try_new(directive) {
            return Ok(filter);
        }
        // A typo in the environment falls through to the config level
        // instead of keeping the service from starting.
    }
    EnvFilter::try_new(configured).map_err(|e| {
        EngineError::Logger(format!("bad log_level '{configured}' in config: {e}"))
    })
}

/// Strictly check a configured level string.
///
/// [`EnvFilter`] accepts almost anything (an unknown word parses as a
/// target filter), so the binary runs the config value through this before
/// [`init`] to catch typos like `"verbose"` early.
pub fn validate_level(level: &str) -> Result<LevelFilter, EngineError> {
    level
        .trim()
        .parse::<LevelFilter>()
        .map_err(|_| EngineError::Logger(format!("unrecognised log level: '{level}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_tiers_map_to_levels() {
        assert_eq!(verbosity_level(0), None);
        assert_eq!(verbosity_level(1), Some("warn"));
        assert_eq!(verbosity_level(2), Some("info"));
        assert_eq!(verbosity_level(3), Some("debug"));
        assert_eq!(verbosity_level(4), Some("trace"));
        assert_eq!(verbosity_level(200), Some("trace"));
    }

    #[test]
    fn cli_level_wins_over_env_and_config() {
        let filter = resolve_filter("info", Some("debug"), Some("error")).unwrap();
        assert_eq!(filter.to_string(), "debug");
    }

    #[test]
    fn env_directive_wins_over_config() {
        let filter = resolve_filter("info", None, Some("warn")).unwrap();
        assert_eq!(filter.to_string(), "warn");
    }

    #[test]
    fn config_level_is_the_fallback() {
        let filter = resolve_filter("error", None, None).unwrap();
        assert_eq!(filter.to_string(), "error");
    }

    #[test]
    fn strict_validation_rejects_non_levels() {
        assert!(validate_level("info").is_ok());
        assert!(validate_level("TRACE").is_ok());
        assert!(validate_level(" warn ").is_ok());
        assert!(validate_level("verbose").is_err());
        assert!(validate_level("").is_err());
    }

    #[test]
    fn init_tolerates_an_existing_subscriber() {
        // Another test in this process may have installed one already; both
        // outcomes are acceptable.
        match init("info", None) {
            Ok(()) => {}
            Err(EngineError::Logger(msg)) => assert!(msg.contains("subscriber")),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}
