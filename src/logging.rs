//! Subscriber setup for the `rubric` binary.
//!
//! The library only emits `tracing` events; installing a subscriber is left to
//! the application.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const CRATE_TARGET: &str = "rubric_harness";

/// Install a stderr subscriber.
///
/// `RUST_LOG`, then `RUBRIC_LOG`, take precedence over the flags. A bare
/// level such as `debug` is scoped to this crate.
pub fn init_tracing(
    verbose: bool,
    log_level: Option<&str>,
    log_json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let directive = match (verbose, log_level) {
        (_, Some(level)) if level.contains('=') => level.to_string(),
        (_, Some(level)) => format!("{CRATE_TARGET}={level}"),
        (true, None) => format!("{CRATE_TARGET}=debug"),
        (false, None) => format!("{CRATE_TARGET}=info"),
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env("RUBRIC_LOG"))
        .unwrap_or_else(|_| EnvFilter::new(directive));

    let registry = tracing_subscriber::registry().with(filter);

    if log_json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_ansi(false)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .try_init()?;
    }

    Ok(())
}
