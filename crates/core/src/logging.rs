//! Logging and observability
//!
//! Structured logging via `tracing-subscriber`, in text or JSON format, chosen
//! at runtime through CLI flags and environment variables.
//!
//! All logging output is directed to stderr to preserve stdout for command output.

use anyhow::Result;
use std::{io, sync::Once};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Initialize the logging system with optional format specification
///
/// Safe to call multiple times; subsequent calls are no-ops.
///
/// ## Arguments
///
/// * `format` - `None` or `"text"` for human-readable output, `"json"` for
///   structured JSON lines
///
/// ## Environment Variables
///
/// * `MANGO_LOG_FORMAT` - Log output format when `format` is `None`
/// * `MANGO_LOG` - Logging filter
/// * `RUST_LOG` - Fallback filter when `MANGO_LOG` is unset
pub fn init(format: Option<&str>) -> Result<()> {
    INIT.call_once(|| {
        let filter = create_env_filter();

        let env_format = std::env::var("MANGO_LOG_FORMAT").ok();
        let effective_format = format.or(env_format.as_deref()).unwrap_or("text");

        match effective_format {
            "json" => {
                tracing_subscriber::registry()
                    .with(
                        fmt::layer()
                            .json()
                            .with_target(true)
                            .with_span_events(fmt::format::FmtSpan::CLOSE)
                            .with_writer(io::stderr),
                    )
                    .with(filter)
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(fmt::layer().with_target(false).with_writer(io::stderr))
                    .with(filter)
                    .init();
            }
        }

        tracing::debug!("Logging initialized with format: {}", effective_format);
    });

    Ok(())
}

/// Create an EnvFilter based on environment variables
fn create_env_filter() -> EnvFilter {
    if let Ok(mango_log) = std::env::var("MANGO_LOG") {
        EnvFilter::try_new(&mango_log).unwrap_or_else(|_| {
            tracing::warn!(
                "Invalid MANGO_LOG specification '{}', using default 'info'",
                mango_log
            );
            EnvFilter::new("info")
        })
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Check if logging has been initialized
pub fn is_initialized() -> bool {
    INIT.is_completed()
}
