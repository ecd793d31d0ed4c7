use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable colored output (for interactive CLI use).
    Human,
    /// Structured JSON output (for log shipping).
    Json,
}

/// Default filter: info+ from the mcm crates, warnings from dependencies.
pub const DEFAULT_FILTER: &str = "mcmctl=info,mcm_core=info,mcm_runtime=info,mcm_iaas=info,mcm_cluster=info,mcm_cli=info,warn";

/// Initialize the global tracing subscriber.
///
/// Call once at program startup. Respects `RUST_LOG` env var for filtering.
pub fn init(format: LogFormat) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Human => {
            let subscriber = fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_writer(std::io::stderr)
                .compact();
            tracing_subscriber::registry()
                .with(env_filter)
                .with(subscriber)
                .init();
        }
        LogFormat::Json => {
            let subscriber = fmt::layer()
                .json()
                .with_target(true)
                .with_writer(std::io::stderr);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(subscriber)
                .init();
        }
    }
}
