//! Tracing initialisation for the fineprune binary.
//!
//! Call [`init_tracing`] once at program start. Operator diagnostics go to
//! stderr through `tracing`; the run log under the output directory is
//! written separately and is not affected by these settings.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const CRATES: [&str; 3] = ["fineprune", "fineprune_core", "fineprune_phases"];

/// Initialise the global tracing subscriber.
///
/// * `json` - emit newline-delimited JSON instead of human-readable lines.
/// * `level` - verbosity of the fineprune crates when `RUST_LOG` is not set.
///
/// Only the first call takes effect.
pub fn init_tracing(json: bool, level: Level) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(level));
    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    let installed = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.json())
            .try_init()
    } else {
        tracing_subscriber::registry().with(filter).with(layer).try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// `level` for fineprune itself, warnings only for dependencies.
fn default_filter(level: Level) -> EnvFilter {
    EnvFilter::new(default_directives(level))
}

fn default_directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    std::iter::once("warn".to_string())
        .chain(CRATES.iter().map(|krate| format!("{krate}={level}")))
        .collect::<Vec<_>>()
        .join(",")
}
