//! `tracing` subscriber setup for the binary and for tests.

use std::io;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Map a `-v` count to a level: 0=error, 1=warn, 2=info, 3=debug, 4+=trace.
pub fn level_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber.  `RUST_LOG` overrides `verbosity`.
/// Logs go to stderr, or are appended to `log_file` without ANSI colours.
pub fn init_logging(verbosity: u8, log_file: Option<&Path>) -> io::Result<()> {
    let level = level_for(verbosity);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ckptsync={level}")));
    let detailed = verbosity >= 3;

    let result = match log_file {
        None => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_file(detailed).with_line_number(detailed))
            .try_init(),
        Some(path) => {
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_writer(Mutex::new(file))
                        .with_ansi(false)
                        .with_target(true)
                        .with_file(detailed)
                        .with_line_number(detailed),
                )
                .try_init()
        }
    };
    result.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
}

/// Best-effort test logger; ignores a subscriber that is already installed.
pub fn init_test_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("ckptsync=debug"))
        .with(fmt::layer().with_test_writer())
        .try_init();
}
