//! Tracing setup
//!
//! Two outputs: a console layer on stderr at the level the user asked for,
//! and a plain-text file holding the full debug log of the last run.

use std::fs::{create_dir_all, File};
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

pub const LOG_FILE_NAME: &str = "termflix-last-run.log";

/// Console level for a `-v` count: warnings by default
pub fn level_for_verbosity(verbose: u8) -> Level {
    match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialize tracing; returns the debug log path
///
/// `RUST_LOG` overrides the console level.
pub fn init_tracing(console_level: Level, logs_dir: &Path) -> Result<PathBuf> {
    create_dir_all(logs_dir)?;
    let log_file_path = logs_dir.join(LOG_FILE_NAME);
    let log_file = File::create(&log_file_path)?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_level.to_string()));

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(console_filter);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(EnvFilter::new("termflix=debug,info"));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::debug!(
        console = %console_level,
        debug_file = %log_file_path.display(),
        "tracing initialized"
    );
    Ok(log_file_path)
}
