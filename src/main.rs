//! termflix - stream torrents straight into a local media player
//!
//! # Usage
//!
//! ```bash
//! termflix stream "magnet:?xt=urn:btih:..." --title "Big Buck Bunny"
//! termflix history
//! termflix status --json
//! ```

use clap::Parser;

use termflix::cli::{Cli, Command, ExitCode, Output};
use termflix::commands;
use termflix::config::Config;
use termflix::logging;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    run_cli(cli).await.into()
}

/// Run CLI command and return exit code
async fn run_cli(cli: Cli) -> ExitCode {
    let output = Output::new(&cli);

    let loaded = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    let (config, config_error) = match loaded {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };

    let level = logging::level_for_verbosity(cli.verbose);
    if let Err(e) = logging::init_tracing(level, &config.state_dir()) {
        output.info(format!("Logging to file disabled: {}", e));
    }
    // Reported only now that tracing is up
    if let Some(e) = config_error {
        tracing::warn!(error = %format!("{:#}", e), "invalid config, using defaults");
        output.info(format!("Ignoring config ({:#}), using defaults", e));
    }

    match cli.command {
        Command::Stream(cmd) => commands::stream_cmd(cmd, &config, &output).await,

        Command::Normalize(cmd) => commands::normalize_cmd(cmd, &output).await,

        Command::History(cmd) => commands::history_cmd(cmd, &config, &output).await,

        Command::Status(cmd) => commands::status_cmd(cmd, &config, &output).await,
    }
}
