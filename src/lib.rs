#![forbid(unsafe_code)]

pub mod adapters;
pub mod app;
pub mod commands;
pub mod domain;
pub mod infrastructure;
pub mod ports;

use std::time::Duration;

use clap::Parser;

use commands::{Cli, CliError};

/// Parse the command line and run it on a fresh tokio runtime.
pub fn run() -> Result<(), CliError> {
    let cli = Cli::try_parse()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;

    let result = runtime.block_on(commands::execute(cli));
    // a blocked stdin read must not hold the process open after Ctrl-C
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}
