use crate::cli::CloudbenchCli;
use clap::Parser;

/// Initialise the CLI and logging for the cloudbench runner.
pub fn init() -> CloudbenchCli {
    env_logger::init();

    CloudbenchCli::parse()
}
