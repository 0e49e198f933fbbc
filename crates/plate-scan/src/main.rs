mod aggregate;
mod cli;
mod ingest;
mod model;
mod notify;
mod pipeline;
mod server;
mod settings;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{CliArgs, Command};
use crate::pipeline::RunError;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), RunError> {
    // Diagnostics go to stderr; stdout stays reserved for the plate text in
    // pipe mode.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = CliArgs::parse();
    let settings = settings::resolve_settings(&args)?;

    match args.command {
        Command::Recognize { timing } => pipeline::run_oneshot(settings, timing).await,
        Command::Serve { .. } => server::run_server(settings).await,
        Command::Watch { .. } => pipeline::run_watch(settings).await,
    }
}
