//! simda — the snapshot stream client.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use simda::cli::ClientCli;
use simda::client;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let cli = ClientCli::parse();
    if let Err(message) = cli.validate() {
        eprintln!("{message}");
        std::process::exit(1);
    }

    client::run(&cli).await
}
