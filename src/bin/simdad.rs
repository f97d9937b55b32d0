//! simdad — the daemon entry point. Runs only as root.

use anyhow::Result;
use clap::Parser;

use simda::cli::DaemonCli;
use simda::daemon;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = DaemonCli::parse();

    if !nix::unistd::Uid::effective().is_root() {
        eprintln!("This program must be run as root.");
        std::process::exit(1);
    }

    daemon::run(cli.config).await
}
