use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use svcbridge::cli::{Cli, Commands};
use svcbridge::{config, local::LocalNode, remote};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose);

    tracing::info!(version = %svcbridge::VERSION, "svcbridge starting");

    // Ctrl-C cancels the root token; a cancelled serve loop returns Ok,
    // so the interrupt path is the only one that exits with status 0.
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            signal_token.cancel();
        }
    });

    match cli.command {
        Commands::Local { config: path } => {
            let config = config::load_local(&path).await?;
            let node = LocalNode::from_config(config)?;
            node.serve(shutdown).await
        }
        Commands::Remote { config: path } => {
            let config = config::load_remote(&path).await?;
            remote::run(config, shutdown).await
        }
    }
}

fn init_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => EnvFilter::new("svcbridge=warn"),
        1 => EnvFilter::new("svcbridge=info"),
        2 => EnvFilter::new("svcbridge=debug"),
        _ => EnvFilter::new("svcbridge=trace"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
