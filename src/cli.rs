use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "svcbridge",
    version,
    about = "Expose services in a protected network through a reverse SSH tunnel",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(
        short = 'v',
        long,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (-v, -vv, -vvv)"
    )]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Run the local node: accept user traffic and host the tunnel endpoint")]
    Local {
        #[arg(help = "Configuration file path")]
        config: PathBuf,
    },

    #[command(about = "Run the remote node: dial the local node and forward to upstreams")]
    Remote {
        #[arg(help = "Configuration file path")]
        config: PathBuf,
    },
}
