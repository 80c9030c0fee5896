pub mod cli;
pub mod config;
pub mod error;
pub mod local;
pub mod proxy;
pub mod remote;
pub mod transport;

pub use cli::Cli;
pub use config::{LocalConfig, ProxySpec, RemoteConfig};
pub use error::Error;

/// Version reported in the startup log line.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
