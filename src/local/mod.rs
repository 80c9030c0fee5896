// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The local node: accepts the remote node's tunnel connection and serves
//! end-user traffic through it.
//!
//! # Overview
//!
//! One control listener accepts TCP connections from the remote node. Each
//! connection is wrapped in mutual TLS (and, per deployment, the WebSocket
//! framed transport), then an SSH server session runs over the resulting
//! byte stream. Reverse-forward requests arriving on that session open the
//! per-service user-facing listeners; see [`handler`] and [`forwards`].
//!
//! A session's lifetime owns everything below it: when the transport dies
//! or the daemon shuts down, the session token cancels every forward, which
//! closes its listener and unblocks its tunnels.

pub mod forwards;
pub mod handler;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::config::{LocalConfig, TransportMode};
use crate::error::Error;
use crate::transport::{self, ws, BoxedStream, HANDSHAKE_TIMEOUT};

pub use self::handler::LocalHandler;

/// Delay before retrying after a temporary accept failure.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(5);

/// The local daemon.
#[derive(Clone)]
pub struct LocalNode {
    config: Arc<LocalConfig>,
    acceptor: tokio_rustls::TlsAcceptor,
    ssh_config: Arc<russh::server::Config>,
    allowed_ports: Arc<HashSet<u16>>,
}

impl LocalNode {
    /// Build the node from a validated configuration. Fails if the TLS
    /// material or the SSH host key do not parse.
    pub fn from_config(config: LocalConfig) -> Result<Self> {
        let acceptor = transport::tls::acceptor(&config)?;

        let host_key = russh::keys::decode_secret_key(&config.host_key, None)
            .map_err(|e| Error::ConfigInvalid(format!("invalid HostKey: {e}")))?;

        let ssh_config = russh::server::Config {
            keys: vec![host_key],
            auth_rejection_time: Duration::from_secs(3),
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        };

        let allowed_ports = config.services.iter().map(|s| s.proxy_port).collect();

        Ok(Self {
            config: Arc::new(config),
            acceptor,
            ssh_config: Arc::new(ssh_config),
            allowed_ports: Arc::new(allowed_ports),
        })
    }

    /// Bind the control listener from the configuration and serve until the
    /// token is cancelled.
    pub async fn serve(&self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind control listener on {addr}"))?;
        self.serve_listener(listener, shutdown).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve_listener(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        tracing::info!(
            local_addr = ?listener.local_addr(),
            "control listener ready"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("control listener stopping");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::info!(peer = %peer, "remote node connected");
                        let node = self.clone();
                        let session_token = shutdown.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = node.handle_connection(stream, peer, session_token).await {
                                tracing::warn!(peer = %peer, error = %e, "session ended with error");
                            }
                        });
                    }
                    Err(e) if is_temporary(&e) => {
                        tracing::warn!(error = %e, "temporary accept error, retrying");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                    Err(e) => {
                        return Err(
                            Error::TransportFatal(format!("control listener died: {e}")).into()
                        );
                    }
                }
            }
        }
    }

    /// Run one tunnel session: TLS handshake, optional WebSocket upgrade,
    /// then the SSH server until either side tears the transport down.
    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        session_token: CancellationToken,
    ) -> Result<()> {
        let _ = stream.set_nodelay(true);

        let tls_stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.acceptor.accept(stream))
            .await
            .map_err(|_| Error::AuthFailed("TLS handshake timed out".to_string()))?
            .map_err(|e| Error::AuthFailed(format!("TLS handshake failed: {e}")))?;
        tracing::debug!(peer = %peer, "TLS handshake complete");

        let stream: BoxedStream = match self.config.transport {
            TransportMode::DirectTls => Box::new(tls_stream),
            TransportMode::Websocket => {
                Box::new(ws::accept(tls_stream, &self.config.ws_path).await?)
            }
        };

        let handler = LocalHandler::new(peer, Arc::clone(&self.allowed_ports), session_token.clone());
        let session = russh::server::run_stream(Arc::clone(&self.ssh_config), stream, handler)
            .await
            .context("SSH handshake failed")?;
        tracing::info!(peer = %peer, "tunnel session established");

        let result = tokio::select! {
            r = session => r,
            _ = session_token.cancelled() => Ok(()),
        };

        // The session owns its forwards; tear them all down with it.
        session_token.cancel();
        tracing::info!(peer = %peer, "tunnel session ended");
        result
    }
}

fn is_temporary(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxySpec;

    #[test]
    fn test_from_config_rejects_garbage_host_key() {
        let config = LocalConfig {
            cert: "not pem".to_string(),
            key: "not pem".to_string(),
            cas: vec!["not pem".to_string()],
            host_key: "not an openssh key".to_string(),
            listen: "127.0.0.1:0".to_string(),
            transport: TransportMode::DirectTls,
            ws_path: "/".to_string(),
            services: vec![ProxySpec {
                name: "web".to_string(),
                proxy_port: 8080,
                upstream_host: "127.0.0.1".to_string(),
                upstream_port: 80,
            }],
        };
        assert!(LocalNode::from_config(config).is_err());
    }

    #[test]
    fn test_temporary_error_classification() {
        assert!(is_temporary(&std::io::ErrorKind::ConnectionAborted.into()));
        assert!(is_temporary(&std::io::ErrorKind::Interrupted.into()));
        assert!(!is_temporary(&std::io::ErrorKind::PermissionDenied.into()));
    }
}
