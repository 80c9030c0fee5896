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

//! The remote node: initiates the tunnel and exports upstream services.
//!
//! # Architecture
//!
//! ```text
//! [User] → [Local listener] → [SSH channel] → [TLS(/WS)] → [Upstream]
//!           (local node)                       (this node dials both)
//! ```
//!
//! The remote node dials the local node's control port, completes the
//! mutual-TLS handshake (plus the WebSocket upgrade when deployed that
//! way), runs an SSH client over the result, and requests one reverse
//! forward per configured proxy. From then on the session handler carries
//! the data plane: every `forwarded-tcpip` channel the local node opens is
//! dialed into its upstream and spliced.

pub mod handler;

pub use self::handler::RemoteHandler;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::Disconnect;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::config::{ImporterEndpoint, RemoteConfig};
use crate::error::Error;
use crate::transport::{self, ws, BoxedStream, HANDSHAKE_TIMEOUT};

/// Placeholder SSH user; authentication happens at the TLS layer.
const SSH_USER: &str = "testuser";

/// SSH-level keepalive, so a dead importer is noticed without traffic.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// How often the supervisor checks the session for silent death.
const SESSION_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Run the remote daemon until the session dies or the token is cancelled.
pub async fn run(config: RemoteConfig, shutdown: CancellationToken) -> Result<()> {
    let connector = transport::tls::connector(&config)?;
    let endpoint = config.importer_endpoint()?;

    tracing::info!(importer = %config.importer, "dialing local node");
    let tcp = TcpStream::connect(endpoint.addr())
        .await
        .with_context(|| format!("Failed to dial importer at {}", endpoint.addr()))?;
    let _ = tcp.set_nodelay(true);

    let server_name = transport::tls::server_name(endpoint.host())?;
    let tls_stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, connector.connect(server_name, tcp))
        .await
        .map_err(|_| Error::AuthFailed("TLS handshake timed out".to_string()))?
        .map_err(|e| Error::AuthFailed(format!("TLS handshake failed: {e}")))?;
    tracing::debug!("TLS handshake complete");

    let stream: BoxedStream = match &endpoint {
        ImporterEndpoint::Direct { .. } => Box::new(tls_stream),
        ImporterEndpoint::Websocket { url, .. } => Box::new(ws::connect(url, tls_stream).await?),
    };

    let ssh_config = Arc::new(russh::client::Config {
        keepalive_interval: Some(KEEPALIVE_INTERVAL),
        ..Default::default()
    });
    let handler = RemoteHandler::new(&config.proxies);
    let mut handle = russh::client::connect_stream(ssh_config, stream, handler)
        .await
        .context("SSH handshake failed")?;

    let auth = handle
        .authenticate_none(SSH_USER)
        .await
        .context("SSH authentication failed")?;
    if !auth.success() {
        return Err(Error::AuthFailed("importer rejected none auth".to_string()).into());
    }
    tracing::info!("tunnel session established");

    // One reverse forward per proxy. A policy denial only loses that
    // service; the session and the other forwards keep going.
    let mut established = 0usize;
    for spec in &config.proxies {
        match handle
            .tcpip_forward("0.0.0.0", u32::from(spec.proxy_port))
            .await
        {
            Ok(assigned) => {
                tracing::info!(
                    service = %spec.name,
                    port = assigned,
                    upstream = %spec.upstream(),
                    "reverse forward established"
                );
                established += 1;
            }
            Err(russh::Error::RequestDenied) => {
                tracing::warn!(
                    service = %spec.name,
                    port = spec.proxy_port,
                    "reverse forward denied by importer policy"
                );
            }
            Err(e) => {
                return Err(anyhow::Error::from(e)
                    .context(format!("reverse forward request for {} failed", spec.name)));
            }
        }
    }
    if established == 0 {
        return Err(Error::TransportFatal(
            "no reverse forward could be established".to_string(),
        )
        .into());
    }

    // The handler carries the data plane; this loop only watches session
    // health and the shutdown signal.
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("shutting down tunnel session");
                let _ = handle
                    .disconnect(Disconnect::ByApplication, "shutdown", "en")
                    .await;
                return Ok(());
            }
            _ = tokio::time::sleep(SESSION_CHECK_INTERVAL) => {
                if handle.is_closed() {
                    return Err(Error::TransportFatal(
                        "tunnel session closed by peer".to_string(),
                    )
                    .into());
                }
            }
        }
    }
}
