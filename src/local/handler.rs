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

//! SSH handler for one tunnel session on the local node.
//!
//! This implements the `russh::server::Handler` trait for the session the
//! remote node runs against us. Authentication is a formality here: both
//! daemons already authenticated each other through mutual TLS, so `none`
//! auth is accepted for the placeholder user. The interesting parts are the
//! reverse-forward requests, gated by the configured allow list and routed
//! to the per-session forward registry.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use russh::server::{Auth, Msg, Session};
use russh::Channel;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::forwards::{self, ForwardRegistry};
use crate::error::Error;

/// Banner written to session channels; the remote side only parks on them.
const SESSION_BANNER: &[u8] = b"Remote forwarding available...\r\n";

pub struct LocalHandler {
    /// Peer address of the tunnel connection, for logging.
    peer: SocketAddr,

    /// Ports the remote node may request reverse forwards for, derived from
    /// the ProxySpec list.
    allowed_ports: Arc<HashSet<u16>>,

    /// Cancelled when the session's transport goes away.
    session_token: CancellationToken,

    /// Active reverse forwards of this session, keyed by bound address.
    forwards: ForwardRegistry,
}

impl LocalHandler {
    pub fn new(
        peer: SocketAddr,
        allowed_ports: Arc<HashSet<u16>>,
        session_token: CancellationToken,
    ) -> Self {
        Self {
            peer,
            allowed_ports,
            session_token,
            forwards: ForwardRegistry::new(),
        }
    }

    /// Policy gate for reverse-forward requests: the wildcard address and a
    /// configured service port, nothing else.
    fn forward_permitted(&self, address: &str, port: u32) -> bool {
        address == "0.0.0.0"
            && u16::try_from(port)
                .map(|p| self.allowed_ports.contains(&p))
                .unwrap_or(false)
    }
}

impl russh::server::Handler for LocalHandler {
    type Error = anyhow::Error;

    /// The outer TLS layer is the real authentication; accept `none`.
    fn auth_none(
        &mut self,
        user: &str,
    ) -> impl std::future::Future<Output = Result<Auth, Self::Error>> + Send {
        tracing::debug!(
            user = %user,
            peer = %self.peer,
            "accepting none auth, peer already authenticated by TLS"
        );
        async { Ok(Auth::Accept) }
    }

    /// Session channels get a banner and are held open until teardown.
    fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> impl std::future::Future<Output = Result<bool, Self::Error>> + Send {
        tracing::debug!(
            peer = %self.peer,
            channel = ?channel.id(),
            "session channel opened"
        );

        let token = self.session_token.clone();
        tokio::spawn(async move {
            if channel.data(SESSION_BANNER).await.is_err() {
                return;
            }
            // Park; dropping the channel before teardown would close it.
            token.cancelled().await;
        });

        async { Ok(true) }
    }

    /// The local node is not an outbound proxy; direct-tcpip is always
    /// denied.
    fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> impl std::future::Future<Output = Result<bool, Self::Error>> + Send {
        tracing::debug!(
            peer = %self.peer,
            host = %host_to_connect,
            port = port_to_connect,
            "denying direct-tcpip channel"
        );
        async { Ok(false) }
    }

    /// Open a listener for a reverse forward and ship every accepted
    /// connection back through the session as a `forwarded-tcpip` channel.
    fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> impl std::future::Future<Output = Result<bool, Self::Error>> + Send {
        let peer = self.peer;
        let requested = *port;
        let address = address.to_string();
        let permitted = self.forward_permitted(&address, requested);
        let handle = session.handle();
        let forwards = self.forwards.clone();
        let session_token = self.session_token.clone();

        async move {
            if !permitted {
                tracing::warn!(
                    peer = %peer,
                    address = %address,
                    port = requested,
                    "{}",
                    Error::ForwardPolicyDenied {
                        bind_addr: address.clone(),
                        bind_port: requested,
                    }
                );
                return Ok(false);
            }

            let listener = match TcpListener::bind(format!("{address}:{requested}")).await {
                Ok(listener) => listener,
                Err(e) => {
                    tracing::warn!(
                        peer = %peer,
                        address = %address,
                        port = requested,
                        error = %e,
                        "failed to bind reverse-forward listener"
                    );
                    return Ok(false);
                }
            };

            let assigned = listener
                .local_addr()
                .map_err(|e| Error::TransportFatal(format!("listener has no local addr: {e}")))?
                .port();
            *port = u32::from(assigned);
            let bound_addr = format!("{address}:{assigned}");

            tracing::info!(peer = %peer, %bound_addr, "reverse forward listening");

            let forward_token = session_token.child_token();
            forwards.insert(bound_addr.clone(), forward_token.clone());
            tokio::spawn(forwards::run_accept_loop(
                forwards.clone(),
                bound_addr,
                listener,
                forward_token,
                handle,
                address,
                u32::from(assigned),
            ));

            Ok(true)
        }
    }

    /// Close the listener for a cancelled forward. A bound address we no
    /// longer know about is not an error.
    fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> impl std::future::Future<Output = Result<bool, Self::Error>> + Send {
        let bound_addr = format!("{address}:{port}");
        let forwards = self.forwards.clone();
        let peer = self.peer;

        async move {
            tracing::info!(peer = %peer, %bound_addr, "reverse forward cancelled");
            forwards.cancel(&bound_addr);
            Ok(true)
        }
    }
}
