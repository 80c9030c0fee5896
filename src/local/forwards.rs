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

//! Per-session reverse-forward state.
//!
//! Each session keeps its own registry of active forwards keyed by bound
//! address, so parallel sessions never collide in the map. The mutex guards
//! map operations only and is never held across I/O. The accept loop and a
//! cancel request may race on removal; removal is keyed and tolerant of an
//! entry that is already gone.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::proxy;

/// Active reverse forwards of one session: bound address → cancel handle.
#[derive(Clone, Default)]
pub struct ForwardRegistry {
    inner: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl ForwardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a forward. A stale entry under the same bound address is
    /// cancelled and replaced, keeping at most one forward per address.
    pub fn insert(&self, bound_addr: String, token: CancellationToken) {
        let previous = self
            .inner
            .lock()
            .expect("forwards lock poisoned")
            .insert(bound_addr, token);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    /// Cancel and remove the forward at `bound_addr`, closing its listener.
    /// Absence is not an error.
    pub fn cancel(&self, bound_addr: &str) {
        let token = self
            .inner
            .lock()
            .expect("forwards lock poisoned")
            .remove(bound_addr);
        if let Some(token) = token {
            token.cancel();
        }
    }

    /// Keyed removal without cancelling; used by the accept loop on exit.
    pub fn remove(&self, bound_addr: &str) {
        self.inner
            .lock()
            .expect("forwards lock poisoned")
            .remove(bound_addr);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("forwards lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Accept user connections on a forward's listener and map each onto a new
/// `forwarded-tcpip` channel. Runs until the forward is cancelled or the
/// listener fails; either way the registry entry is removed on the way out.
pub(crate) async fn run_accept_loop(
    registry: ForwardRegistry,
    bound_addr: String,
    listener: TcpListener,
    token: CancellationToken,
    handle: russh::server::Handle,
    bind_addr: String,
    bind_port: u32,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, origin)) => {
                    debug!(%bound_addr, %origin, "user connection accepted");
                    tokio::spawn(open_tunnel(
                        handle.clone(),
                        bind_addr.clone(),
                        bind_port,
                        socket,
                        origin,
                    ));
                }
                Err(e) => {
                    warn!(%bound_addr, error = %e, "accept failed, closing reverse forward");
                    break;
                }
            }
        }
    }

    registry.remove(&bound_addr);
    debug!(%bound_addr, "reverse forward closed");
}

/// Open the SSH channel for one user connection and splice the two. A
/// failed channel open drops only this connection.
async fn open_tunnel(
    handle: russh::server::Handle,
    bind_addr: String,
    bind_port: u32,
    socket: TcpStream,
    origin: SocketAddr,
) {
    let _ = socket.set_nodelay(true);

    match handle
        .channel_open_forwarded_tcpip(
            bind_addr,
            bind_port,
            origin.ip().to_string(),
            u32::from(origin.port()),
        )
        .await
    {
        Ok(channel) => {
            let label = format!("tunnel {origin}");
            proxy::splice(channel.into_stream(), socket, &label).await;
        }
        Err(e) => {
            debug!(%origin, error = %e, "channel open failed, dropping connection");
        }
    }
}
