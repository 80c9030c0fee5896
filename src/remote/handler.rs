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

//! SSH handler for the remote node's client session.
//!
//! Every `forwarded-tcpip` channel the local node opens corresponds to one
//! end-user connection. The handler resolves the proxy spec by forwarded
//! port, dials the upstream, and splices the two. An unreachable upstream
//! closes only that channel.

use std::collections::HashMap;
use std::sync::Arc;

use russh::client::{Msg, Session};
use russh::keys::ssh_key;
use russh::Channel;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::config::ProxySpec;
use crate::error::Error;
use crate::proxy;

pub struct RemoteHandler {
    /// Proxy specs by forwarded port.
    upstreams: Arc<HashMap<u16, ProxySpec>>,
}

impl RemoteHandler {
    pub fn new(proxies: &[ProxySpec]) -> Self {
        let upstreams = proxies
            .iter()
            .map(|spec| (spec.proxy_port, spec.clone()))
            .collect();
        Self {
            upstreams: Arc::new(upstreams),
        }
    }
}

impl russh::client::Handler for RemoteHandler {
    type Error = anyhow::Error;

    /// Host identity is established by the mutual-TLS layer underneath; the
    /// SSH host key adds nothing on this deployment.
    fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> impl std::future::Future<Output = Result<bool, Self::Error>> + Send {
        async { Ok(true) }
    }

    fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        let spec = u16::try_from(connected_port)
            .ok()
            .and_then(|port| self.upstreams.get(&port).cloned());
        let connected = format!("{connected_address}:{connected_port}");
        let origin = format!("{originator_address}:{originator_port}");

        async move {
            let Some(spec) = spec else {
                warn!("rejecting tunnel for unknown forwarded address {connected}");
                let _ = channel.close().await;
                return Ok(());
            };

            // The copy loop must not run inside the session handler; a
            // blocked handler stalls packet processing for every tunnel.
            tokio::spawn(async move {
                let target = spec.upstream();
                debug!("{}: dialing upstream {target} for {origin}", spec.name);
                match TcpStream::connect(&target).await {
                    Ok(upstream) => {
                        let _ = upstream.set_nodelay(true);
                        let label = format!("{} {origin}", spec.name);
                        proxy::splice(channel.into_stream(), upstream, &label).await;
                    }
                    Err(e) => {
                        warn!(
                            "{}",
                            Error::UpstreamDialFailed {
                                target,
                                source: e,
                            }
                        );
                        let _ = channel.close().await;
                    }
                }
            });

            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, port: u16) -> ProxySpec {
        ProxySpec {
            name: name.to_string(),
            proxy_port: port,
            upstream_host: "127.0.0.1".to_string(),
            upstream_port: 80,
        }
    }

    #[test]
    fn test_upstream_lookup_by_forwarded_port() {
        let handler = RemoteHandler::new(&[spec("web", 8080), spec("db", 5432)]);
        assert_eq!(handler.upstreams.get(&8080).unwrap().name, "web");
        assert_eq!(handler.upstreams.get(&5432).unwrap().name, "db");
        assert!(handler.upstreams.get(&22).is_none());
    }
}
