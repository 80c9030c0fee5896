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

//! Error kinds for the tunnel transport and session layers.
//!
//! Per-connection failures (`AuthFailed`, `UpstreamDialFailed`) are logged
//! and absorbed at the connection boundary; `TransportFatal` ends the serve
//! loop; `ConfigInvalid` aborts startup. A clean EOF from either peer is
//! never represented as an error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed configuration: bad PEM material, missing host key,
    /// duplicate proxy ports, no proxies. Fatal at startup.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// TLS handshake or peer certificate verification failed. Scoped to a
    /// single connection; the accept loop keeps serving.
    #[error("peer authentication failed: {0}")]
    AuthFailed(String),

    /// The listener or established session died in a non-recoverable way.
    #[error("transport failed: {0}")]
    TransportFatal(String),

    /// A reverse-forward request for a bind address/port outside the
    /// configured allow list. The session continues.
    ///
    /// The display string doubles as the policy message reported for the
    /// denied request.
    #[error("port forwarding is disabled")]
    ForwardPolicyDenied { bind_addr: String, bind_port: u32 },

    /// The remote node could not reach the upstream service. Only the
    /// affected tunnel is torn down.
    #[error("upstream dial failed for {target}: {source}")]
    UpstreamDialFailed {
        target: String,
        #[source]
        source: std::io::Error,
    },
}
