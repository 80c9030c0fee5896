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

//! Transport stack between the two nodes: TCP → mutual TLS → optionally a
//! WebSocket framed layer, presented upward as a plain byte stream.
//!
//! The SSH layer never branches on the deployment transport; both variants
//! are erased behind [`BoxedStream`] at connection setup time.

pub mod tls;
pub mod ws;

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Bound on the TLS handshake on both sides.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Capability set the SSH layer runs over: an ordered, reliable byte
/// stream, regardless of what carries it.
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelStream for T {}

pub type BoxedStream = Box<dyn TunnelStream>;
