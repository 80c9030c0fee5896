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

//! Shared fixtures for integration tests: a throwaway PKI, SSH host keys,
//! config builders, and mock upstream servers.

#![allow(dead_code)]

use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{Algorithm, LineEnding};
use svcbridge::config::{LocalConfig, ProxySpec, RemoteConfig, TransportMode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// A self-signed CA that can issue leaf certificates for either node.
pub struct TestCa {
    pub cert_pem: String,
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl TestCa {
    pub fn new() -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "svcbridge test CA");
        let cert = params.self_signed(&key).unwrap();
        Self {
            cert_pem: cert.pem(),
            cert,
            key,
        }
    }

    /// Issue a leaf certificate; returns (cert PEM, key PEM).
    pub fn issue(&self, name: &str) -> (String, String) {
        let leaf_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        let cert = params.signed_by(&leaf_key, &self.cert, &self.key).unwrap();
        (cert.pem(), leaf_key.serialize_pem())
    }
}

/// Fresh OpenSSH-encoded host key for the local node.
pub fn host_key_pem() -> String {
    let key = russh::keys::PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    key.to_openssh(LineEnding::LF).unwrap().to_string()
}

pub fn proxy_spec(name: &str, proxy_port: u16, upstream_port: u16) -> ProxySpec {
    ProxySpec {
        name: name.to_string(),
        proxy_port,
        upstream_host: "127.0.0.1".to_string(),
        upstream_port,
    }
}

pub fn local_config(
    ca: &TestCa,
    host_key: String,
    transport: TransportMode,
    services: Vec<ProxySpec>,
) -> LocalConfig {
    let (cert, key) = ca.issue("localhost");
    LocalConfig {
        cert,
        key,
        cas: vec![ca.cert_pem.clone()],
        host_key,
        listen: "127.0.0.1:0".to_string(),
        transport,
        ws_path: "/".to_string(),
        services,
    }
}

pub fn remote_config(ca: &TestCa, importer: String, proxies: Vec<ProxySpec>) -> RemoteConfig {
    let (cert, key) = ca.issue("localhost");
    RemoteConfig {
        cert,
        key,
        cas: vec![ca.cert_pem.clone()],
        importer,
        proxies,
    }
}

/// A port that was free a moment ago. Good enough for loopback tests.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// TCP server echoing every byte back until the client half-closes.
pub async fn spawn_echo_server() -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = tokio::io::split(socket);
                let _ = tokio::io::copy(&mut read, &mut write).await;
                let _ = write.shutdown().await;
            });
        }
    });
    (port, task)
}

/// TCP server that records everything it reads. Returns the captured bytes
/// of the first connection through the oneshot receiver.
pub async fn spawn_sink_server() -> (u16, tokio::sync::oneshot::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            let mut captured = Vec::new();
            let _ = socket.read_to_end(&mut captured).await;
            let _ = tx.send(captured);
        }
    });
    (port, rx)
}
