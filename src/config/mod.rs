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

//! Configuration types for the local and remote nodes.
//!
//! Both daemons consume a single YAML file with already-materialized PEM
//! bundles; nothing here generates or rotates key material. Configs are
//! immutable snapshots after startup.

mod loader;

pub use loader::{load_local, load_remote};

use crate::error::Error;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// One forwarded service: the port the local node listens on and the
/// upstream the remote node dials for it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ProxySpec {
    /// Label for the logical service, used in logs only.
    pub name: String,
    /// Port the local node listens on for end-user traffic.
    pub proxy_port: u16,
    /// Host the remote node dials for each tunnel.
    pub upstream_host: String,
    /// Port the remote node dials for each tunnel.
    pub upstream_port: u16,
}

impl ProxySpec {
    /// The upstream dial target as `host:port`.
    pub fn upstream(&self) -> String {
        format!("{}:{}", self.upstream_host, self.upstream_port)
    }
}

impl FromStr for ProxySpec {
    type Err = Error;

    /// Parse the compact `"name:port,host:port"` form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            Error::ConfigInvalid(format!(
                "invalid proxy spec '{s}': expected name:port,host:port"
            ))
        };

        let (service, upstream) = s.split_once(',').ok_or_else(invalid)?;
        let (name, proxy_port) = service.split_once(':').ok_or_else(invalid)?;
        let (upstream_host, upstream_port) = upstream.split_once(':').ok_or_else(invalid)?;

        if name.is_empty() || upstream_host.is_empty() {
            return Err(invalid());
        }

        Ok(ProxySpec {
            name: name.to_string(),
            proxy_port: proxy_port.parse().map_err(|_| invalid())?,
            upstream_host: upstream_host.to_string(),
            upstream_port: upstream_port.parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for ProxySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{},{}:{}",
            self.name, self.proxy_port, self.upstream_host, self.upstream_port
        )
    }
}

/// Transport carrying the SSH session between the two nodes, fixed per
/// deployment. Both nodes must agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportMode {
    /// SSH directly over the mutual-TLS stream.
    #[default]
    DirectTls,
    /// SSH over binary WebSocket frames over the mutual-TLS stream.
    Websocket,
}

/// Configuration for the local node (user-facing side).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LocalConfig {
    /// PEM certificate presented to the remote node.
    pub cert: String,
    /// PEM private key for `cert`.
    pub key: String,
    /// PEM certificates the remote node's certificate must chain to.
    #[serde(rename = "CAs")]
    pub cas: Vec<String>,
    /// OpenSSH private key used as the SSH host key. Required; there is no
    /// generated fallback.
    pub host_key: String,
    /// Control listener address, `host:port` or a bare port (bound on all
    /// interfaces).
    pub listen: String,
    #[serde(default)]
    pub transport: TransportMode,
    /// HTTP upgrade path when `transport` is `websocket`.
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    pub services: Vec<ProxySpec>,
}

fn default_ws_path() -> String {
    "/".to_string()
}

impl LocalConfig {
    /// Normalized listen address. A bare port listens on all interfaces.
    pub fn listen_addr(&self) -> String {
        if self.listen.parse::<u16>().is_ok() {
            format!("0.0.0.0:{}", self.listen)
        } else {
            self.listen.clone()
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        validate_common(&self.cert, &self.key, &self.cas, &self.services)?;
        if self.host_key.trim().is_empty() {
            return Err(Error::ConfigInvalid("HostKey is required".to_string()));
        }
        if !self.ws_path.starts_with('/') {
            return Err(Error::ConfigInvalid(format!(
                "WsPath must start with '/': {}",
                self.ws_path
            )));
        }
        Ok(())
    }
}

/// Configuration for the remote node (upstream side).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RemoteConfig {
    pub cert: String,
    pub key: String,
    #[serde(rename = "CAs")]
    pub cas: Vec<String>,
    /// Dial target for the local node: `host:port` for direct TLS, or
    /// `wss://host:port[/path]` for the WebSocket transport.
    pub importer: String,
    pub proxies: Vec<ProxySpec>,
}

impl RemoteConfig {
    pub fn validate(&self) -> Result<(), Error> {
        validate_common(&self.cert, &self.key, &self.cas, &self.proxies)?;
        self.importer_endpoint().map(|_| ())
    }

    /// Parse `importer` into a dial target plus transport selection.
    pub fn importer_endpoint(&self) -> Result<ImporterEndpoint, Error> {
        ImporterEndpoint::parse(&self.importer)
    }
}

/// Where and how the remote node reaches the local node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImporterEndpoint {
    Direct {
        addr: String,
    },
    Websocket {
        addr: String,
        /// Full `wss://` URL used for the HTTP upgrade request.
        url: String,
    },
}

impl ImporterEndpoint {
    fn parse(importer: &str) -> Result<Self, Error> {
        let invalid = || {
            Error::ConfigInvalid(format!(
                "invalid Importer '{importer}': expected host:port or wss://host:port[/path]"
            ))
        };

        if let Some(rest) = importer.strip_prefix("wss://") {
            let authority = rest.split('/').next().unwrap_or_default();
            if authority.is_empty() || !authority.contains(':') {
                return Err(invalid());
            }
            return Ok(ImporterEndpoint::Websocket {
                addr: authority.to_string(),
                url: importer.to_string(),
            });
        }
        if importer.contains("://") || !importer.contains(':') {
            return Err(invalid());
        }
        Ok(ImporterEndpoint::Direct {
            addr: importer.to_string(),
        })
    }

    /// The TCP dial target.
    pub fn addr(&self) -> &str {
        match self {
            ImporterEndpoint::Direct { addr } => addr,
            ImporterEndpoint::Websocket { addr, .. } => addr,
        }
    }

    /// Host part, used as the TLS server name (not verified against the
    /// certificate, see the transport layer).
    pub fn host(&self) -> &str {
        self.addr().rsplit_once(':').map(|(h, _)| h).unwrap_or("")
    }
}

fn validate_common(
    cert: &str,
    key: &str,
    cas: &[String],
    specs: &[ProxySpec],
) -> Result<(), Error> {
    if cert.trim().is_empty() || key.trim().is_empty() {
        return Err(Error::ConfigInvalid(
            "Cert and Key are required".to_string(),
        ));
    }
    if cas.is_empty() || cas.iter().all(|ca| ca.trim().is_empty()) {
        return Err(Error::ConfigInvalid(
            "at least one CA certificate is required".to_string(),
        ));
    }
    if specs.is_empty() {
        return Err(Error::ConfigInvalid(
            "at least one proxy spec is required".to_string(),
        ));
    }
    let mut seen = std::collections::HashSet::new();
    for spec in specs {
        if !seen.insert(spec.proxy_port) {
            return Err(Error::ConfigInvalid(format!(
                "duplicate proxy port {} ({})",
                spec.proxy_port, spec.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proxy_spec() {
        let spec: ProxySpec = "wow:21,test:23".parse().unwrap();
        assert_eq!(spec.name, "wow");
        assert_eq!(spec.proxy_port, 21);
        assert_eq!(spec.upstream_host, "test");
        assert_eq!(spec.upstream_port, 23);
    }

    #[test]
    fn test_parse_proxy_spec_roundtrip() {
        let spec: ProxySpec = "web:8080,127.0.0.1:80".parse().unwrap();
        assert_eq!(spec.to_string(), "web:8080,127.0.0.1:80");
    }

    #[test]
    fn test_invalid_proxy_specs() {
        assert!("21:test".parse::<ProxySpec>().is_err());
        assert!("".parse::<ProxySpec>().is_err());
        assert!("wow:21".parse::<ProxySpec>().is_err());
        assert!("wow:x,test:23".parse::<ProxySpec>().is_err());
        assert!("wow:21,test:y".parse::<ProxySpec>().is_err());
        assert!(":21,test:23".parse::<ProxySpec>().is_err());
        assert!("wow:21,:23".parse::<ProxySpec>().is_err());
        assert!("wow:70000,test:23".parse::<ProxySpec>().is_err());
    }

    #[test]
    fn test_listen_addr_normalization() {
        let mut config = local_fixture();
        config.listen = "9443".to_string();
        assert_eq!(config.listen_addr(), "0.0.0.0:9443");

        config.listen = "127.0.0.1:9443".to_string();
        assert_eq!(config.listen_addr(), "127.0.0.1:9443");
    }

    #[test]
    fn test_importer_endpoint_direct() {
        let endpoint = ImporterEndpoint::parse("importer.example:9443").unwrap();
        assert_eq!(
            endpoint,
            ImporterEndpoint::Direct {
                addr: "importer.example:9443".to_string()
            }
        );
        assert_eq!(endpoint.host(), "importer.example");
    }

    #[test]
    fn test_importer_endpoint_websocket() {
        let endpoint = ImporterEndpoint::parse("wss://importer.example:9443/tunnel").unwrap();
        match endpoint {
            ImporterEndpoint::Websocket { addr, url } => {
                assert_eq!(addr, "importer.example:9443");
                assert_eq!(url, "wss://importer.example:9443/tunnel");
            }
            _ => panic!("Expected Websocket endpoint"),
        }
    }

    #[test]
    fn test_importer_endpoint_invalid() {
        assert!(ImporterEndpoint::parse("importer.example").is_err());
        assert!(ImporterEndpoint::parse("wss://").is_err());
        assert!(ImporterEndpoint::parse("wss://noport/").is_err());
        assert!(ImporterEndpoint::parse("http://importer.example:9443").is_err());
    }

    #[test]
    fn test_duplicate_proxy_ports_rejected() {
        let mut config = local_fixture();
        config.services.push(config.services[0].clone());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate proxy port"));
    }

    #[test]
    fn test_missing_host_key_rejected() {
        let mut config = local_fixture();
        config.host_key = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_local_yaml_deserialization() {
        let yaml = r#"
Cert: "cert pem"
Key: "key pem"
CAs:
  - "ca pem"
HostKey: "host key"
Listen: "0.0.0.0:9443"
Transport: websocket
Services:
  - Name: web
    ProxyPort: 8080
    UpstreamHost: 127.0.0.1
    UpstreamPort: 80
"#;
        let config: LocalConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.transport, TransportMode::Websocket);
        assert_eq!(config.ws_path, "/");
        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services[0].proxy_port, 8080);
        config.validate().unwrap();
    }

    #[test]
    fn test_remote_yaml_deserialization() {
        let yaml = r#"
Cert: "cert pem"
Key: "key pem"
CAs:
  - "ca pem"
Importer: "127.0.0.1:9443"
Proxies:
  - Name: web
    ProxyPort: 8080
    UpstreamHost: 127.0.0.1
    UpstreamPort: 80
"#;
        let config: RemoteConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.importer_endpoint().unwrap().host(), "127.0.0.1");
    }

    fn local_fixture() -> LocalConfig {
        LocalConfig {
            cert: "cert".to_string(),
            key: "key".to_string(),
            cas: vec!["ca".to_string()],
            host_key: "host key".to_string(),
            listen: "0.0.0.0:9443".to_string(),
            transport: TransportMode::DirectTls,
            ws_path: "/".to_string(),
            services: vec![ProxySpec {
                name: "web".to_string(),
                proxy_port: 8080,
                upstream_host: "127.0.0.1".to_string(),
                upstream_port: 80,
            }],
        }
    }
}
