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

//! Configuration file loading.

use anyhow::{Context, Result};
use std::path::Path;
use tokio::fs;

use super::{LocalConfig, RemoteConfig};

/// Load and validate a local node configuration from a YAML file.
pub async fn load_local(path: &Path) -> Result<LocalConfig> {
    let content = read(path).await?;
    let config: LocalConfig = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse local configuration at {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

/// Load and validate a remote node configuration from a YAML file.
pub async fn load_remote(path: &Path) -> Result<RemoteConfig> {
    let content = read(path).await?;
    let config: RemoteConfig = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse remote configuration at {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

async fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).await.with_context(|| {
        format!(
            "Failed to read configuration file at {}. Please check file permissions and ensure the file is accessible.",
            path.display()
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = load_local(Path::new("/nonexistent/config.yaml"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read configuration"));
    }

    #[tokio::test]
    async fn test_load_invalid_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Cert: [unterminated").unwrap();
        let err = load_remote(file.path()).await.unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[tokio::test]
    async fn test_load_rejects_invalid_config() {
        // Parses as YAML but fails validation: no proxies.
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "Cert: c\nKey: k\nCAs: ['ca']\nImporter: '127.0.0.1:1'\nProxies: []"
        )
        .unwrap();
        let err = load_remote(file.path()).await.unwrap_err();
        assert!(err.to_string().contains("at least one proxy spec"));
    }
}
