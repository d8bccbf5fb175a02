//! Daemon configuration: named remote endpoints, key material, tuning knobs.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::progress::DEFAULT_CHUNK_SIZE;

/// Target-host platform, chosen in configuration rather than probed at
/// runtime. Drives strategy selection at dispatch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Linux,
    Windows,
}

/// One named remote host a transfer can touch.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default = "default_platform")]
    pub platform: Platform,
}

fn default_port() -> u16 {
    22
}

fn default_platform() -> Platform {
    Platform::Linux
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Logical name of the endpoint trees are read from.
    pub source: String,
    /// Logical name of the endpoint trees are written to.
    pub dest: String,
    /// Private key used for every endpoint session.
    pub identity_file: PathBuf,
    /// Logical endpoint name -> (host, user) mapping.
    pub endpoints: HashMap<String, EndpointConfig>,
    /// Copy-loop chunk size in bytes. 32 KiB by default; larger chunks
    /// trade lower overhead for coarser progress granularity.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Reconciler tick interval.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Minimum spacing between pushed progress events per job.
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// Worker queue depth. One job is in flight at a time; this only
    /// bounds how many accepted jobs may wait behind it.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// JSONL journal backing the job store. In-memory only when unset.
    #[serde(default)]
    pub journal: Option<PathBuf>,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_progress_interval_ms() -> u64 {
    200
}

fn default_queue_depth() -> usize {
    8
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg: ServerConfig =
            toml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        for name in [&self.source, &self.dest] {
            if !self.endpoints.contains_key(name) {
                anyhow::bail!("config names unknown endpoint '{}'", name);
            }
        }
        if self.chunk_size == 0 {
            anyhow::bail!("chunk_size must be non-zero");
        }
        if self.queue_depth == 0 {
            anyhow::bail!("queue_depth must be non-zero");
        }
        Ok(())
    }

    pub fn endpoint(&self, name: &str) -> Option<&EndpointConfig> {
        self.endpoints.get(name)
    }

    /// Platform of the transfer destination, which picks the strategy.
    pub fn dest_platform(&self) -> Platform {
        self.endpoints
            .get(&self.dest)
            .map(|e| e.platform)
            .unwrap_or(Platform::Linux)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
source = "lab"
dest = "vault"
identity_file = "/etc/relaysync/id_rsa"

[endpoints.lab]
host = "10.0.0.12"
user = "relay"

[endpoints.vault]
host = "10.0.0.40"
user = "relay"
platform = "linux"
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let cfg: ServerConfig = toml::from_str(SAMPLE).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.endpoints.len(), 2);
        assert_eq!(cfg.endpoint("lab").unwrap().port, 22);
        assert_eq!(cfg.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(cfg.poll_interval_ms, 1000);
        assert_eq!(cfg.dest_platform(), Platform::Linux);
    }

    #[test]
    fn rejects_unknown_endpoint_names() {
        let mut cfg: ServerConfig = toml::from_str(SAMPLE).unwrap();
        cfg.dest = "nowhere".into();
        assert!(cfg.validate().is_err());
    }
}
