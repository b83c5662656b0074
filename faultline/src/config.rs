//! Startup configuration and the JSON populate file.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use serde::Deserialize;

use crate::toxic::ToxicInput;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:0";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host the admin API listens on.
    pub host: String,
    /// Port the admin API listens on.
    pub port: u16,
    /// Optional JSON file with proxies to create at startup.
    pub config_file: Option<PathBuf>,
    /// Seed for the deterministic per-stage RNGs.
    pub seed: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 8474,
            config_file: None,
            seed: default_seed(),
        }
    }
}

/// Wall-clock nanoseconds, matching the conventional default for fault
/// randomization seeds.
pub fn default_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or(0x5EED)
}

/// One proxy entry of the populate payload (file or admin API).
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyInput {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub listen: String,
    #[serde(default)]
    pub upstream: String,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub toxics: Vec<ToxicInput>,
}

impl ProxyInput {
    pub fn listen_or_default(&self) -> String {
        if self.listen.is_empty() {
            DEFAULT_LISTEN.to_owned()
        } else {
            self.listen.clone()
        }
    }
}

/// Partial proxy update: omitted fields keep their current values.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyPatch {
    #[serde(default)]
    pub listen: Option<String>,
    #[serde(default)]
    pub upstream: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

pub fn load_populate_file(path: &Path) -> anyhow::Result<Vec<ProxyInput>> {
    let data = std::fs::read(path).with_context(|| format!("couldn't read {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("couldn't parse {}", path.display()))
}
