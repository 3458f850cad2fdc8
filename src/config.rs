//! Node configuration
//!
//! Settings come from a JSON file; a handful of command line flags override
//! it. Every field has a default, so a missing file yields a usable devnet node.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::QuorumPolicy;

/// Errors that can occur while loading the configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Command line flags
#[derive(Debug, Parser)]
#[command(name = "utxo-node")]
#[command(about = "Proof-of-work UTXO node", long_about = None)]
pub struct Cli {
    /// Path of the JSON configuration file
    #[arg(short, long, default_value = "./server-config.json")]
    pub config: PathBuf,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Peer to bootstrap from (`ip:port`)
    #[arg(short, long)]
    pub seed: Option<String>,

    /// Serve and sync without mining
    #[arg(long)]
    pub no_mining: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// The `ip:port` announced to peers; `host:port` when absent
    #[serde(default)]
    pub advertised_address: Option<String>,

    #[serde(default)]
    pub seed_node: Option<String>,

    #[serde(default = "default_mining")]
    pub mining: bool,

    #[serde(default = "default_block_reward")]
    pub block_reward: u64,

    /// Leading zero bits required of every block header
    #[serde(default = "default_difficulty")]
    pub difficulty: u32,

    /// Hex ed25519 seed; a fresh key is generated when absent
    #[serde(default)]
    pub miner_secret_key: Option<String>,

    /// sled directory; blocks live in memory only when absent
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    #[serde(default = "default_quorum_size")]
    pub quorum_size: usize,

    #[serde(default = "default_max_quorum_rounds")]
    pub max_quorum_rounds: u32,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_mining() -> bool {
    true
}
fn default_block_reward() -> u64 {
    50
}
fn default_difficulty() -> u32 {
    16
}
fn default_sync_interval_secs() -> u64 {
    10
}
fn default_quorum_size() -> usize {
    3
}
fn default_max_quorum_rounds() -> u32 {
    5
}
fn default_request_timeout_ms() -> u64 {
    3000
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            advertised_address: None,
            seed_node: None,
            mining: default_mining(),
            block_reward: default_block_reward(),
            difficulty: default_difficulty(),
            miner_secret_key: None,
            data_dir: None,
            sync_interval_secs: default_sync_interval_secs(),
            quorum_size: default_quorum_size(),
            max_quorum_rounds: default_max_quorum_rounds(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl NodeConfig {
    /// Reads `path`, falling back to defaults when the file does not exist
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(NodeConfig::default());
        }

        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn from_json(contents: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(contents)
    }

    /// Loads the file named on the command line and applies the flag overrides
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(&cli.config)?;
        config.apply(cli);
        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, cli: &Cli) {
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(seed) = &cli.seed {
            self.seed_node = Some(seed.clone());
        }
        if cli.no_mining {
            self.mining = false;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.quorum_size == 0 {
            return Err(ConfigError::Invalid("quorum_size must be at least 1".to_string()));
        }
        if self.max_quorum_rounds == 0 {
            return Err(ConfigError::Invalid("max_quorum_rounds must be at least 1".to_string()));
        }
        if self.difficulty > 256 {
            return Err(ConfigError::Invalid(format!(
                "difficulty {} exceeds the 256 bits of a header hash",
                self.difficulty
            )));
        }
        Ok(())
    }

    pub fn advertised_address(&self) -> String {
        self.advertised_address
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.host, self.port))
    }

    pub fn quorum_policy(&self) -> QuorumPolicy {
        QuorumPolicy {
            sample_size: self.quorum_size,
            max_rounds: self.max_quorum_rounds,
            request_timeout: self.request_timeout(),
            ..QuorumPolicy::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}
