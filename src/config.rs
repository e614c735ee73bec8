//! Configuration management for the DPoS node daemon.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Platform data directory for the node.
pub fn get_data_dir() -> PathBuf {
    if cfg!(windows) {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dposnode")
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".dposnode")
    }
}

/// How freshly produced blocks are announced to peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastMode {
    /// Send the full block to all peers.
    #[default]
    Full,
    /// Announce the block id only; peers fetch the body on demand.
    Interactive,
    /// Originator sends full blocks, relayers announce ids.
    Mixed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub consensus: ConsensusConfig,
    pub miner: MinerConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub chain_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Ordered validator set; empty means solo mode with this node as
    /// the only producer.
    #[serde(default)]
    pub validators: Vec<String>,
    #[serde(default = "default_blocks_per_term")]
    pub blocks_per_term: i64,
}

fn default_blocks_per_term() -> i64 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinerConfig {
    /// Admission cap for blocks pushed by the network.
    #[serde(default = "default_max_block_queue_size")]
    pub max_block_queue_size: i64,
    #[serde(default)]
    pub broadcast_mode: BroadcastMode,
    #[serde(default = "default_max_block_size_kb")]
    pub max_block_size_kb: usize,
}

fn default_max_block_queue_size() -> i64 {
    100
}

fn default_max_block_size_kb() -> usize {
    1024
}

impl MinerConfig {
    pub fn max_block_size(&self) -> usize {
        self.max_block_size_kb * 1024
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node: NodeConfig {
                name: "dpos-node".to_string(),
                chain_name: "dpos".to_string(),
            },
            consensus: ConsensusConfig {
                validators: Vec::new(),
                blocks_per_term: default_blocks_per_term(),
            },
            miner: MinerConfig {
                max_block_queue_size: default_max_block_queue_size(),
                broadcast_mode: BroadcastMode::default(),
                max_block_size_kb: default_max_block_size_kb(),
            },
            storage: StorageConfig {
                data_dir: get_data_dir().to_string_lossy().to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "plain".to_string(),
            },
        }
    }
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self, String> {
        let content =
            fs::read_to_string(path).map_err(|e| format!("failed to read {path}: {e}"))?;
        toml::from_str(&content).map_err(|e| format!("failed to parse {path}: {e}"))
    }

    pub fn save_to_file(&self, path: &str) -> Result<(), String> {
        let content =
            toml::to_string_pretty(self).map_err(|e| format!("failed to serialize config: {e}"))?;
        if let Some(parent) = PathBuf::from(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| format!("failed to create {parent:?}: {e}"))?;
            }
        }
        fs::write(path, content).map_err(|e| format!("failed to write {path}: {e}"))
    }

    /// Load the config, writing the defaults to disk on first run.
    pub fn load_or_create(path: &str) -> Result<Self, String> {
        match Self::load_from_file(path) {
            Ok(config) => Ok(config),
            Err(_) => {
                let config = Config::default();
                config.save_to_file(path)?;
                Ok(config)
            }
        }
    }
}
