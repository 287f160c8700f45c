// src/config.rs

use anyhow::Result;
use serde::Deserialize;

/// The main configuration struct for the pyrite node.
#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    pub node: NodeConfig,
    pub p2p: P2PConfig,
    pub sync: SyncConfig,
    pub consensus: ConsensusConfig,
}

/// Node-specific configuration.
#[derive(Clone, Deserialize, Debug)]
pub struct NodeConfig {
    pub p2p_port: u16,
}

/// P2P-specific configuration.
#[derive(Clone, Deserialize, Debug)]
pub struct P2PConfig {
    pub max_message_size: usize,
    pub reconnect_delay_secs: u64,
    pub seed_nodes: Vec<String>,
}

/// Sync-driver configuration.
#[derive(Clone, Deserialize, Debug)]
pub struct SyncConfig {
    /// Log every inbound protocol message at debug level.
    pub network_debug: bool,
    /// Maximum number of block-fetch requests kept in flight at once.
    pub fetch_window: usize,
}

/// Consensus-specific configuration.
#[derive(Clone, Deserialize, Debug)]
pub struct ConsensusConfig {
    pub genesis_timestamp: u64,
    /// Packed compact target for the genesis block.
    pub genesis_bits: [u8; 4],
}

/// Loads the configuration from the `pyrite.toml` file.
pub fn load(filename: &str) -> Result<Config> {
    let builder = config::Config::builder().add_source(config::File::with_name(filename));

    let cfg: Config = builder.build()?.try_deserialize()?;
    Ok(cfg)
}
