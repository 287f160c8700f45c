// src/main.rs - Integrated CLI and node entry point

pub mod block;
pub mod blockchain;
pub mod cli;
pub mod config;
pub mod difficulty;
pub mod fetch;
pub mod miner;
pub mod p2p;
pub mod storage;
pub mod sync;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use log::info;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use crate::block::BasicBlock;
use crate::blockchain::Chain;
use crate::miner::{mine_block, Miner};
use crate::p2p::PeerRegistry;
use crate::storage::SledStore;
use crate::sync::{run_sync_loop, SyncDriver, SyncHandle};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stdout)
        .init();

    let cli = Cli::parse();
    let loaded_config = config::load(&cli.config)?;

    match cli.command {
        Commands::StartNode { mine } => {
            let db = Arc::new(sled::open(&cli.data_dir)?);
            let store = Arc::new(SledStore::open(&db)?);
            let chain = Arc::new(Chain::<BasicBlock>::new(store));

            // Genesis derives deterministically from the configuration, so
            // every node on the same network agrees on it.
            let genesis = mine_block(BasicBlock::get_unmined_genesis(
                loaded_config.consensus.genesis_timestamp,
                loaded_config.consensus.genesis_bits,
            ));
            chain.set_genesis(genesis)?;
            info!("chain initialized at height {}", chain.get_height()?);

            let registry = PeerRegistry::default();
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let (command_tx, command_rx) = mpsc::unbounded_channel();
            let (shutdown_tx, _) = broadcast::channel(1);

            let p2p_config = Arc::new(loaded_config.p2p.clone());
            let server_handle = tokio::spawn(p2p::start_server(
                registry.clone(),
                event_tx.clone(),
                p2p_config.clone(),
                loaded_config.node.p2p_port,
                shutdown_tx.subscribe(),
            ));
            let client_handle = tokio::spawn(p2p::start_client(
                registry.clone(),
                event_tx.clone(),
                p2p_config,
                loaded_config.node.p2p_port,
                shutdown_tx.subscribe(),
            ));

            let driver = SyncDriver::new(chain.clone(), registry.clone(), &loaded_config.sync);
            let sync_handle = tokio::spawn(run_sync_loop(
                driver,
                event_rx,
                command_rx,
                shutdown_tx.subscribe(),
            ));

            let mut worker = if mine {
                Some(Miner::spawn(
                    chain.clone(),
                    SyncHandle::new(command_tx.clone()),
                    None,
                )?)
            } else {
                None
            };

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                    shutdown_tx.send(()).ok();
                }
                res = sync_handle => res??,
                res = server_handle => res??,
                res = client_handle => res??,
            }

            if let Some(worker) = worker.as_mut() {
                worker.shutdown();
            }
        }
    }

    Ok(())
}
