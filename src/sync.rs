// src/sync.rs - Protocol logic driving validation, acceptance and backfill

use crate::block::{Block, BlockHash};
use crate::blockchain::{BlockAdded, Chain, ChainError};
use crate::config::SyncConfig;
use crate::fetch::FetchQueue;
use crate::p2p::{Intro, Message, PeerId, PeerRegistry, SyncEvent};
use anyhow::Result;
use bitcoin_hashes::Hash;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Work submitted to the sync task from outside the event loop (the miner's
/// solution handoff).
pub enum SyncCommand<B: Block> {
    SubmitBlock(B),
}

/// Clonable handle for feeding blocks into the sync task's acceptance path.
#[derive(Clone)]
pub struct SyncHandle<B: Block> {
    tx: mpsc::UnboundedSender<SyncCommand<B>>,
}

impl<B: Block> SyncHandle<B> {
    pub fn new(tx: mpsc::UnboundedSender<SyncCommand<B>>) -> Self {
        SyncHandle { tx }
    }

    /// False once the sync task has shut down.
    pub fn submit_block(&self, block: B) -> bool {
        self.tx.send(SyncCommand::SubmitBlock(block)).is_ok()
    }
}

/// Reacts to the four protocol message kinds and routes every candidate
/// block, local or remote, through the single chain acceptance entry point.
pub struct SyncDriver<B: Block> {
    chain: Arc<Chain<B>>,
    peers: PeerRegistry,
    /// Latest introduction per peer, superseded on every receipt.
    intros: HashMap<PeerId, Intro>,
    fetch: FetchQueue<B>,
    network_debug: bool,
}

impl<B: Block> SyncDriver<B> {
    pub fn new(chain: Arc<Chain<B>>, peers: PeerRegistry, config: &SyncConfig) -> Self {
        SyncDriver {
            chain,
            peers,
            intros: HashMap::new(),
            fetch: FetchQueue::new(config.fetch_window),
            network_debug: config.network_debug,
        }
    }

    /// Introduce ourselves to a freshly connected peer.
    pub fn on_connect(&mut self, peer: PeerId) {
        let intro = match self.chain.head() {
            Some(head) => Intro { top_block: head.hash(), top_height: head.height() },
            None => Intro { top_block: BlockHash::all_zeros(), top_height: 0 },
        };
        self.peers.send(&peer, Message::Intro(intro));
    }

    pub fn on_disconnect(&mut self, peer: &PeerId) {
        self.intros.remove(peer);
    }

    pub fn handle(&mut self, peer: PeerId, message: Message) -> Result<()> {
        match message {
            Message::Intro(intro) => self.handle_intro(peer, intro),
            Message::Blocks(batch) => self.handle_blocks(peer, batch),
            Message::RequestBlocks(hashes) => self.handle_request_blocks(peer, hashes),
            Message::RequestHeights(heights) => self.handle_request_heights(peer, heights),
        }
    }

    pub fn last_intro(&self, peer: &PeerId) -> Option<&Intro> {
        self.intros.get(peer)
    }

    fn handle_intro(&mut self, peer: PeerId, intro: Intro) -> Result<()> {
        if self.network_debug {
            debug!(
                "[SYNC] intro from {}: top {} at height {}",
                peer, intro.top_block, intro.top_height
            );
        }
        let top_block = intro.top_block;
        let top_height = intro.top_height;
        self.intros.insert(peer, intro);

        if top_block != BlockHash::all_zeros() && !self.chain.has_block_hash(&top_block) {
            self.fetch.seek_hash_now(top_block);
        }
        let local_height = self.chain.get_height().unwrap_or(0);
        if top_height > local_height {
            let heights: Vec<u64> = (local_height + 1..=top_height).collect();
            self.peers.send(&peer, Message::RequestHeights(heights));
        }
        self.pump_fetches(Some(&peer));
        Ok(())
    }

    fn handle_blocks(&mut self, peer: PeerId, batch: Vec<Vec<u8>>) -> Result<()> {
        if self.network_debug {
            debug!("[SYNC] {} block(s) from {}", batch.len(), peer);
        }
        // The same block commonly arrives from several peers; dedup the raw
        // encodings before doing any work.
        let mut seen: HashSet<Vec<u8>> = HashSet::new();
        for raw in batch {
            if !seen.insert(raw.clone()) {
                continue;
            }
            let block = match B::deserialize(&raw) {
                Ok(block) => block,
                Err(e) => {
                    warn!("[SYNC] undecodable block from {}: {}", peer, e);
                    continue;
                }
            };
            if let Err(e) = block.assert_internal_consistency() {
                warn!("[SYNC] inconsistent block from {}: {}", peer, e);
                continue;
            }
            let hash = block.hash();
            self.fetch.mark_arrived(&hash);
            if self.chain.has_block_hash(&hash) {
                continue;
            }
            let height = block.height();
            let related = block.related_blocks();
            if let Err(e) = self.submit_block(block) {
                warn!("[SYNC] rejected block {} at height {} from {}: {}", hash, height, peer, e);
                continue;
            }
            // Backfill: chase every referenced block we do not have yet.
            let unknown: Vec<BlockHash> = related
                .into_iter()
                .filter(|h| *h != BlockHash::all_zeros() && !self.chain.has_block_hash(h))
                .collect();
            self.fetch.seek_many_with_priority(unknown);
        }
        self.pump_fetches(Some(&peer));
        Ok(())
    }

    fn handle_request_blocks(&mut self, peer: PeerId, hashes: Vec<[u8; 32]>) -> Result<()> {
        let unique: HashSet<[u8; 32]> = hashes.into_iter().collect();
        let mut blocks_to_send = Vec::new();
        for raw in unique {
            let hash = BlockHash::from_byte_array(raw);
            if !self.chain.has_block_hash(&hash) {
                continue;
            }
            match self.chain.get_block(&hash) {
                Ok(block) => blocks_to_send.push(block.serialize()),
                Err(e) => warn!("[SYNC] failed to load block {}: {}", hash, e),
            }
        }
        if !blocks_to_send.is_empty() {
            self.peers.send(&peer, Message::Blocks(blocks_to_send));
        }
        Ok(())
    }

    fn handle_request_heights(&mut self, peer: PeerId, heights: Vec<u64>) -> Result<()> {
        let local_height = match self.chain.get_height() {
            Ok(height) => height,
            Err(_) => return Ok(()),
        };
        let unique: HashSet<u64> = heights.into_iter().collect();
        let mut blocks_to_send = Vec::new();
        for height in unique {
            if height > local_height {
                continue;
            }
            let hash = match self.chain.get_block_hash_by_height(height) {
                Ok(hash) => hash,
                Err(_) => continue,
            };
            match self.chain.get_block(&hash) {
                Ok(block) => blocks_to_send.push(block.serialize()),
                Err(e) => warn!("[SYNC] failed to load block at height {}: {}", height, e),
            }
        }
        if !blocks_to_send.is_empty() {
            self.peers.send(&peer, Message::Blocks(blocks_to_send));
        }
        Ok(())
    }

    /// Single acceptance path shared by the miner handoff and the block
    /// batch handler: accept into the chain, gossip fresh blocks onward,
    /// park unknown-parent blocks and fetch their ancestor.
    pub fn submit_block(&mut self, block: B) -> Result<(), ChainError> {
        let hash = block.hash();
        let height = block.height();
        let raw = block.serialize();

        if !self.chain.is_initialized() && block.prev_hash() == BlockHash::all_zeros() {
            self.chain.set_genesis(block)?;
            self.peers.broadcast(&Message::Blocks(vec![raw]));
            return Ok(());
        }

        match self.chain.add_block(block.clone()) {
            Ok(BlockAdded::Accepted { new_head }) => {
                self.fetch.mark_arrived(&hash);
                if new_head {
                    info!("[SYNC] chain head advanced to height {}", height);
                }
                self.peers.broadcast(&Message::Blocks(vec![raw]));
                for child in self.fetch.take_orphans(&hash) {
                    let child_hash = child.hash();
                    if let Err(e) = self.submit_block(child) {
                        warn!("[SYNC] parked block {} rejected: {}", child_hash, e);
                    }
                }
                Ok(())
            }
            Ok(BlockAdded::AlreadyKnown) => {
                self.fetch.mark_arrived(&hash);
                Ok(())
            }
            Err(ChainError::UnknownParent(parent)) => {
                debug!("[SYNC] block {} arrived before its parent {}", hash, parent);
                if parent != BlockHash::all_zeros() {
                    self.fetch.park_orphan(parent, block);
                    self.fetch.seek_hash_now(parent);
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Issues queued fetches as a `RequestBlocks`, preferring the peer that
    /// triggered them and falling back to a broadcast.
    fn pump_fetches(&mut self, peer: Option<&PeerId>) {
        let batch = self.fetch.next_batch();
        if batch.is_empty() {
            return;
        }
        let message = Message::RequestBlocks(batch.iter().map(|h| h.to_byte_array()).collect());
        match peer {
            Some(peer) => {
                if !self.peers.send(peer, message.clone()) {
                    self.peers.broadcast(&message);
                }
            }
            None => self.peers.broadcast(&message),
        }
    }
}

/// Event loop for the sync driver: inbound peer traffic, miner handoffs and
/// shutdown, processed to completion one at a time. A failing handler drops
/// its message; it never takes the loop down.
pub async fn run_sync_loop<B: Block>(
    mut driver: SyncDriver<B>,
    mut events: mpsc::UnboundedReceiver<SyncEvent>,
    mut commands: mpsc::UnboundedReceiver<SyncCommand<B>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    loop {
        tokio::select! {
            Some(event) = events.recv() => match event {
                SyncEvent::Connected(peer) => driver.on_connect(peer),
                SyncEvent::Disconnected(peer) => driver.on_disconnect(&peer),
                SyncEvent::Message(peer, message) => {
                    if let Err(e) = driver.handle(peer, message) {
                        warn!("[SYNC] dropped message from {}: {}", peer, e);
                    }
                }
            },
            Some(command) = commands.recv() => match command {
                SyncCommand::SubmitBlock(block) => {
                    if let Err(e) = driver.submit_block(block) {
                        warn!("[SYNC] rejected local block: {}", e);
                    }
                    driver.pump_fetches(None);
                }
            },
            _ = shutdown_rx.recv() => {
                info!("[SYNC] shutting down");
                break;
            }
        }
    }
    Ok(())
}
