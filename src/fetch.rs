// src/fetch.rs - Outstanding block-fetch bookkeeping and orphan parking

use crate::block::{Block, BlockHash};
use log::warn;
use std::collections::{HashMap, HashSet, VecDeque};

/// Upper bound on parked unknown-parent blocks.
pub const MAX_ORPHAN_BLOCKS: usize = 512;

/// Tracks which block hashes still need fetching from peers, with request
/// deduplication, and parks blocks whose parent has not arrived yet.
pub struct FetchQueue<B: Block> {
    want: VecDeque<BlockHash>,
    queued: HashSet<BlockHash>,
    inflight: HashSet<BlockHash>,
    /// Missing parent hash -> children waiting on it.
    orphans: HashMap<BlockHash, Vec<B>>,
    orphan_count: usize,
    window: usize,
}

impl<B: Block> FetchQueue<B> {
    pub fn new(window: usize) -> Self {
        FetchQueue {
            want: VecDeque::new(),
            queued: HashSet::new(),
            inflight: HashSet::new(),
            orphans: HashMap::new(),
            orphan_count: 0,
            window: window.max(1),
        }
    }

    /// Queues a single hash ahead of everything else.
    pub fn seek_hash_now(&mut self, hash: BlockHash) {
        if self.inflight.contains(&hash) || !self.queued.insert(hash) {
            return;
        }
        self.want.push_front(hash);
    }

    /// Queues several hashes ahead of the backlog, preserving their order.
    pub fn seek_many_with_priority(&mut self, hashes: Vec<BlockHash>) {
        for hash in hashes.into_iter().rev() {
            self.seek_hash_now(hash);
        }
    }

    /// Queues a hash at the back of the backlog.
    pub fn seek(&mut self, hash: BlockHash) {
        if self.inflight.contains(&hash) || !self.queued.insert(hash) {
            return;
        }
        self.want.push_back(hash);
    }

    /// Drains up to the free window into the in-flight set and returns the
    /// batch to request.
    pub fn next_batch(&mut self) -> Vec<BlockHash> {
        let available = self.window.saturating_sub(self.inflight.len());
        let mut batch = Vec::new();
        for _ in 0..available {
            match self.want.pop_front() {
                Some(hash) => {
                    self.queued.remove(&hash);
                    self.inflight.insert(hash);
                    batch.push(hash);
                }
                None => break,
            }
        }
        batch
    }

    /// Forgets a hash everywhere once the block has arrived.
    pub fn mark_arrived(&mut self, hash: &BlockHash) {
        self.inflight.remove(hash);
        if self.queued.remove(hash) {
            self.want.retain(|h| h != hash);
        }
    }

    /// Parks a block whose parent is unknown until that parent arrives.
    pub fn park_orphan(&mut self, parent: BlockHash, block: B) {
        if self.orphan_count >= MAX_ORPHAN_BLOCKS {
            warn!("[FETCH] orphan buffer full, dropping block {}", block.hash());
            return;
        }
        let children = self.orphans.entry(parent).or_default();
        let hash = block.hash();
        if children.iter().any(|b| b.hash() == hash) {
            return;
        }
        children.push(block);
        self.orphan_count += 1;
    }

    /// Removes and returns all blocks that were waiting on `parent`.
    pub fn take_orphans(&mut self, parent: &BlockHash) -> Vec<B> {
        let children = self.orphans.remove(parent).unwrap_or_default();
        self.orphan_count -= children.len();
        children
    }

    pub fn pending(&self) -> usize {
        self.want.len() + self.inflight.len()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphan_count
    }
}
