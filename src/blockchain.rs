// src/blockchain.rs - Chain state machine: genesis, acceptance, fork choice

use crate::block::{Block, BlockHash};
use crate::difficulty::work_from_target;
use crate::storage::{ChainStore, StorageError};
use bitcoin_hashes::Hash;
use log::{debug, info};
use num_bigint::BigUint;
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("genesis block already set")]
    GenesisAlreadySet,
    #[error("genesis block not set")]
    GenesisNotSet,
    #[error("unknown block {0}")]
    BlockNotFound(BlockHash),
    #[error("parent {0} is not known to the chain")]
    UnknownParent(BlockHash),
    #[error("block {0} does not satisfy its proof-of-work target")]
    InvalidProofOfWork(BlockHash),
    #[error("invalid block: {0}")]
    InvalidBlock(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Outcome of an acceptance attempt. A repeated submission of a known block
/// is a no-op, not an error: concurrent acceptances of the same identity are
/// expected under gossip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockAdded {
    Accepted { new_head: bool },
    AlreadyKnown,
}

/// Fork choice: does the candidate chain displace the incumbent head?
///
/// Governed by cumulative proof-of-work, with height only as the tie-break
/// when the works are exactly equal. An exact tie at equal height keeps the
/// incumbent (first seen wins).
pub fn better_than(
    candidate_work: &BigUint,
    candidate_height: u64,
    incumbent_work: &BigUint,
    incumbent_height: u64,
) -> bool {
    match candidate_work.cmp(incumbent_work) {
        Ordering::Greater => true,
        Ordering::Equal => candidate_height > incumbent_height,
        Ordering::Less => false,
    }
}

struct ChainState<B: Block> {
    genesis: Option<B>,
    head: Option<B>,
    block_hashes: HashSet<BlockHash>,
    /// Cumulative work per known block, accumulated parent -> child.
    work: HashMap<BlockHash, BigUint>,
    initialized: bool,
}

/// Holds a PoW chain and can answer queries. All acceptance flows through
/// `set_genesis`/`add_block`, which take the single write lock, so the
/// check-then-insert is atomic across the miner thread and the sync task.
pub struct Chain<B: Block> {
    store: Arc<dyn ChainStore>,
    state: RwLock<ChainState<B>>,
    restart_signal: Mutex<Option<Arc<AtomicBool>>>,
}

impl<B: Block> Chain<B> {
    pub fn new(store: Arc<dyn ChainStore>) -> Self {
        Chain {
            store,
            state: RwLock::new(ChainState {
                genesis: None,
                head: None,
                block_hashes: HashSet::new(),
                work: HashMap::new(),
                initialized: false,
            }),
            restart_signal: Mutex::new(None),
        }
    }

    /// Registers the miner's restart flag; raised on every acceptance so an
    /// in-progress candidate search is abandoned.
    pub fn set_restart_signal(&self, flag: Arc<AtomicBool>) {
        *self.restart_signal.lock() = Some(flag);
    }

    fn notify_restart(&self) {
        if let Some(flag) = self.restart_signal.lock().as_ref() {
            flag.store(true, AtomicOrdering::SeqCst);
        }
    }

    /// Installs the genesis block. Allowed exactly once; the block passes the
    /// same consistency and proof-of-work gates as any other block.
    pub fn set_genesis(&self, block: B) -> Result<(), ChainError> {
        let mut state = self.state.write();
        if state.genesis.is_some() {
            return Err(ChainError::GenesisAlreadySet);
        }
        block
            .assert_internal_consistency()
            .map_err(|e| ChainError::InvalidBlock(e.to_string()))?;
        let hash = block.hash();
        if !block.valid_proof_of_work() {
            return Err(ChainError::InvalidProofOfWork(hash));
        }
        if block.prev_hash() != BlockHash::all_zeros() {
            return Err(ChainError::InvalidBlock(
                "genesis block must not have a predecessor".into(),
            ));
        }

        let work = work_from_target(&block.target());
        self.record(&block, &[], work, &mut state)?;
        self.store.set_height_index(0, &hash)?;
        state.genesis = Some(block.clone());
        state.head = Some(block);
        info!("[CHAIN] genesis installed: {}", hash);
        self.notify_restart();
        Ok(())
    }

    /// Accepts a block: fork choice against the current head, persistence,
    /// ancestor recording, membership, miner restart. Idempotent for known
    /// identities. Blocks whose parent is unknown are refused so the known
    /// set never contains a dangling link; the sync driver parks them and
    /// backfills the ancestor instead.
    pub fn add_block(&self, block: B) -> Result<BlockAdded, ChainError> {
        let hash = block.hash();
        let mut state = self.state.write();
        if state.block_hashes.contains(&hash) {
            return Ok(BlockAdded::AlreadyKnown);
        }
        let head = state.head.clone().ok_or(ChainError::GenesisNotSet)?;
        if !block.valid_proof_of_work() {
            return Err(ChainError::InvalidProofOfWork(hash));
        }
        let parent = block.prev_hash();
        if !state.block_hashes.contains(&parent) {
            return Err(ChainError::UnknownParent(parent));
        }

        let parent_work = state.work.get(&parent).cloned().unwrap_or_default();
        let work = parent_work + work_from_target(&block.target());
        let head_work = state.work.get(&head.hash()).cloned().unwrap_or_default();
        let new_head = better_than(&work, block.height(), &head_work, head.height());

        let ancestors = self.derive_ancestors(&block)?;
        self.record(&block, &ancestors, work, &mut state)?;

        if new_head {
            state.head = Some(block.clone());
            self.reindex_heights(&block)?;
            info!("[CHAIN] new head at height {}: {}", block.height(), hash);
        } else {
            debug!("[CHAIN] stored side block at height {}: {}", block.height(), hash);
        }

        self.notify_restart();
        Ok(BlockAdded::Accepted { new_head })
    }

    fn record(
        &self,
        block: &B,
        ancestors: &[BlockHash],
        work: BigUint,
        state: &mut ChainState<B>,
    ) -> Result<(), StorageError> {
        let hash = block.hash();
        self.store.set_entry(&hash, &block.serialize())?;
        self.store.set_ancestors(&hash, ancestors)?;
        state.block_hashes.insert(hash);
        state.work.insert(hash, work);
        if !state.initialized {
            state.initialized = true;
        }
        Ok(())
    }

    /// Skip-list ancestor links at power-of-two distances, derived from the
    /// parent's stored links: entry k points 2^k blocks back.
    fn derive_ancestors(&self, block: &B) -> Result<Vec<BlockHash>, StorageError> {
        let mut links = vec![block.prev_hash()];
        loop {
            let k = links.len() - 1;
            let deeper = self.store.get_ancestors(&links[k])?;
            match deeper.get(k) {
                Some(next) => links.push(*next),
                None => break,
            }
        }
        Ok(links)
    }

    /// Rewrites the height index along the new head's branch, walking parent
    /// links until the stored entry already matches. Bounded by reorg depth.
    fn reindex_heights(&self, new_head: &B) -> Result<(), ChainError> {
        let mut cursor = new_head.clone();
        loop {
            let hash = cursor.hash();
            match self.store.get_hash_by_height(cursor.height()) {
                Ok(existing) if existing == hash => break,
                Ok(_) | Err(StorageError::HeightNotFound(_)) => {
                    self.store.set_height_index(cursor.height(), &hash)?;
                }
                Err(e) => return Err(e.into()),
            }
            let parent = cursor.prev_hash();
            if parent == BlockHash::all_zeros() {
                break;
            }
            let bytes = self.store.get_entry(&parent)?;
            cursor = B::deserialize(&bytes).map_err(|e| ChainError::InvalidBlock(e.to_string()))?;
        }
        Ok(())
    }

    pub fn has_block_hash(&self, hash: &BlockHash) -> bool {
        self.state.read().block_hashes.contains(hash)
    }

    pub fn get_block(&self, hash: &BlockHash) -> Result<B, ChainError> {
        let bytes = self.store.get_entry(hash).map_err(|e| match e {
            StorageError::EntryNotFound(h) => ChainError::BlockNotFound(h),
            other => ChainError::Storage(other),
        })?;
        B::deserialize(&bytes).map_err(|e| ChainError::InvalidBlock(e.to_string()))
    }

    pub fn head(&self) -> Option<B> {
        self.state.read().head.clone()
    }

    pub fn genesis(&self) -> Option<B> {
        self.state.read().genesis.clone()
    }

    /// Height of the current head.
    pub fn get_height(&self) -> Result<u64, ChainError> {
        self.state
            .read()
            .head
            .as_ref()
            .map(|h| h.height())
            .ok_or(ChainError::GenesisNotSet)
    }

    /// Resolves a height on the best chain to a block identity.
    pub fn get_block_hash_by_height(&self, height: u64) -> Result<BlockHash, ChainError> {
        Ok(self.store.get_hash_by_height(height)?)
    }

    pub fn get_ancestors(&self, hash: &BlockHash) -> Result<Vec<BlockHash>, ChainError> {
        Ok(self.store.get_ancestors(hash)?)
    }

    pub fn cumulative_work(&self, hash: &BlockHash) -> Option<BigUint> {
        self.state.read().work.get(hash).cloned()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().initialized
    }
}
