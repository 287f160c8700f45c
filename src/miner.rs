// src/miner.rs - Nonce-search worker racing concurrent chain updates

use crate::block::{Block, BlockHash};
use crate::blockchain::Chain;
use crate::sync::SyncHandle;
use anyhow::{Context, Result};
use bitcoin_hashes::Hash;
use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Nonce iterations between restart-flag checks. A full interval without a
/// solution synthesizes a restart, so a stuck search always unwinds and a
/// pending restart is never ignored for longer than this.
pub const RESTART_CHECK_INTERVAL: u64 = 100_000;
/// Poll interval while waiting for the chain to confirm a found block.
pub const CONFIRM_POLL: Duration = Duration::from_millis(100);
/// Pause after an observed restart before building the next candidate.
pub const RESTART_BACKOFF: Duration = Duration::from_millis(10);

/// Searches nonces until the block satisfies its own target. Used for
/// deterministic genesis bring-up; the long-lived worker goes through
/// `Miner::spawn` instead.
pub fn mine_block<B: Block>(mut block: B) -> B {
    while !block.valid_proof_of_work() {
        block.increment_nonce();
    }
    block
}

/// Handle to the single mining worker thread. Cancellation is cooperative:
/// `restart` discards the current candidate, `shutdown` is one-way and joins
/// the worker.
pub struct Miner {
    shutdown: Arc<AtomicBool>,
    restart: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Miner {
    /// Starts the worker. `provided` seeds the first search (genesis mining);
    /// afterwards every candidate is built from the current chain head.
    /// Registers the restart flag with the chain so every acceptance
    /// invalidates the candidate being searched.
    pub fn spawn<B: Block>(
        chain: Arc<Chain<B>>,
        sync: SyncHandle<B>,
        provided: Option<B>,
    ) -> Result<Miner> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let restart = Arc::new(AtomicBool::new(false));
        chain.set_restart_signal(restart.clone());

        let worker = {
            let shutdown = shutdown.clone();
            let restart = restart.clone();
            thread::Builder::new()
                .name("miner".into())
                .spawn(move || mine_loop(chain, sync, provided, shutdown, restart))
                .context("failed to spawn miner worker")?
        };

        Ok(Miner {
            shutdown,
            restart,
            worker: Some(worker),
        })
    }

    pub fn restart(&self) {
        self.restart.store(true, Ordering::SeqCst);
    }

    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn mine_loop<B: Block>(
    chain: Arc<Chain<B>>,
    sync: SyncHandle<B>,
    mut provided: Option<B>,
    shutdown: Arc<AtomicBool>,
    restart: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::SeqCst) {
        let mut block = match provided.take() {
            Some(block) => block,
            None => match chain.head() {
                Some(head) => head.get_candidate(&chain),
                None => {
                    thread::sleep(CONFIRM_POLL);
                    continue;
                }
            },
        };
        debug!("[MINER] searching for a block at height {}", block.height());

        let mut count: u64 = 0;
        loop {
            if shutdown.load(Ordering::SeqCst) || restart.load(Ordering::SeqCst) {
                break;
            }
            count += 1;
            block.increment_nonce();
            if block.valid_proof_of_work() {
                break;
            }
            if count % RESTART_CHECK_INTERVAL == 0 {
                restart.store(true, Ordering::SeqCst);
            }
        }
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        if restart.swap(false, Ordering::SeqCst) {
            // A pre-supplied block has no head to rebuild from; resume its
            // search instead of dropping it.
            if block.prev_hash() == BlockHash::all_zeros() && !chain.is_initialized() {
                provided = Some(block);
            }
            thread::sleep(RESTART_BACKOFF);
            continue;
        }

        let hash = block.hash();
        let height = block.height();
        info!("[MINER] found solution {} at height {}", hash, height);
        if !sync.submit_block(block) {
            break;
        }
        // Never begin a new search until the chain includes the block just
        // handed off; otherwise the next candidate would build on a stale
        // head and race our own solution.
        while !chain.has_block_hash(&hash) && !shutdown.load(Ordering::SeqCst) {
            thread::sleep(CONFIRM_POLL);
        }
    }
    debug!("[MINER] worker stopped");
}
