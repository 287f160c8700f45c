// src/tests/miner_tests.rs

use crate::block::{BasicBlock, Block};
use crate::blockchain::Chain;
use crate::miner::{mine_block, Miner};
use crate::storage::SledStore;
use crate::sync::{SyncCommand, SyncHandle};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const EASY_BITS: [u8; 4] = [255, 255, 255, 0];
/// Target 1: unreachable for any real hash.
const IMPOSSIBLE_BITS: [u8; 4] = [0, 0, 1, 29];

fn test_chain() -> (Arc<Chain<BasicBlock>>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(sled::open(dir.path()).unwrap());
    let store = Arc::new(SledStore::open(&db).unwrap());
    (Arc::new(Chain::new(store)), dir)
}

fn recv_submitted(
    rx: &mut mpsc::UnboundedReceiver<SyncCommand<BasicBlock>>,
    deadline: Duration,
) -> BasicBlock {
    let start = Instant::now();
    loop {
        match rx.try_recv() {
            Ok(SyncCommand::SubmitBlock(block)) => return block,
            Err(_) => {
                assert!(
                    start.elapsed() < deadline,
                    "miner did not hand off a block in time"
                );
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }
}

#[test]
fn mine_block_searches_until_the_target_is_met() {
    let block = mine_block(BasicBlock::get_unmined_genesis(1_700_000_000, EASY_BITS));
    assert!(block.valid_proof_of_work());
}

#[test]
fn provided_block_is_mined_and_handed_off() {
    let (chain, _dir) = test_chain();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let provided = BasicBlock::get_unmined_genesis(1_700_000_000, EASY_BITS);

    let mut miner =
        Miner::spawn(chain.clone(), SyncHandle::new(tx), Some(provided)).unwrap();

    let solved = recv_submitted(&mut rx, Duration::from_secs(10));
    assert_eq!(solved.height, 0);
    assert!(solved.valid_proof_of_work());

    // Confirm the handoff the way the sync driver would.
    chain.set_genesis(solved).unwrap();
    miner.shutdown();
}

#[test]
fn miner_rebuilds_its_candidate_from_the_new_head() {
    let (chain, _dir) = test_chain();
    let g = mine_block(BasicBlock::get_unmined_genesis(1_700_000_000, EASY_BITS));
    chain.set_genesis(g.clone()).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut miner = Miner::spawn(chain.clone(), SyncHandle::new(tx), None).unwrap();

    let b1 = recv_submitted(&mut rx, Duration::from_secs(10));
    assert_eq!(b1.height, 1);
    assert_eq!(b1.prev_blockhash, g.hash());

    // The miner polls until the chain confirms its block, then must search
    // on top of the new head, not the stale candidate.
    chain.add_block(b1.clone()).unwrap();
    let b2 = recv_submitted(&mut rx, Duration::from_secs(10));
    assert_eq!(b2.height, 2);
    assert_eq!(b2.prev_blockhash, b1.hash());

    miner.shutdown();
}

#[test]
fn shutdown_interrupts_a_running_search() {
    let (chain, _dir) = test_chain();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let provided = BasicBlock::get_unmined_genesis(1_700_000_000, IMPOSSIBLE_BITS);

    let mut miner =
        Miner::spawn(chain, SyncHandle::new(tx), Some(provided)).unwrap();
    std::thread::sleep(Duration::from_millis(50));

    // A transient restart is not an error and must not wedge the worker.
    miner.restart();
    std::thread::sleep(Duration::from_millis(20));

    // Shutdown is observed at nonce-search granularity; join must return.
    miner.shutdown();
    assert!(rx.try_recv().is_err(), "an unsolved block must not be handed off");
}

#[test]
fn handoff_reports_a_closed_sync_task() {
    let (tx, rx) = mpsc::unbounded_channel::<SyncCommand<BasicBlock>>();
    let handle = SyncHandle::new(tx);
    let block = mine_block(BasicBlock::get_unmined_genesis(1_700_000_000, EASY_BITS));
    assert!(handle.submit_block(block.clone()));
    drop(rx);
    assert!(!handle.submit_block(block));
}
