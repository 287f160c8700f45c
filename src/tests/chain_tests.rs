// src/tests/chain_tests.rs

use crate::block::{BasicBlock, Block};
use crate::blockchain::{better_than, BlockAdded, Chain, ChainError};
use crate::miner::mine_block;
use crate::storage::SledStore;
use bitcoin_hashes::{sha256d, Hash};
use num_bigint::BigUint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const EASY_BITS: [u8; 4] = [255, 255, 255, 0];
/// Target 2^255: one unit of work per block.
const HALF_BITS: [u8; 4] = [128, 0, 0, 0];
/// Target 2^254: three units of work per block.
const QUARTER_BITS: [u8; 4] = [64, 0, 0, 0];

fn test_chain() -> (Arc<Chain<BasicBlock>>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(sled::open(dir.path()).unwrap());
    let store = Arc::new(SledStore::open(&db).unwrap());
    (Arc::new(Chain::new(store)), dir)
}

fn genesis() -> BasicBlock {
    mine_block(BasicBlock::get_unmined_genesis(1_700_000_000, EASY_BITS))
}

fn child(parent: &BasicBlock, bits: [u8; 4], salt: u64) -> BasicBlock {
    mine_block(BasicBlock {
        prev_blockhash: parent.hash(),
        height: parent.height + 1,
        time: parent.time + 1 + salt,
        bits,
        nonce: 0,
    })
}

#[test]
fn genesis_is_set_exactly_once() {
    let (chain, _dir) = test_chain();
    let g = genesis();
    chain.set_genesis(g.clone()).unwrap();
    assert_eq!(chain.head().unwrap(), g);
    assert_eq!(chain.get_height().unwrap(), 0);

    let again = mine_block(BasicBlock::get_unmined_genesis(1_700_000_001, EASY_BITS));
    let err = chain.set_genesis(again).unwrap_err();
    assert!(matches!(err, ChainError::GenesisAlreadySet));
    // The original genesis and head are untouched.
    assert_eq!(chain.genesis().unwrap(), g);
    assert_eq!(chain.head().unwrap(), g);
}

#[test]
fn genesis_must_satisfy_its_proof_of_work() {
    let (chain, _dir) = test_chain();
    // Target 1: no real hash can fall below it.
    let unmined = BasicBlock::get_unmined_genesis(1_700_000_000, [0, 0, 1, 29]);
    let err = chain.set_genesis(unmined).unwrap_err();
    assert!(matches!(err, ChainError::InvalidProofOfWork(_)));
    assert!(chain.head().is_none());
}

#[test]
fn genesis_must_have_no_predecessor() {
    let (chain, _dir) = test_chain();
    let g = genesis();
    let mut bad = g.clone();
    bad.prev_blockhash = sha256d::Hash::hash(b"not-zero");
    let err = chain.set_genesis(mine_block(bad)).unwrap_err();
    assert!(matches!(err, ChainError::InvalidBlock(_)));
}

#[test]
fn add_block_requires_genesis() {
    let (chain, _dir) = test_chain();
    let err = chain.add_block(genesis()).unwrap_err();
    assert!(matches!(err, ChainError::GenesisNotSet));
}

#[test]
fn accepted_block_extends_head_and_repeat_is_a_noop() {
    let (chain, _dir) = test_chain();
    let g = genesis();
    chain.set_genesis(g.clone()).unwrap();

    let a = child(&g, EASY_BITS, 0);
    assert_eq!(
        chain.add_block(a.clone()).unwrap(),
        BlockAdded::Accepted { new_head: true }
    );
    assert!(chain.has_block_hash(&a.hash()));
    assert_eq!(chain.get_height().unwrap(), 1);
    assert_eq!(chain.head().unwrap(), a);

    // Idempotent: the second submission changes nothing.
    assert_eq!(chain.add_block(a.clone()).unwrap(), BlockAdded::AlreadyKnown);
    assert_eq!(chain.get_height().unwrap(), 1);
    assert_eq!(chain.head().unwrap(), a);
}

#[test]
fn unknown_parent_is_refused_without_corrupting_state() {
    let (chain, _dir) = test_chain();
    let g = genesis();
    chain.set_genesis(g.clone()).unwrap();

    let a = child(&g, EASY_BITS, 0); // never added
    let b = child(&a, EASY_BITS, 0);
    let err = chain.add_block(b.clone()).unwrap_err();
    match err {
        ChainError::UnknownParent(parent) => assert_eq!(parent, a.hash()),
        other => panic!("expected UnknownParent, got {other}"),
    }
    assert!(!chain.has_block_hash(&b.hash()));
    assert_eq!(chain.head().unwrap(), g);
}

#[test]
fn heavier_fork_displaces_the_head() {
    let (chain, _dir) = test_chain();
    let g = genesis();
    chain.set_genesis(g.clone()).unwrap();

    let light = child(&g, HALF_BITS, 0);
    chain.add_block(light.clone()).unwrap();
    assert_eq!(chain.head().unwrap(), light);

    // Same height, smaller target: more cumulative work wins.
    let heavy = child(&g, QUARTER_BITS, 1);
    assert_eq!(
        chain.add_block(heavy.clone()).unwrap(),
        BlockAdded::Accepted { new_head: true }
    );
    assert_eq!(chain.head().unwrap(), heavy);
    assert!(
        chain.cumulative_work(&heavy.hash()).unwrap()
            > chain.cumulative_work(&light.hash()).unwrap()
    );
}

#[test]
fn equal_work_ties_break_by_height() {
    let (chain, _dir) = test_chain();
    let g = genesis();
    chain.set_genesis(g.clone()).unwrap();

    // One block worth three units of work...
    let a1 = child(&g, QUARTER_BITS, 0);
    chain.add_block(a1.clone()).unwrap();
    assert_eq!(chain.head().unwrap(), a1);

    // ...against three blocks worth one unit each.
    let b1 = child(&g, HALF_BITS, 7);
    let b2 = child(&b1, HALF_BITS, 0);
    let b3 = child(&b2, HALF_BITS, 0);

    assert_eq!(
        chain.add_block(b1.clone()).unwrap(),
        BlockAdded::Accepted { new_head: false }
    );
    assert_eq!(
        chain.add_block(b2.clone()).unwrap(),
        BlockAdded::Accepted { new_head: false }
    );
    assert_eq!(chain.head().unwrap(), a1);

    // The works are now exactly equal; the greater height takes the head.
    assert_eq!(
        chain.add_block(b3.clone()).unwrap(),
        BlockAdded::Accepted { new_head: true }
    );
    assert_eq!(
        chain.cumulative_work(&b3.hash()).unwrap(),
        chain.cumulative_work(&a1.hash()).unwrap()
    );
    assert_eq!(chain.head().unwrap(), b3);

    // The height index follows the new best chain.
    assert_eq!(chain.get_block_hash_by_height(0).unwrap(), g.hash());
    assert_eq!(chain.get_block_hash_by_height(1).unwrap(), b1.hash());
    assert_eq!(chain.get_block_hash_by_height(2).unwrap(), b2.hash());
    assert_eq!(chain.get_block_hash_by_height(3).unwrap(), b3.hash());
}

#[test]
fn exact_tie_keeps_the_incumbent() {
    let (chain, _dir) = test_chain();
    let g = genesis();
    chain.set_genesis(g.clone()).unwrap();

    let first = child(&g, HALF_BITS, 1);
    let second = child(&g, HALF_BITS, 2);
    chain.add_block(first.clone()).unwrap();
    assert_eq!(
        chain.add_block(second).unwrap(),
        BlockAdded::Accepted { new_head: false }
    );
    assert_eq!(chain.head().unwrap(), first);
}

#[test]
fn fork_choice_comparator() {
    let five = BigUint::from(5u32);
    let four = BigUint::from(4u32);
    assert!(better_than(&five, 1, &four, 9));
    assert!(!better_than(&four, 9, &five, 1));
    assert!(better_than(&five, 2, &five, 1));
    assert!(!better_than(&five, 1, &five, 1));
    assert!(!better_than(&five, 1, &five, 2));
}

#[test]
fn ancestor_links_are_recorded_at_power_of_two_distances() {
    let (chain, _dir) = test_chain();
    let g = genesis();
    chain.set_genesis(g.clone()).unwrap();
    let b1 = child(&g, EASY_BITS, 0);
    let b2 = child(&b1, EASY_BITS, 0);
    let b3 = child(&b2, EASY_BITS, 0);
    let b4 = child(&b3, EASY_BITS, 0);
    for b in [&b1, &b2, &b3, &b4] {
        chain.add_block(b.clone()).unwrap();
    }

    assert!(chain.get_ancestors(&g.hash()).unwrap().is_empty());
    assert_eq!(chain.get_ancestors(&b1.hash()).unwrap(), vec![g.hash()]);
    assert_eq!(
        chain.get_ancestors(&b2.hash()).unwrap(),
        vec![b1.hash(), g.hash()]
    );
    assert_eq!(
        chain.get_ancestors(&b3.hash()).unwrap(),
        vec![b2.hash(), b1.hash()]
    );
    assert_eq!(
        chain.get_ancestors(&b4.hash()).unwrap(),
        vec![b3.hash(), b2.hash(), g.hash()]
    );
}

#[test]
fn stored_blocks_round_trip_and_misses_are_reported() {
    let (chain, _dir) = test_chain();
    let g = genesis();
    chain.set_genesis(g.clone()).unwrap();
    let a = child(&g, EASY_BITS, 0);
    chain.add_block(a.clone()).unwrap();

    assert_eq!(chain.get_block(&a.hash()).unwrap(), a);

    let missing = sha256d::Hash::hash(b"missing");
    let err = chain.get_block(&missing).unwrap_err();
    assert!(matches!(err, ChainError::BlockNotFound(_)));
    assert!(chain.get_block_hash_by_height(99).is_err());
}

#[test]
fn every_acceptance_raises_the_restart_signal() {
    let (chain, _dir) = test_chain();
    let flag = Arc::new(AtomicBool::new(false));
    chain.set_restart_signal(flag.clone());

    let g = genesis();
    chain.set_genesis(g.clone()).unwrap();
    assert!(flag.swap(false, Ordering::SeqCst));

    let a = child(&g, EASY_BITS, 0);
    chain.add_block(a.clone()).unwrap();
    assert!(flag.swap(false, Ordering::SeqCst));

    // A no-op resubmission must not wake the miner.
    chain.add_block(a).unwrap();
    assert!(!flag.load(Ordering::SeqCst));
}
