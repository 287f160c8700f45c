// src/block.rs

use crate::blockchain::Chain;
use crate::difficulty::{self, unpack_target, UNPACKED_LEN};
use anyhow::{bail, Result};
use bitcoin_hashes::{sha256d, Hash};
use serde::{Deserialize, Serialize};

pub type BlockHash = sha256d::Hash;

/// Capability set the consensus core requires from the pluggable block type.
///
/// The chain, miner and sync driver are generic over this trait and never
/// touch payload semantics: transactions, balances and reward rules all live
/// behind it. Implementations are shared between the miner thread and the
/// sync task, hence the `Send + Sync` bounds.
pub trait Block: Clone + Send + Sync + 'static {
    /// Deterministic 256-bit identity hash over the block contents.
    fn hash(&self) -> BlockHash;

    /// Height in the chain; the genesis block is fixed at 0 and every other
    /// block sits at exactly `parent.height + 1`.
    fn height(&self) -> u64;

    /// Identity of the immediate predecessor; all-zeros for genesis.
    fn prev_hash(&self) -> BlockHash;

    /// Unpacked 256-bit proof-of-work target, big-endian.
    fn target(&self) -> [u8; UNPACKED_LEN];

    /// Structural and semantic self-check, independent of chain context.
    /// A failure here drops the block without penalizing the rest of a batch.
    fn assert_internal_consistency(&self) -> Result<()>;

    /// Builds a valid, not-yet-solved successor of `self`: correct height,
    /// predecessor link and target, nonce still to be searched.
    fn get_candidate(&self, chain: &Chain<Self>) -> Self;

    fn increment_nonce(&mut self);

    /// Whether the block currently satisfies its own target.
    fn valid_proof_of_work(&self) -> bool {
        difficulty::valid_proof_of_work(&self.hash(), &self.target())
    }

    /// Hashes of other blocks this block references; the sync driver chases
    /// these to backfill ancestor gaps.
    fn related_blocks(&self) -> Vec<BlockHash>;

    fn serialize(&self) -> Vec<u8>;

    fn deserialize(bytes: &[u8]) -> Result<Self>;
}

/// Minimal header-only block: enough to exercise every consensus path.
/// Applications with real payloads supply their own `Block` implementation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    #[serde(with = "serde_hash")]
    pub prev_blockhash: BlockHash,
    pub height: u64,
    pub time: u64,
    /// Packed compact target.
    pub bits: [u8; 4],
    pub nonce: u64,
}

impl BasicBlock {
    /// Genesis block with the nonce still unsearched. Mining it from nonce 0
    /// is deterministic, so every node derives the same genesis identity from
    /// the same configuration.
    pub fn get_unmined_genesis(time: u64, bits: [u8; 4]) -> Self {
        BasicBlock {
            prev_blockhash: BlockHash::all_zeros(),
            height: 0,
            time,
            bits,
            nonce: 0,
        }
    }
}

impl Block for BasicBlock {
    fn hash(&self) -> BlockHash {
        sha256d::Hash::hash(&bincode::serialize(self).unwrap())
    }

    fn height(&self) -> u64 {
        self.height
    }

    fn prev_hash(&self) -> BlockHash {
        self.prev_blockhash
    }

    fn target(&self) -> [u8; UNPACKED_LEN] {
        // An undecodable pad yields the zero target, which no hash can beat.
        unpack_target(&self.bits).unwrap_or([0u8; UNPACKED_LEN])
    }

    fn assert_internal_consistency(&self) -> Result<()> {
        unpack_target(&self.bits)?;
        if self.prev_blockhash == BlockHash::all_zeros() {
            if self.height != 0 {
                bail!("zero predecessor requires height 0, got {}", self.height);
            }
        } else if self.height == 0 {
            bail!("height 0 is reserved for the genesis block");
        }
        Ok(())
    }

    fn get_candidate(&self, _chain: &Chain<Self>) -> Self {
        // Constant difficulty: candidates inherit the parent's target.
        // Retargeting rules belong to richer payload types.
        BasicBlock {
            prev_blockhash: self.hash(),
            height: self.height + 1,
            time: chrono::Utc::now().timestamp() as u64,
            bits: self.bits,
            nonce: 0,
        }
    }

    fn increment_nonce(&mut self) {
        self.nonce = self.nonce.wrapping_add(1);
    }

    fn related_blocks(&self) -> Vec<BlockHash> {
        if self.prev_blockhash == BlockHash::all_zeros() {
            Vec::new()
        } else {
            vec![self.prev_blockhash]
        }
    }

    fn serialize(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap()
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

pub mod serde_hash {
    use bitcoin_hashes::{sha256d, Hash};
    use serde::{self, Deserializer, Serializer};

    pub fn serialize<S>(hash: &sha256d::Hash, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(hash.as_ref())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<sha256d::Hash, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: &[u8] = serde::Deserialize::deserialize(deserializer)?;
        sha256d::Hash::from_slice(bytes).map_err(serde::de::Error::custom)
    }
}
