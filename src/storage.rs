// src/storage.rs

use crate::block::BlockHash;
use bitcoin_hashes::Hash;
use sled::Db;
use std::sync::Arc;
use thiserror::Error;

// Sled tree definitions
const BLOCKS_TREE: &str = "blocks";
const ANCESTORS_TREE: &str = "ancestors";
const HEIGHT_INDEX_TREE: &str = "height_index";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("no entry for block {0}")]
    EntryNotFound(BlockHash),
    #[error("no block indexed at height {0}")]
    HeightNotFound(u64),
    #[error("data integrity error: {0}")]
    DataIntegrity(String),
}

/// Contract the chain state machine requires from durable storage: blocks by
/// hash, ancestor links for traversal, and a height index over the best chain.
pub trait ChainStore: Send + Sync {
    fn set_entry(&self, hash: &BlockHash, bytes: &[u8]) -> Result<(), StorageError>;
    fn get_entry(&self, hash: &BlockHash) -> Result<Vec<u8>, StorageError>;
    fn has_entry(&self, hash: &BlockHash) -> Result<bool, StorageError>;
    fn set_ancestors(&self, hash: &BlockHash, ancestors: &[BlockHash]) -> Result<(), StorageError>;
    fn get_ancestors(&self, hash: &BlockHash) -> Result<Vec<BlockHash>, StorageError>;
    fn set_height_index(&self, height: u64, hash: &BlockHash) -> Result<(), StorageError>;
    fn get_hash_by_height(&self, height: u64) -> Result<BlockHash, StorageError>;
}

#[derive(Clone)]
pub struct SledStore {
    blocks_tree: sled::Tree,
    ancestors_tree: sled::Tree,
    height_index_tree: sled::Tree,
}

impl SledStore {
    pub fn open(db: &Arc<Db>) -> Result<Self, StorageError> {
        Ok(SledStore {
            blocks_tree: db.open_tree(BLOCKS_TREE)?,
            ancestors_tree: db.open_tree(ANCESTORS_TREE)?,
            height_index_tree: db.open_tree(HEIGHT_INDEX_TREE)?,
        })
    }
}

fn decode_hash(bytes: &[u8]) -> Result<BlockHash, StorageError> {
    BlockHash::from_slice(bytes).map_err(|e| StorageError::DataIntegrity(e.to_string()))
}

impl ChainStore for SledStore {
    fn set_entry(&self, hash: &BlockHash, bytes: &[u8]) -> Result<(), StorageError> {
        self.blocks_tree.insert(hash.as_ref() as &[u8], bytes)?;
        Ok(())
    }

    fn get_entry(&self, hash: &BlockHash) -> Result<Vec<u8>, StorageError> {
        match self.blocks_tree.get(hash.as_ref() as &[u8])? {
            Some(ivec) => Ok(ivec.to_vec()),
            None => Err(StorageError::EntryNotFound(*hash)),
        }
    }

    fn has_entry(&self, hash: &BlockHash) -> Result<bool, StorageError> {
        Ok(self.blocks_tree.contains_key(hash.as_ref() as &[u8])?)
    }

    fn set_ancestors(&self, hash: &BlockHash, ancestors: &[BlockHash]) -> Result<(), StorageError> {
        // Flat concatenation of 32-byte hashes, nearest link first.
        let mut value = Vec::with_capacity(ancestors.len() * 32);
        for ancestor in ancestors {
            value.extend_from_slice(ancestor.as_ref());
        }
        self.ancestors_tree.insert(hash.as_ref() as &[u8], value)?;
        Ok(())
    }

    fn get_ancestors(&self, hash: &BlockHash) -> Result<Vec<BlockHash>, StorageError> {
        match self.ancestors_tree.get(hash.as_ref() as &[u8])? {
            Some(ivec) => {
                if ivec.len() % 32 != 0 {
                    return Err(StorageError::DataIntegrity(format!(
                        "ancestor record for {} has length {}",
                        hash,
                        ivec.len()
                    )));
                }
                ivec.chunks_exact(32).map(decode_hash).collect()
            }
            None => Err(StorageError::EntryNotFound(*hash)),
        }
    }

    fn set_height_index(&self, height: u64, hash: &BlockHash) -> Result<(), StorageError> {
        self.height_index_tree
            .insert(height.to_be_bytes(), hash.as_ref() as &[u8])?;
        Ok(())
    }

    fn get_hash_by_height(&self, height: u64) -> Result<BlockHash, StorageError> {
        match self.height_index_tree.get(height.to_be_bytes())? {
            Some(ivec) => decode_hash(&ivec),
            None => Err(StorageError::HeightNotFound(height)),
        }
    }
}
