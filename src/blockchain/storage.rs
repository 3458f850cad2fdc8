use std::collections::HashSet;
use std::path::Path;

use log::warn;
use sled::{Db, Tree};
use thiserror::Error;

use super::block::Block;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// Write-through store of every accepted block, keyed by header hash.
///
/// Only raw blocks and the order they arrived in are kept. Canonical chain,
/// UTXOs and supply are always rebuilt from them.
pub struct BlockStore {
    db: Db,
    blocks: Tree,

    /// Big-endian sequence number -> header hash
    arrival: Tree,
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore")
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

impl BlockStore {
    /// Opens (or creates) a block store
    ///
    /// # Arguments
    ///
    /// * `path` - The path to the database directory
    ///
    /// # Returns
    ///
    /// A new BlockStore instance
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::from_db(sled::open(path)?)
    }

    /// A throwaway store removed when dropped
    #[cfg(test)]
    pub fn temporary() -> Result<Self, StorageError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        let blocks = db.open_tree("blocks")?;
        let arrival = db.open_tree("arrival")?;
        Ok(Self { db, blocks, arrival })
    }

    /// Saves a block under its header hash and records when it arrived.
    /// Saving a known hash again leaves its arrival position unchanged.
    pub fn save_block(&self, hash: &str, block: &Block) -> Result<(), StorageError> {
        let value = bincode::serialize(block)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        if self.blocks.insert(hash.as_bytes(), value)?.is_none() {
            // sled ids are monotonic across restarts.
            let sequence = self.db.generate_id()?;
            self.arrival.insert(sequence.to_be_bytes(), hash.as_bytes())?;
        }
        Ok(())
    }

    /// Loads every stored block in the order it was first saved
    ///
    /// Blocks without an arrival record follow, ordered by height. Undecodable
    /// entries are skipped with a warning unless nothing at all could be
    /// decoded.
    pub fn load_blocks(&self) -> Result<Vec<Block>, StorageError> {
        let mut blocks = Vec::new();
        let mut deserialization_errors = Vec::new();
        let mut sequenced = HashSet::new();

        for result in self.arrival.iter() {
            let (_, hash) = result?;
            if !sequenced.insert(hash.to_vec()) {
                continue;
            }
            if let Some(value) = self.blocks.get(&hash)? {
                match bincode::deserialize::<Block>(&value) {
                    Ok(block) => blocks.push(block),
                    Err(e) => {
                        let key_str = String::from_utf8_lossy(hash.as_ref()).to_string();
                        deserialization_errors.push(format!("{}: {}", key_str, e));
                    }
                }
            }
        }

        let mut unsequenced = Vec::new();
        for result in self.blocks.iter() {
            let (key, value) = result?;
            if sequenced.contains(key.as_ref()) {
                continue;
            }
            match bincode::deserialize::<Block>(&value) {
                Ok(block) => unsequenced.push(block),
                Err(e) => {
                    let key_str = String::from_utf8_lossy(key.as_ref()).to_string();
                    deserialization_errors.push(format!("{}: {}", key_str, e));
                }
            }
        }
        unsequenced.sort_by_key(|block| block.height);
        blocks.extend(unsequenced);

        if !deserialization_errors.is_empty() {
            if blocks.is_empty() {
                return Err(StorageError::DeserializationError(format!(
                    "Failed to deserialize any blocks: {}",
                    deserialization_errors.join(", ")
                )));
            }
            warn!("Some blocks could not be deserialized: {}", deserialization_errors.join(", "));
        }

        Ok(blocks)
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::block::{BlockHeader, GENESIS_PREV_HASH};
    use crate::blockchain::crypto::Keypair;
    use crate::blockchain::transaction::Transaction;

    fn block(prev: &str, height: u64, keypair: &Keypair) -> Block {
        let txs = vec![Transaction::reward(keypair.address().clone(), 50)];
        let header = BlockHeader::new(prev, Block::compute_hash_txs(&txs), 0);
        Block::sealed(header, txs, height, keypair)
    }

    #[test]
    fn test_blocks_load_in_arrival_order() {
        let store = BlockStore::temporary().unwrap();
        let keypair = Keypair::generate();

        let genesis = block(GENESIS_PREV_HASH, 0, &keypair);
        let child = block(&genesis.hash(), 1, &keypair);
        let sibling = block(&genesis.hash(), 1, &keypair);

        store.save_block(&genesis.hash(), &genesis).unwrap();
        store.save_block(&sibling.hash(), &sibling).unwrap();
        store.save_block(&child.hash(), &child).unwrap();
        // A second save does not move the block to the back.
        store.save_block(&sibling.hash(), &sibling).unwrap();
        store.flush().unwrap();

        let loaded = store.load_blocks().unwrap();
        assert_eq!(loaded, vec![genesis, sibling, child]);
    }

    #[test]
    fn test_unsequenced_blocks_follow_in_height_order() {
        let store = BlockStore::temporary().unwrap();
        let keypair = Keypair::generate();

        let genesis = block(GENESIS_PREV_HASH, 0, &keypair);
        let child = block(&genesis.hash(), 1, &keypair);
        store.save_block(&genesis.hash(), &genesis).unwrap();

        let value = bincode::serialize(&child).unwrap();
        store.blocks.insert(child.hash().as_bytes(), value).unwrap();

        assert_eq!(store.load_blocks().unwrap(), vec![genesis, child]);
    }

    #[test]
    fn test_resaving_is_idempotent() {
        let store = BlockStore::temporary().unwrap();
        let keypair = Keypair::generate();
        let genesis = block(GENESIS_PREV_HASH, 0, &keypair);

        store.save_block(&genesis.hash(), &genesis).unwrap();
        store.save_block(&genesis.hash(), &genesis).unwrap();

        assert_eq!(store.load_blocks().unwrap().len(), 1);
    }
}
