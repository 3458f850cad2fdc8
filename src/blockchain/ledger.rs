use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use utoipa::ToSchema;

use super::block::{Block, GENESIS_PREV_HASH};
use super::crypto::{is_hex_digest, verify, Address};
use super::pow;
use super::storage::{BlockStore, StorageError};
use super::transaction::{TransactionError, TxOutput};
use super::validator::validate_transaction;

/// Reasons a block is refused by the ledger
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("Malformed block: {0}")]
    Malformed(String),

    #[error("Block signature does not verify under its signer")]
    InvalidSignature,

    #[error("Block difficulty {actual} is below the required {required} bits")]
    DifficultyTooLow { required: u32, actual: u32 },

    #[error("Block header hash does not meet its own difficulty of {0} bits")]
    InsufficientWork(u32),

    #[error("Unknown parent block {0}")]
    UnknownParent(String),

    #[error("Block height {actual} does not follow its parent (expected {expected})")]
    HeightMismatch { expected: u64, actual: u64 },

    #[error("Block {0} is already stored")]
    Duplicate(String),

    #[error("Transaction {position} is invalid: {source}")]
    InvalidTransaction {
        position: usize,
        #[source]
        source: TransactionError,
    },
}

/// Errors that can occur during ledger operations
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Invalid block: {0}")]
    InvalidBlock(#[from] BlockError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
}

/// Key of an unspent output
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OutPoint {
    pub tx_hash: String,
    pub index: u32,
}

impl OutPoint {
    pub fn new(tx_hash: impl Into<String>, index: u32) -> Self {
        OutPoint {
            tx_hash: tx_hash.into(),
            index,
        }
    }
}

/// Unspent outputs of the canonical chain
pub type UtxoSet = BTreeMap<OutPoint, TxOutput>;

/// One unspent output as served to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Utxo {
    pub tx_hash: String,
    pub index: u32,
    pub output: TxOutput,
}

/// Height and header hash of the canonical tip, both null on an empty chain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChainTip {
    pub height: Option<u64>,
    pub header_hash: Option<String>,
}

/// The ledger as shared between request handlers, the miner and the sync task
pub type SharedLedger = Arc<RwLock<Ledger>>;

/// Every known block plus the state derived from the canonical chain
#[derive(Debug)]
pub struct Ledger {
    /// All stored blocks by header hash, orphans included
    blocks: HashMap<String, Block>,

    /// Header hashes in arrival order; breaks height ties in favour of the first seen
    arrival: Vec<String>,

    /// Header hashes of the canonical chain, height ascending
    canonical: Vec<String>,

    utxos: UtxoSet,

    supply: u64,

    /// Minimum `bits` an accepted block must carry
    difficulty: u32,

    store: Option<BlockStore>,
}

impl Ledger {
    /// Creates an empty in-memory ledger
    ///
    /// # Arguments
    ///
    /// * `difficulty` - The minimum number of leading zero bits required of a block
    pub fn new(difficulty: u32) -> Self {
        Ledger {
            blocks: HashMap::new(),
            arrival: Vec::new(),
            canonical: Vec::new(),
            utxos: UtxoSet::new(),
            supply: 0,
            difficulty,
            store: None,
        }
    }

    /// Opens a sled store at `path` and loads the blocks found there
    pub fn with_storage<P: AsRef<Path>>(path: P, difficulty: u32) -> Result<Self, LedgerError> {
        Self::with_store(BlockStore::open(path)?, difficulty)
    }

    /// Builds a ledger on top of an existing block store
    ///
    /// Stored blocks were validated when first accepted and are not checked again.
    pub fn with_store(store: BlockStore, difficulty: u32) -> Result<Self, LedgerError> {
        let mut ledger = Self::new(difficulty);

        for block in store.load_blocks()? {
            let hash = block.hash();
            if ledger.blocks.insert(hash.clone(), block).is_none() {
                ledger.arrival.push(hash);
            }
        }

        ledger.recompute();
        ledger.store = Some(store);

        info!(
            "Loaded {} blocks from storage, canonical height {:?}",
            ledger.blocks.len(),
            ledger.latest_metadata().height
        );

        Ok(ledger)
    }

    pub fn into_shared(self) -> SharedLedger {
        Arc::new(RwLock::new(self))
    }

    /// Validates a block against the current state without changing anything
    ///
    /// Checks, in order: structure, signature, proof of work, parent and
    /// height, duplicates, then every transaction against the UTXO set of the
    /// parent's ancestry. The first failure is returned.
    pub fn validate_block(&self, block: &Block) -> Result<(), BlockError> {
        check_structure(block)?;

        if !verify(&block.header.digest(), &block.sig, &block.signer) {
            return Err(BlockError::InvalidSignature);
        }

        if block.header.bits < self.difficulty {
            return Err(BlockError::DifficultyTooLow {
                required: self.difficulty,
                actual: block.header.bits,
            });
        }
        if !pow::meets_difficulty(&block.header, block.header.bits) {
            return Err(BlockError::InsufficientWork(block.header.bits));
        }

        let expected = if block.header.is_genesis() {
            0
        } else {
            match self.blocks.get(&block.header.hash_prev_header) {
                Some(parent) => parent.height + 1,
                None => return Err(BlockError::UnknownParent(block.header.hash_prev_header.clone())),
            }
        };
        if block.height != expected {
            return Err(BlockError::HeightMismatch {
                expected,
                actual: block.height,
            });
        }

        let hash = block.hash();
        if self.blocks.contains_key(&hash) {
            return Err(BlockError::Duplicate(hash));
        }

        self.check_transactions(block)
    }

    /// Replays the block's transactions in order on top of its parent's UTXO
    /// set, so a block can neither spend what its branch does not hold nor
    /// spend one output twice.
    fn check_transactions(&self, block: &Block) -> Result<(), BlockError> {
        let mut working = self.utxos_at(&block.header.hash_prev_header)?;

        for (position, tx) in block.txs.iter().enumerate() {
            if position > 0 {
                validate_transaction(tx, &working, &[])
                    .map_err(|source| BlockError::InvalidTransaction { position, source })?;
            }

            for input in &tx.inputs {
                working.remove(&OutPoint::new(input.prev_tx_hash.clone(), input.index));
            }
            let tx_hash = tx.hash();
            for (index, output) in tx.outputs.iter().enumerate() {
                working.insert(OutPoint::new(tx_hash.clone(), index as u32), output.clone());
            }
        }

        Ok(())
    }

    /// UTXO set as of the block `hash`, the sentinel giving the empty set
    fn utxos_at(&self, hash: &str) -> Result<UtxoSet, BlockError> {
        if hash == GENESIS_PREV_HASH {
            return Ok(UtxoSet::new());
        }
        if self.canonical.last().map(String::as_str) == Some(hash) {
            return Ok(self.utxos.clone());
        }

        let path = self
            .walk_to_genesis(hash)
            .ok_or_else(|| BlockError::UnknownParent(hash.to_string()))?;
        Ok(derive_utxos(path.iter().filter_map(|hash| self.blocks.get(hash))))
    }

    /// Inserts an already validated block and recomputes derived state
    ///
    /// # Returns
    ///
    /// `Ok(false)` when a block with the same header hash is already stored;
    /// nothing changes in that case.
    pub fn add_block(&mut self, block: Block) -> Result<bool, LedgerError> {
        let hash = block.hash();
        if self.blocks.contains_key(&hash) {
            return Ok(false);
        }

        // Persist first so a storage failure leaves memory untouched.
        if let Some(store) = &self.store {
            store.save_block(&hash, &block)?;
            store.flush()?;
        }

        debug!("Storing block {} at height {}", hash, block.height);
        self.blocks.insert(hash.clone(), block);
        self.arrival.push(hash);
        self.recompute();

        Ok(true)
    }

    /// Validates and, if valid, adds a block
    pub fn submit_block(&mut self, block: Block) -> Result<(), LedgerError> {
        self.validate_block(&block)?;
        self.add_block(block)?;
        Ok(())
    }

    /// The canonical chain, height ascending
    pub fn canonical_chain(&self) -> Vec<Block> {
        self.canonical_blocks().cloned().collect()
    }

    fn canonical_blocks(&self) -> impl Iterator<Item = &Block> + Clone {
        self.canonical.iter().filter_map(|hash| self.blocks.get(hash))
    }

    /// Canonical blocks with heights `start..=end`
    ///
    /// # Returns
    ///
    /// `None` if `start` is negative, `end` is past the tip, or `start > end`
    pub fn block_range(&self, start: i64, end: i64) -> Option<Vec<Block>> {
        if start < 0 || end < start || end >= self.canonical.len() as i64 {
            return None;
        }

        let range = start as usize..=end as usize;
        Some(
            self.canonical[range]
                .iter()
                .filter_map(|hash| self.blocks.get(hash).cloned())
                .collect(),
        )
    }

    pub fn latest_metadata(&self) -> ChainTip {
        match self.canonical.last().and_then(|hash| self.blocks.get(hash)) {
            Some(tip) => ChainTip {
                height: Some(tip.height),
                header_hash: Some(tip.hash()),
            },
            None => ChainTip::default(),
        }
    }

    /// True for stored blocks and for the genesis sentinel
    pub fn block_exists(&self, hash: &str) -> bool {
        hash == GENESIS_PREV_HASH || self.blocks.contains_key(hash)
    }

    /// Number of stored blocks, orphans included
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Header hash of the canonical block at `height`
    pub fn canonical_hash_at(&self, height: u64) -> Option<&str> {
        self.canonical.get(height as usize).map(String::as_str)
    }

    pub fn utxo_set(&self) -> &UtxoSet {
        &self.utxos
    }

    pub fn utxos(&self) -> Vec<Utxo> {
        self.utxos.iter().map(to_utxo).collect()
    }

    pub fn utxos_for(&self, address: &Address) -> Vec<Utxo> {
        self.utxos
            .iter()
            .filter(|(_, output)| &output.address == address)
            .map(to_utxo)
            .collect()
    }

    pub fn supply(&self) -> u64 {
        self.supply
    }

    pub fn supply_for(&self, address: &Address) -> u64 {
        self.utxos
            .values()
            .filter(|output| &output.address == address)
            .fold(0u64, |acc, output| acc.saturating_add(output.value))
    }

    fn recompute(&mut self) {
        self.canonical = self.select_canonical();
        self.utxos = derive_utxos(self.canonical_blocks());
        self.supply = self
            .utxos
            .values()
            .fold(0u64, |acc, output| acc.saturating_add(output.value));
    }

    /// Picks the tallest block whose ancestry reaches the sentinel and returns
    /// the path to it. Equal heights go to the block that arrived first.
    fn select_canonical(&self) -> Vec<String> {
        let mut candidates: Vec<&String> = self.arrival.iter().collect();
        // Stable sort keeps arrival order among equal heights.
        candidates.sort_by(|a, b| self.blocks[*b].height.cmp(&self.blocks[*a].height));

        for tip in candidates {
            if let Some(path) = self.walk_to_genesis(tip) {
                return path;
            }
            debug!("Block {} has an incomplete ancestry, skipping as tip", tip);
        }

        Vec::new()
    }

    /// Follows parent links from `tip` back to the sentinel
    ///
    /// Returns `None` when a parent is missing or a hash repeats.
    fn walk_to_genesis(&self, tip: &str) -> Option<Vec<String>> {
        let mut path = Vec::new();
        let mut visited = HashSet::new();
        let mut cursor = tip;

        while cursor != GENESIS_PREV_HASH {
            if !visited.insert(cursor) {
                return None;
            }
            let block = self.blocks.get(cursor)?;
            path.push(cursor.to_string());
            cursor = block.header.hash_prev_header.as_str();
        }

        path.reverse();
        Some(path)
    }
}

/// All outputs of `blocks` minus every output their inputs reference
pub fn derive_utxos<'a>(blocks: impl Iterator<Item = &'a Block> + Clone) -> UtxoSet {
    let mut utxos = UtxoSet::new();

    for block in blocks.clone() {
        for tx in &block.txs {
            let tx_hash = tx.hash();
            for (index, output) in tx.outputs.iter().enumerate() {
                utxos.insert(OutPoint::new(tx_hash.clone(), index as u32), output.clone());
            }
        }
    }

    for block in blocks {
        for tx in &block.txs {
            for input in &tx.inputs {
                utxos.remove(&OutPoint::new(input.prev_tx_hash.clone(), input.index));
            }
        }
    }

    utxos
}

fn to_utxo((outpoint, output): (&OutPoint, &TxOutput)) -> Utxo {
    Utxo {
        tx_hash: outpoint.tx_hash.clone(),
        index: outpoint.index,
        output: output.clone(),
    }
}

fn check_structure(block: &Block) -> Result<(), BlockError> {
    let malformed = |reason: &str| Err(BlockError::Malformed(reason.to_string()));

    if !is_hex_digest(&block.header.hash_prev_header) {
        return malformed("hashPrevHeader is not a 64 character hex digest");
    }
    if !is_hex_digest(&block.header.hash_txs) {
        return malformed("hashTxs is not a 64 character hex digest");
    }

    match block.txs.split_first() {
        None => return malformed("block carries no transactions"),
        Some((reward, rest)) => {
            if !reward.is_reward() {
                return malformed("first transaction is not a reward transaction");
            }
            if rest.iter().any(|tx| tx.inputs.is_empty()) {
                return malformed("only the first transaction may be input-less");
            }
        }
    }

    if Block::compute_hash_txs(&block.txs) != block.header.hash_txs {
        return malformed("hashTxs does not match the transactions");
    }

    Ok(())
}
