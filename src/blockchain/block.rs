use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::crypto::{Address, ContentHasher, DigitalSignature, Keypair};
use super::transaction::Transaction;

/// `hash_prev_header` of a genesis block. Always treated as a known block.
pub const GENESIS_PREV_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// The mined, signed part of a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    /// Header hash of the parent block, or the genesis sentinel
    pub hash_prev_header: String,

    /// Digest of the ordered transaction set
    pub hash_txs: String,

    /// Difficulty as a number of leading zero bits
    pub bits: u32,

    /// Proof of work
    pub nonce: u64,
}

impl BlockHeader {
    pub fn new(hash_prev_header: impl Into<String>, hash_txs: impl Into<String>, bits: u32) -> Self {
        BlockHeader {
            hash_prev_header: hash_prev_header.into(),
            hash_txs: hash_txs.into(),
            bits,
            nonce: 0,
        }
    }

    /// Raw content digest of the header; the proof of work is measured on it
    pub fn digest(&self) -> [u8; 32] {
        ContentHasher::new()
            .field(self.hash_prev_header.as_bytes())
            .field(self.hash_txs.as_bytes())
            .field(&self.bits.to_be_bytes())
            .field(&self.nonce.to_be_bytes())
            .finish()
    }

    /// Hex header hash, the key blocks are stored and linked by
    pub fn hash(&self) -> String {
        hex::encode(self.digest())
    }

    pub fn is_genesis(&self) -> bool {
        self.hash_prev_header == GENESIS_PREV_HASH
    }
}

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Block {
    pub header: BlockHeader,

    /// Transactions, reward transaction first
    pub txs: Vec<Transaction>,

    /// Public key of the miner that signed the header
    pub signer: Address,

    /// Signature over the header digest
    pub sig: DigitalSignature,

    /// Distance from genesis
    pub height: u64,
}

impl Block {
    /// Assembles a block around an already mined header and signs it
    ///
    /// # Arguments
    ///
    /// * `header` - The header with its proof of work nonce set
    /// * `txs` - The transactions `header.hash_txs` was computed over
    /// * `height` - Parent height + 1, or 0 for genesis
    /// * `keypair` - The miner's keys
    ///
    /// # Returns
    ///
    /// The signed block
    pub fn sealed(header: BlockHeader, txs: Vec<Transaction>, height: u64, keypair: &Keypair) -> Self {
        let sig = keypair.sign(&header.digest());
        Block {
            header,
            txs,
            signer: keypair.address().clone(),
            sig,
            height,
        }
    }

    pub fn hash(&self) -> String {
        self.header.hash()
    }

    /// Digest over the ordered transaction hashes
    pub fn compute_hash_txs(txs: &[Transaction]) -> String {
        txs.iter()
            .fold(ContentHasher::new(), |hasher, tx| hasher.field(tx.hash().as_bytes()))
            .finish_hex()
    }
}
