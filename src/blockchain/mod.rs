// Blockchain module
//
// This module contains the core chain implementation including:
// - Block and transaction structures
// - Cryptography (hash, sign, verify, keypairs)
// - The ledger: block storage, canonical chain selection and UTXO derivation
// - Transaction validation
// - Proof of work search

pub mod block;
pub mod crypto;
pub mod ledger;
pub mod pow;
pub mod storage;
pub mod transaction;
pub mod validator;

#[cfg(test)]
pub mod test_utils;

// Re-export main components for easier access
pub use block::{Block, BlockHeader, GENESIS_PREV_HASH};
pub use crypto::{Address, DigitalSignature, Keypair};
pub use ledger::{ChainTip, Ledger, SharedLedger, Utxo};
pub use transaction::{Transaction, TxInput, TxOutput};
