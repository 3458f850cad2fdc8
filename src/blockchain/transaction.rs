use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use super::crypto::{Address, ContentHasher, DigitalSignature, Keypair};

/// Reasons a transaction is refused by the validator
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Malformed transaction: {0}")]
    Malformed(String),

    #[error("Input {prev_tx_hash}:{index} does not reference an unspent output")]
    UnknownInput { prev_tx_hash: String, index: u32 },

    #[error("Input {prev_tx_hash}:{index} is referenced more than once")]
    DuplicateInput { prev_tx_hash: String, index: u32 },

    #[error("Input {prev_tx_hash}:{index} is already spent by a pending transaction")]
    PendingConflict { prev_tx_hash: String, index: u32 },

    #[error("Insufficient inputs: outputs require {required}, inputs provide {available}")]
    InsufficientInputs { required: u64, available: u64 },

    #[error("Inputs provide {available} but outputs only claim {claimed}")]
    UnbalancedSurplus { available: u64, claimed: u64 },

    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: u64, available: u64 },

    #[error("Invalid signature on input {0}")]
    InvalidSignature(usize),

    #[error("Transaction nonce {0} is already pending")]
    DuplicateNonce(String),

    #[error("Value overflow")]
    Overflow,
}

/// A reference to an earlier output, plus the owner's signature over it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TxInput {
    /// Hash of the transaction that created the output
    pub prev_tx_hash: String,

    /// Position of the output inside that transaction
    pub index: u32,

    /// Signature over `{prev_tx_hash, index}`
    pub sig: DigitalSignature,
}

impl TxInput {
    /// Builds an input and signs its payload with the output owner's key
    pub fn signed(prev_tx_hash: impl Into<String>, index: u32, owner: &Keypair) -> Self {
        let prev_tx_hash = prev_tx_hash.into();
        let sig = owner.sign(&Self::signing_payload(&prev_tx_hash, index));
        TxInput {
            prev_tx_hash,
            index,
            sig,
        }
    }

    /// The bytes an input signature covers. The signature field itself is excluded.
    pub fn signing_payload(prev_tx_hash: &str, index: u32) -> [u8; 32] {
        ContentHasher::new()
            .field(prev_tx_hash.as_bytes())
            .field(&index.to_be_bytes())
            .finish()
    }
}

/// Value credited to an address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TxOutput {
    pub address: Address,
    pub value: u64,
}

impl TxOutput {
    pub fn new(address: Address, value: u64) -> Self {
        TxOutput { address, value }
    }
}

/// Represents a transaction in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Outputs being spent
    pub inputs: Vec<TxInput>,

    /// Newly created outputs
    pub outputs: Vec<TxOutput>,

    /// Unique identifier chosen by the submitter
    pub tx_nonce: String,
}

impl Transaction {
    /// Creates a transaction with a fresh random nonce
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        Transaction {
            inputs,
            outputs,
            tx_nonce: Uuid::new_v4().to_string(),
        }
    }

    /// Creates the input-less transaction paying the block reward to `miner`
    pub fn reward(miner: Address, amount: u64) -> Self {
        Self::new(Vec::new(), vec![TxOutput::new(miner, amount)])
    }

    /// A reward transaction has no inputs and exactly one output
    pub fn is_reward(&self) -> bool {
        self.inputs.is_empty() && self.outputs.len() == 1
    }

    /// Content hash identifying this transaction in UTXO keys
    pub fn hash(&self) -> String {
        let mut hasher = ContentHasher::new().field(self.tx_nonce.as_bytes());

        for input in &self.inputs {
            hasher = hasher
                .field(input.prev_tx_hash.as_bytes())
                .field(&input.index.to_be_bytes())
                .field(input.sig.0.as_bytes());
        }

        for output in &self.outputs {
            hasher = hasher
                .field(output.address.0.as_bytes())
                .field(&output.value.to_be_bytes());
        }

        hasher.finish_hex()
    }

    /// Sum of output values, `None` on overflow
    pub fn total_output(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, output| acc.checked_add(output.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::verify;

    #[test]
    fn test_reward_transaction() {
        let miner = Keypair::generate();
        let tx = Transaction::reward(miner.address().clone(), 50);

        assert!(tx.is_reward());
        assert_eq!(tx.outputs[0].value, 50);
        assert_eq!(tx.outputs[0].address, *miner.address());
        assert!(!tx.tx_nonce.is_empty());
    }

    #[test]
    fn test_reward_nonces_are_unique() {
        let miner = Keypair::generate();
        let a = Transaction::reward(miner.address().clone(), 50);
        let b = Transaction::reward(miner.address().clone(), 50);
        assert_ne!(a.tx_nonce, b.tx_nonce);
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_signed_input_verifies_for_owner_only() {
        let owner = Keypair::generate();
        let input = TxInput::signed("ab".repeat(32), 0, &owner);
        let payload = TxInput::signing_payload(&input.prev_tx_hash, input.index);

        assert!(verify(&payload, &input.sig, owner.address()));
        assert!(!verify(&payload, &input.sig, Keypair::generate().address()));

        let other_index = TxInput::signing_payload(&input.prev_tx_hash, 1);
        assert!(!verify(&other_index, &input.sig, owner.address()));
    }

    #[test]
    fn test_wire_format_uses_camel_case() {
        let owner = Keypair::generate();
        let tx = Transaction::new(
            vec![TxInput::signed("00".repeat(32), 0, &owner)],
            vec![TxOutput::new(owner.address().clone(), 5)],
        );
        let json = serde_json::to_value(&tx).unwrap();

        assert!(json.get("txNonce").is_some());
        assert!(json["inputs"][0].get("prevTxHash").is_some());
        assert_eq!(json["outputs"][0]["value"], 5);
    }

    #[test]
    fn test_total_output_overflow() {
        let owner = Keypair::generate();
        let tx = Transaction::new(
            Vec::new(),
            vec![
                TxOutput::new(owner.address().clone(), u64::MAX),
                TxOutput::new(owner.address().clone(), 1),
            ],
        );
        assert_eq!(tx.total_output(), None);
    }
}
