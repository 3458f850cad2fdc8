use std::collections::HashSet;

use log::debug;

use crate::blockchain::ledger::UtxoSet;
use crate::blockchain::transaction::{Transaction, TransactionError};
use crate::blockchain::validator::validate_transaction;
use crate::blockchain::Block;

/// Transactions accepted but not yet mined, in arrival order
#[derive(Debug, Default)]
pub struct Mempool {
    txs: Vec<Transaction>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.txs
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    /// Validates `tx` against `utxos` and the current pool and appends it.
    /// The pool is unchanged on error.
    pub fn admit(&mut self, tx: Transaction, utxos: &UtxoSet) -> Result<(), TransactionError> {
        validate_transaction(&tx, utxos, &self.txs)?;
        self.txs.push(tx);
        Ok(())
    }

    /// Drops the transactions `block` included, then anything the new UTXO
    /// set no longer supports.
    ///
    /// # Returns
    ///
    /// The number of transactions removed
    pub fn reconcile(&mut self, block: &Block, utxos: &UtxoSet) -> usize {
        let before = self.txs.len();
        let included: HashSet<&str> = block.txs.iter().map(|tx| tx.tx_nonce.as_str()).collect();

        let remaining: Vec<Transaction> = std::mem::take(&mut self.txs)
            .into_iter()
            .filter(|tx| !included.contains(tx.tx_nonce.as_str()))
            .collect();

        for tx in remaining {
            match validate_transaction(&tx, utxos, &self.txs) {
                Ok(()) => self.txs.push(tx),
                Err(e) => debug!("Evicting pending transaction {}: {}", tx.tx_nonce, e),
            }
        }

        before - self.txs.len()
    }
}
