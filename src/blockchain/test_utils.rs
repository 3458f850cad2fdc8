//! Block and transaction builders shared by the unit tests

use super::block::{Block, BlockHeader, GENESIS_PREV_HASH};
use super::crypto::Keypair;
use super::pow;
use super::transaction::{Transaction, TxInput, TxOutput};

/// Builds a signed zero-difficulty block paying `reward` to `miner`,
/// followed by `extra` transactions
pub fn build_block(parent: Option<&Block>, miner: &Keypair, extra: Vec<Transaction>, reward: u64) -> Block {
    let mut txs = vec![Transaction::reward(miner.address().clone(), reward)];
    txs.extend(extra);

    let (prev, height) = match parent {
        Some(parent) => (parent.hash(), parent.height + 1),
        None => (GENESIS_PREV_HASH.to_string(), 0),
    };

    let mut header = BlockHeader::new(prev, Block::compute_hash_txs(&txs), 0);
    pow::search(&mut header, 0);
    Block::sealed(header, txs, height, miner)
}

/// A linear chain of `len` blocks starting at genesis
pub fn build_chain(len: usize, miner: &Keypair) -> Vec<Block> {
    let mut chain: Vec<Block> = Vec::with_capacity(len);
    for _ in 0..len {
        let block = build_block(chain.last(), miner, Vec::new(), 50);
        chain.push(block);
    }
    chain
}

/// Spends output `index` of `prev` (owned by `owner`) into `payees`
pub fn transfer(owner: &Keypair, prev: &Transaction, index: u32, payees: &[(&Keypair, u64)]) -> Transaction {
    let outputs = payees
        .iter()
        .map(|(payee, value)| TxOutput::new(payee.address().clone(), *value))
        .collect();

    Transaction::new(vec![TxInput::signed(prev.hash(), index, owner)], outputs)
}
