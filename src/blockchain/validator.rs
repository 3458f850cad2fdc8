// Transaction validation against a UTXO snapshot and the pending pool

use std::collections::{BTreeSet, HashSet};

use super::crypto::{verify, Address};
use super::ledger::{OutPoint, UtxoSet};
use super::transaction::{Transaction, TransactionError, TxInput, TxOutput};

/// Validates `tx` for admission to the pending pool.
///
/// Checks run in a fixed order and stop at the first failure:
///
/// 1. structure: a non-empty nonce, at least one input and one output
/// 2. every input resolves to a distinct output of `utxos` not already spent
///    by a transaction in `pending`
/// 3. resolved input value equals total output value exactly
/// 4. the owning addresses hold at least the total output value
/// 5. each input signature verifies against the owner of the output it spends
/// 6. no transaction in `pending` carries the same nonce
///
/// Nothing is mutated; the caller decides what to do with a passing
/// transaction.
pub fn validate_transaction(
    tx: &Transaction,
    utxos: &UtxoSet,
    pending: &[Transaction],
) -> Result<(), TransactionError> {
    check_structure(tx)?;

    let resolved = resolve_inputs(tx, utxos, pending)?;

    let total_in = resolved
        .iter()
        .try_fold(0u64, |acc, output| acc.checked_add(output.value))
        .ok_or(TransactionError::Overflow)?;
    let total_out = tx.total_output().ok_or(TransactionError::Overflow)?;

    if total_in < total_out {
        return Err(TransactionError::InsufficientInputs {
            required: total_out,
            available: total_in,
        });
    }
    if total_in > total_out {
        return Err(TransactionError::UnbalancedSurplus {
            available: total_in,
            claimed: total_out,
        });
    }

    let owners: BTreeSet<&Address> = resolved.iter().map(|output| &output.address).collect();
    let balance = utxos
        .values()
        .filter(|output| owners.contains(&output.address))
        .try_fold(0u64, |acc, output| acc.checked_add(output.value))
        .ok_or(TransactionError::Overflow)?;

    if balance < total_out {
        return Err(TransactionError::InsufficientBalance {
            required: total_out,
            available: balance,
        });
    }

    for (position, (input, output)) in tx.inputs.iter().zip(&resolved).enumerate() {
        let payload = TxInput::signing_payload(&input.prev_tx_hash, input.index);
        if !verify(&payload, &input.sig, &output.address) {
            return Err(TransactionError::InvalidSignature(position));
        }
    }

    if pending.iter().any(|other| other.tx_nonce == tx.tx_nonce) {
        return Err(TransactionError::DuplicateNonce(tx.tx_nonce.clone()));
    }

    Ok(())
}

fn check_structure(tx: &Transaction) -> Result<(), TransactionError> {
    if tx.tx_nonce.trim().is_empty() {
        return Err(TransactionError::Malformed("empty txNonce".to_string()));
    }
    // Input-less transactions are minted only by the miner.
    if tx.inputs.is_empty() {
        return Err(TransactionError::Malformed("no inputs".to_string()));
    }
    if tx.outputs.is_empty() {
        return Err(TransactionError::Malformed("no outputs".to_string()));
    }
    Ok(())
}

/// Maps every input to the output it spends, in input order
fn resolve_inputs<'a>(
    tx: &Transaction,
    utxos: &'a UtxoSet,
    pending: &[Transaction],
) -> Result<Vec<&'a TxOutput>, TransactionError> {
    let pending_spent: HashSet<OutPoint> = pending
        .iter()
        .flat_map(|other| other.inputs.iter())
        .map(|input| OutPoint::new(input.prev_tx_hash.clone(), input.index))
        .collect();

    let mut claimed = HashSet::with_capacity(tx.inputs.len());
    let mut resolved = Vec::with_capacity(tx.inputs.len());

    for input in &tx.inputs {
        let outpoint = OutPoint::new(input.prev_tx_hash.clone(), input.index);

        if claimed.contains(&outpoint) {
            return Err(TransactionError::DuplicateInput {
                prev_tx_hash: input.prev_tx_hash.clone(),
                index: input.index,
            });
        }

        let output = utxos.get(&outpoint).ok_or_else(|| TransactionError::UnknownInput {
            prev_tx_hash: input.prev_tx_hash.clone(),
            index: input.index,
        })?;

        if pending_spent.contains(&outpoint) {
            return Err(TransactionError::PendingConflict {
                prev_tx_hash: input.prev_tx_hash.clone(),
                index: input.index,
            });
        }

        claimed.insert(outpoint);
        resolved.push(output);
    }

    Ok(resolved)
}
