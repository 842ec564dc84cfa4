//! Unspent-output index: fast balance and coin-selection queries
//!
//! The chainstate tree maps a transaction id to that transaction's
//! still-unspent outputs. Each retained output remembers its original
//! index, because inputs reference outputs by position in the original
//! transaction even after earlier outputs have been spent away.

use crate::blockchain::Blockchain;
use crate::error::{NodeError, Result};
use crate::transaction::TxOutput;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One unspent output together with its position in the original
/// transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentOutput {
    pub index: i64,
    pub output: TxOutput,
}

/// The chainstate value for one transaction: its unspent outputs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub outputs: Vec<UnspentOutput>,
}

impl UtxoEntry {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<UtxoEntry> {
        bincode::deserialize(data)
            .map_err(|e| NodeError::StoreCorruption(format!("utxo entry: {}", e)))
    }
}

/// Query layer over the persisted chainstate.
pub struct UtxoIndex<'a> {
    pub chain: &'a Blockchain,
}

impl<'a> UtxoIndex<'a> {
    pub fn new(chain: &'a Blockchain) -> UtxoIndex<'a> {
        UtxoIndex { chain }
    }

    /// Collect outputs locked to `pub_key_hash` until their sum reaches
    /// `amount`. Returns the accumulated value and a map from hex
    /// transaction id to the selected original output indices.
    ///
    /// Accumulation stops as soon as the threshold is met, so no more
    /// outputs are consumed than the transfer needs.
    pub fn find_spendable_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: i64,
    ) -> Result<(i64, HashMap<String, Vec<i64>>)> {
        let mut unspent_outputs: HashMap<String, Vec<i64>> = HashMap::new();
        let mut accumulated = 0i64;

        'scan: for item in self.chain.store().chainstate_iter() {
            let (tx_id, entry_bytes) = item?;
            let entry = UtxoEntry::deserialize(&entry_bytes)?;

            for unspent in &entry.outputs {
                if unspent.output.is_locked_with_key(pub_key_hash) && accumulated < amount {
                    accumulated += unspent.output.value;
                    unspent_outputs
                        .entry(hex::encode(&tx_id))
                        .or_default()
                        .push(unspent.index);
                }
                if accumulated >= amount {
                    break 'scan;
                }
            }
        }

        Ok((accumulated, unspent_outputs))
    }

    /// Every unspent output locked to `pub_key_hash`.
    pub fn find_utxo(&self, pub_key_hash: &[u8]) -> Result<Vec<TxOutput>> {
        let mut utxos = Vec::new();

        for item in self.chain.store().chainstate_iter() {
            let (_, entry_bytes) = item?;
            let entry = UtxoEntry::deserialize(&entry_bytes)?;

            for unspent in entry.outputs {
                if unspent.output.is_locked_with_key(pub_key_hash) {
                    utxos.push(unspent.output);
                }
            }
        }

        Ok(utxos)
    }

    /// Number of transactions that still contribute an unspent output.
    pub fn count_transactions(&self) -> Result<usize> {
        let mut count = 0;
        for item in self.chain.store().chainstate_iter() {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// Rebuild the index from scratch by walking the whole chain,
    /// replacing both the chainstate and the transaction-location tree.
    pub fn reindex(&self) -> Result<()> {
        let (utxo, locations) = self.chain.find_utxo()?;
        self.chain.store().replace_index(utxo, locations)
    }
}
