//! Persistent chain store
//!
//! One sled database per node hosting three trees:
//!
//! - `blocks`: block hash → serialized block, plus the tip pointer under
//!   the literal key `"l"`.
//! - `chainstate`: transaction id → that transaction's unspent outputs.
//! - `chainstate_blockid2tx`: transaction id → hash of the containing
//!   block, kept only while the transaction still has unspent outputs.
//!
//! A block, the tip advance it may cause, and its unspent-output delta
//! commit in a single multi-tree transaction, so readers never observe a
//! tip whose index lags it.

use crate::block::Block;
use crate::error::{NodeError, Result};
use crate::types::Hash;
use crate::utxo::{UnspentOutput, UtxoEntry};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionalTree,
};
use sled::{Config, Db, Transactional, Tree};
use std::collections::HashMap;
use std::path::Path;

const BLOCKS_TREE: &str = "blocks";
const CHAINSTATE_TREE: &str = "chainstate";
const TX_LOCATION_TREE: &str = "chainstate_blockid2tx";

/// Key in the blocks tree holding the hash of the highest-height block.
pub const TIP_KEY: &[u8] = b"l";

/// Handle to the node's database. sled trees are internally reference
/// counted, so cloning is cheap and clones share the same store.
#[derive(Clone)]
pub struct ChainStore {
    _db: Db,
    blocks: Tree,
    chainstate: Tree,
    locations: Tree,
}

impl ChainStore {
    /// Open (creating if absent) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<ChainStore> {
        let db = Config::default().path(path).open()?;
        Ok(ChainStore {
            blocks: db.open_tree(BLOCKS_TREE)?,
            chainstate: db.open_tree(CHAINSTATE_TREE)?,
            locations: db.open_tree(TX_LOCATION_TREE)?,
            _db: db,
        })
    }

    pub fn exists(path: impl AsRef<Path>) -> bool {
        path.as_ref().exists()
    }

    /// Hash of the current tip block, if any block has been committed.
    pub fn tip(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.blocks.get(TIP_KEY)?.map(|v| v.to_vec()))
    }

    pub fn get_block(&self, hash: &[u8]) -> Result<Option<Block>> {
        match self.blocks.get(hash)? {
            Some(bytes) => {
                let block = Block::deserialize(&bytes)
                    .map_err(|e| NodeError::StoreCorruption(e.to_string()))?;
                Ok(Some(block))
            }
            None => Ok(None),
        }
    }

    /// Hash of the block containing the given transaction, while that
    /// transaction still has unspent outputs.
    pub fn get_location(&self, tx_id: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.locations.get(tx_id)?.map(|v| v.to_vec()))
    }

    /// Unspent outputs recorded for the given transaction.
    pub fn get_entry(&self, tx_id: &[u8]) -> Result<Option<UtxoEntry>> {
        match self.chainstate.get(tx_id)? {
            Some(bytes) => Ok(Some(UtxoEntry::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Iterate the chainstate tree as raw `(tx_id, entry)` pairs.
    pub fn chainstate_iter(&self) -> impl Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> {
        self.chainstate.iter().map(|item| {
            item.map(|(k, v)| (k.to_vec(), v.to_vec()))
                .map_err(NodeError::from)
        })
    }

    /// Commit a block: store it, advance the tip if its height exceeds the
    /// stored tip's (an empty store accepts any first block), and fold the
    /// block's unspent-output delta into the index, all in one
    /// transaction.
    ///
    /// Idempotent on block hash; returns whether the block was newly
    /// stored.
    pub fn commit_block(&self, block: &Block) -> Result<bool> {
        let block_bytes = block.serialize()?;

        let committed = (&self.blocks, &self.chainstate, &self.locations).transaction(
            |(blocks, chainstate, locations)| {
                if blocks.get(&block.hash[..])?.is_some() {
                    return Ok(false);
                }
                blocks.insert(&block.hash[..], block_bytes.clone())?;

                let advance = match blocks.get(TIP_KEY)? {
                    None => true,
                    Some(tip_hash) => {
                        let tip_bytes = blocks.get(tip_hash)?.ok_or_else(|| {
                            ConflictableTransactionError::Abort(NodeError::StoreCorruption(
                                "tip points at a missing block".to_string(),
                            ))
                        })?;
                        let tip_block = Block::deserialize(&tip_bytes).map_err(|e| {
                            ConflictableTransactionError::Abort(NodeError::StoreCorruption(
                                e.to_string(),
                            ))
                        })?;
                        block.height > tip_block.height
                    }
                };
                if advance {
                    blocks.insert(TIP_KEY, &block.hash[..])?;
                }

                apply_block_outputs(block, chainstate, locations)?;

                Ok(true)
            },
        );

        committed.map_err(NodeError::from)
    }

    /// Replace both index trees wholesale (reindex).
    pub fn replace_index(
        &self,
        utxo: HashMap<Vec<u8>, UtxoEntry>,
        locations: HashMap<Vec<u8>, Hash>,
    ) -> Result<()> {
        let mut entries = Vec::with_capacity(utxo.len());
        for (tx_id, entry) in &utxo {
            entries.push((tx_id.clone(), entry.serialize()?));
        }

        self.chainstate.clear()?;
        self.locations.clear()?;

        (&self.chainstate, &self.locations)
            .transaction(
                |(chainstate, location_tree)| -> ConflictableTransactionResult<(), NodeError> {
                    for (tx_id, bytes) in &entries {
                        chainstate.insert(&tx_id[..], bytes.clone())?;
                    }
                    for (tx_id, block_hash) in &locations {
                        location_tree.insert(&tx_id[..], &block_hash[..])?;
                    }
                    Ok(())
                },
            )
            .map_err(NodeError::from)
    }
}

/// The incremental index update for one committed block: spent outputs are
/// subtracted from their transactions' entries (dropping an entry and its
/// location once nothing is left), then every transaction in the block
/// contributes its full output list and its location.
fn apply_block_outputs(
    block: &Block,
    chainstate: &TransactionalTree,
    locations: &TransactionalTree,
) -> ConflictableTransactionResult<(), NodeError> {
    for tx in &block.transactions {
        if !tx.is_coinbase() {
            for input in &tx.inputs {
                let entry_bytes = chainstate.get(&input.prev_tx_id[..])?.ok_or_else(|| {
                    ConflictableTransactionError::Abort(NodeError::StoreCorruption(format!(
                        "spent transaction {} missing from chainstate",
                        hex::encode(&input.prev_tx_id)
                    )))
                })?;
                let entry = UtxoEntry::deserialize(&entry_bytes).map_err(|e| {
                    ConflictableTransactionError::Abort(NodeError::StoreCorruption(e.to_string()))
                })?;

                let remaining: Vec<UnspentOutput> = entry
                    .outputs
                    .into_iter()
                    .filter(|unspent| unspent.index != input.prev_out_index)
                    .collect();

                if remaining.is_empty() {
                    chainstate.remove(&input.prev_tx_id[..])?;
                    locations.remove(&input.prev_tx_id[..])?;
                } else {
                    let bytes = UtxoEntry { outputs: remaining }.serialize().map_err(|e| {
                        ConflictableTransactionError::Abort(NodeError::StoreCorruption(
                            e.to_string(),
                        ))
                    })?;
                    chainstate.insert(&input.prev_tx_id[..], bytes)?;
                }
            }
        }

        let outputs: Vec<UnspentOutput> = tx
            .outputs
            .iter()
            .enumerate()
            .map(|(index, output)| UnspentOutput {
                index: index as i64,
                output: output.clone(),
            })
            .collect();
        let bytes = UtxoEntry { outputs }.serialize().map_err(|e| {
            ConflictableTransactionError::Abort(NodeError::StoreCorruption(e.to_string()))
        })?;
        chainstate.insert(&tx.id[..], bytes)?;
        locations.insert(&tx.id[..], &block.hash[..])?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;
    use crate::types::ZERO_HASH;
    use crate::wallet::Wallet;

    fn open_store() -> (tempfile::TempDir, ChainStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::open(dir.path().join("chain.db")).unwrap();
        (dir, store)
    }

    fn genesis_for(seed: u8) -> Block {
        let wallet = Wallet::from_seed([seed; 32]).unwrap();
        let coinbase = Transaction::new_coinbase(&wallet.address(), None).unwrap();
        Block::genesis(coinbase).unwrap()
    }

    #[test]
    fn test_empty_store_has_no_tip() {
        let (_dir, store) = open_store();
        assert!(store.tip().unwrap().is_none());
    }

    #[test]
    fn test_first_commit_sets_tip_and_index() {
        let (_dir, store) = open_store();
        let genesis = genesis_for(31);

        assert!(store.commit_block(&genesis).unwrap());
        assert_eq!(store.tip().unwrap().unwrap(), genesis.hash.to_vec());
        assert_eq!(store.get_block(&genesis.hash).unwrap().unwrap(), genesis);

        // The coinbase is indexed with its original output position.
        let coinbase = &genesis.transactions[0];
        let entry = store.get_entry(&coinbase.id).unwrap().unwrap();
        assert_eq!(entry.outputs.len(), 1);
        assert_eq!(entry.outputs[0].index, 0);
        assert_eq!(
            store.get_location(&coinbase.id).unwrap().unwrap(),
            genesis.hash.to_vec()
        );
    }

    #[test]
    fn test_commit_is_idempotent_on_hash() {
        let (_dir, store) = open_store();
        let genesis = genesis_for(32);

        assert!(store.commit_block(&genesis).unwrap());
        assert!(!store.commit_block(&genesis).unwrap());
        assert_eq!(store.tip().unwrap().unwrap(), genesis.hash.to_vec());
    }

    #[test]
    fn test_tip_advances_only_on_greater_height() {
        let (_dir, store) = open_store();
        let genesis = genesis_for(33);
        store.commit_block(&genesis).unwrap();

        let miner = Wallet::from_seed([34u8; 32]).unwrap();
        let coinbase =
            Transaction::new_coinbase(&miner.address(), Some("next".to_string())).unwrap();
        let next = Block::new(vec![coinbase], genesis.hash, 1).unwrap();
        store.commit_block(&next).unwrap();
        assert_eq!(store.tip().unwrap().unwrap(), next.hash.to_vec());

        // A sibling at the same height is stored but does not move the tip.
        let other =
            Transaction::new_coinbase(&miner.address(), Some("sibling".to_string())).unwrap();
        let sibling = Block::new(vec![other], genesis.hash, 1).unwrap();
        assert!(store.commit_block(&sibling).unwrap());
        assert_eq!(store.tip().unwrap().unwrap(), next.hash.to_vec());
        assert!(store.get_block(&sibling.hash).unwrap().is_some());
    }

    #[test]
    fn test_replace_index_round_trip() {
        let (_dir, store) = open_store();
        let genesis = genesis_for(35);
        store.commit_block(&genesis).unwrap();

        let coinbase = &genesis.transactions[0];
        let mut utxo = HashMap::new();
        utxo.insert(
            coinbase.id.clone(),
            UtxoEntry {
                outputs: vec![UnspentOutput {
                    index: 0,
                    output: coinbase.outputs[0].clone(),
                }],
            },
        );
        let mut locations = HashMap::new();
        locations.insert(coinbase.id.clone(), genesis.hash);

        store.replace_index(utxo, locations).unwrap();

        let entry = store.get_entry(&coinbase.id).unwrap().unwrap();
        assert_eq!(entry.outputs[0].output, coinbase.outputs[0]);
        assert_eq!(
            store.get_location(&coinbase.id).unwrap().unwrap(),
            genesis.hash.to_vec()
        );
        assert_eq!(store.chainstate_iter().count(), 1);
    }

    #[test]
    fn test_missing_block_lookup_is_none() {
        let (_dir, store) = open_store();
        assert!(store.get_block(&ZERO_HASH).unwrap().is_none());
    }
}
