//! The chain facade: creation, iteration, mining, appends, and lookups

use crate::block::Block;
use crate::constants::GENESIS_COINBASE_DATA;
use crate::error::{NodeError, Result};
use crate::store::ChainStore;
use crate::transaction::Transaction;
use crate::types::Hash;
use crate::utxo::{UnspentOutput, UtxoEntry};
use log::info;
use p256::ecdsa::SigningKey;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// A handle to one node's chain. Clones share the same store.
#[derive(Clone)]
pub struct Blockchain {
    store: ChainStore,
}

impl Blockchain {
    /// Database location for a node id: `blockchain_<node_id>.db`.
    pub fn db_file(node_id: &str) -> PathBuf {
        PathBuf::from(format!("blockchain_{}.db", node_id))
    }

    /// Create a fresh chain for `node_id`, mining the genesis block with a
    /// founding coinbase rewarded to `address`.
    pub fn create(address: &str, node_id: &str) -> Result<Blockchain> {
        Blockchain::create_in(Blockchain::db_file(node_id), address)
    }

    /// As `create`, at an explicit path.
    pub fn create_in(path: impl AsRef<Path>, address: &str) -> Result<Blockchain> {
        let store = ChainStore::open(path)?;
        if store.tip()?.is_some() {
            return Err(NodeError::ChainExists);
        }

        let coinbase =
            Transaction::new_coinbase(address, Some(GENESIS_COINBASE_DATA.to_string()))?;
        let genesis = Block::genesis(coinbase)?;
        store.commit_block(&genesis)?;
        info!("mined genesis block {}", hex::encode(genesis.hash));

        Ok(Blockchain { store })
    }

    /// Open an existing chain for `node_id`; fails if none has been
    /// created.
    pub fn open(node_id: &str) -> Result<Blockchain> {
        Blockchain::open_in(Blockchain::db_file(node_id))
    }

    /// As `open`, at an explicit path.
    pub fn open_in(path: impl AsRef<Path>) -> Result<Blockchain> {
        if !ChainStore::exists(&path) {
            return Err(NodeError::ChainMissing);
        }
        let store = ChainStore::open(path)?;
        if store.tip()?.is_none() {
            return Err(NodeError::ChainMissing);
        }
        Ok(Blockchain { store })
    }

    /// Open a possibly-empty store. A chain handle without a tip can only
    /// accept blocks (the first one becomes the tip); this is how a fresh
    /// peer bootstraps from a received genesis block.
    pub fn init_in(path: impl AsRef<Path>) -> Result<Blockchain> {
        Ok(Blockchain {
            store: ChainStore::open(path)?,
        })
    }

    pub fn store(&self) -> &ChainStore {
        &self.store
    }

    /// Hash of the current tip block.
    pub fn tip(&self) -> Result<Vec<u8>> {
        self.store.tip()?.ok_or(NodeError::ChainMissing)
    }

    /// Height of the current tip block.
    pub fn best_height(&self) -> Result<u64> {
        let tip_hash = self.tip()?;
        Ok(self.get_block(&tip_hash)?.height)
    }

    /// Iterate blocks from the tip back to genesis.
    pub fn iter(&self) -> Result<ChainIterator> {
        Ok(ChainIterator {
            current_hash: self.store.tip()?.unwrap_or_default(),
            store: self.store.clone(),
        })
    }

    pub fn get_block(&self, hash: &[u8]) -> Result<Block> {
        self.store
            .get_block(hash)?
            .ok_or_else(|| NodeError::UnknownBlock(hex::encode(hash)))
    }

    /// All block hashes in increasing-height order (genesis first), the
    /// order a syncing peer downloads them in.
    pub fn block_hashes(&self) -> Result<Vec<Vec<u8>>> {
        let mut hashes = Vec::new();
        for block in self.iter()? {
            hashes.push(block?.hash.to_vec());
        }
        hashes.reverse();
        Ok(hashes)
    }

    /// Verify the given transactions, assemble them into a block on top of
    /// the current tip, run the proof of work, and commit the block along
    /// with its unspent-output delta.
    pub fn mine_block(&self, transactions: Vec<Transaction>) -> Result<Block> {
        for tx in &transactions {
            if !self.verify_transaction(tx)? {
                return Err(NodeError::InvalidTransaction(hex::encode(&tx.id)));
            }
        }

        let tip_hash = self.tip()?;
        let tip_height = self.get_block(&tip_hash)?.height;
        let prev_block_hash: Hash = tip_hash
            .as_slice()
            .try_into()
            .map_err(|_| NodeError::StoreCorruption("tip hash has wrong width".to_string()))?;

        info!(
            "mining a new block with {} transactions at height {}",
            transactions.len(),
            tip_height + 1
        );
        let block = Block::new(transactions, prev_block_hash, tip_height + 1)?;
        self.store.commit_block(&block)?;
        info!("mined block {}", hex::encode(block.hash));

        Ok(block)
    }

    /// Append an externally mined block. Idempotent on hash; the tip only
    /// advances when the block's height exceeds the stored tip's. Returns
    /// whether the block was newly stored.
    pub fn add_block(&self, block: &Block) -> Result<bool> {
        let added = self.store.commit_block(block)?;
        if added {
            info!(
                "added block {} at height {}",
                hex::encode(block.hash),
                block.height
            );
        }
        Ok(added)
    }

    /// Walk the whole chain and derive every transaction's unspent outputs
    /// and the hash of its containing block. The reindex source.
    pub fn find_utxo(&self) -> Result<(HashMap<Vec<u8>, UtxoEntry>, HashMap<Vec<u8>, Hash>)> {
        let mut spent: HashMap<Vec<u8>, HashSet<i64>> = HashMap::new();
        let mut outputs: HashMap<Vec<u8>, Vec<UnspentOutput>> = HashMap::new();
        let mut locations: HashMap<Vec<u8>, Hash> = HashMap::new();

        for block in self.iter()? {
            let block = block?;

            for tx in &block.transactions {
                if !tx.is_coinbase() {
                    for input in &tx.inputs {
                        spent
                            .entry(input.prev_tx_id.clone())
                            .or_default()
                            .insert(input.prev_out_index);
                    }
                }

                outputs.insert(
                    tx.id.clone(),
                    tx.outputs
                        .iter()
                        .enumerate()
                        .map(|(index, output)| UnspentOutput {
                            index: index as i64,
                            output: output.clone(),
                        })
                        .collect(),
                );
                locations.insert(tx.id.clone(), block.hash);
            }
        }

        let mut utxo = HashMap::new();
        for (tx_id, tx_outputs) in outputs {
            let spent_here = spent.get(&tx_id);
            let unspent: Vec<UnspentOutput> = tx_outputs
                .into_iter()
                .filter(|unspent| {
                    spent_here.map_or(true, |indices| !indices.contains(&unspent.index))
                })
                .collect();

            if unspent.is_empty() {
                locations.remove(&tx_id);
            } else {
                utxo.insert(tx_id, UtxoEntry { outputs: unspent });
            }
        }

        Ok((utxo, locations))
    }

    /// Find a transaction by scanning the whole chain.
    pub fn find_transaction(&self, id: &[u8]) -> Result<Transaction> {
        for block in self.iter()? {
            for tx in block?.transactions {
                if tx.id == id {
                    return Ok(tx);
                }
            }
        }
        Err(NodeError::UnknownTransaction(hex::encode(id)))
    }

    /// Find a transaction through the location index. Only transactions
    /// that still have unspent outputs are reachable this way.
    pub fn find_transaction_indexed(&self, id: &[u8]) -> Result<Transaction> {
        let block_hash = self
            .store
            .get_location(id)?
            .ok_or_else(|| NodeError::UnknownTransaction(hex::encode(id)))?;
        let block = self.store.get_block(&block_hash)?.ok_or_else(|| {
            NodeError::StoreCorruption(format!(
                "transaction location points at missing block {}",
                hex::encode(&block_hash)
            ))
        })?;

        block
            .transactions
            .into_iter()
            .find(|tx| tx.id == id)
            .ok_or_else(|| {
                NodeError::StoreCorruption(format!(
                    "transaction {} absent from its located block",
                    hex::encode(id)
                ))
            })
    }

    /// Resolve the transactions referenced by `tx`'s inputs, keyed by hex
    /// id.
    fn prev_transactions(&self, tx: &Transaction) -> Result<HashMap<String, Transaction>> {
        let mut prev_txs = HashMap::new();
        for input in &tx.inputs {
            let prev_tx = self.find_transaction_indexed(&input.prev_tx_id)?;
            prev_txs.insert(hex::encode(&prev_tx.id), prev_tx);
        }
        Ok(prev_txs)
    }

    /// Fill in `tx`'s input signatures, resolving the referenced
    /// transactions through the location index.
    pub fn sign_transaction(&self, tx: &mut Transaction, key: &SigningKey) -> Result<()> {
        if tx.is_coinbase() {
            return Ok(());
        }
        let prev_txs = self.prev_transactions(tx)?;
        tx.sign(key, &prev_txs)
    }

    /// Verify every input signature of `tx`. Coinbases are always valid.
    pub fn verify_transaction(&self, tx: &Transaction) -> Result<bool> {
        if tx.is_coinbase() {
            return Ok(true);
        }
        let prev_txs = self.prev_transactions(tx)?;
        tx.verify(&prev_txs)
    }
}

/// Tip-to-genesis block iterator.
pub struct ChainIterator {
    current_hash: Vec<u8>,
    store: ChainStore,
}

impl Iterator for ChainIterator {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_hash.is_empty() {
            return None;
        }

        match self.store.get_block(&self.current_hash) {
            Ok(Some(block)) => {
                self.current_hash = if block.is_genesis() {
                    Vec::new()
                } else {
                    block.prev_block_hash.to_vec()
                };
                Some(Ok(block))
            }
            Ok(None) => {
                let missing = hex::encode(&self.current_hash);
                self.current_hash.clear();
                Some(Err(NodeError::UnknownBlock(missing)))
            }
            Err(e) => {
                self.current_hash.clear();
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::Wallet;

    fn founder() -> Wallet {
        Wallet::from_seed([41u8; 32]).unwrap()
    }

    fn new_chain(dir: &tempfile::TempDir) -> Blockchain {
        Blockchain::create_in(dir.path().join("chain.db"), &founder().address()).unwrap()
    }

    #[test]
    fn test_create_open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.db");

        let tip = {
            let chain = Blockchain::create_in(&path, &founder().address()).unwrap();
            chain.tip().unwrap()
        };

        let reopened = Blockchain::open_in(&path).unwrap();
        assert_eq!(reopened.tip().unwrap(), tip);
        assert_eq!(reopened.best_height().unwrap(), 0);
    }

    #[test]
    fn test_create_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.db");

        Blockchain::create_in(&path, &founder().address()).unwrap();
        assert!(matches!(
            Blockchain::create_in(&path, &founder().address()),
            Err(NodeError::ChainExists)
        ));
    }

    #[test]
    fn test_open_missing_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Blockchain::open_in(dir.path().join("absent.db")),
            Err(NodeError::ChainMissing)
        ));
    }

    #[test]
    fn test_iterates_tip_to_genesis() {
        let dir = tempfile::tempdir().unwrap();
        let chain = new_chain(&dir);

        let miner = founder();
        let coinbase =
            Transaction::new_coinbase(&miner.address(), Some("second".to_string())).unwrap();
        chain.mine_block(vec![coinbase]).unwrap();

        let heights: Vec<u64> = chain
            .iter()
            .unwrap()
            .map(|b| b.unwrap().height)
            .collect();
        assert_eq!(heights, vec![1, 0]);

        let hashes = chain.block_hashes().unwrap();
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[1], chain.tip().unwrap());
    }

    #[test]
    fn test_find_transaction_both_paths() {
        let dir = tempfile::tempdir().unwrap();
        let chain = new_chain(&dir);

        let genesis_hash = chain.tip().unwrap();
        let coinbase = chain.get_block(&genesis_hash).unwrap().transactions[0].clone();

        assert_eq!(chain.find_transaction(&coinbase.id).unwrap(), coinbase);
        assert_eq!(
            chain.find_transaction_indexed(&coinbase.id).unwrap(),
            coinbase
        );
        assert!(matches!(
            chain.find_transaction(&[0u8; 32]),
            Err(NodeError::UnknownTransaction(_))
        ));
    }

    #[test]
    fn test_unknown_block_lookup_fails() {
        let dir = tempfile::tempdir().unwrap();
        let chain = new_chain(&dir);
        assert!(matches!(
            chain.get_block(&[9u8; 32]),
            Err(NodeError::UnknownBlock(_))
        ));
    }

    #[test]
    fn test_find_utxo_matches_store_after_genesis() {
        let dir = tempfile::tempdir().unwrap();
        let chain = new_chain(&dir);

        let (utxo, locations) = chain.find_utxo().unwrap();
        assert_eq!(utxo.len(), 1);
        assert_eq!(locations.len(), 1);

        let genesis_hash = chain.tip().unwrap();
        let coinbase_id = &chain.get_block(&genesis_hash).unwrap().transactions[0].id;
        assert!(utxo.contains_key(coinbase_id));
        assert_eq!(locations[coinbase_id].to_vec(), genesis_hash);
    }
}
