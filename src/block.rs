//! Blocks: an authenticated batch of transactions chained by hash

use crate::error::{NodeError, Result};
use crate::merkle::merkle_root;
use crate::pow::ProofOfWork;
use crate::transaction::Transaction;
use crate::types::{current_timestamp, Hash, ZERO_HASH};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub timestamp: i64,
    /// At least one transaction; the genesis block carries exactly the
    /// founding coinbase.
    pub transactions: Vec<Transaction>,
    /// All-zero for the genesis block.
    pub prev_block_hash: Hash,
    pub nonce: u64,
    /// The proof-of-work output over the header.
    pub hash: Hash,
    pub height: u64,
}

impl Block {
    /// Assemble a candidate block and run the proof-of-work search to
    /// completion, producing a valid block.
    pub fn new(
        transactions: Vec<Transaction>,
        prev_block_hash: Hash,
        height: u64,
    ) -> Result<Block> {
        if transactions.is_empty() {
            return Err(NodeError::InvalidTransaction(
                "a block carries at least one transaction".to_string(),
            ));
        }

        let mut block = Block {
            timestamp: current_timestamp(),
            transactions,
            prev_block_hash,
            nonce: 0,
            hash: ZERO_HASH,
            height,
        };

        let (nonce, hash) = ProofOfWork::new(&block).run()?;
        block.nonce = nonce;
        block.hash = hash;

        Ok(block)
    }

    /// Mine the genesis block around the founding coinbase.
    pub fn genesis(coinbase: Transaction) -> Result<Block> {
        Block::new(vec![coinbase], ZERO_HASH, 0)
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_block_hash == ZERO_HASH
    }

    /// Merkle root over the serialized transactions, in block order.
    pub fn hash_transactions(&self) -> Result<Hash> {
        let mut serialized = Vec::with_capacity(self.transactions.len());
        for tx in &self.transactions {
            serialized.push(tx.serialize()?);
        }
        merkle_root(&serialized)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Block> {
        bincode::deserialize(data).map_err(|e| NodeError::ProtocolParse(format!("block: {}", e)))
    }
}
