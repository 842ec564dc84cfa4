//! Value-transfer transactions: construction, signing, and verification
//!
//! Every input of a non-coinbase transaction is signed independently over a
//! trimmed copy of the whole transaction: all signatures and public keys
//! are zeroed, then the one input being signed temporarily carries the
//! public-key hash of the output it spends. The SHA-256 id of that copy is
//! the signed digest.

use crate::constants::{COINBASE_OUT_INDEX, SUBSIDY};
use crate::error::{NodeError, Result};
use crate::types::{current_timestamp, sha256, ByteString};
use crate::utxo::UtxoIndex;
use crate::wallet::{self, Wallet};
use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::generic_array::GenericArray;
use p256::EncodedPoint;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// One spent output: a reference to a prior transaction's output plus the
/// signature and raw public key that unlock it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Id of the transaction whose output is being spent; empty in a
    /// coinbase.
    pub prev_tx_id: ByteString,
    /// Index of that output; `-1` in a coinbase.
    pub prev_out_index: i64,
    /// ECDSA `r ‖ s`, equal-length halves; empty until signed.
    pub signature: ByteString,
    /// Raw `X ‖ Y` public key of the spender. A coinbase carries arbitrary
    /// payload bytes here instead.
    pub pub_key: ByteString,
}

impl TxInput {
    /// Whether the key that created this input hashes to `pub_key_hash`.
    pub fn uses_key(&self, pub_key_hash: &[u8]) -> bool {
        wallet::hash_pub_key(&self.pub_key) == pub_key_hash
    }
}

/// A value locked to a public-key hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: i64,
    pub pub_key_hash: ByteString,
}

impl TxOutput {
    /// Create an output locked to the key hash an address commits to.
    pub fn new(value: i64, address: &str) -> Result<TxOutput> {
        Ok(TxOutput {
            value,
            pub_key_hash: wallet::pub_key_hash_from_address(address)?,
        })
    }

    pub fn is_locked_with_key(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash == pub_key_hash
    }
}

/// A batch of inputs consumed and outputs created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// SHA-256 of the serialized transaction with `id` cleared; set at
    /// construction, before signing.
    pub id: ByteString,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    /// Disambiguates otherwise-identical coinbases.
    pub timestamp: i64,
}

impl Transaction {
    /// Mint `SUBSIDY` to `to`. The single input references nothing and its
    /// `pub_key` field carries `data` (a miner tag by default).
    pub fn new_coinbase(to: &str, data: Option<String>) -> Result<Transaction> {
        let data = data.unwrap_or_else(|| format!("reward to '{}'", to));

        let input = TxInput {
            prev_tx_id: Vec::new(),
            prev_out_index: COINBASE_OUT_INDEX,
            signature: Vec::new(),
            pub_key: data.into_bytes(),
        };
        let output = TxOutput::new(SUBSIDY, to)?;

        let mut tx = Transaction {
            id: Vec::new(),
            inputs: vec![input],
            outputs: vec![output],
            timestamp: current_timestamp(),
        };
        tx.id = tx.hash()?;

        Ok(tx)
    }

    /// Build and sign a transfer of `amount` from `wallet` to `to`, funded
    /// by the sender's unspent outputs. Any excess over `amount` comes back
    /// as a change output.
    pub fn new_utxo(
        wallet: &Wallet,
        to: &str,
        amount: i64,
        utxo: &UtxoIndex<'_>,
    ) -> Result<Transaction> {
        if amount <= 0 {
            return Err(NodeError::InvalidTransaction(
                "amount must be positive".to_string(),
            ));
        }

        let pub_key_hash = wallet::hash_pub_key(&wallet.public_key);
        let (accumulated, spendable) = utxo.find_spendable_outputs(&pub_key_hash, amount)?;

        if accumulated < amount {
            return Err(NodeError::InsufficientFunds {
                available: accumulated,
                required: amount,
            });
        }

        let mut inputs = Vec::new();
        for (tx_id_hex, out_indices) in &spendable {
            let prev_tx_id = hex::decode(tx_id_hex)
                .map_err(|e| NodeError::StoreCorruption(format!("bad tx id key: {}", e)))?;

            for &prev_out_index in out_indices {
                inputs.push(TxInput {
                    prev_tx_id: prev_tx_id.clone(),
                    prev_out_index,
                    signature: Vec::new(),
                    pub_key: wallet.public_key.clone(),
                });
            }
        }

        let mut outputs = vec![TxOutput::new(amount, to)?];
        if accumulated > amount {
            // Change back to the sender.
            outputs.push(TxOutput {
                value: accumulated - amount,
                pub_key_hash,
            });
        }

        let mut tx = Transaction {
            id: Vec::new(),
            inputs,
            outputs,
            timestamp: current_timestamp(),
        };
        tx.id = tx.hash()?;

        utxo.chain.sign_transaction(&mut tx, &wallet.signing_key()?)?;

        Ok(tx)
    }

    /// A coinbase has exactly one input that references nothing.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1
            && self.inputs[0].prev_tx_id.is_empty()
            && self.inputs[0].prev_out_index == COINBASE_OUT_INDEX
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Transaction> {
        bincode::deserialize(data)
            .map_err(|e| NodeError::ProtocolParse(format!("transaction: {}", e)))
    }

    /// The transaction id: SHA-256 of the serialized transaction with `id`
    /// cleared.
    pub fn hash(&self) -> Result<ByteString> {
        let mut copy = self.clone();
        copy.id = Vec::new();
        Ok(sha256(&copy.serialize()?).to_vec())
    }

    /// The signing template: every input stripped of its signature and
    /// public key. Outputs, ids, and the timestamp are untouched so signer
    /// and verifier derive identical digests.
    fn trimmed_copy(&self) -> Transaction {
        let inputs = self
            .inputs
            .iter()
            .map(|input| TxInput {
                prev_tx_id: input.prev_tx_id.clone(),
                prev_out_index: input.prev_out_index,
                signature: Vec::new(),
                pub_key: Vec::new(),
            })
            .collect();

        Transaction {
            id: self.id.clone(),
            inputs,
            outputs: self.outputs.clone(),
            timestamp: self.timestamp,
        }
    }

    /// The digest signed for input `index`: the trimmed copy's id with that
    /// input temporarily carrying the referenced output's public-key hash.
    fn input_digest(
        &self,
        tx_copy: &mut Transaction,
        index: usize,
        prev_txs: &HashMap<String, Transaction>,
    ) -> Result<ByteString> {
        let input = &self.inputs[index];
        let prev_tx = prev_txs
            .get(&hex::encode(&input.prev_tx_id))
            .ok_or_else(|| NodeError::UnknownTransaction(hex::encode(&input.prev_tx_id)))?;

        let out_index = usize::try_from(input.prev_out_index).map_err(|_| {
            NodeError::InvalidTransaction(format!(
                "negative output index {} in non-coinbase input",
                input.prev_out_index
            ))
        })?;
        let referenced = prev_tx.outputs.get(out_index).ok_or_else(|| {
            NodeError::InvalidTransaction(format!(
                "input references output {} of transaction {} which has {} outputs",
                out_index,
                hex::encode(&prev_tx.id),
                prev_tx.outputs.len()
            ))
        })?;

        tx_copy.inputs[index].pub_key = referenced.pub_key_hash.clone();
        let digest = tx_copy.hash()?;
        tx_copy.inputs[index].pub_key = Vec::new();

        Ok(digest)
    }

    /// Sign every input with `key`. `prev_txs` maps the hex id of each
    /// referenced transaction to the transaction itself.
    pub fn sign(
        &mut self,
        key: &SigningKey,
        prev_txs: &HashMap<String, Transaction>,
    ) -> Result<()> {
        if self.is_coinbase() {
            return Ok(());
        }

        let mut tx_copy = self.trimmed_copy();

        for index in 0..self.inputs.len() {
            let digest = self.input_digest(&mut tx_copy, index, prev_txs)?;

            let signature: Signature = key
                .sign_prehash(&digest)
                .map_err(|e| NodeError::Crypto(e.to_string()))?;
            self.inputs[index].signature = signature.to_bytes().to_vec();
        }

        Ok(())
    }

    /// Check every input signature against the referenced outputs.
    /// Coinbases verify unconditionally. A missing referenced transaction
    /// is an error; a bad signature, key, or encoding is `Ok(false)`.
    pub fn verify(&self, prev_txs: &HashMap<String, Transaction>) -> Result<bool> {
        if self.is_coinbase() {
            return Ok(true);
        }

        let mut tx_copy = self.trimmed_copy();

        for (index, input) in self.inputs.iter().enumerate() {
            let digest = self.input_digest(&mut tx_copy, index, prev_txs)?;

            // r ‖ s, equal halves.
            let signature = match Signature::from_slice(&input.signature) {
                Ok(sig) => sig,
                Err(_) => return Ok(false),
            };

            // Raw X ‖ Y back to a curve point.
            if input.pub_key.len() != 64 {
                return Ok(false);
            }
            let point = EncodedPoint::from_untagged_bytes(GenericArray::from_slice(&input.pub_key));
            let verifying_key = match VerifyingKey::from_encoded_point(&point) {
                Ok(key) => key,
                Err(_) => return Ok(false),
            };

            if verifying_key.verify_prehash(&digest, &signature).is_err() {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Transaction {}:", hex::encode(&self.id))?;

        for (i, input) in self.inputs.iter().enumerate() {
            writeln!(f, "     Input {}:", i)?;
            writeln!(f, "       TxId:      {}", hex::encode(&input.prev_tx_id))?;
            writeln!(f, "       Out:       {}", input.prev_out_index)?;
            writeln!(f, "       Signature: {}", hex::encode(&input.signature))?;
            writeln!(f, "       PubKey:    {}", hex::encode(&input.pub_key))?;
        }

        for (i, output) in self.outputs.iter().enumerate() {
            writeln!(f, "     Output {}:", i)?;
            writeln!(f, "       Value:      {}", output.value)?;
            writeln!(f, "       PubKeyHash: {}", hex::encode(&output.pub_key_hash))?;
        }

        Ok(())
    }
}
