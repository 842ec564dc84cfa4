//! # tinycoin
//!
//! A minimal proof-of-work cryptocurrency node: a peer in a network of
//! equal peers, each maintaining a persistent ledger of blocks of signed
//! value-transfer transactions.
//!
//! ## Architecture
//!
//! - [`merkle`] / [`pow`]: hashing commitments and the fixed-difficulty
//!   nonce search.
//! - [`transaction`] / [`block`]: the UTXO data model, with ECDSA P-256
//!   signatures over per-input trimmed-transaction digests, batched into
//!   proof-of-work blocks.
//! - [`store`] / [`blockchain`] / [`utxo`]: a sled-backed chain store
//!   (blocks, tip pointer, unspent-output index, transaction locations)
//!   behind a chain facade; a block and its index delta commit atomically.
//! - [`wallet`]: key pairs, Base58Check addresses, and the per-node wallet
//!   file.
//! - [`server`]: the TCP peer protocol: `version`/`inv`/`getdata` sync,
//!   mempool gossip, and the mining trigger.

pub mod block;
pub mod blockchain;
pub mod constants;
pub mod error;
pub mod merkle;
pub mod pow;
pub mod server;
pub mod store;
pub mod transaction;
pub mod types;
pub mod utxo;
pub mod wallet;

pub use block::Block;
pub use blockchain::Blockchain;
pub use constants::*;
pub use error::{NodeError, Result};
pub use pow::ProofOfWork;
pub use server::Server;
pub use transaction::{Transaction, TxInput, TxOutput};
pub use utxo::UtxoIndex;
pub use wallet::{Wallet, Wallets};
