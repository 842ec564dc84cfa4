//! Error types for the node

use sled::transaction::TransactionError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("insufficient funds: have {available}, need {required}")]
    InsufficientFunds { available: i64, required: i64 },

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("unknown block: {0}")]
    UnknownBlock(String),

    #[error("unknown transaction: {0}")]
    UnknownTransaction(String),

    #[error("store corruption: {0}")]
    StoreCorruption(String),

    #[error("blockchain already exists")]
    ChainExists,

    #[error("no blockchain found; create one first")]
    ChainMissing,

    #[error("proof of work failed: {0}")]
    ProofOfWork(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("protocol parse error: {0}")]
    ProtocolParse(String),

    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] sled::Error),

    #[error(transparent)]
    Codec(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, NodeError>;

// Unwraps the application error out of an aborted sled transaction; real
// storage failures stay wrapped as `Store`.
impl From<TransactionError<NodeError>> for NodeError {
    fn from(err: TransactionError<NodeError>) -> Self {
        match err {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => NodeError::Store(e),
        }
    }
}
