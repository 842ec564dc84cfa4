//! Protocol constants

/// Difficulty: a valid block hash has at least this many leading zero bits
pub const TARGET_BITS: u64 = 24;

/// Coinbase reward minted to the miner of every block
pub const SUBSIDY: i64 = 10;

/// Address version prefix byte
pub const VERSION_BYTE: u8 = 0x00;

/// Length of the Base58Check address checksum
pub const ADDR_CHECKSUM_LEN: usize = 4;

/// Length of a SHA-256 hash
pub const HASH_LEN: usize = 32;

/// Length of a RIPEMD160(SHA-256(pubkey)) public-key hash
pub const PUB_KEY_HASH_LEN: usize = 20;

/// The hard-coded central peer every node knows at startup
pub const CENTRAL_NODE: &str = "localhost:3000";

/// Wire command field width (ASCII name, right-padded with 0x00)
pub const COMMAND_LEN: usize = 12;

/// Protocol version announced in `version` messages
pub const NODE_VERSION: u32 = 1;

/// Mempool size at which a mining peer starts packing blocks. A protocol
/// compatibility constant with no economic justification.
pub const MIN_MEMPOOL_TXS: usize = 2;

/// Upper bound of the nonce search space
pub const MAX_NONCE: u64 = i64::MAX as u64;

/// Output-index sentinel marking a coinbase input
pub const COINBASE_OUT_INDEX: i64 = -1;

/// Payload embedded in the genesis coinbase input
pub const GENESIS_COINBASE_DATA: &str =
    "The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";
