//! Key pairs, Base58Check addresses, and the on-disk wallet collection
//!
//! A wallet is an ECDSA P-256 key pair. Addresses commit to
//! `RIPEMD160(SHA-256(raw public key))` with a version prefix and a
//! truncated double-SHA-256 checksum.

use crate::constants::{ADDR_CHECKSUM_LEN, PUB_KEY_HASH_LEN, VERSION_BYTE};
use crate::error::{NodeError, Result};
use crate::types::sha256;
use p256::ecdsa::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use ripemd::{Digest, Ripemd160};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// An ECDSA P-256 key pair.
///
/// The secret scalar and the raw `X ‖ Y` public key are kept as bytes so
/// the wallet file stays a plain serde record; the signing key is rebuilt
/// on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    secret_key: Vec<u8>,
    pub public_key: Vec<u8>,
}

impl Wallet {
    /// Generate a fresh key pair from the platform CSPRNG.
    pub fn new() -> Wallet {
        let signing_key = SigningKey::random(&mut OsRng);
        Wallet::from_signing_key(signing_key)
    }

    /// Build a key pair from a fixed 32-byte seed. Deterministic; used to
    /// pin test identities. Fails if the seed is not a valid scalar.
    pub fn from_seed(seed: [u8; 32]) -> Result<Wallet> {
        let signing_key =
            SigningKey::from_slice(&seed).map_err(|e| NodeError::Crypto(e.to_string()))?;
        Ok(Wallet::from_signing_key(signing_key))
    }

    fn from_signing_key(signing_key: SigningKey) -> Wallet {
        let verifying_key = VerifyingKey::from(&signing_key);
        // Untagged SEC1 point: drop the 0x04 prefix, keep X ‖ Y.
        let point = verifying_key.to_encoded_point(false);
        let public_key = point.as_bytes()[1..].to_vec();

        Wallet {
            secret_key: signing_key.to_bytes().to_vec(),
            public_key,
        }
    }

    pub fn signing_key(&self) -> Result<SigningKey> {
        SigningKey::from_slice(&self.secret_key).map_err(|e| NodeError::Crypto(e.to_string()))
    }

    /// The human-readable address:
    /// `Base58(version ‖ pub_key_hash ‖ checksum₄)`.
    pub fn address(&self) -> String {
        let pub_key_hash = hash_pub_key(&self.public_key);

        let mut payload = Vec::with_capacity(1 + PUB_KEY_HASH_LEN + ADDR_CHECKSUM_LEN);
        payload.push(VERSION_BYTE);
        payload.extend_from_slice(&pub_key_hash);
        let check = checksum(&payload);
        payload.extend_from_slice(&check);

        bs58::encode(payload).into_string()
    }
}

impl Default for Wallet {
    fn default() -> Self {
        Wallet::new()
    }
}

/// RIPEMD160(SHA-256(raw public key)); 20 bytes.
pub fn hash_pub_key(pub_key: &[u8]) -> Vec<u8> {
    let sha = sha256(pub_key);
    Ripemd160::digest(sha).to_vec()
}

/// First `ADDR_CHECKSUM_LEN` bytes of SHA-256(SHA-256(payload)).
fn checksum(payload: &[u8]) -> Vec<u8> {
    let second = sha256(&sha256(payload));
    second[..ADDR_CHECKSUM_LEN].to_vec()
}

/// Check that an address decodes to a well-formed, checksummed payload.
pub fn validate_address(address: &str) -> bool {
    pub_key_hash_from_address(address).is_ok()
}

/// Decode an address back to the 20-byte public-key hash it commits to.
pub fn pub_key_hash_from_address(address: &str) -> Result<Vec<u8>> {
    let payload = bs58::decode(address)
        .into_vec()
        .map_err(|_| NodeError::InvalidAddress(address.to_string()))?;

    if payload.len() != 1 + PUB_KEY_HASH_LEN + ADDR_CHECKSUM_LEN {
        return Err(NodeError::InvalidAddress(address.to_string()));
    }
    if payload[0] != VERSION_BYTE {
        return Err(NodeError::InvalidAddress(address.to_string()));
    }

    let (versioned, actual_checksum) = payload.split_at(payload.len() - ADDR_CHECKSUM_LEN);
    if checksum(versioned) != actual_checksum {
        return Err(NodeError::InvalidAddress(address.to_string()));
    }

    Ok(versioned[1..].to_vec())
}

/// The wallet collection persisted to `wallet_<node_id>.dat`.
///
/// One file per node, never shared between nodes.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Wallets {
    wallets: HashMap<String, Wallet>,
    #[serde(skip)]
    path: PathBuf,
}

impl Wallets {
    pub fn wallet_file(node_id: &str) -> PathBuf {
        PathBuf::from(format!("wallet_{}.dat", node_id))
    }

    /// Load the node's wallet file, or start an empty collection if the
    /// file does not exist yet.
    pub fn load(node_id: &str) -> Result<Wallets> {
        Wallets::load_from(Wallets::wallet_file(node_id))
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Wallets> {
        let path = path.as_ref().to_path_buf();
        let mut wallets = if path.exists() {
            let content = fs::read(&path)?;
            bincode::deserialize::<Wallets>(&content)?
        } else {
            Wallets::default()
        };
        wallets.path = path;
        Ok(wallets)
    }

    /// Generate a key pair, add it to the collection, persist, and return
    /// its address.
    pub fn create_wallet(&mut self) -> Result<String> {
        let wallet = Wallet::new();
        let address = wallet.address();
        self.wallets.insert(address.clone(), wallet);
        self.save()?;
        Ok(address)
    }

    pub fn addresses(&self) -> Vec<String> {
        self.wallets.keys().cloned().collect()
    }

    pub fn get_wallet(&self, address: &str) -> Option<&Wallet> {
        self.wallets.get(address)
    }

    pub fn save(&self) -> Result<()> {
        let content = bincode::serialize(self)?;
        fs::write(&self.path, content)?;
        Ok(())
    }
}
