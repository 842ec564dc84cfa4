//! Proof-of-work search and verification
//!
//! The difficulty is a fixed constant: a block hash is valid when, read as
//! a 256-bit big-endian integer, it is below `1 << (256 - TARGET_BITS)`.
//! There is no retargeting.

use crate::block::Block;
use crate::constants::{MAX_NONCE, TARGET_BITS};
use crate::error::{NodeError, Result};
use crate::types::{sha256, Hash};

/// Proof-of-work context for one block: the fixed target plus the header
/// bytes that do not vary with the nonce.
pub struct ProofOfWork<'a> {
    block: &'a Block,
    target: U256,
}

impl<'a> ProofOfWork<'a> {
    pub fn new(block: &'a Block) -> ProofOfWork<'a> {
        let target = U256::one().shl((256 - TARGET_BITS) as u32);
        ProofOfWork { block, target }
    }

    /// Header bytes hashed during the search:
    /// `prev_hash ‖ merkle_root ‖ BE(timestamp) ‖ BE(target_bits) ‖ BE(nonce)`.
    fn prepare_data(&self, nonce: u64) -> Result<Vec<u8>> {
        let mut data = self.prefix()?;
        data.extend_from_slice(&nonce.to_be_bytes());
        Ok(data)
    }

    // Everything but the trailing nonce, so the search loop only rewrites
    // eight bytes per attempt.
    fn prefix(&self) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(32 + 32 + 8 + 8 + 8);
        data.extend_from_slice(&self.block.prev_block_hash);
        data.extend_from_slice(&self.block.hash_transactions()?);
        data.extend_from_slice(&self.block.timestamp.to_be_bytes());
        data.extend_from_slice(&TARGET_BITS.to_be_bytes());
        Ok(data)
    }

    /// Scan nonces from zero until the header hash falls below the target.
    ///
    /// Returns the winning nonce and hash. Exhausting the nonce space is a
    /// hard failure; at 24 bits of difficulty it is unreachable in practice.
    pub fn run(&self) -> Result<(u64, Hash)> {
        let prefix = self.prefix()?;
        let mut data = prefix.clone();
        data.extend_from_slice(&0u64.to_be_bytes());
        let nonce_offset = prefix.len();

        for nonce in 0..=MAX_NONCE {
            data[nonce_offset..].copy_from_slice(&nonce.to_be_bytes());
            let hash = sha256(&data);

            if U256::from_be_bytes(&hash) < self.target {
                return Ok((nonce, hash));
            }
        }

        Err(NodeError::ProofOfWork(
            "nonce space exhausted".to_string(),
        ))
    }

    /// Re-run the hash with the block's stored nonce and check the target.
    pub fn validate(&self) -> Result<bool> {
        let data = self.prepare_data(self.block.nonce)?;
        let hash = sha256(&data);
        Ok(U256::from_be_bytes(&hash) < self.target)
    }
}

/// 256-bit unsigned integer, wide enough to compare hashes against the
/// difficulty target. Words are stored least-significant first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct U256([u64; 4]);

impl U256 {
    fn one() -> Self {
        U256([1, 0, 0, 0])
    }

    fn shl(&self, shift: u32) -> Self {
        if shift >= 256 {
            return U256([0; 4]);
        }

        let mut result = U256([0; 4]);
        let word_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;

        for i in 0..4 {
            if i + word_shift < 4 {
                result.0[i + word_shift] |= self.0[i] << bit_shift;
                if bit_shift > 0 && i + word_shift + 1 < 4 {
                    result.0[i + word_shift + 1] |= self.0[i] >> (64 - bit_shift);
                }
            }
        }

        result
    }

    /// Interpret 32 bytes as a big-endian 256-bit integer.
    fn from_be_bytes(bytes: &[u8; 32]) -> Self {
        let mut words = [0u64; 4];
        for (i, word) in words.iter_mut().enumerate() {
            let start = (3 - i) * 8;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[start..start + 8]);
            *word = u64::from_be_bytes(buf);
        }
        U256(words)
    }
}

impl PartialOrd for U256 {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for U256 {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        for (a, b) in self.0.iter().rev().zip(other.0.iter().rev()) {
            match a.cmp(b) {
                std::cmp::Ordering::Equal => continue,
                ordering => return ordering,
            }
        }
        std::cmp::Ordering::Equal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::GENESIS_COINBASE_DATA;
    use crate::transaction::Transaction;
    use crate::types::ZERO_HASH;
    use crate::wallet::Wallet;

    fn test_block() -> Block {
        let wallet = Wallet::from_seed([7u8; 32]).unwrap();
        let coinbase =
            Transaction::new_coinbase(&wallet.address(), Some(GENESIS_COINBASE_DATA.to_string()))
                .unwrap();
        Block::new(vec![coinbase], ZERO_HASH, 0).unwrap()
    }

    #[test]
    fn test_mined_block_hash_below_target() {
        let block = test_block();
        let pow = ProofOfWork::new(&block);
        let target = U256::one().shl((256 - TARGET_BITS) as u32);
        assert!(U256::from_be_bytes(&block.hash) < target);
        assert!(pow.validate().unwrap());
    }

    #[test]
    fn test_mined_block_has_leading_zero_bits() {
        let block = test_block();
        // 24 leading zero bits means the first three bytes are zero.
        assert_eq!(&block.hash[..3], &[0u8; 3]);
    }

    #[test]
    fn test_validate_rejects_perturbed_nonce() {
        let mut block = test_block();
        block.nonce = block.nonce.wrapping_add(1);
        let pow = ProofOfWork::new(&block);
        assert!(!pow.validate().unwrap());
    }

    #[test]
    fn test_validate_rejects_perturbed_timestamp() {
        let mut block = test_block();
        block.timestamp += 1;
        let pow = ProofOfWork::new(&block);
        assert!(!pow.validate().unwrap());
    }

    #[test]
    fn test_validate_rejects_perturbed_prev_hash() {
        let mut block = test_block();
        block.prev_block_hash[0] ^= 0x01;
        let pow = ProofOfWork::new(&block);
        assert!(!pow.validate().unwrap());
    }

    #[test]
    fn test_u256_ordering() {
        let small = U256([5, 0, 0, 0]);
        let large = U256([0, 0, 0, 5]);
        assert!(small < large);
        assert_eq!(small.cmp(&small), std::cmp::Ordering::Equal);
    }

    #[test]
    fn test_u256_shl_moves_across_words() {
        let one = U256::one();
        assert_eq!(one.shl(64), U256([0, 1, 0, 0]));
        assert_eq!(one.shl(232), U256([0, 0, 0, 1u64 << 40]));
        assert_eq!(one.shl(256), U256([0; 4]));
    }

    #[test]
    fn test_u256_from_be_bytes_round_order() {
        let mut bytes = [0u8; 32];
        bytes[31] = 1; // least significant byte
        assert_eq!(U256::from_be_bytes(&bytes), U256::one());

        bytes[31] = 0;
        bytes[0] = 1; // most significant byte
        assert_eq!(U256::from_be_bytes(&bytes), U256([0, 0, 0, 1u64 << 56]));
    }

    #[test]
    fn test_target_has_expected_magnitude() {
        // 1 << 232: word 3 carries bit 40.
        let target = U256::one().shl((256 - TARGET_BITS) as u32);
        assert_eq!(target, U256([0, 0, 0, 1u64 << 40]));
    }
}
