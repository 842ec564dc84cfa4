//! Merkle commitment over an ordered sequence of byte strings

use crate::error::{NodeError, Result};
use crate::types::{sha256, Hash};

/// Compute the Merkle root of an ordered sequence of byte strings.
///
/// Leaves are `SHA-256(dᵢ)`. Each level is combined pairwise as
/// `SHA-256(left ‖ right)`; a level of odd length duplicates its last
/// element first, so a lone leaf hashes against itself. The root is
/// deterministic for a given input sequence and sensitive to its order.
pub fn merkle_root<T: AsRef<[u8]>>(data: &[T]) -> Result<Hash> {
    if data.is_empty() {
        return Err(NodeError::InvalidTransaction(
            "cannot commit to an empty transaction list".to_string(),
        ));
    }

    let mut level: Vec<Hash> = data.iter().map(|d| sha256(d.as_ref())).collect();

    while level.len() > 1 {
        if level.len() % 2 != 0 {
            let last = *level.last().expect("level is non-empty");
            level.push(last);
        }

        let mut next_level = Vec::with_capacity(level.len() / 2);
        for pair in level.chunks(2) {
            let mut combined = Vec::with_capacity(64);
            combined.extend_from_slice(&pair[0]);
            combined.extend_from_slice(&pair[1]);
            next_level.push(sha256(&combined));
        }
        level = next_level;
    }

    Ok(level[0])
}
