//! Merkle root over transaction ids
//!
//! Pairs of hashes are concatenated and double-hashed level by level. An
//! odd hash at the end of a level is paired with itself.

use super::hash::{double_sha256, Hash256};

/// Calculate the merkle root of a list of hashes; zero for an empty list
pub fn calculate_merkle_root(hashes: &[Hash256]) -> Hash256 {
    if hashes.is_empty() {
        return Hash256::ZERO;
    }

    let mut level = hashes.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let right = pair.get(1).unwrap_or(&pair[0]);
                let mut data = [0u8; 64];
                data[..32].copy_from_slice(pair[0].as_bytes());
                data[32..].copy_from_slice(right.as_bytes());
                double_sha256(&data)
            })
            .collect();
    }

    level[0]
}
