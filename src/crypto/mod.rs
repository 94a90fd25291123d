//! Cryptographic primitives
//!
//! - SHA-256 and double SHA-256 hashing
//! - Merkle roots over transaction ids

pub mod hash;
pub mod merkle;

pub use hash::{double_sha256, sha256, Hash256, HashParseError};
pub use merkle::calculate_merkle_root;
