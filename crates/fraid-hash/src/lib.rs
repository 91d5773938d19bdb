#![forbid(unsafe_code)]
//! Seeded 128-bit block digests.
//!
//! Every data block in the array carries a 16-byte digest used to detect
//! silent corruption on later reads. Two algorithms are supported so an
//! array can migrate from one to the other: while a migration is pending,
//! indices flagged `rehash` still store digests computed with the previous
//! algorithm/seed pair, and the sync engine rewrites them with the current
//! pair on the next clean parity commit.
//!
//! The seed prevents an attacker (or a buggy dedup tool) from crafting
//! colliding blocks offline: digests from different arrays never compare.

use fraid_types::{BlockHash, HASH_SIZE};
use serde::{Deserialize, Serialize};

/// Digest algorithm identifier, persisted in the content file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashKind {
    /// BLAKE3 keyed hash, truncated to 16 bytes.
    Blake3,
    /// XXH3-128 with a numeric seed. Fast, non-cryptographic.
    Xxh3,
}

/// An algorithm plus its 16-byte seed.
///
/// The array state carries two of these: the current pair and the previous
/// pair (for the rehash flow).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashSpec {
    pub kind: HashKind,
    pub seed: [u8; HASH_SIZE],
}

impl HashSpec {
    #[must_use]
    pub fn new(kind: HashKind, seed: [u8; HASH_SIZE]) -> Self {
        Self { kind, seed }
    }

    /// Digest `data` under this algorithm/seed pair.
    #[must_use]
    pub fn digest(&self, data: &[u8]) -> BlockHash {
        match self.kind {
            HashKind::Blake3 => {
                // The keyed mode wants 32 bytes; stretch the 16-byte seed.
                let mut key = [0_u8; 32];
                key[..HASH_SIZE].copy_from_slice(&self.seed);
                key[HASH_SIZE..].copy_from_slice(&self.seed);
                let full = blake3::keyed_hash(&key, data);
                let mut out = [0_u8; HASH_SIZE];
                out.copy_from_slice(&full.as_bytes()[..HASH_SIZE]);
                BlockHash(out)
            }
            HashKind::Xxh3 => {
                let s = &self.seed;
                let seed = u64::from_le_bytes([s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7]]);
                let full = xxhash_rust::xxh3::xxh3_128_with_seed(data, seed);
                BlockHash(full.to_le_bytes())
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
