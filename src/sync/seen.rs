//! Compact accumulator of identifiers observed during a full harvest

use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Append-only set of identifier digests
///
/// Each identifier is stored as the first 128 bits of its SHA-256 digest, so
/// memory use does not depend on identifier length.
#[derive(Debug, Default, Clone)]
pub struct SeenIdentifiers {
    digests: HashSet<u128>,
}

impl SeenIdentifiers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, identifier: &str) {
        self.digests.insert(digest(identifier));
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.digests.contains(&digest(identifier))
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }
}

fn digest(identifier: &str) -> u128 {
    let hash = Sha256::digest(identifier.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);
    u128::from_be_bytes(bytes)
}
