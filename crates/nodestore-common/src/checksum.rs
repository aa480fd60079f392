//! Payload checksums
//!
//! Every object header carries the checksum of its payload so that a
//! decoded object can be verified before it is handed to a caller.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Checksum values computed for an object payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    /// CRC32C checksum (fast, for inline verification)
    pub crc32c: u32,
    /// SHA256 hash (binds the payload into the object identifier)
    pub sha256: [u8; 32],
}

impl Checksum {
    /// Compute checksum from data
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self {
            crc32c: crc32c::crc32c(data),
            sha256: Sha256::digest(data).into(),
        }
    }

    /// Verify data against this checksum (fast check using CRC32C)
    #[must_use]
    pub fn verify_fast(&self, data: &[u8]) -> bool {
        crc32c::crc32c(data) == self.crc32c
    }

    /// Verify data against this checksum (full check)
    #[must_use]
    pub fn verify_full(&self, data: &[u8]) -> bool {
        if !self.verify_fast(data) {
            return false;
        }
        let actual: [u8; 32] = Sha256::digest(data).into();
        actual == self.sha256
    }
}

impl Default for Checksum {
    fn default() -> Self {
        Self::compute(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_compute_and_verify() {
        let data = b"hello nodestore";
        let checksum = Checksum::compute(data);

        assert!(checksum.verify_fast(data));
        assert!(checksum.verify_full(data));
        assert!(!checksum.verify_full(b"hello nodestorE"));
    }

    #[test]
    fn test_checksum_detects_sha_mismatch() {
        let data = b"payload";
        let mut checksum = Checksum::compute(data);
        checksum.sha256[0] ^= 0xff;

        assert!(checksum.verify_fast(data));
        assert!(!checksum.verify_full(data));
    }
}
