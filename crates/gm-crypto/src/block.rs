// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 GridMesh Systems

//! AES-128 block encryption
//!
//! The EAP-PSK key schedule (RFC 4764 §3.2) is built from single-block
//! AES-128 encryptions of constant seeds; this module provides exactly that
//! and nothing more.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::traits::CryptoRng;

/// AES-128 key (16 bytes), zeroized on drop
///
/// Used for every symmetric key in the system: PSK, AK, KDK, TEK and GMK
/// are all 128-bit AES keys.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Aes128Key([u8; 16]);

impl Aes128Key {
    /// Key size in bytes
    pub const SIZE: usize = 16;

    /// Create a key from bytes
    #[must_use]
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Create a key from a slice
    ///
    /// Returns `None` if the slice is not exactly 16 bytes.
    #[must_use]
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() != 16 {
            return None;
        }
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(slice);
        Some(Self(bytes))
    }

    /// Generate a random key
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::RngFailure` if the RNG fails.
    pub fn generate<R: CryptoRng>(rng: &mut R) -> Result<Self, CryptoError> {
        let mut bytes = [0u8; 16];
        rng.fill_bytes(&mut bytes)?;
        Ok(Self(bytes))
    }

    /// Get the raw key bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl AsRef<[u8]> for Aes128Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// Key material never reaches logs or panic messages
impl core::fmt::Debug for Aes128Key {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Aes128Key(..)")
    }
}

/// Encrypt one 16-byte block with AES-128
#[must_use]
pub fn encrypt_block(key: &Aes128Key, input: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
    let mut block = GenericArray::clone_from_slice(input);
    cipher.encrypt_block(&mut block);
    block.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_from_slice_length_check() {
        assert!(Aes128Key::from_slice(&[0u8; 15]).is_none());
        assert!(Aes128Key::from_slice(&[0u8; 16]).is_some());
    }

    #[test]
    fn fips197_vector() {
        // FIPS-197 appendix B
        let key = Aes128Key::new([
            0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf,
            0x4f, 0x3c,
        ]);
        let plaintext = [
            0x32, 0x43, 0xf6, 0xa8, 0x88, 0x5a, 0x30, 0x8d, 0x31, 0x31, 0x98, 0xa2, 0xe0, 0x37,
            0x07, 0x34,
        ];
        let expected = [
            0x39, 0x25, 0x84, 0x1d, 0x02, 0xdc, 0x09, 0xfb, 0xdc, 0x11, 0x85, 0x97, 0x19, 0x6a,
            0x0b, 0x32,
        ];
        assert_eq!(encrypt_block(&key, &plaintext), expected);
    }

    #[test]
    fn block_encryption_is_deterministic() {
        let key = Aes128Key::new([7u8; 16]);
        let input = [3u8; 16];
        assert_eq!(encrypt_block(&key, &input), encrypt_block(&key, &input));
    }
}
