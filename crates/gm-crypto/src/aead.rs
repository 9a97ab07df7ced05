// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 GridMesh Systems

//! EAX-AES128 authenticated encryption
//!
//! The EAP-PSK Protected Channel is EAX keyed with the per-session TEK.
//! The wire carries a 4-byte counter; the full EAX nonce is that counter
//! placed in the low bytes of a 16-byte zero block.
//!
//! **CRITICAL**: a counter value must be used at most once per TEK. The
//! protocol layer enforces monotonic counters; this module only performs
//! the primitive operation.

use aes::Aes128;
use eax::aead::generic_array::GenericArray;
use eax::aead::{AeadInPlace, KeyInit};
use eax::Eax;

use crate::block::Aes128Key;
use crate::error::CryptoError;

type EaxImpl = Eax<Aes128>;

/// EAX nonce (16 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EaxNonce([u8; 16]);

impl EaxNonce {
    /// Build a nonce from a wire counter: zero upper bytes, 32-bit
    /// big-endian counter in the low bytes
    #[must_use]
    pub const fn from_counter(counter: u32) -> Self {
        let c = counter.to_be_bytes();
        let mut bytes = [0u8; 16];
        bytes[12] = c[0];
        bytes[13] = c[1];
        bytes[14] = c[2];
        bytes[15] = c[3];
        Self(bytes)
    }

    /// Raw nonce bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

/// EAX-AES128 AEAD
pub struct Eax128;

impl Eax128 {
    /// Key size in bytes
    pub const KEY_SIZE: usize = 16;
    /// Nonce size in bytes
    pub const NONCE_SIZE: usize = 16;
    /// Authentication tag size in bytes
    pub const TAG_SIZE: usize = 16;

    /// Encrypt `plaintext` with associated data
    ///
    /// Writes ciphertext followed by the 16-byte tag into `output` and
    /// returns the total length.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::BufferTooSmall` if `output` cannot hold
    /// `plaintext.len() + TAG_SIZE` bytes.
    pub fn encrypt(
        key: &Aes128Key,
        nonce: &EaxNonce,
        plaintext: &[u8],
        aad: &[u8],
        output: &mut [u8],
    ) -> Result<usize, CryptoError> {
        let required = plaintext.len() + Self::TAG_SIZE;
        if output.len() < required {
            return Err(CryptoError::BufferTooSmall);
        }

        output[..plaintext.len()].copy_from_slice(plaintext);

        let cipher = EaxImpl::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::InvalidKey)?;
        let tag = cipher
            .encrypt_in_place_detached(
                GenericArray::from_slice(&nonce.0),
                aad,
                &mut output[..plaintext.len()],
            )
            .map_err(|_| CryptoError::InternalError)?;

        output[plaintext.len()..required].copy_from_slice(&tag);
        Ok(required)
    }

    /// Decrypt `ciphertext` (ciphertext ‖ tag) with associated data
    ///
    /// Writes the plaintext into `output` and returns its length. Fails
    /// closed: on any authentication failure `output` contents are
    /// unspecified and must not be used.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::AuthenticationFailed` on tag mismatch and
    /// `CryptoError::BufferTooSmall` if buffers do not line up.
    pub fn decrypt(
        key: &Aes128Key,
        nonce: &EaxNonce,
        ciphertext: &[u8],
        aad: &[u8],
        output: &mut [u8],
    ) -> Result<usize, CryptoError> {
        if ciphertext.len() < Self::TAG_SIZE {
            return Err(CryptoError::AuthenticationFailed);
        }
        let ct_len = ciphertext.len() - Self::TAG_SIZE;
        if output.len() < ct_len {
            return Err(CryptoError::BufferTooSmall);
        }

        output[..ct_len].copy_from_slice(&ciphertext[..ct_len]);

        let cipher = EaxImpl::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::InvalidKey)?;
        cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(&nonce.0),
                aad,
                &mut output[..ct_len],
                GenericArray::from_slice(&ciphertext[ct_len..]),
            )
            .map_err(|_| CryptoError::AuthenticationFailed)?;

        Ok(ct_len)
    }
}
