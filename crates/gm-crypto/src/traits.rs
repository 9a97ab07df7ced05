// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 GridMesh Systems

//! Crypto seam traits
//!
//! The RNG is the only primitive the platform must supply; everything else
//! in this crate is pure computation.

use crate::error::CryptoError;

/// Cryptographically secure random number generator
pub trait CryptoRng {
    /// Fill `dest` with random bytes
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::RngFailure` if the underlying source fails.
    fn fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), CryptoError>;

    /// Generate a random u32
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::RngFailure` if the underlying source fails.
    fn next_u32(&mut self) -> Result<u32, CryptoError> {
        let mut buf = [0u8; 4];
        self.fill_bytes(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
}

/// Constant-time comparison of two byte slices
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    use subtle::ConstantTimeEq;
    a.ct_eq(b).into()
}
