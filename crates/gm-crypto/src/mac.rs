// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 GridMesh Systems

//! CMAC-AES128
//!
//! EAP-PSK authenticates messages 2 and 3 with CMAC over the ordered
//! concatenation of a handful of variable-length fields. The field list is
//! bounded (2-4 entries); exceeding it is a programming error at the call
//! site, not a runtime condition, so the API takes a slice of parts and
//! feeds them to the MAC in order.

use aes::Aes128;
use cmac::{Cmac, Mac};

use crate::block::Aes128Key;
use crate::error::CryptoError;
use crate::traits::constant_time_eq;

/// CMAC-AES128 tag computation
pub struct Cmac128;

impl Cmac128 {
    /// Tag size in bytes
    pub const TAG_SIZE: usize = 16;

    /// Compute the tag over the ordered concatenation of `parts`
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` if key setup fails (cannot happen
    /// with a well-formed `Aes128Key`).
    pub fn tag(key: &Aes128Key, parts: &[&[u8]]) -> Result<[u8; 16], CryptoError> {
        let mut mac =
            <Cmac<Aes128> as Mac>::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::InvalidKey)?;
        for part in parts {
            mac.update(part);
        }
        Ok(mac.finalize().into_bytes().into())
    }

    /// Verify a received tag in constant time
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::AuthenticationFailed` on mismatch.
    pub fn verify(key: &Aes128Key, parts: &[&[u8]], expected: &[u8; 16]) -> Result<(), CryptoError> {
        let tag = Self::tag(key, parts)?;
        if constant_time_eq(&tag, expected) {
            Ok(())
        } else {
            Err(CryptoError::AuthenticationFailed)
        }
    }
}
