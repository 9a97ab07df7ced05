// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 GridMesh Systems

//! Crypto-layer error type
//!
//! Kept separate from `gm_common::Error` so this crate has no opinion about
//! protocol semantics; callers map these onto the system error taxonomy.

use core::fmt;

/// Errors produced by the primitive wrappers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// Key slice had the wrong length
    InvalidKey,
    /// Output buffer cannot hold the result
    BufferTooSmall,
    /// AEAD tag verification failed
    AuthenticationFailed,
    /// Random number generator failure
    RngFailure,
    /// Primitive reported an unexpected internal failure
    InternalError,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::InvalidKey => "invalid key",
            Self::BufferTooSmall => "buffer too small",
            Self::AuthenticationFailed => "authentication failed",
            Self::RngFailure => "RNG failure",
            Self::InternalError => "internal error",
        };
        write!(f, "{msg}")
    }
}

impl From<CryptoError> for gm_common::Error {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidKey => Self::InvalidKey,
            CryptoError::BufferTooSmall => Self::BufferTooSmall,
            CryptoError::AuthenticationFailed => Self::AeadAuthFailed,
            CryptoError::RngFailure => Self::RngFailure,
            CryptoError::InternalError => Self::CryptoFailure,
        }
    }
}
