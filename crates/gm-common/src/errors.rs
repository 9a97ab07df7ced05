// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 GridMesh Systems

//! Error types for GridMesh PLM
//!
//! One unified error enum shared by all crates. All errors are no_std
//! compatible and carry no heap state. Message-verification failures that
//! RFC 4764 mandates be silently discarded are flagged through
//! [`Error::is_silent_discard`] so dispatch code never turns them into
//! protocol responses by accident.

use core::fmt;

/// Result type alias for GridMesh PLM operations
pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for GridMesh PLM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Cryptographic errors (0x01xx)
    // =========================================================================
    /// Invalid key format or size
    InvalidKey,
    /// AEAD authentication failed (tag mismatch)
    AeadAuthFailed,
    /// MAC tag did not verify
    MacMismatch,
    /// Random number generator failure
    RngFailure,
    /// Key derivation failed
    KeyDerivationFailed,
    /// Unrecoverable primitive failure; escalates to a fatal application error
    CryptoFailure,

    // =========================================================================
    // Codec errors (0x02xx)
    // =========================================================================
    /// Message is truncated or structurally invalid
    MalformedMessage,
    /// Unknown envelope or message code
    UnknownMessageCode,
    /// Declared length does not match the buffer
    LengthMismatch,
    /// Unknown configuration-parameter attribute
    UnknownAttribute,

    // =========================================================================
    // Table errors (0x03xx)
    // =========================================================================
    /// Fixed-capacity table is full; no entry was created or disturbed
    TableFull,
    /// An entry for this address already exists
    DuplicateEntry,
    /// Requested entry not found
    NotFound,

    // =========================================================================
    // Protocol errors (0x04xx)
    // =========================================================================
    /// RFC-mandated silent discard: the offending message is dropped and the
    /// protocol entry stays in place
    ValidationFailed,
    /// Fatal mismatch for one device: a Decline is sent and its entry reset
    ProtocolMismatch,
    /// P-Channel nonce is zero or beyond the rollover bound
    NonceOutOfRange,
    /// Message arrived in a state that does not accept it
    UnexpectedMessage,
    /// Operation not valid in the current FSM state
    InvalidState,

    // =========================================================================
    // General errors (0xFFxx)
    // =========================================================================
    /// Buffer is too small for the operation
    BufferTooSmall,
    /// Invalid parameter provided
    InvalidParameter,
    /// Stage deadline elapsed
    Timeout,
    /// A kick or rekeying run is already in flight
    Busy,
    /// Internal error (should not occur)
    InternalError,
}

impl Error {
    /// Get the error code for this error
    ///
    /// Codes are grouped by subsystem:
    /// - 0x01xx: cryptographic errors
    /// - 0x02xx: codec errors
    /// - 0x03xx: table errors
    /// - 0x04xx: protocol errors
    /// - 0xFFxx: general errors
    #[must_use]
    pub const fn code(&self) -> u16 {
        match self {
            Self::InvalidKey => 0x0101,
            Self::AeadAuthFailed => 0x0102,
            Self::MacMismatch => 0x0103,
            Self::RngFailure => 0x0104,
            Self::KeyDerivationFailed => 0x0105,
            Self::CryptoFailure => 0x0106,

            Self::MalformedMessage => 0x0201,
            Self::UnknownMessageCode => 0x0202,
            Self::LengthMismatch => 0x0203,
            Self::UnknownAttribute => 0x0204,

            Self::TableFull => 0x0301,
            Self::DuplicateEntry => 0x0302,
            Self::NotFound => 0x0303,

            Self::ValidationFailed => 0x0401,
            Self::ProtocolMismatch => 0x0402,
            Self::NonceOutOfRange => 0x0403,
            Self::UnexpectedMessage => 0x0404,
            Self::InvalidState => 0x0405,

            Self::BufferTooSmall => 0xFF01,
            Self::InvalidParameter => 0xFF02,
            Self::Timeout => 0xFF03,
            Self::Busy => 0xFF04,
            Self::InternalError => 0xFFFF,
        }
    }

    /// Whether this failure class is handled by silently dropping the message
    ///
    /// Per RFC 4764, MAC and channel-authentication failures must not produce
    /// any response on the wire; the peer entry stays where it is.
    #[must_use]
    pub const fn is_silent_discard(&self) -> bool {
        matches!(
            self,
            Self::AeadAuthFailed
                | Self::MacMismatch
                | Self::ValidationFailed
                | Self::NonceOutOfRange
        )
    }

    /// Get a short description of the error
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::InvalidKey => "invalid key",
            Self::AeadAuthFailed => "AEAD authentication failed",
            Self::MacMismatch => "MAC mismatch",
            Self::RngFailure => "RNG failure",
            Self::KeyDerivationFailed => "key derivation failed",
            Self::CryptoFailure => "crypto primitive failure",
            Self::MalformedMessage => "malformed message",
            Self::UnknownMessageCode => "unknown message code",
            Self::LengthMismatch => "length mismatch",
            Self::UnknownAttribute => "unknown attribute",
            Self::TableFull => "table full",
            Self::DuplicateEntry => "duplicate entry",
            Self::NotFound => "not found",
            Self::ValidationFailed => "validation failed",
            Self::ProtocolMismatch => "protocol mismatch",
            Self::NonceOutOfRange => "nonce out of range",
            Self::UnexpectedMessage => "unexpected message",
            Self::InvalidState => "invalid state",
            Self::BufferTooSmall => "buffer too small",
            Self::InvalidParameter => "invalid parameter",
            Self::Timeout => "timeout",
            Self::Busy => "busy",
            Self::InternalError => "internal error",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[0x{:04X}] {}", self.code(), self.description())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Error {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "[0x{:04X}] {}", self.code(), self.description());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_grouped() {
        assert_eq!(Error::AeadAuthFailed.code() >> 8, 0x01);
        assert_eq!(Error::MalformedMessage.code() >> 8, 0x02);
        assert_eq!(Error::TableFull.code() >> 8, 0x03);
        assert_eq!(Error::ProtocolMismatch.code() >> 8, 0x04);
        assert_eq!(Error::Busy.code() >> 8, 0xFF);
    }

    #[test]
    fn silent_discard_classification() {
        assert!(Error::MacMismatch.is_silent_discard());
        assert!(Error::AeadAuthFailed.is_silent_discard());
        assert!(!Error::ProtocolMismatch.is_silent_discard());
        assert!(!Error::TableFull.is_silent_discard());
    }
}
