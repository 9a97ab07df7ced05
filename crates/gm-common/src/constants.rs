// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 GridMesh Systems

//! System-wide constants for GridMesh PLM
//!
//! Sizes and limits are chosen for the embedded targets this firmware ships
//! on; all tables are fixed-capacity.

// =============================================================================
// Cryptographic constants
// =============================================================================

/// AES-128 key size in bytes (PSK, AK, KDK, TEK, GMK are all this size)
pub const AES128_KEY_SIZE: usize = 16;

/// AES block size in bytes
pub const AES_BLOCK_SIZE: usize = 16;

/// CMAC-AES128 tag size in bytes
pub const CMAC_TAG_SIZE: usize = 16;

/// EAX authentication tag size in bytes
pub const EAX_TAG_SIZE: usize = 16;

/// EAX nonce size in bytes (zero-padded counter)
pub const EAX_NONCE_SIZE: usize = 16;

/// RAND_S / RAND_P size in bytes
pub const RAND_SIZE: usize = 16;

// =============================================================================
// Protocol constants
// =============================================================================

/// EAP method type for EAP-PSK (RFC 4764)
pub const EAP_TYPE_PSK: u8 = 0x2F;

/// Wire size of the P-Channel nonce field in bytes
pub const PCHANNEL_NONCE_SIZE: usize = 4;

/// Exclusive upper bound on accepted P-Channel nonces.
///
/// The wire field is 4 bytes wide, but each re-authentication consumes one
/// nonce and the bound caps a device at 255 rekeys over its connected
/// lifetime; past that the device must rejoin from scratch.
pub const PCHANNEL_NONCE_BOUND: u32 = 0xFF;

/// Maximum EAP identity length (IdS / IdP) in bytes
pub const MAX_ID_LEN: usize = 36;

/// Maximum serialized EAP message size in bytes
pub const MAX_EAP_MSG: usize = 160;

/// Maximum P-Channel plaintext size in bytes
pub const MAX_PCHANNEL_PLAINTEXT: usize = 64;

/// Maximum serialized bootstrapping envelope size in bytes
pub const MAX_ENVELOPE_SIZE: usize = 176;

// =============================================================================
// Table capacities
// =============================================================================

/// Maximum concurrent join entries (in-progress handshakes)
pub const MAX_JOIN_ENTRIES: usize = 16;

/// Maximum admitted devices tracked by the coordinator
pub const MAX_DEVICES: usize = 64;

/// Maximum static access-policy entries
pub const MAX_ACCESS_ENTRIES: usize = 64;

/// Maximum PAN candidates collected during discovery
pub const MAX_PAN_CANDIDATES: usize = 16;
