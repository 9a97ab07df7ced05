// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 GridMesh Systems

//! EAP-PSK key schedule (RFC 4764 §3.2)
//!
//! From the long-term PSK the protocol derives a static pair (AK, KDK); from
//! the KDK and the peer's RAND_P it derives the per-session TEK that keys
//! the Protected Channel. All derivations are single-block AES-128
//! encryptions of constant seeds in the modified counter mode of RFC 4764.
//!
//! # Key hierarchy
//!
//! ```text
//! PSK ──┬── AK   (authenticates messages 2 and 3 via CMAC)
//!       └── KDK ──── TEK(RAND_P)   (keys the EAX Protected Channel)
//! ```

use gm_crypto::block::{encrypt_block, Aes128Key};
use gm_crypto::mac::Cmac128;
use gm_crypto::CryptoError;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Authentication Key, derived from the PSK
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Ak(Aes128Key);

impl Ak {
    /// Access the underlying AES key
    #[must_use]
    pub fn key(&self) -> &Aes128Key {
        &self.0
    }
}

/// Key-Derivation Key, derived from the PSK
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Kdk(Aes128Key);

impl Kdk {
    /// Access the underlying AES key
    #[must_use]
    pub fn key(&self) -> &Aes128Key {
        &self.0
    }
}

/// Transient Encryption Key, derived per session from KDK and RAND_P
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Tek(Aes128Key);

impl Tek {
    /// Access the underlying AES key
    #[must_use]
    pub fn key(&self) -> &Aes128Key {
        &self.0
    }
}

/// XOR a counter byte onto the last byte of a derivation block
fn with_counter(block: &[u8; 16], counter: u8) -> [u8; 16] {
    let mut out = *block;
    out[15] ^= counter;
    out
}

/// Derive (AK, KDK) from the PSK
///
/// RFC 4764 §3.2: `v = AES(PSK, 0^16)`, `AK = AES(PSK, v ^ 1)`,
/// `KDK = AES(PSK, v ^ 2)` with the counter in the low byte.
#[must_use]
pub fn derive_ak_kdk(psk: &Aes128Key) -> (Ak, Kdk) {
    let seed = encrypt_block(psk, &[0u8; 16]);
    let ak = encrypt_block(psk, &with_counter(&seed, 1));
    let kdk = encrypt_block(psk, &with_counter(&seed, 2));
    (Ak(Aes128Key::new(ak)), Kdk(Aes128Key::new(kdk)))
}

/// Derive the session TEK from the KDK and the peer's RAND_P
///
/// RFC 4764 §3.2: `v = AES(KDK, RAND_P)`, `TEK = AES(KDK, v ^ 1)`.
#[must_use]
pub fn derive_tek(kdk: &Kdk, rand_p: &[u8; 16]) -> Tek {
    let seed = encrypt_block(kdk.key(), rand_p);
    let tek = encrypt_block(kdk.key(), &with_counter(&seed, 1));
    Tek(Aes128Key::new(tek))
}

/// Compute MAC_P = CMAC(AK, IdP ‖ IdS ‖ RandS ‖ RandP)
///
/// # Errors
///
/// Propagates `CryptoError` from the MAC primitive (cannot occur with a
/// well-formed AK).
pub fn compute_mac_p(
    ak: &Ak,
    id_p: &[u8],
    id_s: &[u8],
    rand_s: &[u8; 16],
    rand_p: &[u8; 16],
) -> Result<[u8; 16], CryptoError> {
    Cmac128::tag(ak.key(), &[id_p, id_s, rand_s, rand_p])
}

/// Compute MAC_S = CMAC(AK, IdS ‖ RandP)
///
/// # Errors
///
/// Propagates `CryptoError` from the MAC primitive.
pub fn compute_mac_s(ak: &Ak, id_s: &[u8], rand_p: &[u8; 16]) -> Result<[u8; 16], CryptoError> {
    Cmac128::tag(ak.key(), &[id_s, rand_p])
}
