// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 GridMesh Systems

//! Symmetric cryptography for GridMesh PLM
//!
//! Thin, typed wrappers over the RustCrypto implementations of the three
//! primitives the bootstrap protocol needs:
//!
//! - **AES-128** single-block encryption (key derivation seeds)
//! - **CMAC-AES128** (EAP-PSK message authentication)
//! - **EAX-AES128** (the Protected Channel of messages 3 and 4)
//!
//! # Security
//!
//! - Keys are wrapped in types that zeroize on drop
//! - Tag comparison is constant time (handled inside the RustCrypto crates)
//! - Decryption fails closed; no partial plaintext is ever exposed

#![no_std]
#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

#[cfg(feature = "std")]
extern crate std;

pub mod aead;
pub mod block;
pub mod error;
pub mod mac;
pub mod traits;

pub use aead::{Eax128, EaxNonce};
pub use block::Aes128Key;
pub use error::CryptoError;
pub use mac::Cmac128;
pub use traits::{constant_time_eq, CryptoRng};
