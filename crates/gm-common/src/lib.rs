// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 GridMesh Systems

//! GridMesh PLM Common Library
//!
//! Shared types, error definitions, configuration structures and utilities
//! used across the GridMesh powerline-mesh firmware crates.
//!
//! # Features
//!
//! - `std`: Enable standard library support (disabled by default for embedded)
//! - `defmt`: Enable defmt logging support for embedded debugging
//!
//! # Security
//!
//! No heap allocations are performed - all buffers use fixed-size arrays or
//! heapless collections. Key material never lives in this crate; see
//! `gm-crypto`.

#![no_std]
#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

#[cfg(feature = "std")]
extern crate std;

pub mod config;
pub mod constants;
pub mod errors;
pub mod log;
pub mod time;
pub mod types;

pub use errors::{Error, Result};
pub use time::{Millis, Ticks};
pub use types::{ExtendedAddress, MediaType, PanId, ShortAddress};
