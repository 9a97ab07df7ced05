// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 GridMesh Systems

//! GridMesh PLM bootstrap core
//!
//! Admission and group-key management for powerline-mesh networks: the
//! coordinator-side bootstrap server (EAP-PSK authentication, short-address
//! assignment, group-key rotation, kicks) and the device-side client
//! (discovery, candidate ordering, the responder half of the handshake,
//! warm restore).
//!
//! Both sides are single-threaded effects FSMs with no platform
//! dependencies beyond a tick source and an RNG; the MAC layer, timers and
//! persistence are driven through returned [`server::Effect`] /
//! [`client::Effect`] values.

#![no_std]
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod access;
pub mod client;
pub mod codec;
pub mod device_table;
pub mod join;
pub mod keys;
pub mod pansort;
pub mod rekey;
pub mod server;

pub use access::{AccessDecision, AccessEntry, AccessTable};
pub use client::{BootClient, ClientState, NoPersistence, PersistedAttributes, RestoredNetwork};
pub use codec::{ConfigParam, Envelope, EnvelopeCode};
pub use device_table::{ConnectionState, DeviceRecord, DeviceTable};
pub use pansort::{PanCandidate, PanSortConfig, SortDim, SortKey, SortOrder};
pub use rekey::{GmkSlotPair, RekeyError, RekeyPhase};
pub use server::{BootServer, ServerState};
