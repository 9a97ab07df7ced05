// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 GridMesh Systems

//! Provisioned access list: per-device PSKs and optional pinned short
//! addresses

use gm_common::config::AccessMode;
use gm_common::constants::MAX_ACCESS_ENTRIES;
use gm_common::{Error, ExtendedAddress, Result, ShortAddress};
use gm_crypto::Aes128Key;
use heapless::Vec;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// One provisioned device
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AccessEntry {
    /// Device EUI-64
    #[zeroize(skip)]
    pub ext_addr: ExtendedAddress,
    /// Pre-shared key for this device
    pub psk: Aes128Key,
    /// Short address to pin instead of allocating one, if set
    #[zeroize(skip)]
    pub short_addr: Option<ShortAddress>,
}

/// Outcome of an admission access check
#[derive(Clone)]
pub enum AccessDecision {
    /// Refuse the device outright
    Deny,
    /// Admit with this key material
    Allow {
        /// PSK to authenticate against
        psk: Aes128Key,
        /// Pinned short address, if provisioned
        short_addr: Option<ShortAddress>,
    },
    /// Not provisioned; the PSK must come from the operator
    Unknown,
}

/// Fixed-capacity access table
#[derive(Default)]
pub struct AccessTable {
    entries: Vec<AccessEntry, MAX_ACCESS_ENTRIES>,
}

impl AccessTable {
    /// Empty table
    #[must_use]
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Number of provisioned devices
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Provision a device, replacing any existing entry for it
    ///
    /// # Errors
    ///
    /// Returns `Error::TableFull` when no slot is free.
    pub fn provision(&mut self, entry: AccessEntry) -> Result<()> {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|e| e.ext_addr == entry.ext_addr)
        {
            *existing = entry;
            return Ok(());
        }
        self.entries.push(entry).map_err(|_| Error::TableFull)
    }

    /// Remove a provisioned device
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the device was not provisioned.
    pub fn revoke(&mut self, ext_addr: &ExtendedAddress) -> Result<()> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.ext_addr == *ext_addr)
            .ok_or(Error::NotFound)?;
        self.entries.swap_remove(idx);
        Ok(())
    }

    /// Decide whether `ext_addr` may join, under the given mode
    ///
    /// Allow-list mode: only provisioned devices may join, each with its
    /// own PSK. Deny-list mode: listed devices are refused; unknown
    /// devices are deferred to the operator.
    #[must_use]
    pub fn check(&self, mode: AccessMode, ext_addr: &ExtendedAddress) -> AccessDecision {
        let entry = self.entries.iter().find(|e| e.ext_addr == *ext_addr);
        match (mode, entry) {
            (AccessMode::AllowList, Some(entry)) => AccessDecision::Allow {
                psk: entry.psk.clone(),
                short_addr: entry.short_addr,
            },
            (AccessMode::AllowList, None) => AccessDecision::Deny,
            (AccessMode::DenyList, Some(_)) => AccessDecision::Deny,
            (AccessMode::DenyList, None) => AccessDecision::Unknown,
        }
    }
}
