// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 GridMesh Systems

//! Coordinator-side registry of devices on the PAN

use gm_common::constants::MAX_DEVICES;
use gm_common::time::{Millis, Ticks};
use gm_common::{Error, ExtendedAddress, MediaType, Result, ShortAddress};
use gm_crypto::Aes128Key;
use heapless::Vec;

/// Where a device stands in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Known but not currently on the network
    #[default]
    Disconnected,
    /// Admission handshake in progress
    Bootstrapping,
    /// Admitted and addressable
    Connected,
}

/// One registered device
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    /// EUI-64 of the device
    pub ext_addr: ExtendedAddress,
    /// Assigned short address, meaningful once connected
    pub short_addr: ShortAddress,
    /// Lifecycle state
    pub state: ConnectionState,
    /// Medium the device was last heard on
    pub media: MediaType,
    /// Last time traffic from the device was observed
    pub last_seen: Ticks,
    /// PSK the device authenticated with, reused for rekeying exchanges
    pub psk: Option<Aes128Key>,
}

/// Fixed-capacity device registry keyed by extended address
#[derive(Debug, Default)]
pub struct DeviceTable {
    entries: Vec<DeviceRecord, MAX_DEVICES>,
}

impl DeviceTable {
    /// Empty table
    #[must_use]
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Number of registered devices
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a device by extended address
    #[must_use]
    pub fn get(&self, ext_addr: &ExtendedAddress) -> Option<&DeviceRecord> {
        self.entries.iter().find(|d| d.ext_addr == *ext_addr)
    }

    /// Look up a device by its short address
    #[must_use]
    pub fn get_by_short(&self, short_addr: ShortAddress) -> Option<&DeviceRecord> {
        self.entries
            .iter()
            .find(|d| d.state == ConnectionState::Connected && d.short_addr == short_addr)
    }

    /// Whether a short address is already held by a connected device
    #[must_use]
    pub fn short_addr_in_use(&self, short_addr: ShortAddress) -> bool {
        self.get_by_short(short_addr).is_some()
    }

    /// Register a device entering the admission handshake, or refresh an
    /// existing entry back into the bootstrapping state
    ///
    /// # Errors
    ///
    /// Returns `Error::TableFull` when no slot is free for a new device.
    pub fn begin_bootstrap(
        &mut self,
        ext_addr: ExtendedAddress,
        media: MediaType,
        now: Ticks,
    ) -> Result<()> {
        if let Some(entry) = self.entries.iter_mut().find(|d| d.ext_addr == ext_addr) {
            entry.state = ConnectionState::Bootstrapping;
            entry.media = media;
            entry.last_seen = now;
            return Ok(());
        }
        self.entries
            .push(DeviceRecord {
                ext_addr,
                short_addr: ShortAddress::UNASSIGNED,
                state: ConnectionState::Bootstrapping,
                media,
                last_seen: now,
                psk: None,
            })
            .map_err(|_| Error::TableFull)
    }

    /// Mark a device as admitted with its assigned short address
    ///
    /// The PSK it authenticated with is kept on the record; a later
    /// rekeying exchange authenticates under the same key.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the device is not registered.
    pub fn promote(
        &mut self,
        ext_addr: &ExtendedAddress,
        short_addr: ShortAddress,
        psk: Aes128Key,
        now: Ticks,
    ) -> Result<()> {
        let entry = self
            .entries
            .iter_mut()
            .find(|d| d.ext_addr == *ext_addr)
            .ok_or(Error::NotFound)?;
        entry.state = ConnectionState::Connected;
        entry.short_addr = short_addr;
        entry.last_seen = now;
        entry.psk = Some(psk);
        Ok(())
    }

    /// Refresh liveness for a device that was just heard from
    pub fn heartbeat(&mut self, ext_addr: &ExtendedAddress, now: Ticks) {
        if let Some(entry) = self.entries.iter_mut().find(|d| d.ext_addr == *ext_addr) {
            entry.last_seen = now;
        }
    }

    /// Drop a device from the table entirely
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the device is not registered.
    pub fn remove(&mut self, ext_addr: &ExtendedAddress) -> Result<DeviceRecord> {
        let idx = self
            .entries
            .iter()
            .position(|d| d.ext_addr == *ext_addr)
            .ok_or(Error::NotFound)?;
        Ok(self.entries.swap_remove(idx))
    }

    /// Demote connected devices not heard from within `ttl` and return
    /// their addresses
    pub fn expire(&mut self, now: Ticks, ttl: Millis) -> Vec<ExtendedAddress, MAX_DEVICES> {
        let mut demoted = Vec::new();
        for entry in self.entries.iter_mut() {
            if entry.state == ConnectionState::Connected && entry.last_seen.has_elapsed(now, ttl) {
                entry.state = ConnectionState::Disconnected;
                // Same capacity as the source table, push cannot fail
                let _ = demoted.push(entry.ext_addr);
            }
        }
        demoted
    }

    /// Iterate all records
    pub fn iter(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.entries.iter()
    }

    /// Extended addresses of all connected devices
    #[must_use]
    pub fn connected(&self) -> Vec<ExtendedAddress, MAX_DEVICES> {
        let mut out = Vec::new();
        for entry in &self.entries {
            if entry.state == ConnectionState::Connected {
                // Same capacity as the source table, push cannot fail
                let _ = out.push(entry.ext_addr);
            }
        }
        out
    }
}
