// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 GridMesh Systems

//! Group master key rotation
//!
//! The coordinator keeps two GMK slots: one active, one free for the key
//! being rolled out. Rotation runs strictly one device at a time:
//!
//! 1. install the new key in the free slot and snapshot the connected set
//! 2. deliver the key to every device through a re-authentication handshake
//! 3. tell every device to activate the new slot
//! 4. flip the local active index and wait for the platform to confirm
//!
//! Any failure rolls back: devices that already activated the new slot are
//! told, fire-and-forget and in reverse order, to return to the old one,
//! and the pending slot is discarded.

use gm_common::constants::MAX_DEVICES;
use gm_common::{Error, ExtendedAddress, Result};
use gm_crypto::Aes128Key;
use heapless::Vec;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Two-slot group key storage
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct GmkSlotPair {
    slots: [Option<Aes128Key>; 2],
    #[zeroize(skip)]
    active: u8,
    #[zeroize(skip)]
    pending: Option<u8>,
}

impl GmkSlotPair {
    /// Storage with the initial network key in slot 0
    #[must_use]
    pub fn new(initial: Aes128Key) -> Self {
        Self {
            slots: [Some(initial), None],
            active: 0,
            pending: None,
        }
    }

    /// Index of the active slot
    #[must_use]
    pub const fn active_index(&self) -> u8 {
        self.active
    }

    /// Index of the pending slot, while a rotation is in flight
    #[must_use]
    pub const fn pending_index(&self) -> Option<u8> {
        self.pending
    }

    /// The active key
    ///
    /// # Errors
    ///
    /// Returns `Error::InternalError` if the active slot is somehow empty.
    pub fn active_key(&self) -> Result<&Aes128Key> {
        self.slots[self.active as usize]
            .as_ref()
            .ok_or(Error::InternalError)
    }

    /// The staged key, while a rotation is in flight
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` with no staged rotation.
    pub fn pending_key(&self) -> Result<&Aes128Key> {
        let index = self.pending.ok_or(Error::InvalidState)?;
        self.slots[index as usize]
            .as_ref()
            .ok_or(Error::InternalError)
    }

    /// Write `key` into the non-active slot and mark it pending
    ///
    /// # Errors
    ///
    /// Returns `Error::Busy` if a rotation is already staged.
    pub fn install_pending(&mut self, key: Aes128Key) -> Result<u8> {
        if self.pending.is_some() {
            return Err(Error::Busy);
        }
        let index = self.active ^ 1;
        self.slots[index as usize] = Some(key);
        self.pending = Some(index);
        Ok(index)
    }

    /// Make the pending slot active
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` with no staged rotation.
    pub fn commit_pending(&mut self) -> Result<()> {
        let index = self.pending.take().ok_or(Error::InvalidState)?;
        let old = self.active;
        self.active = index;
        if let Some(key) = self.slots[old as usize].as_mut() {
            key.zeroize();
        }
        self.slots[old as usize] = None;
        Ok(())
    }

    /// Discard the pending slot, keeping the active key in place
    pub fn revert_pending(&mut self) {
        if let Some(index) = self.pending.take() {
            if let Some(key) = self.slots[index as usize].as_mut() {
                key.zeroize();
            }
            self.slots[index as usize] = None;
        }
    }
}

/// Why a rotation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RekeyError {
    /// Completed successfully
    #[default]
    None,
    /// A device failed or timed out answering the first message
    SecondMessage,
    /// A device failed or timed out answering the third message
    FourthMessage,
    /// A device rejected a configuration parameter
    Param,
    /// Sequencing violation inside the rotation itself
    Procedure,
    /// The handshake table could not take the re-authentication entry
    TableFull,
    /// The platform rejected the local index flip
    SetAttribute,
    /// Aborted by the operator
    Abort,
}

/// Phase of an in-flight rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RekeyPhase {
    /// No rotation running
    #[default]
    Idle,
    /// Delivering the pending key device by device
    SendGmk,
    /// Activating the pending slot device by device
    ActivateGmk,
    /// Rolling back activations after a failure
    DeactivateGmk,
    /// Local index flipped, waiting for the platform confirm
    WaitIndexConfirm,
}

/// Sequencer for one rotation over a snapshot of the connected set
#[derive(Default)]
pub struct Rekeyer {
    phase: RekeyPhase,
    devices: Vec<ExtendedAddress, MAX_DEVICES>,
    cursor: usize,
    activated: usize,
    new_index: u8,
    error: RekeyError,
}

/// What the coordinator should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RekeyStep {
    /// Run a key-delivery handshake with this device
    Deliver(ExtendedAddress),
    /// Send an activation parameter to this device
    Activate(ExtendedAddress),
    /// Flip the local active index to the pending slot
    CommitIndex(u8),
}

impl Rekeyer {
    /// Idle sequencer
    #[must_use]
    pub const fn new() -> Self {
        Self {
            phase: RekeyPhase::Idle,
            devices: Vec::new(),
            cursor: 0,
            activated: 0,
            new_index: 0,
            error: RekeyError::None,
        }
    }

    /// Current phase
    #[must_use]
    pub const fn phase(&self) -> RekeyPhase {
        self.phase
    }

    /// Whether a rotation is in flight
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.phase != RekeyPhase::Idle
    }

    /// Result of the last rotation
    #[must_use]
    pub const fn last_error(&self) -> RekeyError {
        self.error
    }

    /// Pending slot index being rolled out
    #[must_use]
    pub const fn new_index(&self) -> u8 {
        self.new_index
    }

    /// Device the sequencer is currently waiting on
    #[must_use]
    pub fn current_device(&self) -> Option<ExtendedAddress> {
        match self.phase {
            RekeyPhase::SendGmk | RekeyPhase::ActivateGmk => {
                self.devices.get(self.cursor).copied()
            }
            _ => None,
        }
    }

    /// Begin a rotation over `devices`
    ///
    /// An empty snapshot short-circuits straight to the index flip.
    ///
    /// # Errors
    ///
    /// Returns `Error::Busy` if a rotation is already running.
    pub fn start(
        &mut self,
        devices: Vec<ExtendedAddress, MAX_DEVICES>,
        new_index: u8,
    ) -> Result<RekeyStep> {
        if self.is_active() {
            return Err(Error::Busy);
        }
        self.devices = devices;
        self.cursor = 0;
        self.activated = 0;
        self.new_index = new_index;
        self.error = RekeyError::None;

        match self.devices.first() {
            Some(first) => {
                self.phase = RekeyPhase::SendGmk;
                Ok(RekeyStep::Deliver(*first))
            }
            None => {
                self.phase = RekeyPhase::WaitIndexConfirm;
                Ok(RekeyStep::CommitIndex(new_index))
            }
        }
    }

    /// Record success for the current device and return the next step
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` outside the per-device phases.
    pub fn device_done(&mut self) -> Result<RekeyStep> {
        match self.phase {
            RekeyPhase::SendGmk => {
                self.cursor += 1;
                match self.devices.get(self.cursor) {
                    Some(next) => Ok(RekeyStep::Deliver(*next)),
                    None => {
                        self.phase = RekeyPhase::ActivateGmk;
                        self.cursor = 0;
                        // Snapshot is non-empty or start() would have skipped here
                        let first = self.devices.first().ok_or(Error::InternalError)?;
                        Ok(RekeyStep::Activate(*first))
                    }
                }
            }
            RekeyPhase::ActivateGmk => {
                self.activated += 1;
                self.cursor += 1;
                match self.devices.get(self.cursor) {
                    Some(next) => Ok(RekeyStep::Activate(*next)),
                    None => {
                        self.phase = RekeyPhase::WaitIndexConfirm;
                        Ok(RekeyStep::CommitIndex(self.new_index))
                    }
                }
            }
            _ => Err(Error::InvalidState),
        }
    }

    /// Abort the rotation, returning the devices to roll back
    ///
    /// The list holds devices that already activated the new slot, newest
    /// first. The caller sends each a deactivation for the old index,
    /// fire-and-forget, then discards the pending slot.
    pub fn fail(&mut self, error: RekeyError) -> Vec<ExtendedAddress, MAX_DEVICES> {
        let mut rollback = Vec::new();
        for ext in self.devices[..self.activated].iter().rev() {
            // Rollback list shares the snapshot capacity
            let _ = rollback.push(*ext);
        }
        self.phase = if rollback.is_empty() {
            RekeyPhase::Idle
        } else {
            RekeyPhase::DeactivateGmk
        };
        self.error = error;
        rollback
    }

    /// Rollback parameters sent; the rotation is over
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` outside the rollback phase.
    pub fn rollback_done(&mut self) -> Result<()> {
        if self.phase != RekeyPhase::DeactivateGmk {
            return Err(Error::InvalidState);
        }
        self.phase = RekeyPhase::Idle;
        Ok(())
    }

    /// Platform confirmed the index flip; the rotation succeeded
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` when no confirm is awaited.
    pub fn index_confirmed(&mut self) -> Result<()> {
        if self.phase != RekeyPhase::WaitIndexConfirm {
            return Err(Error::InvalidState);
        }
        self.phase = RekeyPhase::Idle;
        self.error = RekeyError::None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> ExtendedAddress {
        ExtendedAddress::new([byte; 8])
    }

    fn three_devices() -> Vec<ExtendedAddress, MAX_DEVICES> {
        let mut v = Vec::new();
        for i in 1..=3 {
            v.push(addr(i)).unwrap();
        }
        v
    }

    #[test]
    fn slot_pair_rotation_and_revert() {
        let mut pair = GmkSlotPair::new(Aes128Key::new([0xAA; 16]));
        assert_eq!(pair.active_index(), 0);

        let idx = pair.install_pending(Aes128Key::new([0xBB; 16])).unwrap();
        assert_eq!(idx, 1);
        assert_eq!(pair.install_pending(Aes128Key::new([0xCC; 16])), Err(Error::Busy));

        pair.revert_pending();
        assert_eq!(pair.active_index(), 0);
        assert_eq!(pair.active_key().unwrap().as_bytes(), &[0xAA; 16]);

        let idx = pair.install_pending(Aes128Key::new([0xBB; 16])).unwrap();
        pair.commit_pending().unwrap();
        assert_eq!(pair.active_index(), idx);
        assert_eq!(pair.active_key().unwrap().as_bytes(), &[0xBB; 16]);
        assert!(pair.pending_index().is_none());
    }

    #[test]
    fn full_rotation_walks_both_phases_in_order() {
        let mut rekeyer = Rekeyer::new();
        assert_eq!(
            rekeyer.start(three_devices(), 1).unwrap(),
            RekeyStep::Deliver(addr(1))
        );
        assert_eq!(rekeyer.device_done().unwrap(), RekeyStep::Deliver(addr(2)));
        assert_eq!(rekeyer.device_done().unwrap(), RekeyStep::Deliver(addr(3)));
        assert_eq!(rekeyer.device_done().unwrap(), RekeyStep::Activate(addr(1)));
        assert_eq!(rekeyer.device_done().unwrap(), RekeyStep::Activate(addr(2)));
        assert_eq!(rekeyer.device_done().unwrap(), RekeyStep::Activate(addr(3)));
        assert_eq!(rekeyer.device_done().unwrap(), RekeyStep::CommitIndex(1));
        assert_eq!(rekeyer.phase(), RekeyPhase::WaitIndexConfirm);
        rekeyer.index_confirmed().unwrap();
        assert_eq!(rekeyer.last_error(), RekeyError::None);
        assert!(!rekeyer.is_active());
    }

    #[test]
    fn empty_snapshot_goes_straight_to_commit() {
        let mut rekeyer = Rekeyer::new();
        assert_eq!(
            rekeyer.start(Vec::new(), 1).unwrap(),
            RekeyStep::CommitIndex(1)
        );
        rekeyer.index_confirmed().unwrap();
        assert_eq!(rekeyer.last_error(), RekeyError::None);
    }

    #[test]
    fn failure_during_activation_rolls_back_activated_only() {
        let mut rekeyer = Rekeyer::new();
        rekeyer.start(three_devices(), 1).unwrap();
        // Deliver to all three
        for _ in 0..3 {
            rekeyer.device_done().unwrap();
        }
        // Device 1 activates, device 2 fails
        rekeyer.device_done().unwrap();
        let rollback = rekeyer.fail(RekeyError::Param);
        assert_eq!(rollback.as_slice(), &[addr(1)]);
        assert_eq!(rekeyer.phase(), RekeyPhase::DeactivateGmk);
        rekeyer.rollback_done().unwrap();
        assert_eq!(rekeyer.last_error(), RekeyError::Param);
        assert!(!rekeyer.is_active());
    }

    #[test]
    fn failure_during_delivery_needs_no_rollback_sends() {
        let mut rekeyer = Rekeyer::new();
        rekeyer.start(three_devices(), 1).unwrap();
        rekeyer.device_done().unwrap();
        let rollback = rekeyer.fail(RekeyError::FourthMessage);
        assert!(rollback.is_empty());
        assert_eq!(rekeyer.phase(), RekeyPhase::Idle);
        assert_eq!(rekeyer.last_error(), RekeyError::FourthMessage);
    }

    #[test]
    fn concurrent_start_rejected() {
        let mut rekeyer = Rekeyer::new();
        rekeyer.start(three_devices(), 1).unwrap();
        assert_eq!(rekeyer.start(three_devices(), 0), Err(Error::Busy));
    }
}
