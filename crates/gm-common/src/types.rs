// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 GridMesh Systems

//! Common types for GridMesh PLM
//!
//! Fundamental identifiers used throughout the firmware: device addressing,
//! network identifiers and media selection.

use core::fmt;

/// Globally unique device identifier (EUI-64, 8 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtendedAddress([u8; 8]);

impl ExtendedAddress {
    /// Size of an extended address in bytes
    pub const SIZE: usize = 8;

    /// Create a new extended address from bytes
    #[must_use]
    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Create an extended address from a slice
    ///
    /// Returns `None` if the slice length is not exactly 8 bytes.
    #[must_use]
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() != 8 {
            return None;
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(slice);
        Some(Self(bytes))
    }

    /// Get the address as a byte array
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Check if the address is all zeros (invalid)
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl AsRef<[u8]> for ExtendedAddress {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ExtendedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExtendedAddress(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for ExtendedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// 16-bit network short address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShortAddress(u16);

impl ShortAddress {
    /// The coordinator always owns short address zero
    pub const COORDINATOR: Self = Self(0x0000);

    /// Sentinel for a device that has not been assigned an address yet
    pub const UNASSIGNED: Self = Self(0xFFFF);

    /// Create a short address from a raw value
    #[must_use]
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get the raw 16-bit value
    #[must_use]
    pub const fn value(&self) -> u16 {
        self.0
    }

    /// Big-endian wire encoding
    #[must_use]
    pub const fn to_be_bytes(&self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    /// Decode from big-endian wire bytes
    #[must_use]
    pub const fn from_be_bytes(bytes: [u8; 2]) -> Self {
        Self(u16::from_be_bytes(bytes))
    }

    /// Check whether this address has been assigned
    #[must_use]
    pub const fn is_assigned(&self) -> bool {
        self.0 != Self::UNASSIGNED.0
    }
}

impl fmt::Debug for ShortAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShortAddress(0x{:04X})", self.0)
    }
}

impl fmt::Display for ShortAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// PAN (network instance) identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PanId(u16);

impl PanId {
    /// Create a PAN identifier from a raw value
    #[must_use]
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get the raw 16-bit value
    #[must_use]
    pub const fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for PanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PAN 0x{:04X}", self.0)
    }
}

/// Physical medium a device is reached over
///
/// Hybrid nodes carry both a powerline and an RF interface; the medium is
/// recorded per device so rekeying and kicks reach it on the link it
/// actually joined on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MediaType {
    /// Powerline carrier
    Powerline = 0,
    /// Sub-GHz RF backup link
    Rf = 1,
}

impl MediaType {
    /// Convert from a raw byte
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Powerline),
            1 => Some(Self::Rf),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_address_from_slice() {
        assert!(ExtendedAddress::from_slice(&[1, 2, 3]).is_none());
        let addr = ExtendedAddress::from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(addr.as_bytes(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(!addr.is_zero());
        assert!(ExtendedAddress::new([0; 8]).is_zero());
    }

    #[test]
    fn short_address_wire_roundtrip() {
        let addr = ShortAddress::new(0x1234);
        assert_eq!(addr.to_be_bytes(), [0x12, 0x34]);
        assert_eq!(ShortAddress::from_be_bytes([0x12, 0x34]), addr);
        assert!(addr.is_assigned());
        assert!(!ShortAddress::UNASSIGNED.is_assigned());
    }

    #[test]
    fn media_type_from_byte() {
        assert_eq!(MediaType::from_u8(0), Some(MediaType::Powerline));
        assert_eq!(MediaType::from_u8(1), Some(MediaType::Rf));
        assert_eq!(MediaType::from_u8(7), None);
    }
}
