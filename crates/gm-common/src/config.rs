// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 GridMesh Systems

//! Configuration for GridMesh PLM
//!
//! All configuration is compile-time or provisioned at factory; nothing here
//! changes at runtime. Defaults follow the certification profile for
//! powerline street-lighting deployments.

use crate::time::Millis;

/// Access-policy table interpretation, selected at build/provisioning time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Only listed devices may join; each entry supplies the device PSK and
    /// optionally a fixed short address
    AllowList,
    /// Listed devices are refused; unknown devices join with the default PSK
    /// and an allocated short address
    DenyList,
}

/// Coordinator-side bootstrap configuration
#[derive(Debug, Clone, Copy)]
pub struct BootServerConfig {
    /// Access-policy table mode
    pub access_mode: AccessMode,
    /// Total time a handshake may stay in flight before it is swept
    pub handshake_ttl: Millis,
    /// Deadline for an external PSK answer before the default PSK is used
    pub psk_deadline: Millis,
    /// Period of the join-entry sweep timer
    pub sweep_period: Millis,
    /// Deadline for each handshake stage before the message is resent
    pub retry_timeout: Millis,
    /// Per-stage retry bound before an entry is aborted
    pub max_retries: u8,
    /// Connected devices not heard from within this window are demoted
    pub device_ttl: Millis,
    /// PSK substituted when the policy provider does not answer in time
    pub default_psk: [u8; 16],
    /// First short address handed out by the allocator
    pub short_addr_base: u16,
    /// Timing applied to rekeying exchanges instead of the admission deadlines
    pub rekey: RekeyConfig,
}

impl BootServerConfig {
    /// Default coordinator configuration
    pub const DEFAULT: Self = Self {
        access_mode: AccessMode::DenyList,
        handshake_ttl: Millis::from_secs(40),
        psk_deadline: Millis::from_secs(5),
        sweep_period: Millis::new(500),
        retry_timeout: Millis::from_secs(10),
        max_retries: 3,
        device_ttl: Millis::from_secs(600),
        default_psk: [0xAB; 16],
        short_addr_base: 0x0001,
        rekey: RekeyConfig::DEFAULT,
    };
}

impl Default for BootServerConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Device-side bootstrap configuration
#[derive(Debug, Clone, Copy)]
pub struct BootClientConfig {
    /// Device PSK shared with the coordinator
    pub psk: [u8; 16],
    /// Lower bound of the randomized startup delay
    pub startup_delay_min: Millis,
    /// Upper bound of the randomized startup delay
    pub startup_delay_max: Millis,
    /// How long a discovery scan runs
    pub discovery_duration: Millis,
    /// How long to wait for an externally re-sorted candidate list
    pub sort_wait: Millis,
    /// Candidates below this link quality are never attempted
    pub link_quality_threshold: u8,
    /// Join attempts per candidate before advancing to the next one
    pub join_retries: u8,
    /// Timeout for a single join attempt
    pub join_timeout: Millis,
    /// Run route discovery toward the coordinator after joining
    pub route_discovery: bool,
    /// Timeout for the route-discovery step
    pub route_timeout: Millis,
}

impl BootClientConfig {
    /// Default device configuration
    pub const DEFAULT: Self = Self {
        psk: [0xAB; 16],
        startup_delay_min: Millis::new(500),
        startup_delay_max: Millis::from_secs(10),
        discovery_duration: Millis::from_secs(2),
        sort_wait: Millis::from_secs(1),
        link_quality_threshold: 52,
        join_retries: 3,
        join_timeout: Millis::from_secs(20),
        route_discovery: false,
        route_timeout: Millis::from_secs(10),
    };
}

impl Default for BootClientConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Group-key rotation configuration
#[derive(Debug, Clone, Copy)]
pub struct RekeyConfig {
    /// Deadline for each per-device stage of a rekeying run
    pub phase_timeout: Millis,
    /// Per-device retry bound within a phase
    pub max_retries: u8,
}

impl RekeyConfig {
    /// Default rekeying configuration
    pub const DEFAULT: Self = Self {
        phase_timeout: Millis::from_secs(15),
        max_retries: 2,
    };
}

impl Default for RekeyConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
