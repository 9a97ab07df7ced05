// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 GridMesh Systems

//! Ordering of discovered PAN candidates
//!
//! After discovery a device holds a list of (PAN, relay) candidates and
//! must decide which to try first. The ordering is a two-level sort over
//! configurable dimensions; deployments wire in the policy that suits
//! their topology (lowest route cost first is the certification default).

use core::cmp::Ordering;

use gm_common::{MediaType, PanId, ShortAddress};

/// One discovered attachment point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PanCandidate {
    /// Network the relay belongs to
    pub pan_id: PanId,
    /// Short address of the relay that answered the scan
    pub relay: ShortAddress,
    /// Link quality toward the relay, higher is better
    pub link_quality: u8,
    /// Advertised route cost from the relay to the coordinator
    pub route_cost: u16,
    /// Medium the beacon arrived on
    pub media: MediaType,
}

/// Dimension a sort level compares on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDim {
    /// Link quality toward the relay
    LinkQuality,
    /// Relay short address (useful as a deterministic tie-breaker)
    ShortAddress,
    /// Advertised route cost to the coordinator
    RouteCost,
}

/// Direction of one sort level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Smallest first
    Ascending,
    /// Largest first
    Descending,
}

/// One sort level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    /// What to compare
    pub dim: SortDim,
    /// Which way
    pub order: SortOrder,
}

/// Two-level candidate ordering policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PanSortConfig {
    /// Decides first
    pub primary: SortKey,
    /// Breaks primary ties
    pub secondary: SortKey,
}

impl PanSortConfig {
    /// Certification default: cheapest route first, best link on ties
    pub const DEFAULT: Self = Self {
        primary: SortKey {
            dim: SortDim::RouteCost,
            order: SortOrder::Ascending,
        },
        secondary: SortKey {
            dim: SortDim::LinkQuality,
            order: SortOrder::Descending,
        },
    };
}

impl Default for PanSortConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

fn compare_dim(a: &PanCandidate, b: &PanCandidate, key: SortKey) -> Ordering {
    let ord = match key.dim {
        SortDim::LinkQuality => a.link_quality.cmp(&b.link_quality),
        SortDim::ShortAddress => a.relay.cmp(&b.relay),
        SortDim::RouteCost => a.route_cost.cmp(&b.route_cost),
    };
    match key.order {
        SortOrder::Ascending => ord,
        SortOrder::Descending => ord.reverse(),
    }
}

/// Compare two candidates under `config`
#[must_use]
pub fn compare(a: &PanCandidate, b: &PanCandidate, config: &PanSortConfig) -> Ordering {
    compare_dim(a, b, config.primary).then_with(|| compare_dim(a, b, config.secondary))
}

/// Sort candidates in place, best first
pub fn sort(candidates: &mut [PanCandidate], config: &PanSortConfig) {
    candidates.sort_unstable_by(|a, b| compare(a, b, config));
}
