// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 GridMesh Systems

//! Time utilities for GridMesh PLM
//!
//! All protocol deadlines are computed against a caller-supplied monotonic
//! tick count; the core never reads a clock of its own.

use core::ops::Add;

/// Monotonic millisecond tick counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ticks(u64);

impl Ticks {
    /// Tick count zero
    pub const ZERO: Self = Self(0);

    /// Create from a raw tick count
    #[must_use]
    pub const fn new(ticks: u64) -> Self {
        Self(ticks)
    }

    /// Get the raw tick count
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Milliseconds elapsed since this instant
    #[must_use]
    pub const fn elapsed(&self, now: Self) -> u64 {
        now.0.saturating_sub(self.0)
    }

    /// Check if `duration` has elapsed since this instant
    #[must_use]
    pub const fn has_elapsed(&self, now: Self, duration: Millis) -> bool {
        self.elapsed(now) >= duration.as_u32() as u64
    }
}

impl From<u64> for Ticks {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Add<Millis> for Ticks {
    type Output = Self;

    fn add(self, rhs: Millis) -> Self::Output {
        Self(self.0.saturating_add(rhs.as_u32() as u64))
    }
}

/// Duration in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Millis(u32);

impl Millis {
    /// Create from milliseconds
    #[must_use]
    pub const fn new(ms: u32) -> Self {
        Self(ms)
    }

    /// Create from seconds
    #[must_use]
    pub const fn from_secs(secs: u32) -> Self {
        Self(secs.saturating_mul(1000))
    }

    /// Get the raw millisecond count
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}
