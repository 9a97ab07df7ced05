// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 GridMesh Systems

//! Logging for GridMesh PLM
//!
//! A small no_std ring log. Each FSM that wants a trace owns one and records
//! state transitions and protocol errors into it; an operator console can
//! drain it later. Key material (PSK, AK, KDK, TEK, GMK) must never be
//! formatted into a log message.

use core::fmt::{self, Write};
use heapless::String;

use crate::time::Ticks;

/// Maximum length of one formatted log message
pub const MAX_LOG_MESSAGE_LEN: usize = 96;

/// Log severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// Errors that require attention
    Error = 0,
    /// Potential problems, protocol violations from peers
    Warn = 1,
    /// Lifecycle events
    Info = 2,
    /// Development detail
    Debug = 3,
}

impl LogLevel {
    /// Short name of the level
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
        }
    }
}

/// One recorded log entry
#[derive(Clone)]
pub struct LogEntry {
    /// Severity
    pub level: LogLevel,
    /// When the entry was recorded
    pub at: Ticks,
    /// Component name
    pub module: &'static str,
    /// Formatted message
    pub message: String<MAX_LOG_MESSAGE_LEN>,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:010}] {:5} [{}] {}",
            self.at.as_u64(),
            self.level.as_str(),
            self.module,
            self.message
        )
    }
}

/// Fixed-capacity ring log; oldest entries are overwritten
pub struct RingLog<const N: usize> {
    entries: heapless::Deque<LogEntry, N>,
    min_level: LogLevel,
}

impl<const N: usize> RingLog<N> {
    /// Create an empty log accepting entries at `Info` and above
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: heapless::Deque::new(),
            min_level: LogLevel::Info,
        }
    }

    /// Set the minimum recorded severity
    pub fn set_min_level(&mut self, level: LogLevel) {
        self.min_level = level;
    }

    /// Record a formatted message
    pub fn record(
        &mut self,
        level: LogLevel,
        at: Ticks,
        module: &'static str,
        args: fmt::Arguments<'_>,
    ) {
        if level > self.min_level {
            return;
        }

        let mut message = String::new();
        // Overlong messages are truncated by the failed write
        let _ = message.write_fmt(args);

        if self.entries.is_full() {
            self.entries.pop_front();
        }
        let _ = self.entries.push_back(LogEntry {
            level,
            at,
            module,
            message,
        });
    }

    /// Number of retained entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether the log is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate retained entries, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// Drop all entries
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<const N: usize> Default for RingLog<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Record an error entry
#[macro_export]
macro_rules! log_error {
    ($log:expr, $at:expr, $module:expr, $($arg:tt)*) => {
        $log.record($crate::log::LogLevel::Error, $at, $module, format_args!($($arg)*))
    };
}

/// Record a warning entry
#[macro_export]
macro_rules! log_warn {
    ($log:expr, $at:expr, $module:expr, $($arg:tt)*) => {
        $log.record($crate::log::LogLevel::Warn, $at, $module, format_args!($($arg)*))
    };
}

/// Record an informational entry
#[macro_export]
macro_rules! log_info {
    ($log:expr, $at:expr, $module:expr, $($arg:tt)*) => {
        $log.record($crate::log::LogLevel::Info, $at, $module, format_args!($($arg)*))
    };
}

/// Record a debug entry
#[macro_export]
macro_rules! log_debug {
    ($log:expr, $at:expr, $module:expr, $($arg:tt)*) => {
        $log.record($crate::log::LogLevel::Debug, $at, $module, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_iterates_in_order() {
        let mut log: RingLog<4> = RingLog::new();
        log_info!(log, Ticks::new(1), "test", "first");
        log_warn!(log, Ticks::new(2), "test", "second {}", 42);

        let mut iter = log.iter();
        assert_eq!(iter.next().unwrap().message.as_str(), "first");
        assert_eq!(iter.next().unwrap().message.as_str(), "second 42");
        assert!(iter.next().is_none());
    }

    #[test]
    fn overwrites_oldest_when_full() {
        let mut log: RingLog<2> = RingLog::new();
        for i in 0..3u32 {
            log_info!(log, Ticks::new(i as u64), "test", "msg {}", i);
        }
        assert_eq!(log.len(), 2);
        assert_eq!(log.iter().next().unwrap().message.as_str(), "msg 1");
    }

    #[test]
    fn filters_below_min_level() {
        let mut log: RingLog<4> = RingLog::new();
        log_debug!(log, Ticks::ZERO, "test", "dropped");
        assert!(log.is_empty());

        log.set_min_level(LogLevel::Debug);
        log_debug!(log, Ticks::ZERO, "test", "kept");
        assert_eq!(log.len(), 1);
    }
}
