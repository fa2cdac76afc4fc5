//! Logical clock stamping synthesized tombstones.
//!
//! Every file set feeds the versions it ingests into the clock, so a tick
//! is always strictly above anything the engine has seen and a tombstone
//! minted from it dominates the record it replaces. The process-global
//! instance is the default; tests inject their own for determinism.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

static GLOBAL: Lazy<Arc<LogicalClock>> = Lazy::new(|| Arc::new(LogicalClock::new()));

#[derive(Debug, Default)]
pub struct LogicalClock {
    last: AtomicU64,
}

impl LogicalClock {
    pub fn new() -> LogicalClock {
        LogicalClock {
            last: AtomicU64::new(0),
        }
    }

    /// Next unused version.
    pub fn tick(&self) -> u64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Record an externally produced version so later ticks stay above it.
    pub fn observe(&self, version: u64) {
        self.last.fetch_max(version, Ordering::SeqCst);
    }

    pub fn current(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}

/// The clock shared by every file set in the process.
pub fn global() -> Arc<LogicalClock> {
    GLOBAL.clone()
}
