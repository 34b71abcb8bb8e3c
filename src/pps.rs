//! PPS edge hand-off between the capture interrupt and the main loop.
//!
//! The contract is a latch plus a flag, not a queue: the ISR overwrites the
//! previous edge if the consumer has not drained it yet, and the consumer
//! snapshots both fields before clearing the flag. Single producer, single
//! consumer, 32-bit atomic stores only.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// A captured PPS rising edge, in the raw counter domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PpsEdge {
    pub raw_micros: u32,
    pub captured_at_ms: u32,
}

#[derive(Default)]
pub struct PpsLatch {
    ready: AtomicBool,
    raw_micros: AtomicU32,
    captured_at_ms: AtomicU32,
}

impl PpsLatch {
    pub const fn new() -> Self {
        PpsLatch {
            ready: AtomicBool::new(false),
            raw_micros: AtomicU32::new(0),
            captured_at_ms: AtomicU32::new(0),
        }
    }

    /// ISR side: store the edge and raise the flag.
    pub fn publish(&self, raw_micros: u32, captured_at_ms: u32) {
        self.raw_micros.store(raw_micros, Ordering::Relaxed);
        self.captured_at_ms.store(captured_at_ms, Ordering::Relaxed);
        self.ready.store(true, Ordering::Release);
    }

    /// Consumer side: take the pending edge, if any. Clearing the flag before
    /// the field reads means an edge arriving mid-take is kept for next time.
    pub fn take(&self) -> Option<PpsEdge> {
        if !self.ready.swap(false, Ordering::Acquire) {
            return None;
        }
        Some(PpsEdge {
            raw_micros: self.raw_micros.load(Ordering::Relaxed),
            captured_at_ms: self.captured_at_ms.load(Ordering::Relaxed),
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
