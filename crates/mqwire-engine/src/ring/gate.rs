//! Reading gates
//!
//! A gate pins a past read-cursor value so a second, temporary consumer
//! can re-read a region (e.g. decode a header, then stream the body)
//! while the primary read cursor keeps advancing. Gates are claimed from
//! a fixed table of 64 slots tracked as a bitmask on the owning buffer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Pinned read snapshot handle
///
/// Created by [`RingBuffer::add_reading_gate`](super::RingBuffer::add_reading_gate)
/// and destroyed explicitly by its owner via
/// [`RingBuffer::remove_reading_gate`](super::RingBuffer::remove_reading_gate).
/// Removal is idempotent.
#[derive(Clone)]
pub struct ReadingGate {
    inner: Arc<GateInner>,
}

struct GateInner {
    /// Slot index in the owning buffer's gate bitmask
    index: u32,
    /// Read cursor value at creation (global, unwrapped)
    start: u32,
    /// Length of the pinned region in bytes
    length: u32,
    in_effect: AtomicBool,
}

impl ReadingGate {
    pub(crate) fn new(index: u32, start: u32, length: u32) -> Self {
        Self {
            inner: Arc::new(GateInner {
                index,
                start,
                length,
                in_effect: AtomicBool::new(true),
            }),
        }
    }

    /// Slot index in the gate bitmask
    #[inline]
    pub fn index(&self) -> u32 {
        self.inner.index
    }

    /// Pinned read cursor value (global, unwrapped)
    #[inline]
    pub fn start(&self) -> u32 {
        self.inner.start
    }

    /// Length of the pinned region
    #[inline]
    pub fn length(&self) -> u32 {
        self.inner.length
    }

    /// False once the gate has been removed
    #[inline]
    pub fn in_effect(&self) -> bool {
        self.inner.in_effect.load(Ordering::Acquire)
    }

    /// Mark removed; returns true only for the first call
    pub(crate) fn take_effect(&self) -> bool {
        self.inner.in_effect.swap(false, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for ReadingGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadingGate")
            .field("index", &self.index())
            .field("start", &self.start())
            .field("length", &self.length())
            .field("in_effect", &self.in_effect())
            .finish()
    }
}
