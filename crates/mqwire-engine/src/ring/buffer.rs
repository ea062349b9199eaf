//! Lock-free single-producer single-consumer byte ring
//!
//! Cursors are `u32` values that grow monotonically and wrap arithmetically;
//! the buffer size is a power of two so `cursor & (size - 1)` is the byte
//! offset. Each side keeps a cached copy of the other side's cursor and
//! only re-reads the authoritative atomic (Acquire) when the cache suggests
//! the buffer is empty (reader) or full (writer), so the steady-state hot
//! path touches a single cache line per side.
//!
//! Ownership contract: exactly one thread calls the write-side methods
//! (`space_to_write`, `write_at`, `advance_write`) and exactly one thread
//! calls the read-side methods at any given time. Everything else
//! (gates, stop/reenable, `has_unread`) is safe from any thread.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use mqwire_core::constants::MAX_READING_GATES;
use mqwire_core::error::{EngineError, EngineResult};
use mqwire_core::{AutoResetSignal, Semaphore};

use super::gate::ReadingGate;

/// Pads a hot atomic out to its own cache line
#[repr(align(64))]
struct CachePadded<T>(T);

impl<T> std::ops::Deref for CachePadded<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

/// SPSC byte ring with reading gates
pub struct RingBuffer {
    storage: UnsafeCell<Box<[u8]>>,
    size: u32,

    read_pos: CachePadded<AtomicU32>,
    write_pos: CachePadded<AtomicU32>,

    /// Reader's cached copy of `write_pos` (touched only by the reader)
    cached_write: CachePadded<UnsafeCell<u32>>,
    /// Writer's cached copy of `read_pos` (touched only by the writer)
    cached_read: CachePadded<UnsafeCell<u32>>,

    /// Set by `advance_write`, waited on by a blocked reader
    data_ready: AutoResetSignal,
    /// Set by `advance_read`/gate removal, waited on by a blocked writer
    space_freed: AutoResetSignal,

    /// One bit per active gate slot
    gate_mask: AtomicU64,
    /// Bumped on every gate add/remove so lock-free observers can detect
    /// a slot being reused between two reads of the mask
    gate_generation: AtomicU32,
    /// Bounds concurrent gates at the slot count
    gate_permits: Semaphore,
    /// Slot bookkeeping; also serializes gate changes against stop/reenable
    gates: Mutex<GateTable>,

    stopped: AtomicBool,
}

struct GateTable {
    slots: [Option<ReadingGate>; MAX_READING_GATES],
}

// Single-writer/single-reader access to `storage` and the cursor caches is
// the caller's contract (see module docs); all remaining state is atomics
// or lock-protected.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Create a ring of `size` bytes. `size` must be a power of two >= 2.
    pub fn new(size: u32) -> Self {
        assert!(
            size.is_power_of_two() && size >= 2,
            "ring size must be a power of two >= 2, got {}",
            size
        );
        Self {
            storage: UnsafeCell::new(vec![0u8; size as usize].into_boxed_slice()),
            size,
            read_pos: CachePadded(AtomicU32::new(0)),
            write_pos: CachePadded(AtomicU32::new(0)),
            cached_write: CachePadded(UnsafeCell::new(0)),
            cached_read: CachePadded(UnsafeCell::new(0)),
            data_ready: AutoResetSignal::new(false),
            space_freed: AutoResetSignal::new(false),
            gate_mask: AtomicU64::new(0),
            gate_generation: AtomicU32::new(0),
            gate_permits: Semaphore::new(MAX_READING_GATES),
            gates: Mutex::new(GateTable {
                slots: std::array::from_fn(|_| None),
            }),
            stopped: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn buffer_size(&self) -> u32 {
        self.size
    }

    #[inline]
    fn mask(&self) -> u32 {
        self.size - 1
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// True when the writer has published bytes the reader has not consumed
    pub fn has_unread(&self) -> bool {
        self.write_pos.load(Ordering::Acquire) != self.read_pos.load(Ordering::Acquire)
    }

    /// Gate add/remove generation counter
    pub fn gate_generation(&self) -> u32 {
        self.gate_generation.load(Ordering::Acquire)
    }

    /// Number of gates currently in effect
    pub fn active_gates(&self) -> u32 {
        self.gate_mask.load(Ordering::Acquire).count_ones()
    }

    pub(crate) fn data_ready(&self) -> &AutoResetSignal {
        &self.data_ready
    }

    pub(crate) fn space_freed(&self) -> &AutoResetSignal {
        &self.space_freed
    }

    // ---- write side (single owner thread) ----

    /// Claim up to `desired` contiguous writable bytes.
    ///
    /// Returns `(offset, count)`; `count` may be zero when the ring is
    /// full, and may be less than `desired` when the writable run stops at
    /// the end of the buffer (claim again after `advance_write` to wrap).
    pub fn space_to_write(&self, desired: u32) -> (usize, u32) {
        let write = self.write_pos.load(Ordering::Relaxed);

        // Safety: only the writer thread touches `cached_read`.
        let mut read = unsafe { *self.cached_read.get() };
        let mut free = self.contiguous_free(write, read);
        if free == 0 {
            // Full according to the cache; take the one Acquire refresh
            read = self.read_pos.load(Ordering::Acquire);
            unsafe { *self.cached_read.get() = read };
            free = self.contiguous_free(write, read);
        }

        ((write & self.mask()) as usize, free.min(desired))
    }

    /// Copy `src` into the ring at `offset` (claimed via `space_to_write`)
    pub fn write_at(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.size as usize);
        // Safety: writer-owned region per the claim protocol; the reader
        // only touches these bytes after the Release store in
        // `advance_write`.
        unsafe {
            let storage = &mut *self.storage.get();
            storage[offset..offset + src.len()].copy_from_slice(src);
        }
    }

    /// Publish `count` written bytes to the reader
    pub fn advance_write(&self, count: u32) {
        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);
        let new_write = write.wrapping_add(count);
        assert!(
            new_write.wrapping_sub(read) <= self.size,
            "write cursor overran the read cursor"
        );
        self.write_pos.store(new_write, Ordering::Release);
        self.data_ready.set_if_operational();
    }

    // ---- read side (single owner thread) ----

    /// Claim up to `desired` contiguous readable bytes.
    ///
    /// Returns `(offset, count)`; `count` is zero when the ring is empty.
    pub fn space_to_read(&self, desired: u32) -> (usize, u32) {
        let read = self.read_pos.load(Ordering::Relaxed);

        // Safety: only the reader thread touches `cached_write`.
        let mut write = unsafe { *self.cached_write.get() };
        let mut ready = self.contiguous_ready(write, read);
        if ready == 0 {
            write = self.write_pos.load(Ordering::Acquire);
            unsafe { *self.cached_write.get() = write };
            ready = self.contiguous_ready(write, read);
        }

        ((read & self.mask()) as usize, ready.min(desired))
    }

    /// Copy bytes out of the ring at `offset` (claimed via `space_to_read`
    /// or a gated claim)
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= self.size as usize);
        // Safety: reader-owned region per the claim protocol.
        unsafe {
            let storage = &*self.storage.get();
            dst.copy_from_slice(&storage[offset..offset + dst.len()]);
        }
    }

    /// Release `count` consumed bytes back to the writer
    pub fn advance_read(&self, count: u32) {
        let read = self.read_pos.load(Ordering::Relaxed);
        let write = self.write_pos.load(Ordering::Acquire);
        assert!(
            count <= write.wrapping_sub(read),
            "read cursor overran the write cursor"
        );
        self.read_pos
            .store(read.wrapping_add(count), Ordering::Release);
        self.space_freed.set_if_operational();
    }

    // ---- reading gates ----

    /// Pin the current read cursor so a `length`-byte region can be
    /// re-read after the main cursor moves past it.
    ///
    /// Blocks while all gate slots are taken. Fails only when the buffer
    /// has been stopped.
    pub fn add_reading_gate(&self, length: u32) -> EngineResult<ReadingGate> {
        self.gate_permits.acquire();

        let mut table = lock(&self.gates);
        if self.is_stopped() {
            drop(table);
            self.gate_permits.release();
            return Err(EngineError::Stopped);
        }

        let start = self.read_pos.load(Ordering::Acquire);

        // The permit guarantees a free bit exists; CAS against lock-free
        // mask readers.
        let mut mask = self.gate_mask.load(Ordering::Acquire);
        let index = loop {
            let free = (!mask).trailing_zeros();
            debug_assert!((free as usize) < MAX_READING_GATES, "gate permit without a free slot");
            match self.gate_mask.compare_exchange_weak(
                mask,
                mask | 1u64 << free,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break free,
                Err(actual) => mask = actual,
            }
        };
        self.gate_generation.fetch_add(1, Ordering::AcqRel);

        let gate = ReadingGate::new(index, start, length);
        table.slots[index as usize] = Some(gate.clone());
        Ok(gate)
    }

    /// Claim up to `desired` contiguous bytes from a gated region, starting
    /// `consumed` bytes into it. `count` is zero once the gate is exhausted;
    /// a shorter run than `desired` means the region wraps (claim again).
    pub fn space_to_read_gated(
        &self,
        gate: &ReadingGate,
        consumed: u32,
        desired: u32,
    ) -> (usize, u32) {
        debug_assert!(consumed <= gate.length());
        let pos = gate.start().wrapping_add(consumed);
        let offset = pos & self.mask();
        let remaining = gate.length() - consumed;
        let to_edge = self.size - offset;
        (offset as usize, remaining.min(to_edge).min(desired))
    }

    /// Remove a gate. Idempotent; a second removal of the same gate (or a
    /// removal after `stop_and_block`) is a no-op.
    pub fn remove_reading_gate(&self, gate: &ReadingGate) {
        let mut table = lock(&self.gates);
        if !gate.take_effect() {
            return;
        }

        self.clear_gate_slot(&mut table, gate);
        drop(table);

        self.gate_permits.release();
        // A writer blocked on gated space gets another look
        self.space_freed.set_if_operational();
    }

    fn clear_gate_slot(&self, table: &mut GateTable, gate: &ReadingGate) {
        table.slots[gate.index() as usize] = None;
        self.gate_mask
            .fetch_and(!(1u64 << gate.index()), Ordering::AcqRel);
        self.gate_generation.fetch_add(1, Ordering::AcqRel);
    }

    // ---- teardown / reuse ----

    /// Stop the ring: release every blocked reader and writer, abandon all
    /// gates, park briefly so in-flight claims settle, then zero both
    /// cursors. After this every wait on the ring reports released and the
    /// owners must stop touching it until `reenable`.
    pub fn stop_and_block(&self, park: Duration) {
        {
            let mut table = lock(&self.gates);
            self.stopped.store(true, Ordering::Release);

            for index in 0..MAX_READING_GATES {
                if let Some(gate) = table.slots[index].take() {
                    if gate.take_effect() {
                        self.gate_mask
                            .fetch_and(!(1u64 << index), Ordering::AcqRel);
                        self.gate_generation.fetch_add(1, Ordering::AcqRel);
                        self.gate_permits.release();
                    }
                }
            }

            self.data_ready.reset();
            self.space_freed.reset();
        }

        thread::sleep(park);

        self.read_pos.store(0, Ordering::Release);
        self.write_pos.store(0, Ordering::Release);
        // Safety: owners have been released and are barred by `stopped`.
        unsafe {
            *self.cached_write.get() = 0;
            *self.cached_read.get() = 0;
        }
    }

    /// Re-arm a stopped ring for reuse (reconnect path)
    pub fn reenable(&self) {
        let _table = lock(&self.gates);
        assert!(self.is_stopped(), "reenable on a running ring");
        self.data_ready.restore();
        self.space_freed.restore();
        self.stopped.store(false, Ordering::Release);
    }

    // ---- cursor arithmetic ----

    /// Contiguous writable run from the write offset.
    ///
    /// One slot stays reserved when the claim would make the cursors meet,
    /// so a full ring is never mistaken for an empty one.
    fn contiguous_free(&self, write: u32, read: u32) -> u32 {
        let used = write.wrapping_sub(read);
        debug_assert!(used <= self.size, "cursor invariant violated");

        let write_off = write & self.mask();
        let read_off = read & self.mask();
        if write_off < read_off {
            read_off - write_off - 1
        } else if read_off == 0 {
            self.size - write_off - 1
        } else {
            self.size - write_off
        }
    }

    /// Contiguous readable run from the read offset
    fn contiguous_ready(&self, write: u32, read: u32) -> u32 {
        let unread = write.wrapping_sub(read);
        debug_assert!(unread <= self.size, "cursor invariant violated");
        if unread == 0 {
            return 0;
        }

        let write_off = write & self.mask();
        let read_off = read & self.mask();
        if write_off > read_off {
            write_off - read_off
        } else {
            self.size - read_off
        }
    }
}

fn lock(m: &Mutex<GateTable>) -> std::sync::MutexGuard<'_, GateTable> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("size", &self.size)
            .field("read_pos", &self.read_pos.load(Ordering::Relaxed))
            .field("write_pos", &self.write_pos.load(Ordering::Relaxed))
            .field("active_gates", &self.active_gates())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
