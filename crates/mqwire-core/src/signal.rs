//! Hybrid spin/block auto-resetting signal
//!
//! The producer/consumer handoffs in the engine (command outbox, ring
//! buffer data/space notifications) fire many times per second and are
//! usually satisfied within nanoseconds. This primitive packs its whole
//! state into one atomic word and only falls back to a Mutex/Condvar wait
//! after a short bounded spin, amortizing the cost of scheduler-level
//! blocking.
//!
//! State word layout:
//! - bit 15: signalled
//! - bit 14: operational (cleared by `reset`, restored by `restore`)
//! - bits 0-7: waiter count (capped at 255)
//!
//! Waiters try to atomically clear the signalled bit; `set` wakes exactly
//! one blocked waiter. `reset` releases every blocked waiter without a
//! signal (they observe the non-operational state and return); it is used
//! to tear the signal down when the transport drops.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

const SIGNALLED_MASK: u32 = 1 << 15;
const OPERATIONAL_MASK: u32 = 1 << 14;
const WAITERS_MASK: u32 = 0xFF;

/// Maximum concurrent blocked waiters
pub const WAITER_MAX: u32 = 255;

/// Default spin iterations before blocking
pub const DEFAULT_SPINS: u32 = 10;

/// Auto-resetting wait/notify handoff
pub struct AutoResetSignal {
    state: AtomicU32,
    lock: Mutex<()>,
    cond: Condvar,
    spins: u32,
}

impl AutoResetSignal {
    /// Create a new signal, optionally already signalled
    pub fn new(initially_set: bool) -> Self {
        let state = OPERATIONAL_MASK | if initially_set { SIGNALLED_MASK } else { 0 };
        Self {
            state: AtomicU32::new(state),
            lock: Mutex::new(()),
            cond: Condvar::new(),
            spins: DEFAULT_SPINS,
        }
    }

    /// Create with an explicit spin count (0 = block immediately)
    pub fn with_spins(initially_set: bool, spins: u32) -> Self {
        Self {
            spins,
            ..Self::new(initially_set)
        }
    }

    /// True if the signalled bit is currently set
    #[inline]
    pub fn is_set(&self) -> bool {
        self.state.load(Ordering::Acquire) & SIGNALLED_MASK != 0
    }

    /// True unless `reset` has torn the signal down
    #[inline]
    pub fn is_operational(&self) -> bool {
        self.state.load(Ordering::Acquire) & OPERATIONAL_MASK != 0
    }

    /// Current blocked waiter count (test/diagnostic use)
    #[inline]
    pub fn waiters(&self) -> u32 {
        self.state.load(Ordering::Acquire) & WAITERS_MASK
    }

    /// Wait until signalled or until `timeout` elapses.
    ///
    /// Returns true when the signal was consumed (or the signal was torn
    /// down by `reset` while waiting), false on timeout. Pass `None` to
    /// wait indefinitely.
    ///
    /// # Panics
    ///
    /// Panics when called on a non-operational signal - that is invalid
    /// API usage, not a runtime failure.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        assert!(
            self.is_operational(),
            "cannot wait on a non-operational signal"
        );

        // Fast path: consume an already-pending signal
        if self.try_consume() {
            return true;
        }

        // Spin briefly; the common case is a signal arriving within ns
        for _ in 0..self.spins {
            std::hint::spin_loop();
            if self.try_consume() {
                return true;
            }
        }

        // Slow path: counted blocking wait
        let mut guard = match self.lock.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        assert!(
            self.is_operational(),
            "cannot wait on a non-operational signal"
        );

        self.add_waiter();

        // Re-check under the lock; `set` takes the lock before notifying,
        // so a signal from here on cannot be missed.
        if self.try_consume() {
            self.remove_waiter();
            return true;
        }

        let deadline = timeout.map(|d| Instant::now() + d);

        loop {
            let timed_out = match deadline {
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        self.remove_waiter();
                        return false;
                    }
                    let (g, res) = match self.cond.wait_timeout(guard, dl - now) {
                        Ok(pair) => pair,
                        Err(poisoned) => {
                            let pair = poisoned.into_inner();
                            (pair.0, pair.1)
                        }
                    };
                    guard = g;
                    res.timed_out()
                }
                None => {
                    guard = match self.cond.wait(guard) {
                        Ok(g) => g,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    false
                }
            };

            if self.try_consume() {
                self.remove_waiter();
                return true;
            }

            if timed_out {
                self.remove_waiter();
                return false;
            }
        }
    }

    /// Signal one waiter. Idempotent: a no-op if already signalled.
    ///
    /// # Panics
    ///
    /// Panics when called on a non-operational signal.
    pub fn set(&self) {
        assert!(
            self.is_operational(),
            "cannot set a non-operational signal"
        );

        if self.is_set() {
            return;
        }

        // CAS loop; never a blind read-modify-write
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            match self.state.compare_exchange_weak(
                cur,
                cur | SIGNALLED_MASK,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }

        let _guard = match self.lock.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.waiters() > 0 {
            // The awakened thread still has to win the consume CAS
            self.cond.notify_one();
        }
    }

    /// Signal one waiter unless the signal has been torn down.
    ///
    /// Unlike `set` this never panics: producers that race a teardown
    /// (e.g. a ring write finishing while the buffers are being stopped)
    /// use this and treat `false` as "nobody is listening anymore".
    pub fn set_if_operational(&self) -> bool {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            if cur & OPERATIONAL_MASK == 0 {
                return false;
            }
            if cur & SIGNALLED_MASK != 0 {
                return true;
            }
            match self.state.compare_exchange_weak(
                cur,
                cur | SIGNALLED_MASK,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }

        let _guard = match self.lock.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.waiters() > 0 {
            self.cond.notify_one();
        }
        true
    }

    /// Forcibly release all waiters without signalling.
    ///
    /// The signal becomes non-operational; blocked waiters return true
    /// (released) and further `wait`/`set` calls panic until `restore`.
    pub fn reset(&self) {
        let _guard = match self.lock.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            match self.state.compare_exchange_weak(
                cur,
                cur & !OPERATIONAL_MASK,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }

        self.cond.notify_all();
    }

    /// Re-arm the signal for reuse after `reset`
    pub fn restore(&self) {
        let _guard = match self.lock.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.state.store(OPERATIONAL_MASK, Ordering::Release);
    }

    /// Atomically clear the signalled bit if set. Also succeeds when the
    /// signal is non-operational, so `reset` fails every pending check
    /// closed ("released").
    #[inline]
    fn try_consume(&self) -> bool {
        let cur = self.state.load(Ordering::Acquire);
        if cur & OPERATIONAL_MASK == 0 {
            return true;
        }
        if cur & SIGNALLED_MASK == 0 {
            return false;
        }
        self.state
            .compare_exchange(
                cur,
                cur & !SIGNALLED_MASK,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
            || !self.is_operational()
    }

    fn add_waiter(&self) {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            assert!(
                cur & WAITERS_MASK < WAITER_MAX,
                "signal waiter count exceeded {}",
                WAITER_MAX
            );
            match self.state.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    fn remove_waiter(&self) {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            debug_assert!(cur & WAITERS_MASK > 0, "waiter count underflow");
            match self.state.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }
}

impl Default for AutoResetSignal {
    fn default() -> Self {
        Self::new(false)
    }
}

impl std::fmt::Debug for AutoResetSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoResetSignal")
            .field("set", &self.is_set())
            .field("operational", &self.is_operational())
            .field("waiters", &self.waiters())
            .finish()
    }
}
