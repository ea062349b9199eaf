//! Counting semaphore
//!
//! Bounds the number of concurrently active reading gates on the ring
//! buffer. Claimants past the limit block until a permit is released.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Mutex/Condvar-backed counting permits
pub struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
    max: usize,
}

impl Semaphore {
    /// Create with `permits` available (also the cap for `release`)
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
            max: permits,
        }
    }

    /// Take one permit, blocking until one is available
    pub fn acquire(&self) {
        let mut count = match self.permits.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        while *count == 0 {
            count = match self.cond.wait(count) {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        *count -= 1;
    }

    /// Take one permit if available within `timeout`. Returns false on timeout.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let mut count = match self.permits.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        while *count == 0 {
            let (g, res) = match self.cond.wait_timeout(count, timeout) {
                Ok(pair) => pair,
                Err(poisoned) => {
                    let pair = poisoned.into_inner();
                    (pair.0, pair.1)
                }
            };
            count = g;
            if res.timed_out() && *count == 0 {
                return false;
            }
        }
        *count -= 1;
        true
    }

    /// Return one permit and wake a blocked claimant
    ///
    /// # Panics
    ///
    /// Panics on a release without a matching acquire.
    pub fn release(&self) {
        let mut count = match self.permits.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        assert!(*count < self.max, "semaphore released above its cap");
        *count += 1;
        self.cond.notify_one();
    }

    /// Permits currently available
    pub fn available(&self) -> usize {
        match self.permits.lock() {
            Ok(g) => *g,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_acquire_release() {
        let sem = Semaphore::new(2);
        sem.acquire();
        sem.acquire();
        assert_eq!(sem.available(), 0);
        sem.release();
        assert_eq!(sem.available(), 1);
    }

    #[test]
    fn test_acquire_timeout_when_exhausted() {
        let sem = Semaphore::new(1);
        sem.acquire();
        assert!(!sem.acquire_timeout(Duration::from_millis(10)));
        sem.release();
        assert!(sem.acquire_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_blocked_claimant_woken_by_release() {
        let sem = Arc::new(Semaphore::new(1));
        sem.acquire();

        let sem2 = sem.clone();
        let claimant = thread::spawn(move || {
            sem2.acquire();
            true
        });

        thread::sleep(Duration::from_millis(50));
        sem.release();

        assert!(claimant.join().unwrap());
    }

    #[test]
    #[should_panic(expected = "above its cap")]
    fn test_release_above_cap_panics() {
        let sem = Semaphore::new(1);
        sem.release();
    }
}
