//! Heartbeat watchdog thread
//!
//! Ticks at half the negotiated interval. Every inbound frame counts as
//! broker liveness; when the quiet period exceeds 1.5x the interval the
//! watchdog closes the connection, otherwise it sends a best-effort
//! heartbeat frame so the broker sees us alive too.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mqwire_core::command::{Command, FramePayload};
use mqwire_core::error::{EngineError, EngineResult};
use mqwire_core::{log_debug, log_warn};

use crate::connection::Connection;

const SRC: &str = "mqwire::heartbeat";

static WORKER_SEQ: AtomicU32 = AtomicU32::new(0);

/// Handle owning the watchdog thread
pub(crate) struct HeartbeatHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl HeartbeatHandle {
    /// Stop the watchdog. Joins unless called from the watchdog thread
    /// itself (the timeout path closes the connection, which stops us).
    pub(crate) fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn the watchdog for a negotiated interval
pub(crate) fn spawn(
    interval: Duration,
    conn: Weak<Connection>,
) -> EngineResult<HeartbeatHandle> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    let thread = thread::Builder::new()
        .name(format!(
            "mqwire-heartbeat-{}",
            WORKER_SEQ.fetch_add(1, Ordering::Relaxed)
        ))
        .spawn(move || watchdog_loop(conn, interval, flag))
        .map_err(|e| EngineError::Io(e.to_string()))?;

    Ok(HeartbeatHandle {
        shutdown,
        thread: Some(thread),
    })
}

fn watchdog_loop(conn: Weak<Connection>, interval: Duration, shutdown: Arc<AtomicBool>) {
    let tick = (interval / 2).max(Duration::from_millis(1));
    let tolerance = interval + interval / 2;
    log_debug!(SRC, "watchdog started, interval {:?}", interval);

    loop {
        thread::sleep(tick);
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        let conn = match conn.upgrade() {
            Some(c) => c,
            None => break,
        };
        if conn.is_closed() {
            break;
        }

        let idle = conn.heartbeat_idle();
        if idle > tolerance {
            log_warn!(
                SRC,
                "no traffic for {:?} (tolerance {:?}), closing",
                idle,
                tolerance
            );
            conn.close_from_heartbeat_timeout();
            break;
        }

        // Best effort; a fence hit here just means the close won the race
        let _ = conn.enqueue_command(
            Command::new(0, 0, 0, FramePayload::Heartbeat).immediate(),
        );
    }

    log_debug!(SRC, "watchdog exited");
}
