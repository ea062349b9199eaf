//! Connection-level I/O: the outbox and the loop threads
//!
//! Every outbound command funnels through one unbounded MPSC outbox. A
//! single writer loop drains it, applies the sticky-error fence and the
//! server-reply gate, and serializes frames into the outbound ring. A
//! single reader loop decodes frames from the inbound ring and dispatches
//! them. Two pump threads shuttle raw bytes between the rings and the
//! transport halves. All four check one cancellation token at their loop
//! tops.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use mqwire_core::command::Command;
use mqwire_core::error::{EngineError, EngineResult};
use mqwire_core::frame;
use mqwire_core::{log_debug, log_error, log_warn};
use mqwire_core::{AutoResetSignal, CancellationToken};

use crate::connection::Connection;
use crate::transport::{FrameSink, FrameSource};

use super::{lock, Endpoint};

const SRC: &str = "mqwire::io";

/// Monotonic suffix for loop thread names
static LOOP_SEQ: AtomicU32 = AtomicU32::new(0);

fn next_seq() -> u32 {
    LOOP_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// Gate enforcing one in-flight reply-expecting command.
///
/// Manual-reset: open means the wire is free for the next request. The
/// writer loop takes it before a non-immediate reply-expecting write; the
/// dispatcher opens it when a reply resolves an awaiting command.
pub(crate) struct ReplyGate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl ReplyGate {
    pub(crate) fn new() -> Self {
        Self {
            open: Mutex::new(true),
            cond: Condvar::new(),
        }
    }

    /// Wait for the gate to open, then close it behind us
    pub(crate) fn acquire(&self, cancel: &CancellationToken, park: Duration) -> EngineResult<()> {
        let mut open = lock(&self.open);
        while !*open {
            cancel.check()?;
            let (g, _) = match self.cond.wait_timeout(open, park) {
                Ok(pair) => pair,
                Err(poisoned) => {
                    let pair = poisoned.into_inner();
                    (pair.0, pair.1)
                }
            };
            open = g;
        }
        *open = false;
        Ok(())
    }

    pub(crate) fn release(&self) {
        let mut open = lock(&self.open);
        *open = true;
        self.cond.notify_one();
    }
}

/// Connection-level shared I/O state
pub(crate) struct ConnectionIo {
    pub(crate) endpoint: Endpoint,
    pub(crate) outbox: SegQueue<Command>,
    pub(crate) outbox_signal: AutoResetSignal,
    pub(crate) reply_gate: ReplyGate,
    pub(crate) park: Duration,
}

impl ConnectionIo {
    pub(crate) fn new(park: Duration, signal_spins: u32) -> Self {
        Self {
            endpoint: Endpoint::new(0),
            outbox: SegQueue::new(),
            outbox_signal: AutoResetSignal::with_spins(false, signal_spins),
            reply_gate: ReplyGate::new(),
            park,
        }
    }

    /// Enqueue a command for the writer loop.
    ///
    /// The sticky-error fence fails everything after the first error with
    /// that error, except the close/close-ok methods so a close handshake
    /// can still run over a broken connection state.
    pub(crate) fn enqueue(&self, cmd: Command) -> EngineResult<()> {
        if self.endpoint.is_disposed() {
            cmd.cancel();
            return Err(EngineError::Stopped);
        }
        if let Some(err) = self.endpoint.last_error() {
            if !frame::is_close_method(cmd.class_method()) {
                cmd.run_reply(0, 0, Some(&err));
                return Err(EngineError::Protocol(err));
            }
        }
        self.outbox.push(cmd);
        self.outbox_signal.set();
        Ok(())
    }

    /// Fail everything still sitting in the outbox and force the gate open
    pub(crate) fn cancel_pending(&self) {
        while let Some(cmd) = self.outbox.pop() {
            match self.endpoint.last_error() {
                Some(err) => cmd.run_reply(0, 0, Some(&err)),
                None => cmd.run_reply(0, 0, None),
            }
        }
        self.reply_gate.release();
    }
}

// ---- loop threads ----

pub(crate) fn spawn_writer_loop(
    conn: Arc<Connection>,
    mut sink: Box<dyn FrameSink>,
    cancel: CancellationToken,
) -> EngineResult<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("mqwire-writer-{}", next_seq()))
        .spawn(move || writer_loop(&conn, sink.as_mut(), &cancel))
        .map_err(|e| EngineError::Io(e.to_string()))
}

pub(crate) fn spawn_reader_loop(
    conn: Arc<Connection>,
    mut source: Box<dyn FrameSource>,
    cancel: CancellationToken,
) -> EngineResult<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("mqwire-reader-{}", next_seq()))
        .spawn(move || reader_loop(&conn, source.as_mut(), &cancel))
        .map_err(|e| EngineError::Io(e.to_string()))
}

pub(crate) fn spawn_pump(
    src: Box<dyn io::Read + Send>,
    dst: Box<dyn io::Write + Send>,
    conn: Arc<Connection>,
    cancel: CancellationToken,
    label: &'static str,
) -> EngineResult<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("mqwire-{}-{}", label, next_seq()))
        .spawn(move || pump_loop(src, dst, &conn, &cancel, label))
        .map_err(|e| EngineError::Io(e.to_string()))
}

/// Drains the outbox, serializing commands in arrival order
pub(crate) fn writer_loop(conn: &Connection, sink: &mut dyn FrameSink, cancel: &CancellationToken) {
    log_debug!(SRC, "writer loop started");

    'outer: while !cancel.is_cancelled() {
        conn.io().outbox_signal.wait(Some(conn.io().park));

        while let Some(cmd) = conn.io().outbox.pop() {
            if cancel.is_cancelled() {
                cmd.cancel();
                continue;
            }

            // Fence re-check: the error may have landed after the enqueue
            if let Some(err) = conn.io().endpoint.last_error() {
                if !frame::is_close_method(cmd.class_method()) {
                    cmd.run_reply(0, 0, Some(&err));
                    continue;
                }
            }

            // One reply-expecting command on the wire at a time, unless
            // the command is exempt (handshake, heartbeats, closes)
            if cmd.expects_reply && !cmd.immediate {
                if conn
                    .io()
                    .reply_gate
                    .acquire(cancel, conn.io().park)
                    .is_err()
                {
                    cmd.cancel();
                    continue;
                }
            }

            let info = cmd.debug_info();
            let result = if cmd.expects_reply {
                // Park the command before its bytes go out so the reply
                // can never race an empty queue
                let (channel, class_id, method_id) = (cmd.channel, cmd.class_id, cmd.method_id);
                let payload = cmd.payload.clone();
                conn.park_awaiting(cmd);
                sink.write_frame(channel, class_id, method_id, &payload)
            } else {
                match sink.write_frame(cmd.channel, cmd.class_id, cmd.method_id, &cmd.payload) {
                    Ok(()) => {
                        cmd.complete_written();
                        Ok(())
                    }
                    Err(e) => {
                        cmd.cancel();
                        Err(e)
                    }
                }
            };

            match result {
                Ok(()) => {}
                Err(EngineError::Cancelled) | Err(EngineError::Stopped) => break 'outer,
                Err(e) => {
                    log_error!(SRC, "write fault on {}: {}", info, e);
                    conn.handle_disconnect(e);
                    break 'outer;
                }
            }
        }

        match sink.flush() {
            Ok(()) => {}
            Err(EngineError::Cancelled) | Err(EngineError::Stopped) => break,
            Err(e) => {
                log_error!(SRC, "flush fault: {}", e);
                conn.handle_disconnect(e);
                break;
            }
        }
    }

    conn.io().cancel_pending();
    log_debug!(SRC, "writer loop exited");
}

/// Decodes inbound frames and dispatches them to the connection
pub(crate) fn reader_loop(
    conn: &Connection,
    source: &mut dyn FrameSource,
    cancel: &CancellationToken,
) {
    log_debug!(SRC, "reader loop started");

    while !cancel.is_cancelled() {
        match source.read_frame(conn) {
            Ok(()) => {}
            Err(EngineError::Cancelled) | Err(EngineError::Stopped) => break,
            Err(e) => {
                if !cancel.is_cancelled() {
                    log_warn!(SRC, "read fault: {}", e);
                    conn.handle_disconnect(e);
                }
                break;
            }
        }
    }

    log_debug!(SRC, "reader loop exited");
}

/// Copies raw bytes between a transport half and a ring
pub(crate) fn pump_loop(
    mut src: Box<dyn io::Read + Send>,
    mut dst: Box<dyn io::Write + Send>,
    conn: &Connection,
    cancel: &CancellationToken,
    label: &str,
) {
    log_debug!(SRC, "{} pump started", label);
    let mut buf = [0u8; 8192];

    loop {
        if cancel.is_cancelled() {
            break;
        }
        match src.read(&mut buf) {
            Ok(0) => {
                if !cancel.is_cancelled() {
                    conn.handle_disconnect(EngineError::Closed);
                }
                break;
            }
            Ok(n) => {
                if let Err(e) = dst.write_all(&buf[..n]).and_then(|()| dst.flush()) {
                    if !cancel.is_cancelled() && e.kind() != io::ErrorKind::BrokenPipe {
                        conn.handle_disconnect(e.into());
                    }
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                if cancel.is_cancelled() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => break,
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => break,
            Err(e) => {
                if !cancel.is_cancelled() {
                    conn.handle_disconnect(e.into());
                }
                break;
            }
        }
    }

    log_debug!(SRC, "{} pump exited", label);
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqwire_core::command::FramePayload;
    use mqwire_core::error::ProtocolError;
    use std::time::Duration;

    #[test]
    fn test_fence_blocks_after_error() {
        let io = ConnectionIo::new(Duration::from_millis(10), 0);
        io.endpoint
            .set_last_error(ProtocolError::synthetic("broken"));

        let cmd = Command::new(0, 10, 40, FramePayload::Open { vhost: "/".into() });
        let pending = cmd.completion();
        assert!(matches!(
            io.enqueue(cmd),
            Err(EngineError::Protocol(_))
        ));
        assert!(matches!(
            pending.wait(Some(Duration::from_millis(10))),
            Err(EngineError::Protocol(_))
        ));
        assert!(io.outbox.pop().is_none());
    }

    #[test]
    fn test_fence_exempts_close_methods() {
        let io = ConnectionIo::new(Duration::from_millis(10), 0);
        io.endpoint
            .set_last_error(ProtocolError::synthetic("broken"));

        let close = Command::new(
            0,
            10,
            50,
            FramePayload::ConnectionClose {
                reply_code: 200,
                reply_text: "bye".into(),
            },
        );
        assert!(io.enqueue(close).is_ok());
        assert!(io.outbox.pop().is_some());

        let close_ok = Command::new(0, 10, 51, FramePayload::ConnectionCloseOk);
        assert!(io.enqueue(close_ok).is_ok());
    }

    #[test]
    fn test_enqueue_signals_outbox() {
        let io = ConnectionIo::new(Duration::from_millis(10), 0);
        io.enqueue(Command::new(0, 0, 0, FramePayload::Heartbeat))
            .unwrap();
        assert!(io.outbox_signal.wait(Some(Duration::from_millis(10))));
    }

    #[test]
    fn test_disposed_rejects_everything() {
        let io = ConnectionIo::new(Duration::from_millis(10), 0);
        assert!(io.endpoint.try_dispose());

        let cmd = Command::new(0, 10, 51, FramePayload::ConnectionCloseOk);
        assert!(matches!(io.enqueue(cmd), Err(EngineError::Stopped)));
    }

    #[test]
    fn test_cancel_pending_uses_sticky_error() {
        let io = ConnectionIo::new(Duration::from_millis(10), 0);
        let cmd = Command::new(0, 10, 40, FramePayload::Open { vhost: "/".into() });
        let pending = cmd.completion();
        io.enqueue(cmd).unwrap();

        io.endpoint
            .set_last_error(ProtocolError::synthetic("went away"));
        io.cancel_pending();

        match pending.wait(Some(Duration::from_millis(10))) {
            Err(EngineError::Protocol(e)) => assert_eq!(e.reply_text, "went away"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_reply_gate_serializes() {
        let gate = Arc::new(ReplyGate::new());
        let cancel = CancellationToken::new();

        gate.acquire(&cancel, Duration::from_millis(5)).unwrap();

        // a second claim blocks until release
        let gate2 = gate.clone();
        let cancel2 = cancel.clone();
        let claimant = std::thread::spawn(move || {
            gate2.acquire(&cancel2, Duration::from_millis(5)).is_ok()
        });

        std::thread::sleep(Duration::from_millis(30));
        gate.release();

        assert!(claimant.join().unwrap());
    }

    #[test]
    fn test_reply_gate_acquire_observes_cancel() {
        let gate = ReplyGate::new();
        let cancel = CancellationToken::new();
        gate.acquire(&cancel, Duration::from_millis(5)).unwrap();

        cancel.cancel();
        assert!(matches!(
            gate.acquire(&cancel, Duration::from_millis(5)),
            Err(EngineError::Cancelled)
        ));
    }
}
