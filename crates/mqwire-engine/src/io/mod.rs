//! Shared endpoint state and the close state machines
//!
//! The connection and every channel are both protocol endpoints: they
//! carry a close fence, a sticky error and a FIFO of commands awaiting a
//! reply, and they share the clean/abrupt close choreography. `IoEndpoint`
//! holds that common behavior; the implementors only provide their own
//! close method frames and routing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use mqwire_core::command::Command;
use mqwire_core::error::{EngineResult, ProtocolError};
use mqwire_core::frame;

mod channel_io;
mod connection_io;

pub use channel_io::ChannelIo;
pub(crate) use connection_io::{
    spawn_pump, spawn_reader_loop, spawn_writer_loop, ConnectionIo,
};

/// How long a locally initiated clean close waits for the close-ok reply
pub(crate) const CLOSE_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a peer-initiated close waits for our close-ok to hit the wire
pub(crate) const CLOSE_OK_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// State shared by connection-level and channel-level endpoints
pub struct Endpoint {
    channel: u16,
    closed: AtomicBool,
    disposed: AtomicBool,
    last_error: Mutex<Option<ProtocolError>>,
    awaiting_reply: SegQueue<Command>,
}

impl Endpoint {
    pub fn new(channel: u16) -> Self {
        Self {
            channel,
            closed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            last_error: Mutex::new(None),
            awaiting_reply: SegQueue::new(),
        }
    }

    #[inline]
    pub fn channel(&self) -> u16 {
        self.channel
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Atomically enter the closing state; true only for the first caller
    pub fn try_begin_close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Atomically enter the disposed state; true only for the first caller
    pub fn try_dispose(&self) -> bool {
        !self.disposed.swap(true, Ordering::AcqRel)
    }

    /// Record the first error observed on this endpoint; later errors are
    /// dropped so the cause survives the churn of teardown.
    pub fn set_last_error(&self, error: ProtocolError) {
        let mut slot = lock(&self.last_error);
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    pub fn last_error(&self) -> Option<ProtocolError> {
        lock(&self.last_error).clone()
    }

    pub fn push_awaiting(&self, cmd: Command) {
        self.awaiting_reply.push(cmd);
    }

    pub fn pop_awaiting(&self) -> Option<Command> {
        self.awaiting_reply.pop()
    }

    /// Back to a fresh state for reconnect
    pub fn reset(&self) {
        self.closed.store(false, Ordering::Release);
        self.disposed.store(false, Ordering::Release);
        *lock(&self.last_error) = None;
        while self.awaiting_reply.pop().is_some() {}
    }
}

/// Common close choreography for connection and channel endpoints
pub(crate) trait IoEndpoint {
    fn endpoint(&self) -> &Endpoint;

    /// Route a command to the connection outbox
    fn enqueue(&self, cmd: Command) -> EngineResult<()>;

    /// Build this endpoint's close method (expects close-ok)
    fn close_command(&self, reply_code: u16, reply_text: &str) -> Command;

    /// Build this endpoint's close-ok method
    fn close_ok_command(&self) -> Command;

    /// Runs once after the endpoint finished closing
    fn on_closed(&self);

    /// Reopen the connection's reply gate. Drains call this when a gated
    /// command is failed without a reply; nothing else ever would.
    fn release_reply_gate(&self);

    /// Orderly close handshake. Exactly-once; later calls are no-ops.
    ///
    /// When the peer initiated, answer with close-ok and wait only for it
    /// to reach the wire. When we initiate, send close and wait for the
    /// peer's close-ok (bounded). Either way the pending FIFO is drained.
    fn initiate_clean_close(&self, by_peer: bool, error: Option<&ProtocolError>) {
        if !self.endpoint().try_begin_close() {
            return;
        }
        if let Some(e) = error {
            self.endpoint().set_last_error(e.clone());
        }

        if by_peer {
            let cmd = self.close_ok_command();
            let written = cmd.completion();
            if self.enqueue(cmd).is_ok() {
                let _ = written.wait(Some(CLOSE_OK_FLUSH_TIMEOUT));
            }
        } else {
            let (code, text) = match error {
                Some(e) => (e.reply_code, e.reply_text.clone()),
                None => (frame::REPLY_SUCCESS, "Goodbye".to_string()),
            };
            let cmd = self.close_command(code, &text);
            let replied = cmd.completion();
            if self.enqueue(cmd).is_ok() {
                let _ = replied.wait(Some(CLOSE_WAIT_TIMEOUT));
            }
        }

        self.drain_pending();
        self.on_closed();
    }

    /// Immediate close without a handshake (transport already gone)
    fn initiate_abrupt_close(&self, error: ProtocolError) {
        if !self.endpoint().try_begin_close() {
            return;
        }
        self.endpoint().set_last_error(error);
        self.drain_pending();
        self.on_closed();
    }

    /// Fail one drained command. The sticky error goes to the command it
    /// names; every other command resolves with the generic closed
    /// outcome. Returns true when the command was holding the reply gate.
    fn resolve_drained(&self, cmd: Command) -> bool {
        let held_gate = cmd.expects_reply && !cmd.immediate;
        match self.endpoint().last_error() {
            Some(e) if e.matches(cmd.class_id, cmd.method_id) => cmd.run_reply(0, 0, Some(&e)),
            _ => cmd.run_reply(0, 0, None),
        }
        held_gate
    }

    /// Fail every command still waiting for a reply. A drained command
    /// never releases the reply gate itself, so reopen it here.
    fn drain_pending(&self) {
        let mut held_gate = false;
        while let Some(cmd) = self.endpoint().pop_awaiting() {
            held_gate |= self.resolve_drained(cmd);
        }
        if held_gate {
            self.release_reply_gate();
        }
    }

    /// Resolve the oldest awaiting command with this reply. FIFO: replies
    /// arrive in the order their requests were written. Returns false when
    /// nothing was waiting.
    fn handle_reply(&self, channel: u16, class_method_id: u32, error: Option<&ProtocolError>) -> bool {
        match self.endpoint().pop_awaiting() {
            Some(cmd) => {
                cmd.run_reply(channel, class_method_id, error);
                true
            }
            None => false,
        }
    }

    /// A close-ok arrived. Commands queued ahead of the close will never
    /// be answered (the peer stopped servicing this endpoint), so fail
    /// them closed and resolve the close command itself.
    fn handle_close_ok(&self, channel: u16, class_method_id: u32) -> bool {
        let mut held_gate = false;
        let mut resolved = false;
        while let Some(cmd) = self.endpoint().pop_awaiting() {
            if cmd.expected_reply == Some(class_method_id) {
                cmd.run_reply(channel, class_method_id, None);
                resolved = true;
                break;
            }
            held_gate |= self.resolve_drained(cmd);
        }
        if held_gate {
            self.release_reply_gate();
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqwire_core::command::FramePayload;
    use mqwire_core::error::EngineError;

    #[test]
    fn test_begin_close_is_exactly_once() {
        let ep = Endpoint::new(0);
        assert!(ep.try_begin_close());
        assert!(!ep.try_begin_close());
        assert!(ep.is_closed());
    }

    #[test]
    fn test_first_error_sticks() {
        let ep = Endpoint::new(3);
        ep.set_last_error(ProtocolError::synthetic("first"));
        ep.set_last_error(ProtocolError::synthetic("second"));
        assert_eq!(ep.last_error().unwrap().reply_text, "first");
    }

    #[test]
    fn test_awaiting_queue_is_fifo() {
        let ep = Endpoint::new(0);
        ep.push_awaiting(Command::new(0, 10, 40, FramePayload::Open { vhost: "/".into() }));
        ep.push_awaiting(Command::new(0, 20, 10, FramePayload::ChannelOpen));

        assert_eq!(ep.pop_awaiting().unwrap().class_id, 10);
        assert_eq!(ep.pop_awaiting().unwrap().class_id, 20);
        assert!(ep.pop_awaiting().is_none());
    }

    #[test]
    fn test_reset_clears_everything() {
        let ep = Endpoint::new(0);
        ep.try_begin_close();
        ep.try_dispose();
        ep.set_last_error(ProtocolError::synthetic("gone"));
        ep.push_awaiting(Command::new(0, 10, 40, FramePayload::Open { vhost: "/".into() }));

        ep.reset();
        assert!(!ep.is_closed());
        assert!(!ep.is_disposed());
        assert!(ep.last_error().is_none());
        assert!(ep.pop_awaiting().is_none());
    }

    struct Stub {
        ep: Endpoint,
        gate_releases: std::sync::atomic::AtomicU32,
    }

    impl Stub {
        fn new() -> Self {
            Self {
                ep: Endpoint::new(0),
                gate_releases: std::sync::atomic::AtomicU32::new(0),
            }
        }
    }

    impl IoEndpoint for Stub {
        fn endpoint(&self) -> &Endpoint {
            &self.ep
        }
        fn enqueue(&self, cmd: Command) -> EngineResult<()> {
            cmd.complete_written();
            Ok(())
        }
        fn close_command(&self, reply_code: u16, reply_text: &str) -> Command {
            Command::new(
                0,
                10,
                50,
                FramePayload::ConnectionClose {
                    reply_code,
                    reply_text: reply_text.into(),
                },
            )
        }
        fn close_ok_command(&self) -> Command {
            Command::new(0, 10, 51, FramePayload::ConnectionCloseOk)
        }
        fn on_closed(&self) {}
        fn release_reply_gate(&self) {
            self.gate_releases
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn test_drained_command_resolves_closed() {
        let stub = Stub::new();
        let cmd = Command::new(0, 10, 40, FramePayload::Open { vhost: "/".into() })
            .expects_reply(None);
        let pending = cmd.completion();
        stub.ep.push_awaiting(cmd);

        stub.initiate_clean_close(true, None);

        assert_eq!(
            pending.wait(Some(Duration::from_millis(10))),
            Err(EngineError::Closed)
        );
        assert!(stub.ep.is_closed());
    }

    #[test]
    fn test_drain_delivers_matching_error_to_offender() {
        let stub = Stub::new();

        let offender = Command::new(1, 60, 40, FramePayload::Method(Vec::new()))
            .expects_reply(Some(frame::class_method(60, 41)));
        let bystander = Command::new(1, 50, 10, FramePayload::Method(Vec::new()))
            .expects_reply(Some(frame::class_method(50, 11)));
        let offender_done = offender.completion();
        let bystander_done = bystander.completion();
        stub.ep.push_awaiting(offender);
        stub.ep.push_awaiting(bystander);

        stub.initiate_abrupt_close(ProtocolError {
            class_id: 60,
            method_id: 40,
            reply_code: 404,
            reply_text: "NOT_FOUND".into(),
        });

        match offender_done.wait(Some(Duration::from_millis(10))) {
            Err(EngineError::Protocol(e)) => {
                assert_eq!(e.reply_code, 404);
                assert!(e.matches(60, 40));
            }
            other => panic!("offender got {:?}", other),
        }
        assert_eq!(
            bystander_done.wait(Some(Duration::from_millis(10))),
            Err(EngineError::Closed)
        );
    }

    #[test]
    fn test_drain_reopens_the_reply_gate() {
        let stub = Stub::new();
        let gated = Command::new(1, 60, 40, FramePayload::Method(Vec::new()))
            .expects_reply(Some(frame::class_method(60, 41)));
        stub.ep.push_awaiting(gated);
        // immediate commands never held the gate
        stub.ep.push_awaiting(
            Command::new(0, 0, 0, FramePayload::Heartbeat).immediate(),
        );

        stub.initiate_abrupt_close(ProtocolError::synthetic("gone"));
        assert_eq!(
            stub.gate_releases.load(std::sync::atomic::Ordering::SeqCst),
            1
        );

        // nothing gated in the queue: the gate stays untouched
        let idle = Stub::new();
        idle.initiate_abrupt_close(ProtocolError::synthetic("gone"));
        assert_eq!(
            idle.gate_releases.load(std::sync::atomic::Ordering::SeqCst),
            0
        );
    }

    #[test]
    fn test_close_ok_drain_reopens_the_reply_gate() {
        let stub = Stub::new();
        let stale = Command::new(1, 60, 40, FramePayload::Method(Vec::new()))
            .expects_reply(Some(frame::class_method(60, 41)));
        let stale_done = stale.completion();
        stub.ep.push_awaiting(stale);

        // close-ok with no matching close awaiting still frees the gate
        assert!(!stub.handle_close_ok(0, frame::connection_method::CLOSE_OK));
        assert_eq!(
            stale_done.wait(Some(Duration::from_millis(10))),
            Err(EngineError::Closed)
        );
        assert_eq!(
            stub.gate_releases.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }
}
