//! Outbound protocol commands and their completion handles
//!
//! A `Command` is one unit of outbound work: it is created per call,
//! enqueued on the connection outbox, serialized by the writer loop, and
//! then either completed (reply observed, or written when no reply is
//! expected) or cancelled (drained on close). A command is never reused
//! across those outcomes.
//!
//! Frame contents are a closed set of tagged variants rather than writer
//! callbacks: the engine itself only ever emits control frames, and
//! anything else travels as an opaque pre-encoded method payload.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{EngineError, EngineResult, ProtocolError};
use crate::frame;

/// Content of an outbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePayload {
    /// Protocol greeting preamble (not a method frame)
    Greeting,
    /// connection.start-ok
    StartOk {
        /// Immutable client identity table, built once at startup
        client_properties: Vec<(String, String)>,
        /// SASL mechanism (e.g. "PLAIN")
        mechanism: String,
        /// SASL response bytes
        response: Vec<u8>,
        /// Locale (e.g. "en_US")
        locale: String,
    },
    /// connection.tune-ok
    TuneOk {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    /// connection.open
    Open { vhost: String },
    /// connection.close
    ConnectionClose { reply_code: u16, reply_text: String },
    /// connection.close-ok
    ConnectionCloseOk,
    /// channel.open
    ChannelOpen,
    /// channel.close
    ChannelClose { reply_code: u16, reply_text: String },
    /// channel.close-ok
    ChannelCloseOk,
    /// channel.flow-ok
    ChannelFlowOk { active: bool },
    /// Heartbeat frame
    Heartbeat,
    /// Pre-encoded method arguments, passed through opaquely
    Method(Vec<u8>),
}

/// One-shot completion handle for a command
///
/// First resolution wins; later resolutions are no-ops. Cloning shares
/// the underlying state so the caller can hold a handle while the command
/// travels through the engine.
#[derive(Clone)]
pub struct Completion {
    inner: Arc<CompletionInner>,
}

struct CompletionInner {
    result: Mutex<Option<EngineResult<()>>>,
    cond: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CompletionInner {
                result: Mutex::new(None),
                cond: Condvar::new(),
            }),
        }
    }

    /// Resolve successfully (no-op if already resolved)
    pub fn complete_ok(&self) {
        self.resolve(Ok(()));
    }

    /// Resolve with an error (no-op if already resolved)
    pub fn complete_err(&self, error: EngineError) {
        self.resolve(Err(error));
    }

    fn resolve(&self, outcome: EngineResult<()>) {
        let mut slot = match self.inner.result.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_none() {
            *slot = Some(outcome);
            self.inner.cond.notify_all();
        }
    }

    /// True once resolved either way
    pub fn is_done(&self) -> bool {
        match self.inner.result.lock() {
            Ok(g) => g.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }

    /// Block until resolved. `None` waits indefinitely; on timeout returns
    /// `Err(EngineError::Timeout)`.
    pub fn wait(&self, timeout: Option<Duration>) -> EngineResult<()> {
        let mut slot = match self.inner.result.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            match deadline {
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        return Err(EngineError::Timeout);
                    }
                    slot = match self.inner.cond.wait_timeout(slot, dl - now) {
                        Ok((g, _)) => g,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
                None => {
                    slot = match self.inner.cond.wait(slot) {
                        Ok(g) => g,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
            }
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("done", &self.is_done())
            .finish()
    }
}

/// Reply callback: (channel, packed class/method id, optional error)
pub type ReplyAction = Box<dyn FnOnce(u16, u32, Option<&ProtocolError>) + Send>;

/// One outbound unit of protocol work
pub struct Command {
    /// Target channel number (0 = connection level)
    pub channel: u16,
    /// Method class id
    pub class_id: u16,
    /// Method id
    pub method_id: u16,
    /// Frame content
    pub payload: FramePayload,
    /// True if the broker answers this method with a reply method
    pub expects_reply: bool,
    /// Bypass the server-reply gate (greeting, heartbeats, close during
    /// shutdown must be sent without waiting for a prior reply)
    pub immediate: bool,
    /// When set, a reply with a different packed id resolves the
    /// completion with an unexpected-reply error
    pub expected_reply: Option<u32>,
    reply_action: Option<ReplyAction>,
    completion: Completion,
}

impl Command {
    pub fn new(channel: u16, class_id: u16, method_id: u16, payload: FramePayload) -> Self {
        Self {
            channel,
            class_id,
            method_id,
            payload,
            expects_reply: false,
            immediate: false,
            expected_reply: None,
            reply_action: None,
            completion: Completion::new(),
        }
    }

    pub fn expects_reply(mut self, expected: Option<u32>) -> Self {
        self.expects_reply = true;
        self.expected_reply = expected;
        self
    }

    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    pub fn on_reply(
        mut self,
        action: impl FnOnce(u16, u32, Option<&ProtocolError>) + Send + 'static,
    ) -> Self {
        self.reply_action = Some(Box::new(action));
        self
    }

    /// Handle observers clone before the command enters the outbox
    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }

    /// Packed class/method id of this command
    #[inline]
    pub fn class_method(&self) -> u32 {
        frame::class_method(self.class_id, self.method_id)
    }

    /// Writer resolved this command by writing it (no reply expected)
    pub fn complete_written(mut self) {
        if let Some(action) = self.reply_action.take() {
            action(0, 0, None);
        }
        self.completion.complete_ok();
    }

    /// A reply (or a drain) resolves the command.
    ///
    /// `class_method_id == 0` with no error means the generic
    /// "connection closed" outcome used when draining pending commands.
    pub fn run_reply(mut self, channel: u16, class_method_id: u32, error: Option<&ProtocolError>) {
        if let Some(action) = self.reply_action.take() {
            action(channel, class_method_id, error);
        }

        match error {
            Some(e) => self.completion.complete_err(EngineError::Protocol(e.clone())),
            None if class_method_id == 0 => self.completion.complete_err(EngineError::Closed),
            None => match self.expected_reply {
                Some(expected) if expected != class_method_id => {
                    self.completion.complete_err(EngineError::UnexpectedReply {
                        class_id: frame::class_of(class_method_id),
                        method_id: frame::method_of(class_method_id),
                    })
                }
                _ => self.completion.complete_ok(),
            },
        }
    }

    /// Resolve as cancelled (shutdown observed before the write)
    pub fn cancel(self) {
        self.completion.complete_err(EngineError::Cancelled);
    }

    /// Short description for loop error logs
    pub fn debug_info(&self) -> String {
        format!(
            "[channel_{}] class {} method {}",
            self.channel, self.class_id, self.method_id
        )
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("channel", &self.channel)
            .field("class_id", &self.class_id)
            .field("method_id", &self.method_id)
            .field("expects_reply", &self.expects_reply)
            .field("immediate", &self.immediate)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_completion_first_resolution_wins() {
        let c = Completion::new();
        c.complete_ok();
        c.complete_err(EngineError::Closed);
        assert_eq!(c.wait(Some(Duration::from_millis(1))), Ok(()));
    }

    #[test]
    fn test_completion_debug_reports_state() {
        let c = Completion::new();
        assert!(format!("{:?}", c).contains("done: false"));
        c.complete_ok();
        assert!(format!("{:?}", c).contains("done: true"));
    }

    #[test]
    fn test_completion_wait_timeout() {
        let c = Completion::new();
        assert_eq!(
            c.wait(Some(Duration::from_millis(10))),
            Err(EngineError::Timeout)
        );
    }

    #[test]
    fn test_complete_written_runs_action_and_resolves() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let cmd = Command::new(1, 60, 40, FramePayload::Method(vec![1, 2, 3]))
            .on_reply(move |_, _, _| ran2.store(true, Ordering::SeqCst));
        let completion = cmd.completion();

        cmd.complete_written();

        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(completion.wait(Some(Duration::from_millis(1))), Ok(()));
    }

    #[test]
    fn test_drain_resolves_with_generic_closed() {
        let cmd = Command::new(0, 10, 40, FramePayload::Open { vhost: "/".into() })
            .expects_reply(None);
        let completion = cmd.completion();

        cmd.run_reply(0, 0, None);

        assert_eq!(
            completion.wait(Some(Duration::from_millis(1))),
            Err(EngineError::Closed)
        );
    }

    #[test]
    fn test_matching_error_is_reported_precisely() {
        let cmd = Command::new(0, 10, 40, FramePayload::Open { vhost: "/".into() })
            .expects_reply(None);
        let completion = cmd.completion();

        let err = ProtocolError {
            class_id: 10,
            method_id: 40,
            reply_code: 530,
            reply_text: "NOT_ALLOWED".into(),
        };
        cmd.run_reply(0, 0, Some(&err));

        match completion.wait(Some(Duration::from_millis(1))) {
            Err(EngineError::Protocol(e)) => assert_eq!(e.reply_code, 530),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_unexpected_reply() {
        use crate::frame::connection_method;

        let cmd = Command::new(0, 10, 50, FramePayload::ConnectionClose {
            reply_code: 200,
            reply_text: "bye".into(),
        })
        .expects_reply(Some(connection_method::CLOSE_OK));
        let completion = cmd.completion();

        // reply with the wrong method
        cmd.run_reply(0, connection_method::TUNE, None);

        assert!(matches!(
            completion.wait(Some(Duration::from_millis(1))),
            Err(EngineError::UnexpectedReply { class_id: 10, method_id: 30 })
        ));
    }

    #[test]
    fn test_expected_reply_resolves_ok() {
        use crate::frame::connection_method;

        let cmd = Command::new(0, 10, 50, FramePayload::ConnectionCloseOk)
            .expects_reply(Some(connection_method::CLOSE_OK));
        let completion = cmd.completion();

        cmd.run_reply(0, connection_method::CLOSE_OK, None);

        assert_eq!(completion.wait(Some(Duration::from_millis(1))), Ok(()));
    }
}
