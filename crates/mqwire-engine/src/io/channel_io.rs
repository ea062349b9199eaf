//! Channel endpoint
//!
//! A channel multiplexes protocol work over the connection. It shares the
//! connection's writer/reader loops; all it owns is its endpoint state,
//! the open/close handshakes and the flow-control flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;

use mqwire_core::command::{Command, Completion, FramePayload};
use mqwire_core::error::{EngineError, EngineResult, ProtocolError};
use mqwire_core::frame::{self, channel_method, CHANNEL_CLASS};
use mqwire_core::log_warn;

use crate::connection::Connection;

use super::{Endpoint, IoEndpoint, CLOSE_WAIT_TIMEOUT};

const SRC: &str = "mqwire::channel";

/// One protocol channel
pub struct ChannelIo {
    endpoint: Endpoint,
    conn: Weak<Connection>,
    flow_blocked: AtomicBool,
}

impl ChannelIo {
    pub(crate) fn new(number: u16, conn: Weak<Connection>) -> Self {
        Self {
            endpoint: Endpoint::new(number),
            conn,
            flow_blocked: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn number(&self) -> u16 {
        self.endpoint.channel()
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        !self.endpoint.is_closed()
    }

    /// True while the broker asked us to hold publishes, either on this
    /// channel (channel.flow) or connection-wide (connection.blocked)
    pub fn is_flow_blocked(&self) -> bool {
        if self.flow_blocked.load(Ordering::Acquire) {
            return true;
        }
        self.conn
            .upgrade()
            .map(|c| c.is_blocked())
            .unwrap_or(false)
    }

    /// channel.open handshake, driven by `Connection::create_channel`
    pub(crate) fn open(&self) -> EngineResult<()> {
        let cmd = Command::new(self.number(), CHANNEL_CLASS, 10, FramePayload::ChannelOpen)
            .expects_reply(Some(channel_method::OPEN_OK));
        let opened = cmd.completion();
        self.enqueue(cmd)?;
        opened.wait(Some(CLOSE_WAIT_TIMEOUT))
    }

    /// Orderly channel close (close, wait for close-ok)
    pub fn close(&self) {
        self.initiate_clean_close(false, None);
    }

    /// Send a method that the broker answers; the completion resolves when
    /// the expected reply (or an error) arrives.
    pub fn call(
        &self,
        class_id: u16,
        method_id: u16,
        args: Vec<u8>,
        expected_reply: u32,
    ) -> EngineResult<Completion> {
        let cmd = Command::new(self.number(), class_id, method_id, FramePayload::Method(args))
            .expects_reply(Some(expected_reply));
        let completion = cmd.completion();
        self.enqueue(cmd)?;
        Ok(completion)
    }

    /// Send a method with no reply; the completion resolves once written
    pub fn cast(&self, class_id: u16, method_id: u16, args: Vec<u8>) -> EngineResult<Completion> {
        let cmd = Command::new(self.number(), class_id, method_id, FramePayload::Method(args));
        let completion = cmd.completion();
        self.enqueue(cmd)?;
        Ok(completion)
    }

    pub fn last_error(&self) -> Option<ProtocolError> {
        self.endpoint.last_error()
    }

    /// Inbound method frame for this channel. Returns true when it
    /// resolved a command awaiting a reply.
    pub(crate) fn dispatch(&self, class_method_id: u32, error: Option<ProtocolError>) -> bool {
        match class_method_id {
            channel_method::CLOSE => {
                self.initiate_clean_close(true, error.as_ref());
                false
            }
            channel_method::CLOSE_OK => self.handle_close_ok(self.number(), class_method_id),
            _ => {
                if self.handle_reply(self.number(), class_method_id, error.as_ref()) {
                    return true;
                }
                match error {
                    Some(e) => {
                        log_warn!(
                            SRC,
                            "[channel_{}] unsolicited error, closing channel: {}",
                            self.number(),
                            e
                        );
                        self.initiate_abrupt_close(e);
                    }
                    None => log_warn!(
                        SRC,
                        "[channel_{}] frame {:#x} with nobody waiting",
                        self.number(),
                        class_method_id
                    ),
                }
                false
            }
        }
    }

    /// channel.flow from the broker: record the state and confirm
    pub(crate) fn on_flow(&self, active: bool) {
        self.flow_blocked.store(!active, Ordering::Release);
        let _ = self.enqueue(
            Command::new(
                self.number(),
                CHANNEL_CLASS,
                21,
                FramePayload::ChannelFlowOk { active },
            )
            .immediate(),
        );
    }
}

impl IoEndpoint for ChannelIo {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn enqueue(&self, cmd: Command) -> EngineResult<()> {
        // Channel-level sticky fence; close methods still pass so the
        // close handshake can finish.
        if let Some(err) = self.endpoint.last_error() {
            if !frame::is_close_method(cmd.class_method()) {
                cmd.run_reply(0, 0, Some(&err));
                return Err(EngineError::Protocol(err));
            }
        }
        match self.conn.upgrade() {
            Some(conn) => conn.enqueue_command(cmd),
            None => {
                cmd.cancel();
                Err(EngineError::Closed)
            }
        }
    }

    fn close_command(&self, reply_code: u16, reply_text: &str) -> Command {
        Command::new(
            self.number(),
            CHANNEL_CLASS,
            40,
            FramePayload::ChannelClose {
                reply_code,
                reply_text: reply_text.into(),
            },
        )
        .immediate()
        .expects_reply(Some(channel_method::CLOSE_OK))
    }

    fn close_ok_command(&self) -> Command {
        Command::new(self.number(), CHANNEL_CLASS, 41, FramePayload::ChannelCloseOk).immediate()
    }

    fn release_reply_gate(&self) {
        if let Some(conn) = self.conn.upgrade() {
            conn.io().reply_gate.release();
        }
    }

    fn on_closed(&self) {
        if let Some(conn) = self.conn.upgrade() {
            conn.forget_channel(self.number());
        }
    }
}

impl std::fmt::Debug for ChannelIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelIo")
            .field("number", &self.number())
            .field("open", &self.is_open())
            .field("flow_blocked", &self.flow_blocked.load(Ordering::Relaxed))
            .finish()
    }
}
