//! Capability traits at the engine's seams
//!
//! The engine never talks to a socket directly: the writer loop hands
//! frames to a [`FrameSink`], the reader loop pulls frames out of a
//! [`FrameSource`], and the socket pumps move raw bytes between the ring
//! buffers and whatever byte stream the [`Transport`] provides. Tests plug
//! in-memory implementations into the same seams.

use std::io;
use std::net::TcpStream;

use mqwire_core::command::FramePayload;
use mqwire_core::error::{EngineResult, ProtocolError};

/// Halves of a split transport plus a closer that unblocks a pending read
pub struct TransportParts {
    pub reader: Box<dyn io::Read + Send>,
    pub writer: Box<dyn io::Write + Send>,
    /// Forces both halves to fail; called during shutdown so the socket
    /// pump threads can be joined
    pub closer: Box<dyn Fn() + Send + Sync>,
}

/// A connected byte stream the engine can pump frames through
pub trait Transport: Send {
    fn split(self: Box<Self>) -> EngineResult<TransportParts>;
}

impl Transport for TcpStream {
    fn split(self: Box<Self>) -> EngineResult<TransportParts> {
        let reader = self.try_clone()?;
        let closer_handle = self.try_clone()?;
        Ok(TransportParts {
            reader: Box::new(reader),
            writer: Box::new(*self),
            closer: Box::new(move || {
                let _ = closer_handle.shutdown(std::net::Shutdown::Both);
            }),
        })
    }
}

/// Serializes one outbound frame
pub trait FrameSink: Send {
    fn write_frame(
        &mut self,
        channel: u16,
        class_id: u16,
        method_id: u16,
        payload: &FramePayload,
    ) -> EngineResult<()>;

    fn flush(&mut self) -> EngineResult<()>;
}

/// Decodes one inbound frame and hands it to the dispatcher
pub trait FrameSource: Send {
    fn read_frame(&mut self, dispatcher: &dyn FrameDispatcher) -> EngineResult<()>;
}

/// Inbound frame routing, implemented by the connection.
///
/// Every dispatch counts as broker liveness and refreshes the heartbeat
/// timestamp.
pub trait FrameDispatcher: Send + Sync {
    /// A method frame. `error` is populated for close methods, decoded
    /// from the close body.
    fn dispatch_method(&self, channel: u16, class_method_id: u32, error: Option<ProtocolError>);

    /// connection.tune with the server's limits
    fn dispatch_tune(&self, channel_max: u16, frame_max: u32, heartbeat: u16);

    /// channel.flow
    fn dispatch_channel_flow(&self, channel: u16, active: bool);

    /// connection.blocked
    fn dispatch_blocked(&self, reason: String);

    /// connection.unblocked
    fn dispatch_unblocked(&self);

    /// A heartbeat frame (no payload)
    fn dispatch_heartbeat(&self);
}
