//! Connection: handshake, channel table, close paths, recovery
//!
//! Owns the two ring buffers, the loop threads and the channel table. One
//! `Connection` survives a reconnect: teardown parks the rings and a new
//! transport re-arms them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mqwire_core::command::{Command, FramePayload};
use mqwire_core::error::{EngineError, EngineResult, ProtocolError};
use mqwire_core::frame::{connection_method, CONNECTION_CLASS};
use mqwire_core::{log_debug, log_info, log_warn};
use mqwire_core::CancellationToken;

use crate::codec::{FrameReader, FrameWriter};
use crate::config::ConnectionConfig;
use crate::heartbeat::{self, HeartbeatHandle};
use crate::io::{
    lock, spawn_pump, spawn_reader_loop, spawn_writer_loop, ChannelIo, ConnectionIo, Endpoint,
    IoEndpoint,
};
use crate::recovery::{NullRecovery, RecoveryAction, RecoveryHandler};
use crate::ring::{RingBuffer, RingByteReader, RingByteWriter};
use crate::transport::{FrameDispatcher, Transport};

const SRC: &str = "mqwire::connection";

/// Handshake completion bound
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Limits agreed during the tune step
#[derive(Debug, Clone, Copy, Default)]
pub struct Negotiated {
    pub channel_max: u16,
    pub frame_max: u32,
    /// Heartbeat interval in seconds; zero disables heartbeats
    pub heartbeat: u16,
}

type ErrorCallback = Box<dyn Fn(&ProtocolError) + Send>;
type TransportCloser = Box<dyn Fn() + Send + Sync>;

/// A broker connection
pub struct Connection {
    config: ConnectionConfig,
    io: ConnectionIo,
    inbound: Arc<RingBuffer>,
    outbound: Arc<RingBuffer>,
    channels: Mutex<Vec<Option<Arc<ChannelIo>>>>,
    error_callbacks: Mutex<Vec<ErrorCallback>>,
    callbacks_fired: AtomicBool,
    last_heartbeat: Mutex<Instant>,
    blocked: AtomicBool,
    negotiated: Mutex<Negotiated>,
    recovery: Box<dyn RecoveryHandler>,
    cancel: Mutex<CancellationToken>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    closer: Mutex<Option<TransportCloser>>,
    heartbeat: Mutex<Option<HeartbeatHandle>>,
}

impl Connection {
    /// Connect over `transport` and run the handshake
    pub fn connect(
        transport: Box<dyn Transport>,
        config: ConnectionConfig,
    ) -> EngineResult<Arc<Connection>> {
        Self::connect_with_recovery(transport, config, Box::new(NullRecovery))
    }

    /// Connect with a recovery handler observing the lifecycle
    pub fn connect_with_recovery(
        transport: Box<dyn Transport>,
        config: ConnectionConfig,
        recovery: Box<dyn RecoveryHandler>,
    ) -> EngineResult<Arc<Connection>> {
        mqwire_core::log::init();

        let conn = Arc::new(Connection::new(config, recovery));
        conn.start_io(transport)?;
        if let Err(e) = conn.run_handshake() {
            conn.teardown();
            return Err(e);
        }
        conn.recovery.notify_connected();
        conn.start_heartbeat();
        Ok(conn)
    }

    fn new(config: ConnectionConfig, recovery: Box<dyn RecoveryHandler>) -> Self {
        let inbound = Arc::new(RingBuffer::new(config.buffer_size));
        let outbound = Arc::new(RingBuffer::new(config.buffer_size));
        let io = ConnectionIo::new(config.park_timeout, config.signal_spins);
        Self {
            config,
            io,
            inbound,
            outbound,
            channels: Mutex::new(Vec::new()),
            error_callbacks: Mutex::new(Vec::new()),
            callbacks_fired: AtomicBool::new(false),
            last_heartbeat: Mutex::new(Instant::now()),
            blocked: AtomicBool::new(false),
            negotiated: Mutex::new(Negotiated::default()),
            recovery,
            cancel: Mutex::new(CancellationToken::new()),
            loops: Mutex::new(Vec::new()),
            closer: Mutex::new(None),
            heartbeat: Mutex::new(None),
        }
    }

    pub(crate) fn io(&self) -> &ConnectionIo {
        &self.io
    }

    /// Limits agreed with the broker (zeroed before the handshake)
    pub fn negotiated(&self) -> Negotiated {
        *lock(&self.negotiated)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.io.endpoint.is_closed()
    }

    /// True while the broker reports itself blocked (connection.blocked)
    #[inline]
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<ProtocolError> {
        self.io.endpoint.last_error()
    }

    /// Register a callback fired once when the connection closes, in
    /// registration order
    pub fn on_connection_error(&self, callback: impl Fn(&ProtocolError) + Send + 'static) {
        lock(&self.error_callbacks).push(Box::new(callback));
    }

    // ---- transport wiring ----

    fn start_io(self: &Arc<Self>, transport: Box<dyn Transport>) -> EngineResult<()> {
        let parts = transport.split()?;

        if self.inbound.is_stopped() {
            self.inbound.reenable();
        }
        if self.outbound.is_stopped() {
            self.outbound.reenable();
        }

        let cancel = CancellationToken::new();
        *lock(&self.cancel) = cancel.clone();
        *lock(&self.closer) = Some(parts.closer);

        let park = self.config.park_timeout;
        let sink = FrameWriter::new(RingByteWriter::new(
            self.outbound.clone(),
            cancel.clone(),
            park,
        ));
        let source = FrameReader::new(RingByteReader::new(
            self.inbound.clone(),
            cancel.clone(),
            park,
        ));

        let mut handles = Vec::with_capacity(4);
        handles.push(spawn_writer_loop(
            self.clone(),
            Box::new(sink),
            cancel.clone(),
        )?);
        handles.push(spawn_reader_loop(
            self.clone(),
            Box::new(source),
            cancel.clone(),
        )?);
        handles.push(spawn_pump(
            Box::new(RingByteReader::new(
                self.outbound.clone(),
                cancel.clone(),
                park,
            )),
            parts.writer,
            self.clone(),
            cancel.clone(),
            "socket-out",
        )?);
        handles.push(spawn_pump(
            parts.reader,
            Box::new(RingByteWriter::new(
                self.inbound.clone(),
                cancel.clone(),
                park,
            )),
            self.clone(),
            cancel,
            "socket-in",
        )?);
        *lock(&self.loops) = handles;
        Ok(())
    }

    // ---- handshake ----

    fn run_handshake(&self) -> EngineResult<()> {
        // Greeting preamble; the server answers with connection.start
        self.await_step(
            Command::new(0, 0, 0, FramePayload::Greeting)
                .immediate()
                .expects_reply(Some(connection_method::START)),
        )?;

        self.await_step(
            Command::new(
                0,
                CONNECTION_CLASS,
                11,
                FramePayload::StartOk {
                    client_properties: self.client_properties(),
                    mechanism: "PLAIN".into(),
                    response: sasl_plain(&self.config.username, &self.config.password),
                    locale: "en_US".into(),
                },
            )
            .immediate()
            .expects_reply(Some(connection_method::TUNE)),
        )?;

        // dispatch_tune recorded the agreed limits before resolving the
        // start-ok completion
        let negotiated = self.negotiated();
        self.io.enqueue(
            Command::new(
                0,
                CONNECTION_CLASS,
                31,
                FramePayload::TuneOk {
                    channel_max: negotiated.channel_max,
                    frame_max: negotiated.frame_max,
                    heartbeat: negotiated.heartbeat,
                },
            )
            .immediate(),
        )?;

        self.await_step(
            Command::new(
                0,
                CONNECTION_CLASS,
                40,
                FramePayload::Open {
                    vhost: self.config.vhost.clone(),
                },
            )
            .immediate()
            .expects_reply(Some(connection_method::OPEN_OK)),
        )?;

        self.touch_heartbeat();
        log_info!(
            SRC,
            "connected: vhost {:?} channel_max {} frame_max {} heartbeat {}s",
            self.config.vhost,
            negotiated.channel_max,
            negotiated.frame_max,
            negotiated.heartbeat
        );
        Ok(())
    }

    fn await_step(&self, cmd: Command) -> EngineResult<()> {
        let step = cmd.completion();
        self.io.enqueue(cmd)?;
        step.wait(Some(HANDSHAKE_TIMEOUT))
    }

    fn client_properties(&self) -> Vec<(String, String)> {
        let mut props = self.config.client_properties.clone();
        if let Some(name) = &self.config.connection_name {
            props.push(("connection_name".into(), name.clone()));
        }
        props
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let seconds = self.negotiated().heartbeat;
        if seconds == 0 {
            return;
        }
        match heartbeat::spawn(
            Duration::from_secs(seconds as u64),
            Arc::downgrade(self),
        ) {
            Ok(handle) => *lock(&self.heartbeat) = Some(handle),
            Err(e) => log_warn!(SRC, "could not start heartbeat thread: {}", e),
        }
    }

    // ---- channels ----

    /// Open a new channel on the lowest free number
    pub fn create_channel(self: &Arc<Self>) -> EngineResult<Arc<ChannelIo>> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        let channel_max = self.negotiated().channel_max;

        let channel = {
            let mut table = lock(&self.channels);
            let index = table
                .iter()
                .position(|slot| slot.is_none())
                .unwrap_or(table.len());
            let number = index as u32 + 1;
            if number > channel_max as u32 {
                return Err(EngineError::ChannelLimit);
            }
            if index == table.len() {
                table.push(None);
            }
            let channel = Arc::new(ChannelIo::new(number as u16, Arc::downgrade(self)));
            table[index] = Some(channel.clone());
            channel
        };

        match channel.open() {
            Ok(()) => Ok(channel),
            Err(e) => {
                self.forget_channel(channel.number());
                Err(e)
            }
        }
    }

    /// Look up a channel the caller knows exists.
    ///
    /// # Panics
    ///
    /// Panics on an unknown or already-released channel number - resolving
    /// one is a caller bug, not a runtime condition.
    pub fn resolve_channel(&self, number: u16) -> Arc<ChannelIo> {
        assert!(number >= 1, "channel numbers start at 1");
        self.try_channel(number)
            .unwrap_or_else(|| panic!("unknown channel {}", number))
    }

    fn try_channel(&self, number: u16) -> Option<Arc<ChannelIo>> {
        if number == 0 {
            return None;
        }
        lock(&self.channels)
            .get(number as usize - 1)
            .and_then(|slot| slot.clone())
    }

    pub(crate) fn forget_channel(&self, number: u16) {
        let mut table = lock(&self.channels);
        if let Some(slot) = table.get_mut(number as usize - 1) {
            *slot = None;
        }
    }

    fn open_channels(&self) -> Vec<Arc<ChannelIo>> {
        lock(&self.channels).iter().flatten().cloned().collect()
    }

    // ---- outbound plumbing (used by channels, heartbeat, loops) ----

    pub(crate) fn enqueue_command(&self, cmd: Command) -> EngineResult<()> {
        self.io.enqueue(cmd)
    }

    /// Writer loop: file a reply-expecting command with its endpoint
    pub(crate) fn park_awaiting(&self, cmd: Command) {
        if cmd.channel == 0 {
            self.io.endpoint.push_awaiting(cmd);
            return;
        }
        match self.try_channel(cmd.channel) {
            Some(channel) => channel.endpoint().push_awaiting(cmd),
            None => cmd.run_reply(0, 0, None),
        }
    }

    // ---- close paths ----

    /// Orderly shutdown: close channels, run the connection close
    /// handshake, stop the loops.
    pub fn close(&self) {
        self.recovery.notify_close_by_user();
        for channel in self.open_channels() {
            channel.initiate_clean_close(false, None);
        }
        self.initiate_clean_close(false, None);
        self.teardown();
    }

    /// Transport dropped or a loop faulted
    pub(crate) fn handle_disconnect(&self, error: EngineError) {
        if self.io.endpoint.is_closed() {
            return;
        }
        log_warn!(SRC, "disconnected: {}", error);

        let protocol_error = match error {
            EngineError::Protocol(e) => e,
            other => ProtocolError::synthetic(other.to_string()),
        };
        let action = self.recovery.notify_abrupt_close(&protocol_error);
        for channel in self.open_channels() {
            channel.initiate_abrupt_close(protocol_error.clone());
        }
        self.initiate_abrupt_close(protocol_error);
        self.finish_close(action);
    }

    fn handle_close_by_server(&self, error: ProtocolError) {
        log_info!(SRC, "server closed the connection: {}", error);
        let action = self.recovery.notify_close_by_server(&error);
        for channel in self.open_channels() {
            channel.initiate_abrupt_close(error.clone());
        }
        self.initiate_clean_close(true, Some(&error));
        self.finish_close(action);
    }

    /// Heartbeat watchdog: the broker went quiet past tolerance
    pub(crate) fn close_from_heartbeat_timeout(&self) {
        if self.io.endpoint.is_closed() {
            return;
        }
        let error = ProtocolError {
            reply_code: 320,
            reply_text: "Heartbeat timeout".into(),
            ..ProtocolError::default()
        };
        let action = self.recovery.notify_abrupt_close(&error);
        for channel in self.open_channels() {
            channel.initiate_abrupt_close(error.clone());
        }
        self.initiate_clean_close(false, Some(&error));
        self.finish_close(action);
    }

    fn finish_close(&self, action: RecoveryAction) {
        if action == RecoveryAction::WillReconnect {
            log_info!(SRC, "resources parked pending reconnect");
        }
        self.teardown();
    }

    /// Stop loops and pumps, park the rings, fail everything pending.
    /// Idempotent; safe to call from a loop thread.
    fn teardown(&self) {
        if !self.io.endpoint.try_dispose() {
            return;
        }

        lock(&self.cancel).cancel();
        self.io.outbox_signal.set();

        if let Some(mut handle) = lock(&self.heartbeat).take() {
            handle.stop();
        }
        if let Some(closer) = lock(&self.closer).take() {
            closer();
        }

        let park = self.config.park_timeout;
        self.outbound.stop_and_block(park);
        self.inbound.stop_and_block(park);

        let handles = std::mem::take(&mut *lock(&self.loops));
        let current = std::thread::current().id();
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }

        self.io.cancel_pending();
        log_debug!(SRC, "teardown complete");
    }

    /// Attach a fresh transport to a closed connection and redo the
    /// handshake. Channels do not survive; open new ones.
    pub fn reconnect(self: &Arc<Self>, transport: Box<dyn Transport>) -> EngineResult<()> {
        if !self.is_closed() {
            return Err(EngineError::Io("reconnect on a live connection".into()));
        }

        self.io.endpoint.reset();
        self.callbacks_fired.store(false, Ordering::Release);
        self.blocked.store(false, Ordering::Release);
        lock(&self.channels).clear();
        self.io.reply_gate.release();
        self.touch_heartbeat();

        self.start_io(transport)?;
        if let Err(e) = self.run_handshake() {
            self.teardown();
            return Err(e);
        }
        self.recovery.notify_connected();
        self.start_heartbeat();
        log_info!(SRC, "reconnected");
        Ok(())
    }

    // ---- heartbeat bookkeeping ----

    pub(crate) fn touch_heartbeat(&self) {
        *lock(&self.last_heartbeat) = Instant::now();
    }

    /// Time since the broker last showed any sign of life
    pub(crate) fn heartbeat_idle(&self) -> Duration {
        lock(&self.last_heartbeat).elapsed()
    }

    // ---- inbound dispatch helpers ----

    fn hand_connection_reply(&self, class_method_id: u32, error: Option<&ProtocolError>) {
        if self.handle_reply(0, class_method_id, error) {
            self.io.reply_gate.release();
            return;
        }
        match error {
            Some(e) => {
                log_warn!(SRC, "unsolicited connection error: {}", e);
                self.handle_disconnect(EngineError::Protocol(e.clone()));
            }
            None => log_warn!(
                SRC,
                "frame {:#x} with nobody waiting",
                class_method_id
            ),
        }
    }
}

impl IoEndpoint for Connection {
    fn endpoint(&self) -> &Endpoint {
        &self.io.endpoint
    }

    fn enqueue(&self, cmd: Command) -> EngineResult<()> {
        self.io.enqueue(cmd)
    }

    fn close_command(&self, reply_code: u16, reply_text: &str) -> Command {
        Command::new(
            0,
            CONNECTION_CLASS,
            50,
            FramePayload::ConnectionClose {
                reply_code,
                reply_text: reply_text.into(),
            },
        )
        .immediate()
        .expects_reply(Some(connection_method::CLOSE_OK))
    }

    fn close_ok_command(&self) -> Command {
        Command::new(0, CONNECTION_CLASS, 51, FramePayload::ConnectionCloseOk).immediate()
    }

    fn release_reply_gate(&self) {
        self.io.reply_gate.release();
    }

    fn on_closed(&self) {
        if self.callbacks_fired.swap(true, Ordering::AcqRel) {
            return;
        }
        let error = self
            .io
            .endpoint
            .last_error()
            .unwrap_or_else(|| ProtocolError::synthetic("connection closed"));
        let callbacks = lock(&self.error_callbacks);
        for callback in callbacks.iter() {
            callback(&error);
        }
    }
}

impl FrameDispatcher for Connection {
    fn dispatch_method(&self, channel: u16, class_method_id: u32, error: Option<ProtocolError>) {
        self.touch_heartbeat();

        if channel == 0 {
            match class_method_id {
                connection_method::CLOSE => {
                    let error = error
                        .unwrap_or_else(|| ProtocolError::synthetic("closed by server"));
                    self.handle_close_by_server(error);
                }
                connection_method::CLOSE_OK => {
                    if self.handle_close_ok(0, class_method_id) {
                        self.io.reply_gate.release();
                    }
                }
                _ => self.hand_connection_reply(class_method_id, error.as_ref()),
            }
            return;
        }

        match self.try_channel(channel) {
            Some(ch) => {
                if ch.dispatch(class_method_id, error) {
                    self.io.reply_gate.release();
                }
            }
            None => log_warn!(SRC, "frame for unknown channel {}", channel),
        }
    }

    fn dispatch_tune(&self, channel_max: u16, frame_max: u32, heartbeat: u16) {
        self.touch_heartbeat();

        let ours_heartbeat = self.config.heartbeat.as_secs().min(u16::MAX as u64) as u16;
        let negotiated = Negotiated {
            channel_max: pick_limit(self.config.channel_max as u32, channel_max as u32) as u16,
            frame_max: pick_limit(self.config.frame_max, frame_max),
            heartbeat: pick_limit(ours_heartbeat as u32, heartbeat as u32) as u16,
        };
        *lock(&self.negotiated) = negotiated;

        self.hand_connection_reply(connection_method::TUNE, None);
    }

    fn dispatch_channel_flow(&self, channel: u16, active: bool) {
        self.touch_heartbeat();
        if let Some(ch) = self.try_channel(channel) {
            ch.on_flow(active);
        }
    }

    fn dispatch_blocked(&self, reason: String) {
        self.touch_heartbeat();
        log_info!(SRC, "broker blocked publishing: {}", reason);
        self.blocked.store(true, Ordering::Release);
    }

    fn dispatch_unblocked(&self) {
        self.touch_heartbeat();
        log_info!(SRC, "broker unblocked publishing");
        self.blocked.store(false, Ordering::Release);
    }

    fn dispatch_heartbeat(&self) {
        self.touch_heartbeat();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Best effort; an already-closed connection makes this a no-op
        if !self.io.endpoint.is_disposed() {
            self.teardown();
        }
    }
}

/// Zero means "no limit stated"; otherwise the stricter side wins
fn pick_limit(ours: u32, theirs: u32) -> u32 {
    match (ours, theirs) {
        (0, t) => t,
        (o, 0) => o,
        (o, t) => o.min(t),
    }
}

/// PLAIN mechanism response: NUL user NUL password
fn sasl_plain(username: &str, password: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(username.len() + password.len() + 2);
    out.push(0);
    out.extend_from_slice(username.as_bytes());
    out.push(0);
    out.extend_from_slice(password.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_limit() {
        assert_eq!(pick_limit(0, 2047), 2047);
        assert_eq!(pick_limit(256, 0), 256);
        assert_eq!(pick_limit(256, 2047), 256);
        assert_eq!(pick_limit(4096, 2047), 2047);
    }

    #[test]
    fn test_sasl_plain_layout() {
        assert_eq!(sasl_plain("guest", "secret"), b"\0guest\0secret");
    }
}
