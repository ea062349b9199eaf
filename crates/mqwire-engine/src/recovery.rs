//! Recovery hook
//!
//! The connection reports close events to a `RecoveryHandler` and acts on
//! its verdict: `WillReconnect` parks the ring buffers instead of tearing
//! them down, so the handler can later reattach a fresh transport via
//! `Connection::reconnect`.

use mqwire_core::error::ProtocolError;

/// Verdict returned from the close notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Tear the connection down for good
    NoAction,
    /// Keep resources parked; the handler will reconnect
    WillReconnect,
}

/// Observer for connection lifecycle events
pub trait RecoveryHandler: Send + Sync {
    /// The transport dropped or a loop faulted
    fn notify_abrupt_close(&self, error: &ProtocolError) -> RecoveryAction;

    /// The broker sent connection.close
    fn notify_close_by_server(&self, error: &ProtocolError) -> RecoveryAction;

    /// The user asked for a clean close; informational only
    fn notify_close_by_user(&self) {}

    /// A connect or reconnect handshake finished
    fn notify_connected(&self) {}
}

/// Default handler: never reconnects
pub struct NullRecovery;

impl RecoveryHandler for NullRecovery {
    fn notify_abrupt_close(&self, _error: &ProtocolError) -> RecoveryAction {
        RecoveryAction::NoAction
    }

    fn notify_close_by_server(&self, _error: &ProtocolError) -> RecoveryAction {
        RecoveryAction::NoAction
    }
}
