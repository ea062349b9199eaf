//! Error types for the mqwire engine

use core::fmt;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Broker-reported protocol error decoded from a close method frame.
///
/// `class_id`/`method_id` identify the offending method (zero when the
/// error is not tied to a specific method). A default-constructed value
/// with only `reply_text` set is used for synthetic errors built from
/// local faults.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProtocolError {
    /// Class id of the method that caused the error (0 = none)
    pub class_id: u16,
    /// Method id of the method that caused the error (0 = none)
    pub method_id: u16,
    /// Protocol reply code (e.g. 320 connection-forced)
    pub reply_code: u16,
    /// Human readable reply text
    pub reply_text: String,
}

impl ProtocolError {
    /// Synthetic error carrying only a message (local faults, watchdogs)
    pub fn synthetic(reply_text: impl Into<String>) -> Self {
        ProtocolError {
            reply_text: reply_text.into(),
            ..ProtocolError::default()
        }
    }

    /// True if this error points at the given class/method pair
    #[inline]
    pub fn matches(&self, class_id: u16, method_id: u16) -> bool {
        self.class_id == class_id && self.method_id == method_id
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "protocol error {}: {} (class {} method {})",
            self.reply_code, self.reply_text, self.class_id, self.method_id
        )
    }
}

/// Errors that can occur in engine operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Operation was cancelled via CancellationToken
    Cancelled,

    /// Operation timed out
    Timeout,

    /// Ring buffer / transport has been stopped
    Stopped,

    /// Connection or channel closed without a specific error
    Closed,

    /// No more channel numbers available
    ChannelLimit,

    /// Broker-reported protocol error
    Protocol(ProtocolError),

    /// Reply did not match any expected outcome for the pending command
    UnexpectedReply {
        /// Class id of the reply actually received
        class_id: u16,
        /// Method id of the reply actually received
        method_id: u16,
    },

    /// Local I/O fault during read/write
    Io(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Cancelled => write!(f, "operation cancelled"),
            EngineError::Timeout => write!(f, "operation timed out"),
            EngineError::Stopped => write!(f, "transport stopped"),
            EngineError::Closed => write!(f, "connection closed"),
            EngineError::ChannelLimit => write!(f, "exceeded channel limits"),
            EngineError::Protocol(e) => write!(f, "{}", e),
            EngineError::UnexpectedReply {
                class_id,
                method_id,
            } => write!(
                f,
                "unexpected reply from the server: class {} method {}",
                class_id, method_id
            ),
            EngineError::Io(msg) => write!(f, "io error: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ProtocolError> for EngineError {
    fn from(e: ProtocolError) -> Self {
        EngineError::Protocol(e)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_matches() {
        let err = ProtocolError {
            class_id: 60,
            method_id: 40,
            reply_code: 404,
            reply_text: "NOT_FOUND".into(),
        };
        assert!(err.matches(60, 40));
        assert!(!err.matches(60, 41));
    }

    #[test]
    fn test_synthetic_error() {
        let err = ProtocolError::synthetic("disconnected");
        assert_eq!(err.class_id, 0);
        assert_eq!(err.reply_code, 0);
        assert_eq!(err.reply_text, "disconnected");
    }

    #[test]
    fn test_display() {
        let e = EngineError::UnexpectedReply {
            class_id: 10,
            method_id: 41,
        };
        assert!(e.to_string().contains("class 10 method 41"));
    }
}
