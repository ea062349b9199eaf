//! Frame and method identifiers for the wire protocol
//!
//! A method frame header carries a (class id, method id) pair. The engine
//! dispatches on the packed form `class << 16 | method`, same as the wire
//! layout, so packing/unpacking helpers live here alongside the constants
//! the close state machine needs to recognize.

/// Frame type octets
pub mod frame_type {
    /// Method frame
    pub const METHOD: u8 = 1;
    /// Content header frame
    pub const HEADER: u8 = 2;
    /// Content body frame
    pub const BODY: u8 = 3;
    /// Heartbeat frame
    pub const HEARTBEAT: u8 = 8;
}

/// Frame-end sentinel octet
pub const FRAME_END: u8 = 0xCE;

/// Reply code sent on a normal, locally initiated close
pub const REPLY_SUCCESS: u16 = 200;

/// Connection class id
pub const CONNECTION_CLASS: u16 = 10;
/// Channel class id
pub const CHANNEL_CLASS: u16 = 20;

/// Pack a class/method pair into the dispatch identifier
#[inline]
pub const fn class_method(class_id: u16, method_id: u16) -> u32 {
    ((class_id as u32) << 16) | method_id as u32
}

/// Class id half of a packed identifier
#[inline]
pub const fn class_of(class_method_id: u32) -> u16 {
    (class_method_id >> 16) as u16
}

/// Method id half of a packed identifier
#[inline]
pub const fn method_of(class_method_id: u32) -> u16 {
    (class_method_id & 0xFFFF) as u16
}

/// Packed connection-level method identifiers
pub mod connection_method {
    use super::class_method;

    pub const START: u32 = class_method(10, 10);
    pub const START_OK: u32 = class_method(10, 11);
    pub const TUNE: u32 = class_method(10, 30);
    pub const TUNE_OK: u32 = class_method(10, 31);
    pub const OPEN: u32 = class_method(10, 40);
    pub const OPEN_OK: u32 = class_method(10, 41);
    pub const CLOSE: u32 = class_method(10, 50);
    pub const CLOSE_OK: u32 = class_method(10, 51);
    pub const BLOCKED: u32 = class_method(10, 60);
    pub const UNBLOCKED: u32 = class_method(10, 61);
}

/// Packed channel-level method identifiers
pub mod channel_method {
    use super::class_method;

    pub const OPEN: u32 = class_method(20, 10);
    pub const OPEN_OK: u32 = class_method(20, 11);
    pub const FLOW: u32 = class_method(20, 20);
    pub const FLOW_OK: u32 = class_method(20, 21);
    pub const CLOSE: u32 = class_method(20, 40);
    pub const CLOSE_OK: u32 = class_method(20, 41);
}

/// True for the four close/close-ok methods that must bypass the sticky
/// error fence so a close handshake can complete.
#[inline]
pub fn is_close_method(class_method_id: u32) -> bool {
    matches!(
        class_method_id,
        connection_method::CLOSE
            | connection_method::CLOSE_OK
            | channel_method::CLOSE
            | channel_method::CLOSE_OK
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack() {
        let id = class_method(60, 40);
        assert_eq!(class_of(id), 60);
        assert_eq!(method_of(id), 40);
    }

    #[test]
    fn test_close_methods_recognized() {
        assert!(is_close_method(connection_method::CLOSE));
        assert!(is_close_method(connection_method::CLOSE_OK));
        assert!(is_close_method(channel_method::CLOSE));
        assert!(is_close_method(channel_method::CLOSE_OK));
        assert!(!is_close_method(connection_method::OPEN));
        assert!(!is_close_method(channel_method::FLOW));
    }
}
