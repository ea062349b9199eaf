//! # mqwire-engine
//!
//! The moving parts of the mqwire broker client: the SPSC ring buffers
//! frames travel through, the connection/channel protocol engine with its
//! writer and reader loops, the frame codec, the heartbeat watchdog and
//! the recovery hook.
//!
//! ## Threading model
//!
//! Four threads per connection: a writer loop draining the command
//! outbox into the outbound ring, a reader loop decoding frames from the
//! inbound ring, and two pumps moving raw bytes between the rings and the
//! transport. User threads only enqueue commands and block on
//! completions.

#![allow(dead_code)]

pub mod codec;
pub mod config;
pub mod connection;
pub mod io;
pub mod recovery;
pub mod ring;
pub mod transport;

mod heartbeat;

pub use codec::{FrameReader, FrameWriter, PROTOCOL_HEADER};
pub use config::ConnectionConfig;
pub use connection::{Connection, Negotiated};
pub use io::ChannelIo;
pub use recovery::{NullRecovery, RecoveryAction, RecoveryHandler};
pub use ring::{ReadingGate, RingBuffer, RingByteReader, RingByteWriter};
pub use transport::{FrameDispatcher, FrameSink, FrameSource, Transport, TransportParts};
