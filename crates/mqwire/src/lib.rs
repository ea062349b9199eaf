//! # mqwire
//!
//! Client engine for an AMQP-style message broker: a lock-free SPSC ring
//! buffer carries serialized frames between the protocol loops and the
//! transport, commands resolve through one-shot completions, and the
//! connection drives the handshake, heartbeats and the close state
//! machines.
//!
//! ```no_run
//! use mqwire::{Connection, ConnectionConfig};
//! use std::net::TcpStream;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let socket = TcpStream::connect("127.0.0.1:5672")?;
//! let conn = Connection::connect(Box::new(socket), ConnectionConfig::from_env())?;
//! let channel = conn.create_channel()?;
//! // ... issue methods on the channel ...
//! channel.close();
//! conn.close();
//! # Ok(())
//! # }
//! ```

pub use mqwire_core::{
    cancel::CancellationToken,
    command::{Command, Completion, FramePayload},
    error::{EngineError, EngineResult, ProtocolError},
    frame, log,
    semaphore::Semaphore,
    signal::AutoResetSignal,
};

pub use mqwire_engine::{
    ChannelIo, Connection, ConnectionConfig, FrameDispatcher, FrameReader, FrameSink,
    FrameSource, FrameWriter, Negotiated, NullRecovery, ReadingGate, RecoveryAction,
    RecoveryHandler, RingBuffer, RingByteReader, RingByteWriter, Transport, TransportParts,
};
