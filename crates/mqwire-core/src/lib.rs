//! # mqwire-core
//!
//! Core types and synchronization primitives for the mqwire broker
//! client. This crate is platform-agnostic and has no I/O of its own;
//! everything that touches threads-plus-transport lives in
//! `mqwire-engine`.
//!
//! ## Modules
//!
//! - `error` - Engine and protocol error types
//! - `frame` - Frame/method identifier constants and packing
//! - `command` - Outbound commands and one-shot completions
//! - `signal` - Hybrid spin/block auto-resetting signal
//! - `semaphore` - Counting semaphore (reading-gate permits)
//! - `cancel` - Cancellation token for cooperative cancellation
//! - `env` - Environment variable utilities
//! - `log` - Leveled stderr logging macros

#![allow(dead_code)]

pub mod cancel;
pub mod command;
pub mod env;
pub mod error;
pub mod frame;
pub mod log;
pub mod semaphore;
pub mod signal;

// Re-exports for convenience
pub use cancel::CancellationToken;
pub use command::{Command, Completion, FramePayload, ReplyAction};
pub use error::{EngineError, EngineResult, ProtocolError};
pub use semaphore::Semaphore;
pub use signal::AutoResetSignal;

/// Shared layout constants
pub mod constants {
    /// Cache line size for alignment/padding of hot atomics
    pub const CACHE_LINE_SIZE: usize = 64;

    /// Maximum concurrently active reading gates on a ring buffer
    pub const MAX_READING_GATES: usize = 64;
}
