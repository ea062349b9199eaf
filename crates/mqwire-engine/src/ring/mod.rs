//! SPSC ring buffer with reading gates and stream adapters

mod buffer;
mod gate;
mod stream;

pub use buffer::RingBuffer;
pub use gate::ReadingGate;
pub use stream::{RingByteReader, RingByteWriter};
