//! Blocking byte-stream adapters over the ring
//!
//! The writer loop serializes frames into the outbound ring through
//! `RingByteWriter`; the socket pump drains it from the other side
//! through `RingByteReader` (and vice versa for the inbound ring).
//! Both block on the ring's signals when the ring is full/empty and
//! observe cancellation and teardown.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use mqwire_core::CancellationToken;

use super::RingBuffer;

fn stream_error(kind: io::ErrorKind, what: &str) -> io::Error {
    io::Error::new(kind, what.to_string())
}

/// Producer side of a ring as `io::Write`
pub struct RingByteWriter {
    ring: Arc<RingBuffer>,
    cancel: CancellationToken,
    park: Duration,
}

impl RingByteWriter {
    pub fn new(ring: Arc<RingBuffer>, cancel: CancellationToken, park: Duration) -> Self {
        Self { ring, cancel, park }
    }
}

impl io::Write for RingByteWriter {
    /// Blocks until at least one byte fits; short writes happen at the
    /// buffer edge.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            // Cancellation must be a kind the std read_exact/write_all
            // helpers do not retry, or a blocked caller spins forever.
            if self.cancel.is_cancelled() {
                return Err(stream_error(io::ErrorKind::ConnectionAborted, "cancelled"));
            }
            if self.ring.is_stopped() {
                return Err(stream_error(io::ErrorKind::BrokenPipe, "ring stopped"));
            }

            let (pos, avail) = self.ring.space_to_write(buf.len() as u32);
            if avail > 0 {
                self.ring.write_at(pos, &buf[..avail as usize]);
                self.ring.advance_write(avail);
                return Ok(avail as usize);
            }

            // Full: park until the reader frees space. A teardown releases
            // the wait and the top of the loop reports it.
            self.ring.space_freed().wait(Some(self.park));
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Consumer side of a ring as `io::Read`
pub struct RingByteReader {
    ring: Arc<RingBuffer>,
    cancel: CancellationToken,
    park: Duration,
}

impl RingByteReader {
    pub fn new(ring: Arc<RingBuffer>, cancel: CancellationToken, park: Duration) -> Self {
        Self { ring, cancel, park }
    }

    /// Bytes published but not yet consumed
    pub fn has_unread(&self) -> bool {
        self.ring.has_unread()
    }
}

impl io::Read for RingByteReader {
    /// Blocks until at least one byte is readable; short reads happen at
    /// the buffer edge.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.cancel.is_cancelled() {
                return Err(stream_error(io::ErrorKind::ConnectionAborted, "cancelled"));
            }
            if self.ring.is_stopped() {
                return Err(stream_error(io::ErrorKind::BrokenPipe, "ring stopped"));
            }

            let (pos, avail) = self.ring.space_to_read(buf.len() as u32);
            if avail > 0 {
                self.ring.read_at(pos, &mut buf[..avail as usize]);
                self.ring.advance_read(avail);
                return Ok(avail as usize);
            }

            self.ring.data_ready().wait(Some(self.park));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::thread;

    fn pair(size: u32) -> (RingByteWriter, RingByteReader, Arc<RingBuffer>) {
        let ring = Arc::new(RingBuffer::new(size));
        let cancel = CancellationToken::new();
        (
            RingByteWriter::new(ring.clone(), cancel.clone(), Duration::from_millis(20)),
            RingByteReader::new(ring.clone(), cancel, Duration::from_millis(20)),
            ring,
        )
    }

    #[test]
    fn test_stream_round_trip_across_threads() {
        let (mut writer, mut reader, _ring) = pair(64);
        let payload: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let expected = payload.clone();

        let producer = thread::spawn(move || {
            writer.write_all(&payload).unwrap();
        });

        let mut out = vec![0u8; expected.len()];
        reader.read_exact(&mut out).unwrap();
        assert_eq!(out, expected);

        producer.join().unwrap();
    }

    #[test]
    fn test_blocked_writer_unblocks_when_reader_drains() {
        let (mut writer, mut reader, _ring) = pair(16);

        // more than fits; the writer must block until drained
        let producer = thread::spawn(move || writer.write_all(&[3u8; 40]).is_ok());

        thread::sleep(Duration::from_millis(30));
        let mut out = vec![0u8; 40];
        reader.read_exact(&mut out).unwrap();

        assert!(producer.join().unwrap());
        assert!(out.iter().all(|&b| b == 3));
    }

    #[test]
    fn test_cancel_aborts_blocked_reader() {
        let ring = Arc::new(RingBuffer::new(16));
        let cancel = CancellationToken::new();
        let mut reader =
            RingByteReader::new(ring, cancel.clone(), Duration::from_millis(5));

        let consumer = thread::spawn(move || {
            let mut buf = [0u8; 4];
            reader.read(&mut buf)
        });

        thread::sleep(Duration::from_millis(20));
        cancel.cancel();

        let err = consumer.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[test]
    fn test_cancel_fails_read_exact_from_another_thread() {
        let ring = Arc::new(RingBuffer::new(16));
        let cancel = CancellationToken::new();
        let mut reader =
            RingByteReader::new(ring, cancel.clone(), Duration::from_millis(5));

        // read_exact retries Interrupted internally, so cancellation has
        // to surface as a kind it passes through
        let consumer = thread::spawn(move || {
            let mut buf = [0u8; 7];
            reader.read_exact(&mut buf)
        });

        thread::sleep(Duration::from_millis(20));
        cancel.cancel();

        assert!(consumer.join().unwrap().is_err());
    }

    #[test]
    fn test_cancel_fails_write_all_on_full_ring() {
        let ring = Arc::new(RingBuffer::new(16));
        let cancel = CancellationToken::new();
        let mut writer =
            RingByteWriter::new(ring, cancel.clone(), Duration::from_millis(5));

        let producer = thread::spawn(move || writer.write_all(&[9u8; 64]));

        thread::sleep(Duration::from_millis(20));
        cancel.cancel();

        assert!(producer.join().unwrap().is_err());
    }

    #[test]
    fn test_stopped_ring_reports_broken_pipe() {
        let (mut writer, mut reader, ring) = pair(16);
        ring.stop_and_block(Duration::from_millis(1));

        assert_eq!(
            writer.write(&[1]).unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
        let mut buf = [0u8; 1];
        assert_eq!(
            reader.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
    }
}
