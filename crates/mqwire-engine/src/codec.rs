//! Frame codec over plain byte streams
//!
//! Frame layout: `[type u8][channel u16][size u32][payload][0xCE]`, all
//! integers big-endian. Method payloads start with the class and method
//! ids; heartbeats carry no payload; the greeting is the raw protocol
//! preamble with no frame envelope.

use std::io::{self, Read, Write};

use mqwire_core::command::FramePayload;
use mqwire_core::error::{EngineError, EngineResult, ProtocolError};
use mqwire_core::frame::{self, channel_method, connection_method, frame_type, FRAME_END};
use mqwire_core::log_trace;

use crate::transport::{FrameDispatcher, FrameSink, FrameSource};

/// Protocol preamble sent before any frame
pub const PROTOCOL_HEADER: &[u8; 8] = b"AMQP\x00\x00\x09\x01";

/// Largest frame payload the reader will accept before declaring the
/// stream corrupt
const MAX_FRAME_PAYLOAD: u32 = 16 * 1024 * 1024;

fn map_io(e: io::Error) -> EngineError {
    match e.kind() {
        io::ErrorKind::ConnectionAborted => EngineError::Cancelled,
        io::ErrorKind::BrokenPipe => EngineError::Stopped,
        io::ErrorKind::UnexpectedEof => EngineError::Closed,
        _ => EngineError::Io(e.to_string()),
    }
}

// ---- encoding ----

/// `FrameSink` over any `io::Write`
pub struct FrameWriter<W> {
    out: W,
    scratch: Vec<u8>,
}

impl<W: Write + Send> FrameWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            scratch: Vec::with_capacity(512),
        }
    }

    fn write_method_frame(&mut self, channel: u16) -> EngineResult<()> {
        let mut header = [0u8; 7];
        header[0] = frame_type::METHOD;
        header[1..3].copy_from_slice(&channel.to_be_bytes());
        header[3..7].copy_from_slice(&(self.scratch.len() as u32).to_be_bytes());
        self.out.write_all(&header).map_err(map_io)?;
        self.out.write_all(&self.scratch).map_err(map_io)?;
        self.out.write_all(&[FRAME_END]).map_err(map_io)
    }
}

impl<W: Write + Send> FrameSink for FrameWriter<W> {
    fn write_frame(
        &mut self,
        channel: u16,
        class_id: u16,
        method_id: u16,
        payload: &FramePayload,
    ) -> EngineResult<()> {
        match payload {
            FramePayload::Greeting => {
                return self.out.write_all(PROTOCOL_HEADER).map_err(map_io);
            }
            FramePayload::Heartbeat => {
                let mut buf = [0u8; 8];
                buf[0] = frame_type::HEARTBEAT;
                buf[1..3].copy_from_slice(&channel.to_be_bytes());
                // size stays zero
                buf[7] = FRAME_END;
                return self.out.write_all(&buf).map_err(map_io);
            }
            _ => {}
        }

        self.scratch.clear();
        put_u16(&mut self.scratch, class_id);
        put_u16(&mut self.scratch, method_id);

        match payload {
            FramePayload::StartOk {
                client_properties,
                mechanism,
                response,
                locale,
            } => {
                put_u16(&mut self.scratch, client_properties.len() as u16);
                for (key, value) in client_properties {
                    put_shortstr(&mut self.scratch, key);
                    put_longstr(&mut self.scratch, value.as_bytes());
                }
                put_shortstr(&mut self.scratch, mechanism);
                put_longstr(&mut self.scratch, response);
                put_shortstr(&mut self.scratch, locale);
            }
            FramePayload::TuneOk {
                channel_max,
                frame_max,
                heartbeat,
            } => {
                put_u16(&mut self.scratch, *channel_max);
                put_u32(&mut self.scratch, *frame_max);
                put_u16(&mut self.scratch, *heartbeat);
            }
            FramePayload::Open { vhost } => {
                put_shortstr(&mut self.scratch, vhost);
                put_shortstr(&mut self.scratch, "");
                self.scratch.push(0);
            }
            FramePayload::ConnectionClose {
                reply_code,
                reply_text,
            }
            | FramePayload::ChannelClose {
                reply_code,
                reply_text,
            } => {
                put_u16(&mut self.scratch, *reply_code);
                put_shortstr(&mut self.scratch, reply_text);
                put_u16(&mut self.scratch, 0);
                put_u16(&mut self.scratch, 0);
            }
            FramePayload::ConnectionCloseOk | FramePayload::ChannelCloseOk => {}
            FramePayload::ChannelOpen => put_shortstr(&mut self.scratch, ""),
            FramePayload::ChannelFlowOk { active } => self.scratch.push(*active as u8),
            FramePayload::Method(args) => self.scratch.extend_from_slice(args),
            FramePayload::Greeting | FramePayload::Heartbeat => unreachable!(),
        }

        self.write_method_frame(channel)
    }

    fn flush(&mut self) -> EngineResult<()> {
        self.out.flush().map_err(map_io)
    }
}

pub fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

/// Length-prefixed short string (u8 length, truncated at 255 bytes)
pub fn put_shortstr(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(255);
    buf.push(len as u8);
    buf.extend_from_slice(&bytes[..len]);
}

/// Length-prefixed long string (u32 length)
pub fn put_longstr(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(buf, bytes.len() as u32);
    buf.extend_from_slice(bytes);
}

// ---- decoding ----

/// `FrameSource` over any `io::Read`
pub struct FrameReader<R> {
    input: R,
    payload: Vec<u8>,
}

impl<R: Read + Send> FrameReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            payload: Vec::with_capacity(512),
        }
    }
}

impl<R: Read + Send> FrameSource for FrameReader<R> {
    fn read_frame(&mut self, dispatcher: &dyn FrameDispatcher) -> EngineResult<()> {
        let mut header = [0u8; 7];
        self.input.read_exact(&mut header).map_err(map_io)?;

        let ftype = header[0];
        let channel = u16::from_be_bytes([header[1], header[2]]);
        let size = u32::from_be_bytes([header[3], header[4], header[5], header[6]]);
        if size > MAX_FRAME_PAYLOAD {
            return Err(corrupt(format!("frame payload of {} bytes", size)));
        }

        self.payload.resize(size as usize, 0);
        self.input.read_exact(&mut self.payload).map_err(map_io)?;

        let mut end = [0u8; 1];
        self.input.read_exact(&mut end).map_err(map_io)?;
        if end[0] != FRAME_END {
            return Err(corrupt(format!("frame end octet {:#x}", end[0])));
        }

        match ftype {
            frame_type::HEARTBEAT => {
                dispatcher.dispatch_heartbeat();
                Ok(())
            }
            frame_type::METHOD => dispatch_method_frame(&self.payload, channel, dispatcher),
            frame_type::HEADER | frame_type::BODY => {
                // content frames are opaque to the engine
                log_trace!("mqwire::codec", "skipping content frame type {}", ftype);
                Ok(())
            }
            other => Err(corrupt(format!("frame type {}", other))),
        }
    }
}

fn dispatch_method_frame(
    payload: &[u8],
    channel: u16,
    dispatcher: &dyn FrameDispatcher,
) -> EngineResult<()> {
    let mut args = Decoder::new(payload);
    let class_id = args.get_u16()?;
    let method_id = args.get_u16()?;
    let cmid = frame::class_method(class_id, method_id);

    match cmid {
        connection_method::CLOSE | channel_method::CLOSE => {
            let error = decode_close_body(&mut args)?;
            dispatcher.dispatch_method(channel, cmid, Some(error));
        }
        connection_method::TUNE => {
            let channel_max = args.get_u16()?;
            let frame_max = args.get_u32()?;
            let heartbeat = args.get_u16()?;
            dispatcher.dispatch_tune(channel_max, frame_max, heartbeat);
        }
        channel_method::FLOW => {
            let active = args.get_u8()? != 0;
            dispatcher.dispatch_channel_flow(channel, active);
        }
        connection_method::BLOCKED => {
            let reason = args.get_shortstr()?;
            dispatcher.dispatch_blocked(reason);
        }
        connection_method::UNBLOCKED => dispatcher.dispatch_unblocked(),
        _ => dispatcher.dispatch_method(channel, cmid, None),
    }
    Ok(())
}

fn decode_close_body(args: &mut Decoder<'_>) -> EngineResult<ProtocolError> {
    let reply_code = args.get_u16()?;
    let reply_text = args.get_shortstr()?;
    let class_id = args.get_u16()?;
    let method_id = args.get_u16()?;
    Ok(ProtocolError {
        class_id,
        method_id,
        reply_code,
        reply_text,
    })
}

fn corrupt(what: String) -> EngineError {
    EngineError::Io(format!("corrupt frame stream: {}", what))
}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> EngineResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(corrupt("truncated method arguments".into()));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn get_u8(&mut self) -> EngineResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn get_u16(&mut self) -> EngineResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn get_u32(&mut self) -> EngineResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn get_shortstr(&mut self) -> EngineResult<String> {
        let len = self.get_u8()? as usize;
        let b = self.take(len)?;
        Ok(String::from_utf8_lossy(b).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, PartialEq)]
    enum Seen {
        Method(u16, u32, Option<ProtocolError>),
        Tune(u16, u32, u16),
        Flow(u16, bool),
        Blocked(String),
        Unblocked,
        Heartbeat,
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Seen>>,
    }

    impl FrameDispatcher for Recorder {
        fn dispatch_method(&self, channel: u16, cmid: u32, error: Option<ProtocolError>) {
            self.seen.lock().unwrap().push(Seen::Method(channel, cmid, error));
        }
        fn dispatch_tune(&self, channel_max: u16, frame_max: u32, heartbeat: u16) {
            self.seen
                .lock()
                .unwrap()
                .push(Seen::Tune(channel_max, frame_max, heartbeat));
        }
        fn dispatch_channel_flow(&self, channel: u16, active: bool) {
            self.seen.lock().unwrap().push(Seen::Flow(channel, active));
        }
        fn dispatch_blocked(&self, reason: String) {
            self.seen.lock().unwrap().push(Seen::Blocked(reason));
        }
        fn dispatch_unblocked(&self) {
            self.seen.lock().unwrap().push(Seen::Unblocked);
        }
        fn dispatch_heartbeat(&self) {
            self.seen.lock().unwrap().push(Seen::Heartbeat);
        }
    }

    fn decode_all(bytes: Vec<u8>, frames: usize) -> Vec<Seen> {
        let recorder = Recorder::default();
        let mut reader = FrameReader::new(io::Cursor::new(bytes));
        for _ in 0..frames {
            reader.read_frame(&recorder).unwrap();
        }
        recorder.seen.into_inner().unwrap()
    }

    #[test]
    fn test_heartbeat_round_trip() {
        let mut out = Vec::new();
        let mut writer = FrameWriter::new(&mut out);
        writer
            .write_frame(0, 0, 0, &FramePayload::Heartbeat)
            .unwrap();
        assert_eq!(out.len(), 8);

        assert_eq!(decode_all(out, 1), vec![Seen::Heartbeat]);
    }

    #[test]
    fn test_close_body_decodes_to_protocol_error() {
        let mut out = Vec::new();
        let mut writer = FrameWriter::new(&mut out);
        writer
            .write_frame(
                0,
                10,
                50,
                &FramePayload::ConnectionClose {
                    reply_code: 320,
                    reply_text: "CONNECTION_FORCED".into(),
                },
            )
            .unwrap();

        let seen = decode_all(out, 1);
        match &seen[0] {
            Seen::Method(0, cmid, Some(err)) => {
                assert_eq!(*cmid, connection_method::CLOSE);
                assert_eq!(err.reply_code, 320);
                assert_eq!(err.reply_text, "CONNECTION_FORCED");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_tune_dispatches_limits() {
        let mut body = Vec::new();
        put_u16(&mut body, 1024);
        put_u32(&mut body, 4096);
        put_u16(&mut body, 30);

        let mut out = Vec::new();
        let mut writer = FrameWriter::new(&mut out);
        writer
            .write_frame(0, 10, 30, &FramePayload::Method(body))
            .unwrap();

        assert_eq!(decode_all(out, 1), vec![Seen::Tune(1024, 4096, 30)]);
    }

    #[test]
    fn test_opaque_method_passes_through() {
        let mut out = Vec::new();
        let mut writer = FrameWriter::new(&mut out);
        writer
            .write_frame(7, 60, 40, &FramePayload::Method(vec![1, 2, 3]))
            .unwrap();

        assert_eq!(
            decode_all(out, 1),
            vec![Seen::Method(7, frame::class_method(60, 40), None)]
        );
    }

    #[test]
    fn test_flow_and_blocked() {
        let mut out = Vec::new();
        let mut writer = FrameWriter::new(&mut out);

        let mut flow = Vec::new();
        flow.push(0u8);
        writer
            .write_frame(3, 20, 20, &FramePayload::Method(flow))
            .unwrap();

        let mut blocked = Vec::new();
        put_shortstr(&mut blocked, "low on memory");
        writer
            .write_frame(0, 10, 60, &FramePayload::Method(blocked))
            .unwrap();

        assert_eq!(
            decode_all(out, 2),
            vec![Seen::Flow(3, false), Seen::Blocked("low on memory".into())]
        );
    }

    #[test]
    fn test_bad_end_octet_is_an_error() {
        let mut out = Vec::new();
        let mut writer = FrameWriter::new(&mut out);
        writer
            .write_frame(0, 10, 51, &FramePayload::ConnectionCloseOk)
            .unwrap();
        let last = out.len() - 1;
        out[last] = 0x00;

        let recorder = Recorder::default();
        let mut reader = FrameReader::new(io::Cursor::new(out));
        assert!(matches!(
            reader.read_frame(&recorder),
            Err(EngineError::Io(_))
        ));
    }

    #[test]
    fn test_greeting_is_raw_preamble() {
        let mut out = Vec::new();
        let mut writer = FrameWriter::new(&mut out);
        writer.write_frame(0, 0, 0, &FramePayload::Greeting).unwrap();
        assert_eq!(&out, PROTOCOL_HEADER);
    }
}
