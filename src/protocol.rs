// Copyright 2020 Joyent, Inc.

//! Message reassembly.
//!
//! A [`FrameReassembler`] turns arbitrary byte chunks read from one remote
//! peer into complete messages. It walks the configured wire layout
//!
//! ```text
//!   [header]? [message id]? [body] [message id]? [body] ... [header]? ...
//! ```
//!
//! and never fails: malformed input is logged and discarded at packet
//! granularity so that a misbehaving device cannot stall the stream.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder as _};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;
use slog::{debug, o, trace, warn, Drain, Logger};
use tokio_util::codec::Decoder;

use crate::catalog::{MessageCatalog, MessageCatalogEntry};
use crate::config::{ByteOrder, LengthMode, MessageIdType, ProtocolConfig};
use crate::error::Result;
use crate::header::HeaderCodec;

/// Size of the metadata prefix of the canonical message encoding.
pub const RAW_PREFIX_SZ: usize = 16;

const RAW_OFF_KEY: usize = 0x0;
const RAW_OFF_HEADER_TS: usize = 0x8;
const RAW_OFF_PAYLOAD: usize = RAW_PREFIX_SZ;

/// One complete message plus its arrival metadata.
///
/// The canonical encoding, used for queue files and replication, is
///
/// * KEY      8 bytes, big-endian `receive_timestamp << 16 | sequence_number`
/// * HDRTS    8 bytes, big-endian header timestamp
/// * PAYLOAD  remaining bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Wall clock milliseconds at which the first byte of the packet arrived.
    pub receive_timestamp: i64,
    /// Timestamp carried by the header, 0 without a header.
    pub header_timestamp: u32,
    pub sequence_number: u16,
    pub payload: Bytes,
}

impl RawMessage {
    /// The 8-byte identity used to match queue entries across nodes.
    pub fn key(&self) -> u64 {
        ((self.receive_timestamp as u64) << 16) | u64::from(self.sequence_number)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RAW_PREFIX_SZ + self.payload.len());
        buf.put_u64(self.key());
        buf.put_u64(u64::from(self.header_timestamp));
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn parse(buf: &[u8]) -> io::Result<RawMessage> {
        let key = key_of(buf).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                "Unable to parse message: not enough bytes",
            )
        })?;
        let header_ts = BigEndian::read_u64(&buf[RAW_OFF_HEADER_TS..RAW_OFF_PAYLOAD]);

        Ok(RawMessage {
            receive_timestamp: (key as i64) >> 16,
            header_timestamp: header_ts as u32,
            sequence_number: key as u16,
            payload: Bytes::copy_from_slice(&buf[RAW_OFF_PAYLOAD..]),
        })
    }
}

/// Read the identity key straight out of an encoded message.
pub fn key_of(buf: &[u8]) -> Option<u64> {
    if buf.len() < RAW_PREFIX_SZ {
        None
    } else {
        Some(BigEndian::read_u64(&buf[RAW_OFF_KEY..RAW_OFF_HEADER_TS]))
    }
}

/// Something the reassembler wants the connection to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// A complete message for catalog entry `id`.
    Message { id: u16, message: RawMessage },
    /// Handshake bytes to send back to the peer right away.
    Reply(Bytes),
}

/// Immutable wire description shared by every reassembler of a driver.
#[derive(Debug, Clone)]
pub struct FrameFormat {
    pub header: Option<HeaderCodec>,
    pub catalog: Arc<MessageCatalog>,
    pub id_type: MessageIdType,
    pub order: ByteOrder,
    pub message_timeout: Option<Duration>,
    pub packet_timeout: Duration,
}

impl FrameFormat {
    pub fn from_config(config: &ProtocolConfig) -> Result<FrameFormat> {
        let header = match &config.header {
            Some(h) => Some(HeaderCodec::new(h, config.byte_order)?),
            None => None,
        };
        let message_timeout = if config.message_timeout_ms > 0 {
            Some(Duration::from_millis(config.message_timeout_ms))
        } else {
            None
        };

        Ok(FrameFormat {
            header,
            catalog: Arc::new(MessageCatalog::from_config(config)?),
            id_type: config.id_type,
            order: config.byte_order,
            message_timeout,
            packet_timeout: Duration::from_millis(config.packet_timeout_ms),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Header,
    /// Drop this many bytes, or everything received so far when `None`.
    Discard(Option<usize>),
    MessageId,
    Body,
}

pub struct FrameReassembler {
    format: Arc<FrameFormat>,
    log: Logger,

    phase: Phase,
    header_buf: BytesMut,
    id_buf: BytesMut,
    body_buf: BytesMut,
    entry: Option<Arc<MessageCatalogEntry>>,
    /// Body bytes still expected; `None` while reading an open-ended body.
    expected: Option<usize>,
    /// Bytes left in the current header-delimited packet.
    packet_remaining: Option<usize>,
    header_timestamp: u32,
    sequence_id: u16,
    handshake: Option<Bytes>,
    receive_timestamp: i64,
    started: Option<Instant>,
    deadline: Option<Instant>,
    ready: VecDeque<FrameEvent>,
}

impl FrameReassembler {
    pub fn new(format: Arc<FrameFormat>, log: Option<&Logger>) -> FrameReassembler {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let phase = start_phase(&format);
        let header_len = format.header.as_ref().map(|h| h.len()).unwrap_or(0);

        FrameReassembler {
            format,
            log,
            phase,
            header_buf: BytesMut::with_capacity(header_len),
            id_buf: BytesMut::with_capacity(2),
            body_buf: BytesMut::new(),
            entry: None,
            expected: None,
            packet_remaining: None,
            header_timestamp: 0,
            sequence_id: 0,
            handshake: None,
            receive_timestamp: 0,
            started: None,
            deadline: None,
            ready: VecDeque::new(),
        }
    }

    pub fn add_data(&mut self, data: &[u8]) -> Vec<FrameEvent> {
        self.add_data_at(data, Instant::now(), Utc::now().timestamp_millis())
    }

    /// Feed `data` that arrived at monotonic time `now` and wall clock
    /// `wall_ms`, returning whatever became complete.
    pub fn add_data_at(&mut self, data: &[u8], now: Instant, wall_ms: i64) -> Vec<FrameEvent> {
        self.feed(data, now, wall_ms);
        self.ready.drain(..).collect()
    }

    /// Completion deadline of an open-ended body, if one is armed.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Deliver an open-ended body whose completion timeout has passed. Safe to
    /// call at any time; does nothing unless the deadline really expired.
    pub fn expire(&mut self, now: Instant) -> Vec<FrameEvent> {
        match self.deadline {
            Some(deadline) if deadline <= now && self.phase == Phase::Body => {
                trace!(self.log, "packet timeout, delivering accumulated body";
                       "bytes" => self.body_buf.len());
                self.deliver();
            }
            _ => (),
        }
        self.ready.drain(..).collect()
    }

    /// Bytes still owed by the current packet (or being discarded).
    pub fn pending_bytes(&self) -> usize {
        match self.phase {
            Phase::Discard(Some(n)) => n,
            Phase::Body if self.packet_remaining.is_none() => self.expected.unwrap_or(0),
            _ => self.packet_remaining.unwrap_or(0),
        }
    }

    fn feed(&mut self, mut data: &[u8], now: Instant, wall_ms: i64) {
        if data.is_empty() {
            return;
        }
        self.check_stale(now);

        while !data.is_empty() {
            match self.phase {
                Phase::Header => {
                    let hlen = self.header_len();
                    if self.header_buf.is_empty() {
                        self.begin(now, wall_ms);
                    }
                    let take = (hlen - self.header_buf.len()).min(data.len());
                    self.header_buf.put_slice(&data[..take]);
                    data = &data[take..];
                    if self.header_buf.len() == hlen {
                        self.on_header();
                    }
                }
                Phase::Discard(None) => {
                    debug!(self.log, "discarding rest of received data";
                           "bytes" => data.len());
                    data = &[];
                    self.reset();
                }
                Phase::Discard(Some(n)) => {
                    let take = n.min(data.len());
                    data = &data[take..];
                    if take == n {
                        self.reset();
                    } else {
                        self.phase = Phase::Discard(Some(n - take));
                    }
                }
                Phase::MessageId => {
                    if self.format.header.is_none() && self.id_buf.is_empty() {
                        self.begin(now, wall_ms);
                    }
                    let need = self.format.id_type.byte_size() - self.id_buf.len();
                    let take = self.bounded(need.min(data.len()));
                    self.id_buf.put_slice(&data[..take]);
                    data = &data[take..];
                    self.consume(take);

                    if self.id_buf.len() == self.format.id_type.byte_size() {
                        self.on_message_id();
                    } else if self.packet_remaining == Some(0) {
                        warn!(self.log, "packet ended inside a message id");
                        self.reset();
                    }
                }
                Phase::Body => match self.expected {
                    Some(n) => {
                        let take = n.min(data.len());
                        self.body_buf.put_slice(&data[..take]);
                        data = &data[take..];
                        self.consume(take);
                        self.expected = Some(n - take);
                        if take == n {
                            self.deliver();
                        }
                    }
                    None => {
                        self.body_buf.put_slice(data);
                        data = &[];
                        self.deadline = Some(now + self.format.packet_timeout);
                    }
                },
            }
        }
    }

    fn header_len(&self) -> usize {
        self.format.header.as_ref().map(|h| h.len()).unwrap_or(0)
    }

    fn begin(&mut self, now: Instant, wall_ms: i64) {
        self.receive_timestamp = wall_ms;
        self.started = Some(now);
    }

    /// Clamp a read to what is left of the current packet.
    fn bounded(&self, n: usize) -> usize {
        match self.packet_remaining {
            Some(left) => n.min(left),
            None => n,
        }
    }

    fn consume(&mut self, n: usize) {
        if let Some(left) = self.packet_remaining.as_mut() {
            *left -= n;
        }
    }

    fn check_stale(&mut self, now: Instant) {
        let timeout = match self.format.message_timeout {
            Some(t) => t,
            None => return,
        };
        let started = match self.started {
            Some(s) => s,
            None => return,
        };
        if matches!(self.phase, Phase::Discard(_)) || self.deadline.is_some() {
            return;
        }
        if now.duration_since(started) > timeout {
            warn!(self.log, "partial message timed out, resetting";
                  "elapsed_ms" => now.duration_since(started).as_millis() as u64,
                  "pending" => self.pending_bytes());
            self.reset();
        }
    }

    fn on_header(&mut self) {
        let eval = match &self.format.header {
            Some(codec) => codec.evaluate(&self.header_buf),
            None => return,
        };
        let raw = self.header_buf.split();

        if !eval.valid {
            warn!(self.log, "invalid header";
                  "header" => format!("{:02x?}", &raw[..]),
                  "discard" => ?eval.packet_size);
            self.packet_remaining = None;
            self.phase = Phase::Discard(eval.packet_size);
            if eval.packet_size == Some(0) {
                self.reset();
            }
            return;
        }

        trace!(self.log, "header accepted";
               "packet_size" => ?eval.packet_size,
               "sequence" => eval.sequence_id);
        self.header_timestamp = eval.header_timestamp;
        self.sequence_id = eval.sequence_id;
        self.handshake = eval.handshake;
        self.packet_remaining = eval.packet_size;

        if self.packet_remaining == Some(0) {
            self.finish_packet();
        } else {
            self.phase = Phase::MessageId;
        }
    }

    fn on_message_id(&mut self) {
        let entry = match self.format.id_type {
            MessageIdType::None => self.format.catalog.sole().cloned(),
            MessageIdType::Byte => self.format.catalog.get(u16::from(self.id_buf[0])).cloned(),
            MessageIdType::Word => {
                let id = self.format.order.read_u16(&self.id_buf);
                self.format.catalog.get(id).cloned()
            }
        };

        let entry = match entry {
            Some(e) => e,
            None => {
                warn!(self.log, "unknown message id";
                      "id" => format!("{:02x?}", &self.id_buf[..]),
                      "discard" => ?self.packet_remaining);
                self.discard_packet();
                return;
            }
        };
        self.id_buf.clear();

        let expected = match entry.length_mode {
            LengthMode::Fixed => Some(entry.fixed_length),
            LengthMode::Variable | LengthMode::PacketBased => self.packet_remaining,
        };

        if let (Some(left), Some(want)) = (self.packet_remaining, expected) {
            if want > left || want < entry.min_length {
                warn!(self.log, "short packet";
                      "id" => entry.id,
                      "needed" => want.max(entry.min_length),
                      "left" => left);
                self.discard_packet();
                return;
            }
        }

        self.entry = Some(entry);
        self.expected = expected;
        self.phase = Phase::Body;
        if expected == Some(0) {
            self.deliver();
        }
    }

    fn discard_packet(&mut self) {
        let remaining = self.packet_remaining;
        self.reset();
        match remaining {
            Some(0) => (),
            other => self.phase = Phase::Discard(other),
        }
    }

    fn deliver(&mut self) {
        let entry = match self.entry.take() {
            Some(e) => e,
            None => return,
        };
        let message = RawMessage {
            receive_timestamp: self.receive_timestamp,
            header_timestamp: self.header_timestamp,
            sequence_number: self.sequence_id,
            payload: self.body_buf.split().freeze(),
        };
        trace!(self.log, "message complete";
               "id" => entry.id, "bytes" => message.payload.len());
        self.ready.push_back(FrameEvent::Message {
            id: entry.id,
            message,
        });

        self.expected = None;
        self.deadline = None;
        match self.packet_remaining {
            Some(left) if left > 0 => self.phase = Phase::MessageId,
            _ => self.finish_packet(),
        }
    }

    fn finish_packet(&mut self) {
        if let Some(reply) = self.handshake.take() {
            self.ready.push_back(FrameEvent::Reply(reply));
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.phase = start_phase(&self.format);
        self.header_buf.clear();
        self.id_buf.clear();
        self.body_buf.clear();
        self.entry = None;
        self.expected = None;
        self.packet_remaining = None;
        self.handshake = None;
        self.started = None;
        self.deadline = None;
        if self.format.header.is_some() {
            self.header_timestamp = 0;
            self.sequence_id = 0;
        }
    }
}

fn start_phase(format: &FrameFormat) -> Phase {
    if format.header.is_some() {
        Phase::Header
    } else {
        Phase::MessageId
    }
}

impl Decoder for FrameReassembler {
    type Item = FrameEvent;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<FrameEvent>> {
        if !buf.is_empty() {
            let chunk = buf.split();
            self.feed(&chunk, Instant::now(), Utc::now().timestamp_millis());
        }
        Ok(self.ready.pop_front())
    }
}
