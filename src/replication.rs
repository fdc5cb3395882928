// Copyright 2020 Joyent, Inc.

//! Active/backup queue replication.
//!
//! Incremental update record:
//!
//! * KIND     1 byte, 1 = add, 2 = remove
//! * CHANNEL  4-byte big-endian channel id
//! * KEY      8-byte big-endian message key
//! * LEN      4-byte big-endian entry length (0 for remove)
//! * ENTRY    LEN bytes, the encoded message
//!
//! Full state record:
//!
//! * MAGIC    3 bytes, "DCS", then VERSION 1 byte
//! * NDEV     2-byte count, then NDEV connected device ids (1 byte each)
//! * NCHAN    4-byte count, then per channel:
//!   CHANNEL 4, MODE 1, AWAITING 1, TICKS 4, HAS_FIRST 1, FIRST 8,
//!   NENT 4, then NENT times LEN 4 + ENTRY

use std::sync::Mutex;

use byteorder::{BigEndian, ByteOrder as _};
use bytes::{BufMut, Bytes, BytesMut};
use num::{FromPrimitive, ToPrimitive};
use slog::{debug, o, warn, Drain, Logger};

use crate::config::QueueMode;
use crate::delivery::{ChannelSnapshot, DeliveryState, QueueMirror};
use crate::device::{ChannelId, DeviceId};
use crate::error::DevCommError;
use crate::protocol::key_of;
use crate::queue::PersistentQueue;

const STATE_MAGIC: &[u8; 3] = b"DCS";
const STATE_VERSION: u8 = 1;

const UPD_OFF_CHANNEL: usize = 0x1;
const UPD_OFF_KEY: usize = 0x5;
const UPD_OFF_LEN: usize = 0xd;
const UPD_OFF_ENTRY: usize = 0x11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
enum UpdateKind {
    Add = 1,
    Remove = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationUpdate {
    Add { channel: ChannelId, entry: Bytes },
    Remove { channel: ChannelId, key: u64 },
}

impl ReplicationUpdate {
    pub fn channel(&self) -> ChannelId {
        match self {
            ReplicationUpdate::Add { channel, .. } => *channel,
            ReplicationUpdate::Remove { channel, .. } => *channel,
        }
    }

    pub fn encode(&self) -> Bytes {
        let (kind, channel, key, entry) = match self {
            ReplicationUpdate::Add { channel, entry } => (
                UpdateKind::Add,
                *channel,
                key_of(entry).unwrap_or(0),
                &entry[..],
            ),
            ReplicationUpdate::Remove { channel, key } => {
                (UpdateKind::Remove, *channel, *key, &[][..])
            }
        };

        let mut buf = BytesMut::with_capacity(UPD_OFF_ENTRY + entry.len());
        buf.put_u8(ToPrimitive::to_u8(&kind).unwrap_or_default());
        buf.put_u32(channel);
        buf.put_u64(key);
        buf.put_u32(entry.len() as u32);
        buf.put_slice(entry);
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> Result<ReplicationUpdate, DevCommError> {
        if buf.len() < UPD_OFF_ENTRY {
            return Err(short("update"));
        }
        let channel = BigEndian::read_u32(&buf[UPD_OFF_CHANNEL..UPD_OFF_KEY]);
        let key = BigEndian::read_u64(&buf[UPD_OFF_KEY..UPD_OFF_LEN]);
        let len = BigEndian::read_u32(&buf[UPD_OFF_LEN..UPD_OFF_ENTRY]) as usize;
        if buf.len() - UPD_OFF_ENTRY != len {
            return Err(short("update entry"));
        }

        match FromPrimitive::from_u8(buf[0]) {
            Some(UpdateKind::Add) => Ok(ReplicationUpdate::Add {
                channel,
                entry: Bytes::copy_from_slice(&buf[UPD_OFF_ENTRY..]),
            }),
            Some(UpdateKind::Remove) => Ok(ReplicationUpdate::Remove { channel, key }),
            None => Err(DevCommError::Replication(format!(
                "unknown update kind {}",
                buf[0]
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalStatus {
    pub connected_devices: Vec<DeviceId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FullState {
    pub status: GlobalStatus,
    pub channels: Vec<ChannelSnapshot>,
}

impl FullState {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(STATE_MAGIC);
        buf.put_u8(STATE_VERSION);
        buf.put_u16(self.status.connected_devices.len() as u16);
        for dev in &self.status.connected_devices {
            buf.put_u8(*dev);
        }

        buf.put_u32(self.channels.len() as u32);
        for snap in &self.channels {
            buf.put_u32(snap.channel);
            buf.put_u8(mode_to_u8(snap.state.mode));
            buf.put_u8(snap.state.awaiting_ack as u8);
            buf.put_u32(snap.state.timer_ticks);
            match snap.state.first_delivered_timestamp {
                Some(ts) => {
                    buf.put_u8(1);
                    buf.put_i64(ts);
                }
                None => {
                    buf.put_u8(0);
                    buf.put_i64(0);
                }
            }
            buf.put_u32(snap.entries.len() as u32);
            for entry in &snap.entries {
                buf.put_u32(entry.len() as u32);
                buf.put_slice(entry);
            }
        }

        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> Result<FullState, DevCommError> {
        let mut rd = Reader { buf, pos: 0 };
        if rd.take(3)? != STATE_MAGIC || rd.u8()? != STATE_VERSION {
            return Err(DevCommError::Replication(
                "not a full state record".to_string(),
            ));
        }

        let ndev = rd.u16()? as usize;
        let connected_devices = rd.take(ndev)?.to_vec();

        let nchan = rd.u32()? as usize;
        let mut channels = Vec::with_capacity(nchan.min(1024));
        for _ in 0..nchan {
            let channel = rd.u32()?;
            let mode = mode_from_u8(rd.u8()?)?;
            let awaiting_ack = rd.u8()? != 0;
            let timer_ticks = rd.u32()?;
            let has_first = rd.u8()? != 0;
            let first = rd.i64()?;
            let nent = rd.u32()? as usize;
            let mut entries = Vec::with_capacity(nent.min(1024));
            for _ in 0..nent {
                let len = rd.u32()? as usize;
                entries.push(Bytes::copy_from_slice(rd.take(len)?));
            }

            channels.push(ChannelSnapshot {
                channel,
                state: DeliveryState {
                    mode,
                    awaiting_ack,
                    timer_ticks,
                    first_delivered_timestamp: if has_first { Some(first) } else { None },
                },
                entries,
            });
        }

        if rd.pos != buf.len() {
            return Err(DevCommError::Replication(
                "trailing bytes after full state".to_string(),
            ));
        }

        Ok(FullState {
            status: GlobalStatus { connected_devices },
            channels,
        })
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DevCommError> {
        if self.buf.len() - self.pos < n {
            return Err(short("full state"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DevCommError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DevCommError> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    fn u32(&mut self) -> Result<u32, DevCommError> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    fn i64(&mut self) -> Result<i64, DevCommError> {
        Ok(BigEndian::read_i64(self.take(8)?))
    }
}

fn short(what: &str) -> DevCommError {
    DevCommError::Replication(format!("truncated {}", what))
}

fn mode_to_u8(mode: QueueMode) -> u8 {
    match mode {
        QueueMode::None => 0,
        QueueMode::Delayed => 1,
        QueueMode::Handshake => 2,
    }
}

fn mode_from_u8(b: u8) -> Result<QueueMode, DevCommError> {
    match b {
        0 => Ok(QueueMode::None),
        1 => Ok(QueueMode::Delayed),
        2 => Ok(QueueMode::Handshake),
        _ => Err(DevCommError::Replication(format!("unknown queue mode {}", b))),
    }
}

/// Carries replication records to the standby node.
pub trait ReplicationTransport: Send + Sync {
    fn send_update(&self, update: &ReplicationUpdate);
    fn send_full_state(&self, state: &FullState);
}

/// Forwards queue mutations to a transport, one at a time, so the backup
/// applies them in the order the active node made them.
pub struct ReplicationBridge {
    transport: Mutex<Box<dyn ReplicationTransport>>,
    log: Logger,
}

impl ReplicationBridge {
    pub fn new(
        transport: Box<dyn ReplicationTransport>,
        log: Option<&Logger>,
    ) -> ReplicationBridge {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        ReplicationBridge {
            transport: Mutex::new(transport),
            log,
        }
    }

    pub fn publish(&self, update: &ReplicationUpdate) {
        match self.transport.lock() {
            Ok(transport) => transport.send_update(update),
            Err(poisoned) => poisoned.into_inner().send_update(update),
        }
    }

    pub fn publish_full_state(&self, state: &FullState) {
        debug!(self.log, "sending full state"; "channels" => state.channels.len());
        match self.transport.lock() {
            Ok(transport) => transport.send_full_state(state),
            Err(poisoned) => poisoned.into_inner().send_full_state(state),
        }
    }
}

impl QueueMirror for ReplicationBridge {
    fn added(&self, channel: ChannelId, entry: &Bytes) {
        self.publish(&ReplicationUpdate::Add {
            channel,
            entry: entry.clone(),
        });
    }

    fn removed(&self, channel: ChannelId, key: u64) {
        self.publish(&ReplicationUpdate::Remove { channel, key });
    }
}

/// Apply one replicated mutation to a backup queue. Returns how many stale
/// entries had to be dropped to get back in step.
pub fn apply_update(queue: &mut PersistentQueue, update: &ReplicationUpdate, log: &Logger) -> usize {
    match update {
        ReplicationUpdate::Add { entry, .. } => {
            queue.add(entry.clone());
            0
        }
        ReplicationUpdate::Remove { key, .. } => reconcile_remove(queue, *key, log),
    }
}

/// Remove the entry identified by `key` from `queue`. Entries in front of it
/// are stale leftovers of a missed update and are dropped along the way.
/// Keys are not ordered along the queue, so the match is by presence. When
/// the key is not queued at all, nothing can realign and the queue drains.
pub fn reconcile_remove(queue: &mut PersistentQueue, key: u64, log: &Logger) -> usize {
    let found = queue.iter().position(|e| key_of(e) == Some(key));
    let discarded = match found {
        Some(stale) => {
            for _ in 0..=stale {
                queue.poll();
            }
            stale
        }
        None => {
            let stale = queue.len();
            while queue.poll().is_some() {}
            stale
        }
    };

    if discarded > 0 {
        warn!(log, "queue out of step with active node, discarded stale entries";
              "key" => key, "discarded" => discarded);
    }
    discarded
}
