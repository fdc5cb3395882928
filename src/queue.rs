// Copyright 2020 Joyent, Inc.

//! Disk-backed FIFO of opaque messages.
//!
//! Queue file layout:
//!
//! * MAGIC     3 bytes, "DCQ"
//! * VERSION   1 byte, currently 1
//! * RESERVED  4 bytes, zero
//!
//! followed by records
//!
//! * KIND      1 byte, see [`RecordKind`]
//! * LEN       4-byte big-endian body length
//! * CRC       2-byte big-endian CRC16 (ARC) of the body
//! * BODY      LEN bytes
//!
//! `add` appends an `Entry` record and `poll` appends a `Remove` marker, so
//! the steady state never rewrites the file. After enough markers have piled
//! up, or when an append fails, the file is compacted into a fresh one that
//! holds a hash marker and the live entries only.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder as _};
use bytes::{BufMut, Bytes, BytesMut};
use crc16::{State, ARC};
use num::{FromPrimitive, ToPrimitive};
use slog::{debug, error, info, o, warn, Drain, Logger};

const FILE_MAGIC: &[u8; 3] = b"DCQ";
const FILE_VERSION: u8 = 1;
const FILE_HEADER_SZ: usize = 8;

const REC_OFF_LEN: usize = 0x1;
const REC_OFF_CRC: usize = 0x5;
const REC_HEADER_SZ: usize = 0x7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum RecordKind {
    Hash = 1,
    Entry = 2,
    Remove = 3,
    Clear = 4,
}

/// What replaying an existing queue file found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub live: usize,
    /// Entries logged under a configuration hash other than ours.
    pub stale: usize,
    /// Replay stopped early at a torn or corrupt record.
    pub truncated: bool,
}

struct QueueFile {
    path: PathBuf,
    file: File,
    hash: u32,
    markers: usize,
    defrag_threshold: usize,
}

pub struct PersistentQueue {
    entries: VecDeque<Bytes>,
    store: Option<QueueFile>,
    log: Logger,
}

impl PersistentQueue {
    pub fn in_memory(log: Option<&Logger>) -> PersistentQueue {
        PersistentQueue {
            entries: VecDeque::new(),
            store: None,
            log: root_or(log),
        }
    }

    /// Open (or create) the queue file at `path`. Entries are only accepted
    /// when logged under `hash`, the caller's configuration hash.
    pub fn open(
        path: &Path,
        hash: u32,
        defrag_threshold: usize,
        log: Option<&Logger>,
    ) -> io::Result<PersistentQueue> {
        let log = root_or(log).new(o!("queue" => path.display().to_string()));

        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }

        let (entries, stats) = match fs::read(path) {
            Ok(buf) => replay(&buf, hash, &log),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {
                (VecDeque::new(), ReplayStats::default())
            }
            Err(e) => return Err(e),
        };

        if stats.stale > 0 {
            warn!(log, "discarded entries from a previous configuration";
                  "stale" => stats.stale);
        }
        if stats.truncated {
            warn!(log, "queue file ended in a torn record");
        }
        info!(log, "queue opened"; "entries" => stats.live);

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if file.metadata()?.len() == 0 {
            // Appends must stay replayable even if compaction never succeeds.
            file.write_all(&file_header())?;
        }
        let mut queue = PersistentQueue {
            entries,
            store: Some(QueueFile {
                path: path.to_path_buf(),
                file,
                hash,
                markers: 0,
                defrag_threshold: defrag_threshold.max(1),
            }),
            log,
        };
        if !queue.defragment() {
            // Old file still in use: make sure new appends count as current.
            queue.append(RecordKind::Hash, &hash.to_be_bytes());
        }

        Ok(queue)
    }

    pub fn is_persistent(&self) -> bool {
        self.store.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.store.as_ref().map(|s| s.path.as_path())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn peek(&self) -> Option<&Bytes> {
        self.entries.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.entries.iter()
    }

    pub fn add(&mut self, entry: Bytes) {
        self.entries.push_back(entry);
        if let Some(tail) = self.entries.back().cloned() {
            self.append(RecordKind::Entry, &tail);
        }
    }

    pub fn poll(&mut self) -> Option<Bytes> {
        let head = self.entries.pop_front()?;
        self.append(RecordKind::Remove, &[]);

        let compact = match self.store.as_mut() {
            Some(store) => {
                store.markers += 1;
                store.markers >= store.defrag_threshold
            }
            None => false,
        };
        if compact {
            self.defragment();
        }

        Some(head)
    }

    pub fn clear(&mut self) {
        self.append(RecordKind::Clear, &[]);
        self.entries.clear();
        self.defragment();
    }

    /// Replace the whole content, as when a full state arrives from the peer.
    pub fn replace(&mut self, entries: Vec<Bytes>) {
        self.append(RecordKind::Clear, &[]);
        self.entries = entries.into();
        self.defragment();
    }

    /// Rewrite the file with only the live entries. Returns false when the
    /// old file had to be kept.
    pub fn defragment(&mut self) -> bool {
        let store = match self.store.as_mut() {
            Some(s) => s,
            None => return true,
        };

        let tmp = temp_path(&store.path);
        if let Err(e) = write_compacted(&tmp, store.hash, &self.entries) {
            error!(self.log, "failed to write compacted queue file"; "err" => %e);
            let _ = fs::remove_file(&tmp);
            return false;
        }
        if let Err(e) = fs::rename(&tmp, &store.path) {
            error!(self.log, "failed to replace queue file, keeping old one";
                   "err" => %e);
            let _ = fs::remove_file(&tmp);
            return false;
        }

        match OpenOptions::new().append(true).open(&store.path) {
            Ok(file) => {
                store.file = file;
                store.markers = 0;
                debug!(self.log, "queue file compacted"; "entries" => self.entries.len());
                true
            }
            Err(e) => {
                error!(self.log, "failed to reopen compacted queue file"; "err" => %e);
                false
            }
        }
    }

    fn append(&mut self, kind: RecordKind, body: &[u8]) {
        let result = match self.store.as_mut() {
            Some(store) => store.file.write_all(&encode_record(kind, body)),
            None => return,
        };
        if let Err(e) = result {
            // Memory already reflects the mutation, so the rewrite captures it.
            error!(self.log, "queue append failed, rewriting file";
                   "kind" => ?kind, "err" => %e);
            self.defragment();
        }
    }
}

fn root_or(log: Option<&Logger>) -> Logger {
    log.cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

pub fn encode_record(kind: RecordKind, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(REC_HEADER_SZ + body.len());
    buf.put_u8(ToPrimitive::to_u8(&kind).unwrap_or_default());
    buf.put_u32(body.len() as u32);
    buf.put_u16(State::<ARC>::calculate(body));
    buf.put_slice(body);
    buf.freeze()
}

fn file_header() -> [u8; FILE_HEADER_SZ] {
    let mut header = [0u8; FILE_HEADER_SZ];
    header[..3].copy_from_slice(FILE_MAGIC);
    header[3] = FILE_VERSION;
    header
}

fn write_compacted(path: &Path, hash: u32, entries: &VecDeque<Bytes>) -> io::Result<()> {
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);
    out.write_all(&file_header())?;
    out.write_all(&encode_record(RecordKind::Hash, &hash.to_be_bytes()))?;
    for entry in entries {
        out.write_all(&encode_record(RecordKind::Entry, entry))?;
    }
    let file = out.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()
}

/// Rebuild the live entries from a queue file image.
pub fn replay(buf: &[u8], hash: u32, log: &Logger) -> (VecDeque<Bytes>, ReplayStats) {
    let mut entries = VecDeque::new();
    let mut stats = ReplayStats::default();

    if buf.len() < FILE_HEADER_SZ
        || &buf[..3] != FILE_MAGIC
        || buf[3] != FILE_VERSION
    {
        if !buf.is_empty() {
            warn!(log, "unrecognized queue file header, starting empty");
            stats.truncated = true;
        }
        return (entries, stats);
    }

    let mut current = false;
    let mut pos = FILE_HEADER_SZ;
    while pos < buf.len() {
        if buf.len() - pos < REC_HEADER_SZ {
            stats.truncated = true;
            break;
        }
        let rec = &buf[pos..];
        let len = BigEndian::read_u32(&rec[REC_OFF_LEN..REC_OFF_CRC]) as usize;
        let crc = BigEndian::read_u16(&rec[REC_OFF_CRC..REC_HEADER_SZ]);
        if rec.len() - REC_HEADER_SZ < len {
            stats.truncated = true;
            break;
        }
        let body = &rec[REC_HEADER_SZ..REC_HEADER_SZ + len];
        if State::<ARC>::calculate(body) != crc {
            stats.truncated = true;
            break;
        }
        pos += REC_HEADER_SZ + len;

        match FromPrimitive::from_u8(rec[0]) {
            Some(RecordKind::Hash) => {
                current = body.len() == 4 && BigEndian::read_u32(body) == hash;
            }
            Some(RecordKind::Entry) if current => {
                entries.push_back(Bytes::copy_from_slice(body));
            }
            Some(RecordKind::Entry) => stats.stale += 1,
            Some(RecordKind::Remove) if current => {
                entries.pop_front();
            }
            Some(RecordKind::Clear) if current => entries.clear(),
            Some(RecordKind::Remove) | Some(RecordKind::Clear) => (),
            None => {
                stats.truncated = true;
                break;
            }
        }
    }

    stats.live = entries.len();
    (entries, stats)
}
