// Copyright 2020 Joyent, Inc.

//! Statically typed driver configuration.
//!
//! The whole driver is described by one JSON document that deserializes into
//! [`DriverConfig`]. Nothing here is negotiated with devices at runtime: the
//! header layout, the message catalog and the handshake templates are fixed
//! once the configuration has been loaded and validated.

use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use byteorder::{BigEndian, ByteOrder as _, LittleEndian};
use crc16::{State, ARC, CCITT_FALSE};
use serde_derive::{Deserialize, Serialize};

use crate::error::{config_error, Result};
use crate::template::ByteTemplate;

pub const DEFAULT_PACKET_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 500;
pub const DEFAULT_DEFRAG_THRESHOLD: usize = 50;
pub const DEFAULT_HANDSHAKE_TIMEOUT_CYCLES: u32 = 5;
pub const DEFAULT_DELAY_CYCLES: u32 = 2;
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    Big,
    Little,
}

impl Default for ByteOrder {
    fn default() -> Self {
        ByteOrder::Big
    }
}

impl ByteOrder {
    pub fn read_u16(self, buf: &[u8]) -> u16 {
        match self {
            ByteOrder::Big => BigEndian::read_u16(buf),
            ByteOrder::Little => LittleEndian::read_u16(buf),
        }
    }

    pub fn read_u32(self, buf: &[u8]) -> u32 {
        match self {
            ByteOrder::Big => BigEndian::read_u32(buf),
            ByteOrder::Little => LittleEndian::read_u32(buf),
        }
    }

    pub fn read_u64(self, buf: &[u8]) -> u64 {
        match self {
            ByteOrder::Big => BigEndian::read_u64(buf),
            ByteOrder::Little => LittleEndian::read_u64(buf),
        }
    }

    pub fn write_u16(self, buf: &mut [u8], n: u16) {
        match self {
            ByteOrder::Big => BigEndian::write_u16(buf, n),
            ByteOrder::Little => LittleEndian::write_u16(buf, n),
        }
    }

    pub fn write_u32(self, buf: &mut [u8], n: u32) {
        match self {
            ByteOrder::Big => BigEndian::write_u32(buf, n),
            ByteOrder::Little => LittleEndian::write_u32(buf, n),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Tcp,
    Udp,
}

/// Passive: devices connect to us. Active: we connect to each device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Passive,
    Active,
}

impl Default for Role {
    fn default() -> Self {
        Role::Passive
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderField {
    Dummy,
    PacketSize,
    Timestamp,
    SequenceId,
    FixedByte(u8),
    FixedWord(u16),
}

impl HeaderField {
    pub fn byte_count(self) -> usize {
        match self {
            HeaderField::Dummy | HeaderField::FixedByte(_) => 1,
            HeaderField::PacketSize
            | HeaderField::SequenceId
            | HeaderField::FixedWord(_) => 2,
            HeaderField::Timestamp => 4,
        }
    }

    pub fn is_fixed(self) -> bool {
        matches!(self, HeaderField::FixedByte(_) | HeaderField::FixedWord(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderConfig {
    pub fields: Vec<HeaderField>,
    #[serde(default)]
    pub size_includes_header: bool,
    #[serde(default)]
    pub handshake: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageIdType {
    None,
    Byte,
    Word,
}

impl Default for MessageIdType {
    fn default() -> Self {
        MessageIdType::None
    }
}

impl MessageIdType {
    pub fn byte_size(self) -> usize {
        match self {
            MessageIdType::None => 0,
            MessageIdType::Byte => 1,
            MessageIdType::Word => 2,
        }
    }

    fn max_id(self) -> u32 {
        match self {
            MessageIdType::None => 0,
            MessageIdType::Byte => u32::from(u8::MAX),
            MessageIdType::Word => u32::from(u16::MAX),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthMode {
    Fixed,
    Variable,
    PacketBased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Bool,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    String(usize),
    Bytes(usize),
    VarString,
    VarBytes,
}

impl FieldKind {
    /// Declared width, `None` for the variable tail kinds.
    pub fn width(self) -> Option<usize> {
        match self {
            FieldKind::Bool | FieldKind::Byte => Some(1),
            FieldKind::Short => Some(2),
            FieldKind::Int | FieldKind::Float => Some(4),
            FieldKind::Long | FieldKind::Double => Some(8),
            FieldKind::String(n) | FieldKind::Bytes(n) => Some(n),
            FieldKind::VarString | FieldKind::VarBytes => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConfig {
    pub name: String,
    pub kind: FieldKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageConfig {
    pub id: u16,
    pub length_mode: LengthMode,
    #[serde(default)]
    pub fields: Vec<FieldConfig>,
    #[serde(default)]
    pub write_prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default)]
    pub byte_order: ByteOrder,
    #[serde(default)]
    pub header: Option<HeaderConfig>,
    #[serde(default)]
    pub id_type: MessageIdType,
    pub messages: Vec<MessageConfig>,
    #[serde(default)]
    pub message_timeout_ms: u64,
    #[serde(default = "default_packet_timeout_ms")]
    pub packet_timeout_ms: u64,
}

impl ProtocolConfig {
    /// Hash of everything that determines how a stored payload of message
    /// `id` must be interpreted. Queue files carry it so that entries written
    /// under a different layout are dropped on replay.
    pub fn content_hash(&self, id: u16) -> u32 {
        let message = self.messages.iter().find(|m| m.id == id);
        let canonical = serde_json::to_vec(&(
            &self.byte_order,
            &self.header,
            &self.id_type,
            message,
        ))
        .unwrap_or_default();

        let hi = u32::from(State::<ARC>::calculate(&canonical));
        let lo = u32::from(State::<CCITT_FALSE>::calculate(&canonical));
        hi << 16 | lo
    }

    fn validate(&self) -> Result<()> {
        if let Some(header) = &self.header {
            let sizes = header
                .fields
                .iter()
                .filter(|f| **f == HeaderField::PacketSize)
                .count();
            if sizes > 1 {
                return Err(config_error(
                    "header may contain at most one packet_size field",
                ));
            }
            if header.fields.is_empty() {
                return Err(config_error("header has no fields"));
            }
            if let Some(handshake) = &header.handshake {
                ByteTemplate::from_str(handshake)?;
            }
        }

        if self.messages.is_empty() {
            return Err(config_error("no messages configured"));
        }
        if self.id_type == MessageIdType::None && self.messages.len() != 1 {
            return Err(config_error(
                "id_type none requires exactly one message",
            ));
        }

        let mut seen = HashSet::new();
        for msg in &self.messages {
            if u32::from(msg.id) > self.id_type.max_id() {
                return Err(config_error(format!(
                    "message id {} does not fit id type {:?}",
                    msg.id, self.id_type
                )));
            }
            if !seen.insert(msg.id) {
                return Err(config_error(format!(
                    "duplicate message id {}",
                    msg.id
                )));
            }

            let tails = msg
                .fields
                .iter()
                .filter(|f| f.kind.width().is_none())
                .count();
            match msg.length_mode {
                LengthMode::Fixed if tails > 0 => {
                    return Err(config_error(format!(
                        "fixed-length message {} has a variable field",
                        msg.id
                    )));
                }
                LengthMode::Variable if tails > 1 => {
                    return Err(config_error(format!(
                        "message {} has more than one variable field",
                        msg.id
                    )));
                }
                LengthMode::Fixed
                    if self.id_type == MessageIdType::None
                        && msg.fields.iter().all(|f| f.kind.width() == Some(0)) =>
                {
                    return Err(config_error(format!(
                        "message {} has an empty body and no id",
                        msg.id
                    )));
                }
                _ => (),
            }

            let delimited = self
                .header
                .as_ref()
                .map(|h| h.fields.contains(&HeaderField::PacketSize))
                .unwrap_or(false);
            if msg.length_mode != LengthMode::Fixed
                && !delimited
                && self.packet_timeout_ms == 0
            {
                return Err(config_error(format!(
                    "message {} needs a packet_size header field or a packet timeout",
                    msg.id
                )));
            }

            if let Some(prefix) = &msg.write_prefix {
                ByteTemplate::from_str(prefix)?;
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    None,
    Delayed,
    Handshake,
}

impl Default for QueueMode {
    fn default() -> Self {
        QueueMode::None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub mode: QueueMode,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default = "default_queue_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_defrag_threshold")]
    pub defrag_threshold: usize,
    #[serde(default = "default_handshake_timeout_cycles")]
    pub handshake_timeout_cycles: u32,
    #[serde(default = "default_delay_cycles")]
    pub delay_cycles: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            mode: QueueMode::None,
            persistent: false,
            directory: default_queue_directory(),
            max_depth: DEFAULT_MAX_QUEUE_DEPTH,
            defrag_threshold: DEFAULT_DEFRAG_THRESHOLD,
            handshake_timeout_cycles: DEFAULT_HANDSHAKE_TIMEOUT_CYCLES,
            delay_cycles: DEFAULT_DELAY_CYCLES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub hostname: String,
    #[serde(default)]
    pub alias: String,
    pub device_id: u8,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    pub transport: Transport,
    #[serde(default)]
    pub role: Role,
    pub bind_address: SocketAddr,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
}

impl DriverConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<DriverConfig> {
        let text = fs::read_to_string(path)?;
        text.parse()
    }

    pub fn validate(&self) -> Result<()> {
        self.protocol.validate()?;

        let mut ids = HashSet::new();
        for dev in &self.devices {
            if !ids.insert(dev.device_id) {
                return Err(config_error(format!(
                    "duplicate device id {}",
                    dev.device_id
                )));
            }
            if self.role == Role::Active && dev.port.is_none() {
                return Err(config_error(format!(
                    "device {} needs a port in active role",
                    dev.hostname
                )));
            }
        }
        if self.role == Role::Active && self.transport == Transport::Udp {
            return Err(config_error("active role is only supported over TCP"));
        }
        if self.queue.max_depth == 0 {
            return Err(config_error("queue max_depth must be positive"));
        }

        Ok(())
    }
}

impl FromStr for DriverConfig {
    type Err = crate::error::DevCommError;

    fn from_str(s: &str) -> Result<DriverConfig> {
        let config: DriverConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

fn default_packet_timeout_ms() -> u64 {
    DEFAULT_PACKET_TIMEOUT_MS
}

fn default_queue_directory() -> PathBuf {
    PathBuf::from("queues")
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_QUEUE_DEPTH
}

fn default_defrag_threshold() -> usize {
    DEFAULT_DEFRAG_THRESHOLD
}

fn default_handshake_timeout_cycles() -> u32 {
    DEFAULT_HANDSHAKE_TIMEOUT_CYCLES
}

fn default_delay_cycles() -> u32 {
    DEFAULT_DELAY_CYCLES
}

fn default_reconnect_interval_ms() -> u64 {
    DEFAULT_RECONNECT_INTERVAL_MS
}
