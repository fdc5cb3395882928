// Copyright 2020 Joyent, Inc.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use slog::{o, Drain, Level, LevelFilter, Logger};

use devcomm::config::{
    ByteOrder, FieldConfig, FieldKind, HeaderConfig, HeaderField, LengthMode, MessageConfig,
    MessageIdType, ProtocolConfig,
};
use devcomm::delivery::DeliverySink;
use devcomm::device::ChannelId;
use devcomm::protocol::{FrameEvent, FrameFormat, RawMessage};

pub fn test_logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Warning,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    )
}

pub fn field(name: &str, kind: FieldKind) -> FieldConfig {
    FieldConfig {
        name: name.to_string(),
        kind,
    }
}

pub fn message(id: u16, length_mode: LengthMode, fields: Vec<FieldConfig>) -> MessageConfig {
    MessageConfig {
        id,
        length_mode,
        fields,
        write_prefix: None,
    }
}

pub fn header(fields: Vec<HeaderField>, size_includes_header: bool) -> HeaderConfig {
    HeaderConfig {
        fields,
        size_includes_header,
        handshake: None,
    }
}

pub fn protocol(
    header: Option<HeaderConfig>,
    id_type: MessageIdType,
    messages: Vec<MessageConfig>,
) -> ProtocolConfig {
    ProtocolConfig {
        byte_order: ByteOrder::Big,
        header,
        id_type,
        messages,
        message_timeout_ms: 0,
        packet_timeout_ms: 2000,
    }
}

pub fn format(config: &ProtocolConfig) -> Arc<FrameFormat> {
    Arc::new(FrameFormat::from_config(config).expect("valid protocol"))
}

/// (id, payload) of every message event, in order.
pub fn payloads(events: &[FrameEvent]) -> Vec<(u16, Vec<u8>)> {
    events
        .iter()
        .filter_map(|e| match e {
            FrameEvent::Message { id, message } => Some((*id, message.payload.to_vec())),
            FrameEvent::Reply(_) => None,
        })
        .collect()
}

pub fn replies(events: &[FrameEvent]) -> Vec<Vec<u8>> {
    events
        .iter()
        .filter_map(|e| match e {
            FrameEvent::Reply(r) => Some(r.to_vec()),
            FrameEvent::Message { .. } => None,
        })
        .collect()
}

pub fn raw(receive_timestamp: i64, sequence_number: u16, payload: &[u8]) -> RawMessage {
    RawMessage {
        receive_timestamp,
        header_timestamp: 0,
        sequence_number,
        payload: Bytes::copy_from_slice(payload),
    }
}

/// Records what a delivery controller exposes.
#[derive(Default)]
pub struct RecordingSink {
    pub delivered: Mutex<Vec<(ChannelId, RawMessage, bool)>>,
    pub retired: Mutex<Vec<ChannelId>>,
}

impl RecordingSink {
    pub fn new() -> Arc<RecordingSink> {
        Arc::new(RecordingSink::default())
    }

    pub fn delivered_payloads(&self) -> Vec<Vec<u8>> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|(_, m, _)| m.payload.to_vec())
            .collect()
    }

    pub fn retired_count(&self) -> usize {
        self.retired.lock().unwrap().len()
    }
}

impl DeliverySink for RecordingSink {
    fn deliver(&self, channel: ChannelId, message: &RawMessage, handshake: bool) {
        self.delivered
            .lock()
            .unwrap()
            .push((channel, message.clone(), handshake));
    }

    fn retired(&self, channel: ChannelId) {
        self.retired.lock().unwrap().push(channel);
    }
}
