// Copyright 2020 Joyent, Inc.

//! Message catalog: message id to body length rules and field layout.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::config::{ByteOrder, FieldConfig, FieldKind, LengthMode, ProtocolConfig};
use crate::error::Result;
use crate::template::ByteTemplate;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Bytes),
}

#[derive(Debug, Clone)]
pub struct MessageCatalogEntry {
    pub id: u16,
    pub length_mode: LengthMode,
    /// Sum of all declared field widths (the whole body for `Fixed`).
    pub fixed_length: usize,
    /// Smallest acceptable body. The variable tail may be empty.
    pub min_length: usize,
    pub fields: Vec<FieldConfig>,
    pub write_prefix: Option<ByteTemplate>,
}

impl MessageCatalogEntry {
    fn new(id: u16, mode: LengthMode, fields: &[FieldConfig], prefix: Option<&String>) -> Result<Self> {
        let fixed_length = fields.iter().filter_map(|f| f.kind.width()).sum();
        let write_prefix = match prefix {
            Some(text) => Some(text.parse::<ByteTemplate>()?),
            None => None,
        };

        Ok(MessageCatalogEntry {
            id,
            length_mode: mode,
            fixed_length,
            min_length: fixed_length,
            fields: fields.to_vec(),
            write_prefix,
        })
    }

    /// Decode a delivered payload into field values. Fields that do not fit
    /// into a short payload are left out.
    pub fn decode(&self, payload: &[u8], order: ByteOrder) -> Vec<FieldValue> {
        let tail = payload.len().saturating_sub(self.min_length);
        let mut values = Vec::with_capacity(self.fields.len());
        let mut off = 0;

        for field in &self.fields {
            let width = field.kind.width().unwrap_or(tail);
            if off + width > payload.len() {
                break;
            }
            let raw = &payload[off..off + width];
            off += width;

            let value = match field.kind {
                FieldKind::Bool => FieldValue::Bool(raw[0] != 0),
                FieldKind::Byte => FieldValue::Int(i64::from(raw[0])),
                FieldKind::Short => FieldValue::Int(i64::from(order.read_u16(raw) as i16)),
                FieldKind::Int => FieldValue::Int(i64::from(order.read_u32(raw) as i32)),
                FieldKind::Long => FieldValue::Int(order.read_u64(raw) as i64),
                FieldKind::Float => {
                    FieldValue::Float(f64::from(f32::from_bits(order.read_u32(raw))))
                }
                FieldKind::Double => FieldValue::Float(f64::from_bits(order.read_u64(raw))),
                FieldKind::String(_) | FieldKind::VarString => {
                    FieldValue::Text(latin1_until_nul(raw))
                }
                FieldKind::Bytes(_) | FieldKind::VarBytes => {
                    FieldValue::Bytes(Bytes::copy_from_slice(raw))
                }
            };
            values.push(value);
        }

        values
    }
}

fn latin1_until_nul(raw: &[u8]) -> String {
    raw.iter()
        .take_while(|b| **b != 0)
        .map(|b| char::from(*b))
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct MessageCatalog {
    entries: HashMap<u16, Arc<MessageCatalogEntry>>,
}

impl MessageCatalog {
    pub fn from_config(config: &ProtocolConfig) -> Result<MessageCatalog> {
        let mut entries = HashMap::with_capacity(config.messages.len());
        for msg in &config.messages {
            let entry = MessageCatalogEntry::new(
                msg.id,
                msg.length_mode,
                &msg.fields,
                msg.write_prefix.as_ref(),
            )?;
            entries.insert(msg.id, Arc::new(entry));
        }
        Ok(MessageCatalog { entries })
    }

    pub fn get(&self, id: u16) -> Option<&Arc<MessageCatalogEntry>> {
        self.entries.get(&id)
    }

    /// The single entry of an id-less protocol.
    pub fn sole(&self) -> Option<&Arc<MessageCatalogEntry>> {
        if self.entries.len() == 1 {
            self.entries.values().next()
        } else {
            None
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
