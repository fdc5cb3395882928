// Copyright 2020 Joyent, Inc.

//! Fixed-size message header layout and validation.

use bytes::Bytes;

use crate::config::{ByteOrder, HeaderConfig, HeaderField};
use crate::error::Result;
use crate::template::{ByteTemplate, TemplateValues};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacedField {
    pub field: HeaderField,
    pub offset: usize,
}

/// Header fields with their byte offsets. Offsets are accumulated once, in
/// configured order, and never change afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderLayout {
    fields: Vec<PlacedField>,
    len: usize,
    packet_size: Option<usize>,
    first_fixed: Option<PlacedField>,
    size_includes_header: bool,
}

impl HeaderLayout {
    pub fn new(fields: &[HeaderField], size_includes_header: bool) -> HeaderLayout {
        let mut offset = 0;
        let mut placed = Vec::with_capacity(fields.len());
        for field in fields {
            placed.push(PlacedField {
                field: *field,
                offset,
            });
            offset += field.byte_count();
        }

        let packet_size = placed
            .iter()
            .find(|p| p.field == HeaderField::PacketSize)
            .map(|p| p.offset);
        let first_fixed = placed.iter().find(|p| p.field.is_fixed()).copied();

        HeaderLayout {
            fields: placed,
            len: offset,
            packet_size,
            first_fixed,
            size_includes_header,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn fields(&self) -> &[PlacedField] {
        &self.fields
    }

    /// True when the header carries the packet boundary.
    pub fn has_packet_size(&self) -> bool {
        self.packet_size.is_some()
    }
}

/// Outcome of evaluating one complete header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderEval {
    pub valid: bool,
    /// Body bytes that follow the header, if the header declares them. For an
    /// invalid header this is the number of bytes to discard; `None` means
    /// the boundary is unknown and the rest of the received data must go.
    pub packet_size: Option<usize>,
    pub header_timestamp: u32,
    pub sequence_id: u16,
    /// Pre-rendered handshake reply, only for valid headers.
    pub handshake: Option<Bytes>,
}

impl HeaderEval {
    fn invalid(packet_size: Option<usize>) -> HeaderEval {
        HeaderEval {
            valid: false,
            packet_size,
            header_timestamp: 0,
            sequence_id: 0,
            handshake: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeaderCodec {
    layout: HeaderLayout,
    order: ByteOrder,
    handshake: Option<ByteTemplate>,
}

impl HeaderCodec {
    pub fn new(config: &HeaderConfig, order: ByteOrder) -> Result<HeaderCodec> {
        let handshake = match &config.handshake {
            Some(text) => Some(text.parse::<ByteTemplate>()?),
            None => None,
        };

        Ok(HeaderCodec {
            layout: HeaderLayout::new(&config.fields, config.size_includes_header),
            order,
            handshake,
        })
    }

    pub fn layout(&self) -> &HeaderLayout {
        &self.layout
    }

    pub fn len(&self) -> usize {
        self.layout.len
    }

    pub fn is_empty(&self) -> bool {
        self.layout.is_empty()
    }

    /// Evaluate a complete header. `header` must hold exactly `len()` bytes.
    ///
    /// The packet size is read before anything else is checked, since it
    /// determines how much input to throw away when the header turns out to
    /// be invalid.
    pub fn evaluate(&self, header: &[u8]) -> HeaderEval {
        debug_assert_eq!(header.len(), self.layout.len);

        let packet_size = match self.layout.packet_size {
            Some(off) => {
                let raw = usize::from(self.order.read_u16(&header[off..off + 2]));
                if !self.layout.size_includes_header {
                    Some(raw)
                } else if raw < self.layout.len {
                    return HeaderEval::invalid(None);
                } else {
                    Some(raw - self.layout.len)
                }
            }
            None => None,
        };

        if let Some(first) = self.layout.first_fixed {
            if !self.fixed_matches(first, header) {
                return HeaderEval::invalid(packet_size);
            }
        }

        let mut valid = true;
        let mut header_timestamp = 0;
        let mut sequence_id = 0;
        for placed in &self.layout.fields {
            let off = placed.offset;
            match placed.field {
                HeaderField::Timestamp => {
                    header_timestamp = self.order.read_u32(&header[off..off + 4]);
                }
                HeaderField::SequenceId => {
                    sequence_id = self.order.read_u16(&header[off..off + 2]);
                }
                HeaderField::FixedByte(_) | HeaderField::FixedWord(_) => {
                    if !self.fixed_matches(*placed, header) {
                        valid = false;
                    }
                }
                HeaderField::Dummy | HeaderField::PacketSize => (),
            }
        }

        let handshake = match (&self.handshake, valid) {
            (Some(template), true) => Some(template.render(
                &TemplateValues {
                    timestamp: header_timestamp,
                    sequence: sequence_id,
                    length: packet_size.unwrap_or(0),
                    id: 0,
                },
                self.order,
            )),
            _ => None,
        };

        HeaderEval {
            valid,
            packet_size,
            header_timestamp,
            sequence_id,
            handshake,
        }
    }

    fn fixed_matches(&self, placed: PlacedField, header: &[u8]) -> bool {
        let off = placed.offset;
        match placed.field {
            HeaderField::FixedByte(v) => header[off] == v,
            HeaderField::FixedWord(v) => self.order.read_u16(&header[off..off + 2]) == v,
            _ => true,
        }
    }
}
