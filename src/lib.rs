// Copyright 2020 Joyent, Inc.

//! devcomm: a communication engine for remote industrial devices
//!
//! Devices talk to us over TCP or UDP using a configurable binary protocol.
//! The engine reassembles their byte stream into messages, queues each
//! message per channel, hands the queue head to a consumer and keeps a
//! standby node's queues in step.
//!
//! Wire format
//!
//! A packet is an optional header followed by one or more messages:
//!
//! * HEADER    Fixed-size, made of configured fields in order:
//!
//!     * DUMMY        one ignored byte
//!
//!     * PACKET_SIZE  2-byte unsigned length of the data that follows the
//!                    header, or of the whole packet when configured so
//!
//!     * TIMESTAMP    4-byte device timestamp
//!
//!     * SEQUENCE_ID  2-byte device sequence number
//!
//!     * FIXED_BYTE, FIXED_WORD   constants the header must carry
//!
//! * MSGID     0, 1 or 2 bytes identifying the catalog entry of the message.
//!             Absent when the catalog has a single message.
//!
//! * DATA      The message body. Its length is fixed by the catalog entry,
//!             or runs to the end of the packet.
//!
//! Multi-byte fields use the configured byte order. A packet whose header
//! carries a handshake template is answered with the rendered template as
//! soon as the whole packet has been read.
//!
//! Channels: every (device, message) pair is a channel, identified by
//! `device << 24 | message id`. Each channel has its own queue and its own
//! delivery mode (none, delayed or handshake).

#![allow(missing_docs)]

#[macro_use]
extern crate num_derive;

pub mod catalog;
pub mod client;
pub mod config;
pub mod delivery;
pub mod device;
pub mod driver;
pub mod error;
pub mod folder;
pub mod header;
pub mod protocol;
pub mod queue;
pub mod replication;
pub mod scheduler;
pub mod server;
pub mod template;
pub mod transport;
pub mod udp;
