// Copyright 2020 Joyent, Inc.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors surfaced to the host. Runtime protocol and persistence faults are
/// logged and absorbed where they happen; only configuration problems and
/// failing to bind the listening socket reach the caller.
#[derive(Debug, Error)]
pub enum DevCommError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("invalid byte template: {0}")]
    Template(String),

    #[error("malformed replication record: {0}")]
    Replication(String),

    #[error("{0} is read-only")]
    ReadOnly(String),

    #[error("device {0} is not reachable")]
    NotConnected(u8),

    #[error("unknown channel {0:#010x}")]
    UnknownChannel(u32),
}

pub type Result<T> = std::result::Result<T, DevCommError>;

pub(crate) fn config_error<S: Into<String>>(msg: S) -> DevCommError {
    DevCommError::Config(msg.into())
}
