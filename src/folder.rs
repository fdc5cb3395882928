// Copyright 2020 Joyent, Inc.

//! Consumer-facing views of the driver state.
//!
//! The set of folder kinds is closed: a global status folder, one status
//! folder per device and one message folder per channel. They share the
//! [`FolderOps`] interface and are dispatched through the [`Folder`] enum.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, SecondsFormat, Utc};

use crate::catalog::{FieldValue, MessageCatalogEntry};
use crate::config::ByteOrder;
use crate::delivery::DeliveryController;
use crate::device::{split_channel, DeviceId};
use crate::error::{DevCommError, Result};
use crate::template::TemplateValues;
use crate::transport::MultiplexerHandle;

pub type FolderValues = Vec<(String, FieldValue)>;

/// Where message folders send their writes; set once the multiplexer runs.
pub type Link = Arc<RwLock<Option<MultiplexerHandle>>>;

pub trait FolderOps {
    fn connection_state_changed(&self, device: DeviceId, peer: Option<SocketAddr>);
    fn activity_level_changed(&self, active: bool);
    fn read(&self) -> FolderValues;
    fn write(&self, payload: &[u8]) -> Result<()>;
}

#[derive(Default)]
pub struct StatusFolder {
    connected: Mutex<BTreeSet<DeviceId>>,
    active: AtomicBool,
}

impl StatusFolder {
    pub fn connected_devices(&self) -> Vec<DeviceId> {
        match self.connected.lock() {
            Ok(c) => c.iter().copied().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn set_connected_devices(&self, devices: &[DeviceId]) {
        if let Ok(mut c) = self.connected.lock() {
            *c = devices.iter().copied().collect();
        }
    }
}

impl FolderOps for StatusFolder {
    fn connection_state_changed(&self, device: DeviceId, peer: Option<SocketAddr>) {
        if let Ok(mut c) = self.connected.lock() {
            if peer.is_some() {
                c.insert(device);
            } else {
                c.remove(&device);
            }
        }
    }

    fn activity_level_changed(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    fn read(&self) -> FolderValues {
        vec![
            (
                "connected_devices".to_string(),
                FieldValue::Int(self.connected_devices().len() as i64),
            ),
            (
                "active".to_string(),
                FieldValue::Bool(self.active.load(Ordering::SeqCst)),
            ),
        ]
    }

    fn write(&self, _payload: &[u8]) -> Result<()> {
        Err(DevCommError::ReadOnly("status folder".to_string()))
    }
}

#[derive(Debug, Clone, Default)]
struct DeviceStatus {
    address: Option<SocketAddr>,
    last_change: Option<DateTime<Utc>>,
}

pub struct DeviceStatusFolder {
    device: DeviceId,
    name: String,
    status: Mutex<DeviceStatus>,
}

impl DeviceStatusFolder {
    pub fn new(device: DeviceId, name: &str) -> DeviceStatusFolder {
        DeviceStatusFolder {
            device,
            name: name.to_string(),
            status: Mutex::new(DeviceStatus::default()),
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn is_connected(&self) -> bool {
        self.status
            .lock()
            .map(|s| s.address.is_some())
            .unwrap_or(false)
    }
}

impl FolderOps for DeviceStatusFolder {
    fn connection_state_changed(&self, device: DeviceId, peer: Option<SocketAddr>) {
        if device != self.device {
            return;
        }
        if let Ok(mut s) = self.status.lock() {
            s.address = peer;
            s.last_change = Some(Utc::now());
        }
    }

    fn activity_level_changed(&self, _active: bool) {}

    fn read(&self) -> FolderValues {
        let status = self.status.lock().map(|s| s.clone()).unwrap_or_default();
        vec![
            ("name".to_string(), FieldValue::Text(self.name.clone())),
            (
                "connected".to_string(),
                FieldValue::Bool(status.address.is_some()),
            ),
            (
                "address".to_string(),
                FieldValue::Text(status.address.map(|a| a.to_string()).unwrap_or_default()),
            ),
            (
                "last_change".to_string(),
                FieldValue::Text(
                    status
                        .last_change
                        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
                        .unwrap_or_default(),
                ),
            ),
        ]
    }

    fn write(&self, _payload: &[u8]) -> Result<()> {
        Err(DevCommError::ReadOnly(format!("status of {}", self.name)))
    }
}

pub struct MessageFolder {
    entry: Arc<MessageCatalogEntry>,
    order: ByteOrder,
    controller: DeliveryController,
    link: Link,
}

impl MessageFolder {
    pub fn new(
        entry: Arc<MessageCatalogEntry>,
        order: ByteOrder,
        controller: DeliveryController,
        link: Link,
    ) -> MessageFolder {
        MessageFolder {
            entry,
            order,
            controller,
            link,
        }
    }

    pub fn controller(&self) -> &DeliveryController {
        &self.controller
    }

    /// Bytes sent to the device for a write of `payload`.
    pub fn frame_write(&self, payload: &[u8]) -> Bytes {
        let prefix = self.entry.write_prefix.as_ref().map(|t| {
            t.render(
                &TemplateValues {
                    length: payload.len(),
                    id: self.entry.id,
                    ..TemplateValues::default()
                },
                self.order,
            )
        });

        let mut buf = BytesMut::with_capacity(
            prefix.as_ref().map(|p| p.len()).unwrap_or(0) + payload.len(),
        );
        if let Some(p) = prefix {
            buf.put_slice(&p);
        }
        buf.put_slice(payload);
        buf.freeze()
    }
}

impl FolderOps for MessageFolder {
    fn connection_state_changed(&self, _device: DeviceId, _peer: Option<SocketAddr>) {}

    fn activity_level_changed(&self, active: bool) {
        self.controller.set_active(active);
    }

    fn read(&self) -> FolderValues {
        let (current, handshake) = self.controller.view();
        let mut values: FolderValues = match &current {
            Some(msg) => self
                .entry
                .fields
                .iter()
                .map(|f| f.name.clone())
                .zip(self.entry.decode(&msg.payload, self.order))
                .collect(),
            None => Vec::new(),
        };
        values.push((
            "handshake".to_string(),
            FieldValue::Bool(handshake),
        ));
        if let Some(msg) = current {
            values.push((
                "sequence".to_string(),
                FieldValue::Int(i64::from(msg.sequence_number)),
            ));
            values.push((
                "received".to_string(),
                FieldValue::Int(msg.receive_timestamp),
            ));
        }
        values
    }

    fn write(&self, payload: &[u8]) -> Result<()> {
        let (device, _) = split_channel(self.controller.channel());
        let framed = self.frame_write(payload);
        let link = self
            .link
            .read()
            .map_err(|_| DevCommError::NotConnected(device))?;
        match link.as_ref() {
            Some(mux) if mux.write(device, framed) => Ok(()),
            _ => Err(DevCommError::NotConnected(device)),
        }
    }
}

pub enum Folder {
    Status(StatusFolder),
    DeviceStatus(DeviceStatusFolder),
    Message(MessageFolder),
}

impl FolderOps for Folder {
    fn connection_state_changed(&self, device: DeviceId, peer: Option<SocketAddr>) {
        match self {
            Folder::Status(f) => f.connection_state_changed(device, peer),
            Folder::DeviceStatus(f) => f.connection_state_changed(device, peer),
            Folder::Message(f) => f.connection_state_changed(device, peer),
        }
    }

    fn activity_level_changed(&self, active: bool) {
        match self {
            Folder::Status(f) => f.activity_level_changed(active),
            Folder::DeviceStatus(f) => f.activity_level_changed(active),
            Folder::Message(f) => f.activity_level_changed(active),
        }
    }

    fn read(&self) -> FolderValues {
        match self {
            Folder::Status(f) => f.read(),
            Folder::DeviceStatus(f) => f.read(),
            Folder::Message(f) => f.read(),
        }
    }

    fn write(&self, payload: &[u8]) -> Result<()> {
        match self {
            Folder::Status(f) => f.write(payload),
            Folder::DeviceStatus(f) => f.write(payload),
            Folder::Message(f) => f.write(payload),
        }
    }
}
