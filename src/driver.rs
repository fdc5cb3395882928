// Copyright 2020 Joyent, Inc.

//! Wires configuration, devices, folders, delivery and transport together.
//!
//! A driver owns one folder per message per device. Each message folder has
//! a [`DeliveryController`] whose channel id is `device << 24 | message id`.
//! The multiplexer routes reassembled messages to the matching controller.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use slog::{debug, error, info, o, warn, Drain, Logger};

use crate::config::{DriverConfig, QueueMode, Role, Transport};
use crate::delivery::{DeliveryConfig, DeliveryController, DeliverySink, QueueMirror};
use crate::device::{
    channel_id, split_channel, ChannelId, DeviceId, DeviceRegistry, RemoteDevice,
};
use crate::error::{DevCommError, Result};
use crate::folder::{
    DeviceStatusFolder, Folder, FolderOps, FolderValues, Link, MessageFolder, StatusFolder,
};
use crate::protocol::{FrameFormat, RawMessage};
use crate::queue::PersistentQueue;
use crate::replication::{
    self, FullState, GlobalStatus, ReplicationBridge, ReplicationTransport, ReplicationUpdate,
};
use crate::scheduler::Scheduler;
use crate::transport::{ConnectionHandler, Multiplexer};
use crate::{client, server, udp};

/// Where a folder sits in the driver's tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FolderId {
    Status,
    Device(DeviceId),
    Message(ChannelId),
}

struct Folders {
    status: Folder,
    devices: BTreeMap<DeviceId, Folder>,
    messages: BTreeMap<ChannelId, Folder>,
}

impl Folders {
    fn all(&self) -> impl Iterator<Item = &Folder> {
        std::iter::once(&self.status)
            .chain(self.devices.values())
            .chain(self.messages.values())
    }

    fn get(&self, id: FolderId) -> Option<&Folder> {
        match id {
            FolderId::Status => Some(&self.status),
            FolderId::Device(d) => self.devices.get(&d),
            FolderId::Message(c) => self.messages.get(&c),
        }
    }

    fn message(&self, channel: ChannelId) -> Option<&MessageFolder> {
        match self.messages.get(&channel) {
            Some(Folder::Message(f)) => Some(f),
            _ => None,
        }
    }

    fn controllers(&self) -> impl Iterator<Item = &DeliveryController> {
        self.messages.values().filter_map(|f| match f {
            Folder::Message(m) => Some(m.controller()),
            _ => None,
        })
    }

    fn status(&self) -> Option<&StatusFolder> {
        match &self.status {
            Folder::Status(s) => Some(s),
            _ => None,
        }
    }
}

/// Multiplexer callbacks, routed into the folder tree.
struct Router {
    registry: Arc<DeviceRegistry>,
    folders: Arc<Folders>,
    log: Logger,
}

impl ConnectionHandler for Router {
    fn authorize(&self, peer: &SocketAddr) -> Option<DeviceId> {
        let device = self.registry.authorize(peer);
        if device.is_none() {
            info!(self.log, "rejecting unknown peer"; "peer" => %peer);
        }
        device
    }

    fn connected(&self, device: DeviceId, peer: &SocketAddr) {
        self.registry.set_address(device, Some(*peer));
        for f in self.folders.all() {
            f.connection_state_changed(device, Some(*peer));
        }
    }

    fn message(&self, device: DeviceId, id: u16, message: RawMessage) {
        let channel = channel_id(device, id);
        match self.folders.message(channel) {
            Some(f) => f.controller().message_arrived(message),
            None => debug!(self.log, "no folder for message";
                           "device" => device, "id" => id),
        }
    }

    fn disconnected(&self, device: DeviceId, _peer: &SocketAddr) {
        self.registry.set_address(device, None);
        for f in self.folders.all() {
            f.connection_state_changed(device, None);
        }
    }
}

pub struct Driver {
    config: DriverConfig,
    format: Arc<FrameFormat>,
    registry: Arc<DeviceRegistry>,
    folders: Arc<Folders>,
    router: Arc<Router>,
    link: Link,
    mux: Mutex<Option<Multiplexer>>,
    bridge: Option<Arc<ReplicationBridge>>,
    scheduler: Arc<dyn Scheduler>,
    cycling: AtomicBool,
    log: Logger,
}

impl Driver {
    /// Build the folder tree and open every channel's queue. Nothing touches
    /// the network until [`Driver::start`].
    pub fn new(
        config: DriverConfig,
        scheduler: Arc<dyn Scheduler>,
        sink: Arc<dyn DeliverySink>,
        transport: Option<Box<dyn ReplicationTransport>>,
        log: Option<&Logger>,
    ) -> Result<Driver> {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        config.validate()?;
        let format = Arc::new(FrameFormat::from_config(&config.protocol)?);
        let registry = Arc::new(DeviceRegistry::new(&config.devices, &log));
        let link: Link = Arc::new(RwLock::new(None));
        let bridge = transport.map(|t| Arc::new(ReplicationBridge::new(t, Some(&log))));
        let mirror = bridge
            .as_ref()
            .map(|b| Arc::clone(b) as Arc<dyn QueueMirror>);
        let delivery = DeliveryConfig::from(&config.queue);

        let mut devices = BTreeMap::new();
        let mut messages = BTreeMap::new();
        for dev in registry.all() {
            devices.insert(
                dev.device_id,
                Folder::DeviceStatus(DeviceStatusFolder::new(dev.device_id, dev.name())),
            );

            for id in format.catalog.ids().collect::<Vec<_>>() {
                let entry = match format.catalog.get(id) {
                    Some(e) => Arc::clone(e),
                    None => continue,
                };
                let channel = channel_id(dev.device_id, id);
                let queue = open_queue(&config, channel, &log);
                let controller = DeliveryController::new(
                    channel,
                    delivery,
                    queue,
                    Arc::clone(&scheduler),
                    Arc::clone(&sink),
                    mirror.clone(),
                    Some(&log),
                );
                messages.insert(
                    channel,
                    Folder::Message(MessageFolder::new(
                        entry,
                        config.protocol.byte_order,
                        controller,
                        Arc::clone(&link),
                    )),
                );
            }
        }

        info!(log, "driver configured";
              "devices" => devices.len(), "channels" => messages.len());

        let folders = Arc::new(Folders {
            status: Folder::Status(StatusFolder::default()),
            devices,
            messages,
        });
        let router = Arc::new(Router {
            registry: Arc::clone(&registry),
            folders: Arc::clone(&folders),
            log: log.new(o!("component" => "router")),
        });

        Ok(Driver {
            config,
            format,
            registry,
            folders,
            router,
            link,
            mux: Mutex::new(None),
            bridge,
            scheduler,
            cycling: AtomicBool::new(false),
            log,
        })
    }

    /// Start the multiplexer for the configured transport and role. Returns
    /// the bound address, or the unspecified address in the active role.
    pub fn start(&self) -> Result<SocketAddr> {
        let mut slot = self.mux.lock().map_err(|_| poisoned())?;
        if let Some(mux) = slot.as_ref() {
            return Ok(mux.local_addr());
        }

        let handler: Arc<dyn ConnectionHandler> = self.router.clone();
        let format = Arc::clone(&self.format);
        let mux = match (self.config.transport, self.config.role) {
            (Transport::Tcp, Role::Passive) => {
                server::listen(self.config.bind_address, format, handler, Some(&self.log))?
            }
            (Transport::Tcp, Role::Active) => {
                let targets = self
                    .registry
                    .all()
                    .into_iter()
                    .filter_map(|d| match d.dial_address() {
                        Some(addr) => Some((d.device_id, addr)),
                        None => {
                            warn!(self.log, "no address to dial"; "device" => d.name());
                            None
                        }
                    })
                    .collect();
                client::connect(
                    targets,
                    Duration::from_millis(self.config.reconnect_interval_ms),
                    format,
                    handler,
                    Some(&self.log),
                )?
            }
            (Transport::Udp, _) => {
                udp::bind(self.config.bind_address, format, handler, Some(&self.log))?
            }
        };

        let addr = mux.local_addr();
        match self.link.write() {
            Ok(mut link) => *link = Some(mux.handle()),
            Err(_) => return Err(poisoned()),
        }
        *slot = Some(mux);
        Ok(addr)
    }

    /// Stop the multiplexer and cancel all scheduled delivery work.
    pub fn stop(&self) {
        self.cycling.store(false, Ordering::SeqCst);
        if let Ok(mut link) = self.link.write() {
            *link = None;
        }
        let mux = self.mux.lock().ok().and_then(|mut m| m.take());
        if let Some(mux) = mux {
            mux.shutdown();
        }
        for c in self.folders.controllers() {
            c.shutdown();
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.mux
            .lock()
            .ok()
            .and_then(|m| m.as_ref().map(|m| m.local_addr()))
    }

    pub fn devices(&self) -> Vec<RemoteDevice> {
        self.registry.all()
    }

    pub fn folder_ids(&self) -> Vec<FolderId> {
        std::iter::once(FolderId::Status)
            .chain(self.folders.devices.keys().map(|d| FolderId::Device(*d)))
            .chain(self.folders.messages.keys().map(|c| FolderId::Message(*c)))
            .collect()
    }

    /// This node became the active (true) or backup (false) one.
    pub fn set_active(&self, active: bool) {
        info!(self.log, "activity level changed"; "active" => active);
        for f in self.folders.all() {
            f.activity_level_changed(active);
        }
    }

    /// Advance every channel by one consumer cycle.
    pub fn cycle(&self) {
        for c in self.folders.controllers() {
            if c.mode() != QueueMode::None {
                c.cycle();
            }
        }
    }

    /// Call [`Driver::cycle`] every `period` until [`Driver::stop`].
    pub fn start_cycles(self: &Arc<Self>, period: Duration) {
        if self.cycling.swap(true, Ordering::SeqCst) {
            return;
        }
        schedule_cycle(Arc::downgrade(self), Arc::clone(&self.scheduler), period);
    }

    pub fn acknowledge(&self, channel: ChannelId) -> Result<bool> {
        Ok(self.controller(channel)?.acknowledge())
    }

    pub fn read(&self, id: FolderId) -> Result<FolderValues> {
        Ok(self.folder(id)?.read())
    }

    pub fn write(&self, id: FolderId, payload: &[u8]) -> Result<()> {
        self.folder(id)?.write(payload)
    }

    pub fn controller(&self, channel: ChannelId) -> Result<&DeliveryController> {
        self.folders
            .message(channel)
            .map(|f| f.controller())
            .ok_or(DevCommError::UnknownChannel(channel))
    }

    fn folder(&self, id: FolderId) -> Result<&Folder> {
        self.folders.get(id).ok_or_else(|| match id {
            FolderId::Device(d) => DevCommError::NotConnected(d),
            FolderId::Message(c) => DevCommError::UnknownChannel(c),
            FolderId::Status => DevCommError::UnknownChannel(0),
        })
    }

    /// Everything a joining backup needs to catch up.
    pub fn full_state(&self) -> FullState {
        let connected_devices = self
            .folders
            .status()
            .map(|s| s.connected_devices())
            .unwrap_or_default();
        FullState {
            status: GlobalStatus { connected_devices },
            channels: self
                .folders
                .controllers()
                .filter(|c| c.mode() != QueueMode::None)
                .map(|c| c.snapshot())
                .collect(),
        }
    }

    /// A backup joined: send it the full state.
    pub fn publish_full_state(&self) {
        match &self.bridge {
            Some(bridge) => bridge.publish_full_state(&self.full_state()),
            None => debug!(self.log, "no replication transport configured"),
        }
    }

    /// Adopt the state the active node sent on joining.
    pub fn apply_full_state(&self, state: FullState) {
        if let Some(status) = self.folders.status() {
            status.set_connected_devices(&state.status.connected_devices);
        }
        for snap in state.channels {
            match self.folders.message(snap.channel) {
                Some(f) => f.controller().restore(snap),
                None => warn!(self.log, "full state for unknown channel";
                              "channel" => snap.channel),
            }
        }
    }

    /// Apply one replicated queue mutation. Returns how many stale entries
    /// were dropped on the way.
    pub fn apply_update(&self, update: &ReplicationUpdate) -> Result<usize> {
        let controller = self.controller(update.channel())?;
        Ok(controller.with_queue(|q, log| replication::apply_update(q, update, log)))
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn schedule_cycle(driver: Weak<Driver>, scheduler: Arc<dyn Scheduler>, period: Duration) {
    let next = Arc::clone(&scheduler);
    scheduler.schedule(
        period,
        Box::new(move || {
            let d = match driver.upgrade() {
                Some(d) => d,
                None => return,
            };
            if !d.cycling.load(Ordering::SeqCst) {
                return;
            }
            d.cycle();
            drop(d);
            schedule_cycle(driver, next, period);
        }),
    );
}

fn queue_path(config: &DriverConfig, channel: ChannelId) -> PathBuf {
    config.queue.directory.join(format!("{:08x}.q", channel))
}

fn open_queue(config: &DriverConfig, channel: ChannelId, log: &Logger) -> PersistentQueue {
    if !config.queue.persistent || config.queue.mode == QueueMode::None {
        return PersistentQueue::in_memory(Some(log));
    }

    let path = queue_path(config, channel);
    let (_, id) = split_channel(channel);
    let hash = config.protocol.content_hash(id);
    match PersistentQueue::open(&path, hash, config.queue.defrag_threshold, Some(log)) {
        Ok(q) => q,
        Err(e) => {
            error!(log, "cannot open queue file, keeping messages in memory";
                   "path" => path.display().to_string(), "err" => %e);
            PersistentQueue::in_memory(Some(log))
        }
    }
}

fn poisoned() -> DevCommError {
    DevCommError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        "driver lock poisoned",
    ))
}
