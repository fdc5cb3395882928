// Copyright 2020 Joyent, Inc.

//! Configured remote devices and channel addressing.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Mutex;

use slog::{warn, Logger};

use crate::config::DeviceConfig;

pub type DeviceId = u8;

/// `device << 24 | local message id`
pub type ChannelId = u32;

pub fn channel_id(device: DeviceId, local: u16) -> ChannelId {
    u32::from(device) << 24 | u32::from(local)
}

pub fn split_channel(channel: ChannelId) -> (DeviceId, u16) {
    ((channel >> 24) as DeviceId, channel as u16)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDevice {
    pub hostname: String,
    pub alias: String,
    pub device_id: DeviceId,
    pub port: Option<u16>,
    pub current_address: Option<SocketAddr>,
    addresses: Vec<IpAddr>,
}

impl RemoteDevice {
    pub fn name(&self) -> &str {
        if self.alias.is_empty() {
            &self.hostname
        } else {
            &self.alias
        }
    }

    /// Address to dial in the active role.
    pub fn dial_address(&self) -> Option<SocketAddr> {
        let port = self.port?;
        self.addresses.first().map(|ip| SocketAddr::new(*ip, port))
    }
}

pub struct DeviceRegistry {
    devices: Mutex<HashMap<DeviceId, RemoteDevice>>,
}

impl DeviceRegistry {
    /// Build the registry, resolving hostnames once. A device whose name
    /// does not resolve stays configured but can never be authorized.
    pub fn new(configs: &[DeviceConfig], log: &Logger) -> DeviceRegistry {
        let devices = configs
            .iter()
            .map(|c| {
                let addresses = resolve(&c.hostname);
                if addresses.is_empty() {
                    warn!(log, "device hostname did not resolve";
                          "hostname" => &c.hostname);
                }
                let dev = RemoteDevice {
                    hostname: c.hostname.clone(),
                    alias: c.alias.clone(),
                    device_id: c.device_id,
                    port: c.port,
                    current_address: None,
                    addresses,
                };
                (c.device_id, dev)
            })
            .collect();

        DeviceRegistry {
            devices: Mutex::new(devices),
        }
    }

    /// Map a connecting peer to its configured device.
    pub fn authorize(&self, peer: &SocketAddr) -> Option<DeviceId> {
        let devices = self.devices.lock().ok()?;
        devices
            .values()
            .find(|d| d.addresses.contains(&peer.ip()))
            .map(|d| d.device_id)
    }

    pub fn set_address(&self, device: DeviceId, addr: Option<SocketAddr>) {
        if let Ok(mut devices) = self.devices.lock() {
            if let Some(d) = devices.get_mut(&device) {
                d.current_address = addr;
            }
        }
    }

    pub fn get(&self, device: DeviceId) -> Option<RemoteDevice> {
        self.devices.lock().ok()?.get(&device).cloned()
    }

    pub fn all(&self) -> Vec<RemoteDevice> {
        let mut all: Vec<RemoteDevice> = match self.devices.lock() {
            Ok(d) => d.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        all.sort_by_key(|d| d.device_id);
        all
    }
}

fn resolve(hostname: &str) -> Vec<IpAddr> {
    if let Ok(ip) = hostname.parse::<IpAddr>() {
        return vec![ip];
    }
    match (hostname, 0).to_socket_addrs() {
        Ok(addrs) => addrs.map(|a| a.ip()).collect(),
        Err(_) => Vec::new(),
    }
}
