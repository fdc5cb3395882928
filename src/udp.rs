// Copyright 2020 Joyent, Inc.

//! UDP multiplexer.
//!
//! UDP has no accept: a remote address counts as connected the first time a
//! datagram arrives from it and the handler authorizes it. A rejected peer is
//! not remembered, so its next datagram asks the handler again.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use slog::{debug, error, info, o, trace, warn, Drain, Logger};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::sleep_until;

use crate::device::DeviceId;
use crate::error::{DevCommError, Result};
use crate::protocol::{FrameEvent, FrameFormat, FrameReassembler};
use crate::transport::{to_tokio, Command, ConnectionHandler, Multiplexer};

const MAX_DATAGRAM: usize = 65536;

struct Peer {
    device: DeviceId,
    frames: FrameReassembler,
}

struct Peers {
    by_addr: HashMap<SocketAddr, Peer>,
    by_device: HashMap<DeviceId, SocketAddr>,
}

impl Peers {
    fn next_deadline(&self) -> Option<Instant> {
        self.by_addr
            .values()
            .filter_map(|p| p.frames.next_deadline())
            .min()
    }

    fn remove_device(&mut self, device: DeviceId) -> Option<SocketAddr> {
        let addr = self.by_device.remove(&device)?;
        self.by_addr.remove(&addr);
        Some(addr)
    }
}

pub fn bind(
    addr: SocketAddr,
    format: Arc<FrameFormat>,
    handler: Arc<dyn ConnectionHandler>,
    log: Option<&Logger>,
) -> Result<Multiplexer> {
    let log = log
        .cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

    let socket = std::net::UdpSocket::bind(addr)
        .map_err(|source| DevCommError::Bind { addr, source })?;
    socket.set_nonblocking(true)?;
    let local_addr = socket.local_addr()?;
    info!(log, "listening for device datagrams"; "address" => %local_addr);

    let mux = Multiplexer::spawn("devcomm-udp", local_addr, move |commands| {
        serve(socket, commands, format, handler, log)
    })?;
    Ok(mux)
}

async fn serve(
    socket: std::net::UdpSocket,
    mut commands: UnboundedReceiver<Command>,
    format: Arc<FrameFormat>,
    handler: Arc<dyn ConnectionHandler>,
    log: Logger,
) {
    let socket = match UdpSocket::from_std(socket) {
        Ok(s) => s,
        Err(e) => {
            error!(log, "failed to register socket"; "err" => %e);
            return;
        }
    };

    let mut peers = Peers {
        by_addr: HashMap::new(),
        by_device: HashMap::new(),
    };
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let deadline = peers.next_deadline();
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, addr)) => {
                    if !peers.by_addr.contains_key(&addr)
                        && !admit(&mut peers, addr, &format, &*handler, &log)
                    {
                        continue;
                    }
                    let events = match peers.by_addr.get_mut(&addr) {
                        Some(peer) => peer.frames.add_data(&buf[..n]),
                        None => continue,
                    };
                    let device = peers.by_addr[&addr].device;
                    dispatch(events, device, addr, &socket, &*handler, &log).await;
                }
                // ICMP port unreachable shows up here on some platforms.
                Err(e) => debug!(log, "receive failed"; "err" => %e),
            },
            cmd = commands.recv() => match cmd {
                Some(Command::Write(device, out)) => match peers.by_device.get(&device) {
                    Some(addr) => {
                        if let Err(e) = socket.send_to(&out, *addr).await {
                            warn!(log, "send failed"; "device" => device, "err" => %e);
                        }
                    }
                    None => debug!(log, "dropping write for unknown peer"; "device" => device),
                },
                Some(Command::Disconnect(device)) => {
                    if let Some(addr) = peers.remove_device(device) {
                        handler.disconnected(device, &addr);
                    }
                }
                Some(Command::Shutdown) | None => break,
            },
            _ = sleep_until(to_tokio(deadline)), if deadline.is_some() => {
                let now = Instant::now();
                let mut due = Vec::new();
                for (addr, peer) in peers.by_addr.iter_mut() {
                    let events = peer.frames.expire(now);
                    if !events.is_empty() {
                        due.push((*addr, peer.device, events));
                    }
                }
                for (addr, device, events) in due {
                    dispatch(events, device, addr, &socket, &*handler, &log).await;
                }
            }
        }
    }

    info!(log, "shutting down"; "peers" => peers.by_addr.len());
    for (addr, peer) in peers.by_addr.drain() {
        handler.disconnected(peer.device, &addr);
    }
}

fn admit(
    peers: &mut Peers,
    addr: SocketAddr,
    format: &Arc<FrameFormat>,
    handler: &dyn ConnectionHandler,
    log: &Logger,
) -> bool {
    let device = match handler.authorize(&addr) {
        Some(d) => d,
        None => {
            debug!(log, "rejected datagram"; "peer" => %addr);
            return false;
        }
    };

    if let Some(old) = peers.remove_device(device) {
        info!(log, "device moved to a new address";
              "device" => device, "old" => %old, "new" => %addr);
        handler.disconnected(device, &old);
    }

    let peer_log = log.new(o!("peer" => addr.to_string(), "device" => device));
    peers.by_addr.insert(
        addr,
        Peer {
            device,
            frames: FrameReassembler::new(Arc::clone(format), Some(&peer_log)),
        },
    );
    peers.by_device.insert(device, addr);
    handler.connected(device, &addr);
    true
}

async fn dispatch(
    events: Vec<FrameEvent>,
    device: DeviceId,
    addr: SocketAddr,
    socket: &UdpSocket,
    handler: &dyn ConnectionHandler,
    log: &Logger,
) {
    for event in events {
        match event {
            FrameEvent::Message { id, message } => {
                trace!(log, "delivering message"; "device" => device, "id" => id);
                handler.message(device, id, message);
            }
            FrameEvent::Reply(reply) => {
                if let Err(e) = socket.send_to(&reply, addr).await {
                    warn!(log, "failed to send handshake"; "peer" => %addr, "err" => %e);
                }
            }
        }
    }
}
