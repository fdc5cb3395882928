// Copyright 2020 Joyent, Inc.

//! TCP multiplexer for the passive role: devices connect to us.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use slog::{debug, error, info, o, warn, Drain, Logger};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::device::DeviceId;
use crate::error::{DevCommError, Result};
use crate::protocol::FrameFormat;
use crate::transport::{run_connection, Command, ConnectionHandler, Control, Multiplexer};

struct Connection {
    id: u64,
    peer: SocketAddr,
    outbound: UnboundedSender<Bytes>,
    control: UnboundedSender<Control>,
    task: JoinHandle<()>,
}

impl Connection {
    /// Close the socket and wait until the disconnect has been reported.
    async fn close(self) {
        let _ = self.control.send(Control::Close);
        let _ = self.task.await;
    }
}

/// Bind `addr` and start accepting device connections on a dedicated
/// thread. Failing to bind is the one fatal error of the engine.
pub fn listen(
    addr: SocketAddr,
    format: Arc<FrameFormat>,
    handler: Arc<dyn ConnectionHandler>,
    log: Option<&Logger>,
) -> Result<Multiplexer> {
    let log = log
        .cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

    let listener = std::net::TcpListener::bind(addr)
        .map_err(|source| DevCommError::Bind { addr, source })?;
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;
    info!(log, "listening for device connections"; "address" => %local_addr);

    let mux = Multiplexer::spawn("devcomm-tcp", local_addr, move |commands| {
        serve(listener, commands, format, handler, log)
    })?;
    Ok(mux)
}

async fn serve(
    listener: std::net::TcpListener,
    mut commands: UnboundedReceiver<Command>,
    format: Arc<FrameFormat>,
    handler: Arc<dyn ConnectionHandler>,
    log: Logger,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(l) => l,
        Err(e) => {
            error!(log, "failed to register listener"; "err" => %e);
            return;
        }
    };

    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<(DeviceId, u64)>();
    let mut conns: HashMap<DeviceId, Connection> = HashMap::new();
    let mut next_id = 0u64;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let device = match handler.authorize(&peer) {
                        Some(d) => d,
                        None => {
                            info!(log, "rejected connection"; "peer" => %peer);
                            continue;
                        }
                    };

                    // Last connect wins: retire the previous socket first so
                    // its disconnect is reported before the new connect.
                    if let Some(old) = conns.remove(&device) {
                        info!(log, "replacing existing connection";
                              "device" => device, "old" => %old.peer, "new" => %peer);
                        old.close().await;
                    }

                    next_id += 1;
                    let conn = spawn_connection(
                        stream,
                        peer,
                        device,
                        next_id,
                        closed_tx.clone(),
                        Arc::clone(&format),
                        Arc::clone(&handler),
                        &log,
                    );
                    conns.insert(device, conn);
                }
                Err(e) => warn!(log, "failed to accept socket"; "err" => %e),
            },
            cmd = commands.recv() => match cmd {
                Some(Command::Write(device, buf)) => match conns.get(&device) {
                    Some(conn) => {
                        let _ = conn.outbound.send(buf);
                    }
                    None => debug!(log, "dropping write for unconnected device";
                                   "device" => device),
                },
                Some(Command::Disconnect(device)) => {
                    if let Some(conn) = conns.remove(&device) {
                        conn.close().await;
                    }
                }
                Some(Command::Shutdown) | None => break,
            },
            Some((device, id)) = closed_rx.recv() => {
                if conns.get(&device).map(|c| c.id) == Some(id) {
                    conns.remove(&device);
                }
            }
        }
    }

    info!(log, "shutting down"; "connections" => conns.len());
    for (_, conn) in conns.drain() {
        conn.close().await;
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_connection(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    device: DeviceId,
    id: u64,
    closed: UnboundedSender<(DeviceId, u64)>,
    format: Arc<FrameFormat>,
    handler: Arc<dyn ConnectionHandler>,
    log: &Logger,
) -> Connection {
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
    let (control, mut control_rx) = mpsc::unbounded_channel();
    let conn_log = log.new(o!("peer" => peer.to_string(), "device" => device));

    let task = tokio::spawn(async move {
        run_connection(
            stream,
            peer,
            device,
            &mut outbound_rx,
            &mut control_rx,
            format,
            handler,
            &conn_log,
        )
        .await;
        let _ = closed.send((device, id));
    });

    Connection {
        id,
        peer,
        outbound,
        control,
        task,
    }
}
