// Copyright 2020 Joyent, Inc.

//! TCP multiplexer for the active role: we connect to every device.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use slog::{debug, info, o, warn, Drain, Logger};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::device::DeviceId;
use crate::error::Result;
use crate::protocol::FrameFormat;
use crate::transport::{run_connection, Command, ConnectionHandler, Control, Exit, Multiplexer};

struct Dialer {
    outbound: UnboundedSender<Bytes>,
    control: UnboundedSender<Control>,
    task: JoinHandle<()>,
}

/// Keep one outbound connection per device, redialing every `reconnect`
/// after a failure or disconnect until shut down.
pub fn connect(
    devices: Vec<(DeviceId, SocketAddr)>,
    reconnect: Duration,
    format: Arc<FrameFormat>,
    handler: Arc<dyn ConnectionHandler>,
    log: Option<&Logger>,
) -> Result<Multiplexer> {
    let log = log
        .cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
    let unbound = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));

    let mux = Multiplexer::spawn("devcomm-tcp-client", unbound, move |commands| {
        run(devices, reconnect, commands, format, handler, log)
    })?;
    Ok(mux)
}

async fn run(
    devices: Vec<(DeviceId, SocketAddr)>,
    reconnect: Duration,
    mut commands: UnboundedReceiver<Command>,
    format: Arc<FrameFormat>,
    handler: Arc<dyn ConnectionHandler>,
    log: Logger,
) {
    let mut dialers: HashMap<DeviceId, Dialer> = HashMap::new();
    for (device, addr) in devices {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (control, control_rx) = mpsc::unbounded_channel();
        let dial_log = log.new(o!("peer" => addr.to_string(), "device" => device));
        let task = tokio::spawn(dial(
            device,
            addr,
            reconnect,
            outbound_rx,
            control_rx,
            Arc::clone(&format),
            Arc::clone(&handler),
            dial_log,
        ));
        dialers.insert(
            device,
            Dialer {
                outbound,
                control,
                task,
            },
        );
    }

    while let Some(cmd) = commands.recv().await {
        match cmd {
            Command::Write(device, buf) => match dialers.get(&device) {
                Some(d) => {
                    let _ = d.outbound.send(buf);
                }
                None => debug!(log, "dropping write for unknown device"; "device" => device),
            },
            Command::Disconnect(device) => {
                if let Some(d) = dialers.get(&device) {
                    let _ = d.control.send(Control::Close);
                }
            }
            Command::Shutdown => break,
        }
    }

    for (_, dialer) in dialers.drain() {
        let Dialer { task, control, .. } = dialer;
        drop(control);
        let _ = task.await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn dial(
    device: DeviceId,
    addr: SocketAddr,
    reconnect: Duration,
    mut outbound: UnboundedReceiver<Bytes>,
    mut control: UnboundedReceiver<Control>,
    format: Arc<FrameFormat>,
    handler: Arc<dyn ConnectionHandler>,
    log: Logger,
) {
    loop {
        // Writes queued while there was no connection are stale.
        while outbound.try_recv().is_ok() {}

        let attempt = tokio::select! {
            ctl = control.recv() => match ctl {
                Some(Control::Close) => continue,
                None => return,
            },
            stream = TcpStream::connect(addr) => stream,
        };

        match attempt {
            Ok(stream) => {
                let exit = run_connection(
                    stream,
                    addr,
                    device,
                    &mut outbound,
                    &mut control,
                    Arc::clone(&format),
                    Arc::clone(&handler),
                    &log,
                )
                .await;
                if exit == Exit::Shutdown {
                    return;
                }
            }
            Err(e) => warn!(log, "failed to connect to device"; "err" => %e),
        }

        info!(log, "reconnecting"; "delay_ms" => reconnect.as_millis() as u64);
        tokio::select! {
            ctl = control.recv() => {
                if ctl.is_none() {
                    return;
                }
            }
            _ = sleep(reconnect) => (),
        }
    }
}
