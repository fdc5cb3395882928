// Copyright 2020 Joyent, Inc.

//! Pieces shared by the TCP and UDP multiplexers.
//!
//! Every multiplexer runs one event loop on one dedicated thread. All of its
//! sockets and reassemblers live on that thread. Other threads talk to it
//! only through a [`MultiplexerHandle`], which queues commands and wakes the
//! loop; the loop then performs the socket writes itself.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use slog::{debug, info, trace, warn, Logger};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{sleep_until, Instant as TokioInstant};
use tokio_util::codec::{BytesCodec, FramedRead, FramedWrite};

use crate::device::DeviceId;
use crate::protocol::{FrameEvent, FrameFormat, FrameReassembler, RawMessage};

/// Callbacks from a multiplexer to its consumer. Invoked on the
/// multiplexer thread; implementations should hand work off quickly.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Decide whether `peer` may talk to us, and as which device.
    fn authorize(&self, peer: &SocketAddr) -> Option<DeviceId>;

    fn connected(&self, _device: DeviceId, _peer: &SocketAddr) {}

    /// A complete message for catalog entry `id` arrived from `device`.
    fn message(&self, device: DeviceId, id: u16, message: RawMessage);

    fn disconnected(&self, _device: DeviceId, _peer: &SocketAddr) {}
}

#[derive(Debug)]
pub(crate) enum Command {
    Write(DeviceId, Bytes),
    Disconnect(DeviceId),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exit {
    /// The peer went away or the socket failed.
    PeerGone,
    /// Closed on request; the owner may reconnect.
    Closed,
    /// The owner is gone; do not reconnect.
    Shutdown,
}

/// Thread-safe handle used to queue work for a multiplexer.
#[derive(Clone)]
pub struct MultiplexerHandle {
    tx: UnboundedSender<Command>,
}

impl MultiplexerHandle {
    /// Queue `buf` for `device`. Returns false if the multiplexer is gone.
    pub fn write(&self, device: DeviceId, buf: Bytes) -> bool {
        self.tx.send(Command::Write(device, buf)).is_ok()
    }

    pub fn disconnect(&self, device: DeviceId) -> bool {
        self.tx.send(Command::Disconnect(device)).is_ok()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

/// A running multiplexer thread. Dropping it shuts the loop down and waits
/// for the thread to finish.
pub struct Multiplexer {
    handle: MultiplexerHandle,
    local_addr: SocketAddr,
    thread: Option<thread::JoinHandle<()>>,
}

impl Multiplexer {
    pub(crate) fn spawn<F, Fut>(
        name: &str,
        local_addr: SocketAddr,
        run: F,
    ) -> io::Result<Multiplexer>
    where
        F: FnOnce(UnboundedReceiver<Command>) -> Fut + Send + 'static,
        Fut: Future<Output = ()>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || runtime.block_on(async move { run(rx).await }))?;

        Ok(Multiplexer {
            handle: MultiplexerHandle { tx },
            local_addr,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> MultiplexerHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Serve one TCP connection until the peer leaves or the owner closes it.
///
/// Reassembly state is created here and dies with the connection. Queued
/// outbound buffers that were not written by then are discarded.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_connection(
    stream: TcpStream,
    peer: SocketAddr,
    device: DeviceId,
    outbound: &mut UnboundedReceiver<Bytes>,
    control: &mut UnboundedReceiver<Control>,
    format: Arc<FrameFormat>,
    handler: Arc<dyn ConnectionHandler>,
    log: &Logger,
) -> Exit {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(log, "failed to disable Nagle's algorithm"; "err" => %e);
    }
    let (rd, wr) = stream.into_split();
    let mut frames = FramedRead::new(rd, FrameReassembler::new(format, Some(log)));
    let mut sink = FramedWrite::new(wr, BytesCodec::new());

    handler.connected(device, &peer);
    info!(log, "device connected");

    let exit = 'serve: loop {
        let deadline = frames.decoder().next_deadline();
        tokio::select! {
            biased;

            ctl = control.recv() => match ctl {
                Some(Control::Close) => break Exit::Closed,
                None => break Exit::Shutdown,
            },
            frame = frames.next() => match frame {
                Some(Ok(event)) => {
                    if let Err(e) = dispatch(event, device, &mut sink, &*handler, log).await {
                        warn!(log, "failed to send handshake"; "err" => %e);
                        break Exit::PeerGone;
                    }
                }
                Some(Err(e)) => {
                    warn!(log, "read failed"; "err" => %e);
                    break Exit::PeerGone;
                }
                None => {
                    debug!(log, "peer closed connection");
                    break Exit::PeerGone;
                }
            },
            out = outbound.recv() => match out {
                Some(buf) => {
                    if let Err(e) = drain_outbound(buf, outbound, &mut sink).await {
                        warn!(log, "write failed"; "err" => %e);
                        break Exit::PeerGone;
                    }
                }
                None => break Exit::Shutdown,
            },
            _ = sleep_until(to_tokio(deadline)), if deadline.is_some() => {
                let events = frames.decoder_mut().expire(std::time::Instant::now());
                for event in events {
                    if let Err(e) = dispatch(event, device, &mut sink, &*handler, log).await {
                        warn!(log, "failed to send handshake"; "err" => %e);
                        break 'serve Exit::PeerGone;
                    }
                }
            }
        }
    };

    let mut dropped = 0;
    while outbound.try_recv().is_ok() {
        dropped += 1;
    }
    info!(log, "device disconnected"; "reason" => ?exit, "dropped_writes" => dropped);
    handler.disconnected(device, &peer);
    exit
}

type TcpSink = FramedWrite<tokio::net::tcp::OwnedWriteHalf, BytesCodec>;

async fn dispatch(
    event: FrameEvent,
    device: DeviceId,
    sink: &mut TcpSink,
    handler: &dyn ConnectionHandler,
    log: &Logger,
) -> io::Result<()> {
    match event {
        FrameEvent::Message { id, message } => {
            trace!(log, "delivering message"; "id" => id);
            handler.message(device, id, message);
            Ok(())
        }
        FrameEvent::Reply(reply) => sink.send(reply).await,
    }
}

/// Write `first` and whatever else is already queued, then flush once.
async fn drain_outbound(
    first: Bytes,
    outbound: &mut UnboundedReceiver<Bytes>,
    sink: &mut TcpSink,
) -> io::Result<()> {
    sink.feed(first).await?;
    while let Ok(buf) = outbound.try_recv() {
        sink.feed(buf).await?;
    }
    SinkExt::<Bytes>::flush(sink).await
}

pub(crate) fn to_tokio(deadline: Option<std::time::Instant>) -> TokioInstant {
    match deadline {
        Some(d) => TokioInstant::from_std(d),
        None => TokioInstant::now(),
    }
}
