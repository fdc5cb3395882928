// Copyright 2020 Joyent, Inc.

mod common;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use slog::Logger;
use tokio::runtime::Runtime;

use devcomm::catalog::FieldValue;
use devcomm::config::DriverConfig;
use devcomm::delivery::DeliverySink;
use devcomm::device::{channel_id, ChannelId};
use devcomm::driver::{Driver, FolderId};
use devcomm::protocol::RawMessage;
use devcomm::replication::{FullState, ReplicationTransport, ReplicationUpdate};
use devcomm::scheduler::TokioScheduler;

use common::test_logger;

const TIMEOUT: Duration = Duration::from_secs(5);

struct ChannelSink {
    tx: Mutex<Sender<(ChannelId, RawMessage, bool)>>,
}

impl DeliverySink for ChannelSink {
    fn deliver(&self, channel: ChannelId, message: &RawMessage, handshake: bool) {
        let _ = self
            .tx
            .lock()
            .unwrap()
            .send((channel, message.clone(), handshake));
    }
}

fn sink() -> (Arc<ChannelSink>, Receiver<(ChannelId, RawMessage, bool)>) {
    let (tx, rx) = mpsc::channel();
    (Arc::new(ChannelSink { tx: Mutex::new(tx) }), rx)
}

fn driver_config(transport: &str, role: &str, mode: &str, devices: &str) -> DriverConfig {
    format!(
        r#"{{
            "transport": "{}",
            "role": "{}",
            "bind_address": "127.0.0.1:0",
            "devices": {},
            "protocol": {{
                "header": {{ "fields": ["packet_size"], "handshake": "06" }},
                "id_type": "byte",
                "messages": [{{
                    "id": 1,
                    "length_mode": "fixed",
                    "fields": [{{ "name": "v", "kind": "short" }}],
                    "write_prefix": "01 lenb"
                }}]
            }},
            "queue": {{ "mode": "{}" }},
            "reconnect_interval_ms": 100
        }}"#,
        transport, role, devices, mode
    )
    .parse()
    .expect("valid configuration")
}

fn start(
    rt: &Runtime,
    config: DriverConfig,
    sink: Arc<ChannelSink>,
    log: &Logger,
) -> (Driver, SocketAddr) {
    let scheduler = Arc::new(TokioScheduler::new(rt.handle().clone()));
    let driver = Driver::new(config, scheduler, sink, None, Some(log)).expect("driver");
    driver.set_active(true);
    let addr = driver.start().expect("start");
    (driver, addr)
}

fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

fn value(values: &[(String, FieldValue)], name: &str) -> Option<FieldValue> {
    values
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.clone())
}

fn connected(driver: &Driver, device: u8) -> bool {
    driver
        .read(FolderId::Device(device))
        .map(|v| value(&v, "connected") == Some(FieldValue::Bool(true)))
        .unwrap_or(false)
}

#[test]
fn tcp_device_round_trip() {
    let log = test_logger();
    let rt = Runtime::new().unwrap();
    let (sink, rx) = sink();
    let config = driver_config(
        "tcp",
        "passive",
        "handshake",
        r#"[{ "hostname": "127.0.0.1", "alias": "press", "device_id": 1 }]"#,
    );
    let (driver, addr) = start(&rt, config, sink, &log);
    let ch = channel_id(1, 1);

    let mut device = TcpStream::connect(addr).unwrap();
    device.set_read_timeout(Some(TIMEOUT)).unwrap();
    device.write_all(&[0x00, 0x03, 0x01, 0x00, 0x2a]).unwrap();

    let mut reply = [0u8; 1];
    device.read_exact(&mut reply).unwrap();
    assert_eq!(reply, [0x06]);

    let (channel, message, handshake) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(channel, ch);
    assert_eq!(&message.payload[..], &[0x00, 0x2a]);
    assert!(handshake);

    assert!(connected(&driver, 1));
    let values = driver.read(FolderId::Message(ch)).unwrap();
    assert_eq!(value(&values, "v"), Some(FieldValue::Int(42)));
    assert_eq!(value(&values, "handshake"), Some(FieldValue::Bool(true)));
    assert!(driver.acknowledge(ch).unwrap());

    driver.write(FolderId::Message(ch), &[9, 9]).unwrap();
    let mut out = [0u8; 4];
    device.read_exact(&mut out).unwrap();
    assert_eq!(out, [0x01, 0x02, 9, 9]);

    assert!(driver.write(FolderId::Status, &[1]).is_err());

    drop(device);
    assert!(wait_for(|| !connected(&driver, 1)));
    driver.stop();
}

#[test]
fn tcp_last_connect_wins() {
    let log = test_logger();
    let rt = Runtime::new().unwrap();
    let (sink, rx) = sink();
    let config = driver_config(
        "tcp",
        "passive",
        "none",
        r#"[{ "hostname": "127.0.0.1", "device_id": 1 }]"#,
    );
    let (driver, addr) = start(&rt, config, sink, &log);

    let mut first = TcpStream::connect(addr).unwrap();
    first.set_read_timeout(Some(TIMEOUT)).unwrap();
    assert!(wait_for(|| connected(&driver, 1)));

    let mut second = TcpStream::connect(addr).unwrap();
    second.set_read_timeout(Some(TIMEOUT)).unwrap();

    // The replaced socket is closed by the driver.
    let mut buf = [0u8; 1];
    assert!(matches!(first.read(&mut buf), Ok(0) | Err(_)));

    second.write_all(&[0x00, 0x03, 0x01, 0x00, 0x07]).unwrap();
    let (_, message, handshake) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(&message.payload[..], &[0x00, 0x07]);
    assert!(!handshake);
    assert!(connected(&driver, 1));
}

#[test]
fn tcp_unknown_peer_is_rejected() {
    let log = test_logger();
    let rt = Runtime::new().unwrap();
    let (sink, _rx) = sink();
    let config = driver_config(
        "tcp",
        "passive",
        "none",
        r#"[{ "hostname": "192.0.2.1", "device_id": 1 }]"#,
    );
    let (driver, addr) = start(&rt, config, sink, &log);

    let mut stranger = TcpStream::connect(addr).unwrap();
    stranger.set_read_timeout(Some(TIMEOUT)).unwrap();
    let mut buf = [0u8; 1];
    assert!(matches!(stranger.read(&mut buf), Ok(0) | Err(_)));
    assert!(!connected(&driver, 1));
}

#[test]
fn udp_device_round_trip() {
    let log = test_logger();
    let rt = Runtime::new().unwrap();
    let (sink, rx) = sink();
    let config = driver_config(
        "udp",
        "passive",
        "none",
        r#"[{ "hostname": "127.0.0.1", "device_id": 2 }]"#,
    );
    let (driver, addr) = start(&rt, config, sink, &log);

    let device = UdpSocket::bind("127.0.0.1:0").unwrap();
    device.set_read_timeout(Some(TIMEOUT)).unwrap();
    device.send_to(&[0x00, 0x03, 0x01, 0x12, 0x34], addr).unwrap();

    let mut buf = [0u8; 16];
    let (n, from) = device.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], &[0x06]);
    assert_eq!(from, addr);

    let (channel, message, _) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(channel, channel_id(2, 1));
    assert_eq!(&message.payload[..], &[0x12, 0x34]);
    assert!(connected(&driver, 2));

    driver.write(FolderId::Message(channel_id(2, 1)), &[5]).unwrap();
    let (n, _) = device.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], &[0x01, 0x01, 5]);

    driver.stop();
    assert!(!connected(&driver, 2));
}

#[test]
fn active_role_dials_and_redials() {
    let log = test_logger();
    let rt = Runtime::new().unwrap();
    let (sink, rx) = sink();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = driver_config(
        "tcp",
        "active",
        "delayed",
        &format!(
            r#"[{{ "hostname": "127.0.0.1", "device_id": 3, "port": {} }}]"#,
            port
        ),
    );
    let (driver, _) = start(&rt, config, sink, &log);
    let ch = channel_id(3, 1);

    let (mut device, _) = listener.accept().unwrap();
    device.set_read_timeout(Some(TIMEOUT)).unwrap();
    device.write_all(&[0x00, 0x03, 0x01, 0x00, 0x01]).unwrap();
    let mut reply = [0u8; 1];
    device.read_exact(&mut reply).unwrap();
    let (channel, _, handshake) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(channel, ch);
    assert!(!handshake);

    // Delayed mode retires the message after two cycles.
    driver.cycle();
    assert!(driver.controller(ch).unwrap().current().is_some());
    driver.cycle();
    assert!(driver.controller(ch).unwrap().current().is_none());

    drop(device);
    let (device, _) = listener.accept().unwrap();
    assert!(wait_for(|| connected(&driver, 3)));
    drop(device);
    driver.stop();
}

#[test]
fn packet_timeout_completes_message_and_answers() {
    let log = test_logger();
    let rt = Runtime::new().unwrap();
    let (sink, rx) = sink();
    let config: DriverConfig = r#"{
        "transport": "tcp",
        "bind_address": "127.0.0.1:0",
        "devices": [{ "hostname": "127.0.0.1", "device_id": 4 }],
        "protocol": {
            "header": { "fields": ["sequence_id"], "handshake": "06 sequence" },
            "id_type": "byte",
            "messages": [{ "id": 1, "length_mode": "packet_based" }],
            "packet_timeout_ms": 100
        }
    }"#
    .parse()
    .expect("valid configuration");
    let (driver, addr) = start(&rt, config, sink, &log);

    let mut device = TcpStream::connect(addr).unwrap();
    device.set_read_timeout(Some(TIMEOUT)).unwrap();
    device.write_all(&[0x00, 0x05, 0x01, 0xaa, 0xbb]).unwrap();

    let mut reply = [0u8; 3];
    device.read_exact(&mut reply).unwrap();
    assert_eq!(reply, [0x06, 0x00, 0x05]);

    let (channel, message, _) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(channel, channel_id(4, 1));
    assert_eq!(&message.payload[..], &[0xaa, 0xbb]);
    assert_eq!(message.sequence_number, 5);

    // The connection keeps serving after a timed-out packet.
    device.write_all(&[0x00, 0x06, 0x01, 0xcc]).unwrap();
    device.read_exact(&mut reply).unwrap();
    assert_eq!(reply, [0x06, 0x00, 0x06]);
    let (_, message, _) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(&message.payload[..], &[0xcc]);
    driver.stop();
}

/// Standby link that takes its time with every update.
struct SlowStandby {
    threads: Arc<Mutex<Vec<String>>>,
}

impl ReplicationTransport for SlowStandby {
    fn send_update(&self, _update: &ReplicationUpdate) {
        let name = thread::current().name().unwrap_or_default().to_string();
        self.threads.lock().unwrap().push(name);
        thread::sleep(Duration::from_millis(300));
    }

    fn send_full_state(&self, _state: &FullState) {}
}

#[test]
fn slow_standby_does_not_stall_other_devices() {
    let log = test_logger();
    let rt = Runtime::new().unwrap();
    let (sink, rx) = sink();
    let config = driver_config(
        "udp",
        "passive",
        "handshake",
        r#"[{ "hostname": "127.0.0.1", "device_id": 1 },
            { "hostname": "127.0.0.2", "device_id": 2 }]"#,
    );
    let threads = Arc::new(Mutex::new(Vec::new()));
    let standby = SlowStandby {
        threads: Arc::clone(&threads),
    };
    let scheduler = Arc::new(TokioScheduler::new(rt.handle().clone()));
    let driver = Driver::new(config, scheduler, sink, Some(Box::new(standby)), Some(&log))
        .expect("driver");
    driver.set_active(true);
    let addr = driver.start().expect("start");

    let first = UdpSocket::bind("127.0.0.1:0").unwrap();
    let second = UdpSocket::bind("127.0.0.2:0").unwrap();
    second.set_read_timeout(Some(TIMEOUT)).unwrap();

    let started = Instant::now();
    for seq in 0..3u8 {
        first.send_to(&[0x00, 0x03, 0x01, 0x00, seq], addr).unwrap();
    }
    second.send_to(&[0x00, 0x03, 0x01, 0x00, 0x09], addr).unwrap();

    let mut buf = [0u8; 16];
    let (n, _) = second.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], &[0x06]);
    assert!(started.elapsed() < Duration::from_millis(300));

    let mut channels = vec![
        rx.recv_timeout(TIMEOUT).unwrap().0,
        rx.recv_timeout(TIMEOUT).unwrap().0,
    ];
    channels.sort();
    assert_eq!(channels, vec![channel_id(1, 1), channel_id(2, 1)]);

    let threads = threads.lock().unwrap().clone();
    assert!(!threads.is_empty());
    assert!(threads.iter().all(|t| t != "devcomm-udp"));
    driver.stop();
}
