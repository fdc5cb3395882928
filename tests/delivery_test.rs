// Copyright 2020 Joyent, Inc.

mod common;

use std::sync::{Arc, Mutex};

use bytes::Bytes;

use devcomm::config::QueueMode;
use devcomm::delivery::{DeliveryConfig, DeliveryController, QueueMirror};
use devcomm::device::{channel_id, ChannelId};
use devcomm::protocol::key_of;
use devcomm::queue::PersistentQueue;
use devcomm::scheduler::ManualScheduler;

use common::{raw, test_logger, RecordingSink};

fn config(mode: QueueMode) -> DeliveryConfig {
    DeliveryConfig {
        mode,
        max_depth: 500,
        handshake_timeout_cycles: 5,
        delay_cycles: 2,
    }
}

fn channel() -> ChannelId {
    channel_id(2, 7)
}

fn controller(
    config: DeliveryConfig,
    sched: &Arc<ManualScheduler>,
    sink: &Arc<RecordingSink>,
) -> DeliveryController {
    let log = test_logger();
    DeliveryController::new(
        channel(),
        config,
        PersistentQueue::in_memory(Some(&log)),
        sched.clone(),
        sink.clone(),
        None,
        Some(&log),
    )
}

#[test]
fn handshake_add_schedules_exactly_one_evaluation() {
    let sched = Arc::new(ManualScheduler::new());
    let sink = RecordingSink::new();
    let c = controller(config(QueueMode::Handshake), &sched, &sink);
    c.set_active(true);
    assert_eq!(sched.pending(), 0);

    let m1 = raw(1000, 1, b"m1");
    let m2 = raw(1001, 2, b"m2");
    // Arrivals are buffered and applied by a single drain task.
    c.message_arrived(m1.clone());
    assert_eq!(sched.pending(), 1);
    c.message_arrived(m2.clone());
    assert_eq!(sched.pending(), 1);
    assert_eq!(c.queue_len(), 0);

    assert_eq!(sched.run_pending(), 1);
    assert_eq!(c.queue_len(), 2);
    assert_eq!(c.current(), None);
    assert_eq!(sched.pending(), 1);

    assert_eq!(sched.run_pending(), 1);
    assert_eq!(c.current(), Some(m1.clone()));
    assert!(c.handshake_raised());
    assert_eq!(sched.pending(), 0);
    {
        let delivered = sink.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0], (channel(), m1, true));
    }

    // Lowering the flag pops one entry and schedules one more evaluation.
    assert!(c.acknowledge());
    assert_eq!(c.queue_len(), 1);
    assert_eq!(c.current(), None);
    assert_eq!(sched.pending(), 1);

    sched.run_pending();
    assert_eq!(c.current(), Some(m2));
    assert!(c.acknowledge());
    assert_eq!(c.queue_len(), 0);
    assert_eq!(sched.pending(), 0);
    assert_eq!(sink.retired_count(), 2);

    assert!(!c.acknowledge());
}

#[test]
fn handshake_times_out_after_configured_cycles() {
    let sched = Arc::new(ManualScheduler::new());
    let sink = RecordingSink::new();
    let c = controller(config(QueueMode::Handshake), &sched, &sink);
    c.set_active(true);

    c.message_arrived(raw(1, 1, b"a"));
    c.message_arrived(raw(2, 2, b"b"));
    sched.run_all();

    for _ in 0..4 {
        c.cycle();
    }
    assert!(c.handshake_raised());
    assert_eq!(c.state().timer_ticks, 4);
    assert_eq!(c.queue_len(), 2);

    c.cycle();
    assert!(!c.handshake_raised());
    assert_eq!(c.queue_len(), 1);
    assert_eq!(sched.pending(), 1);

    sched.run_pending();
    assert_eq!(sink.delivered_payloads(), vec![b"a".to_vec(), b"b".to_vec()]);
    assert_eq!(c.state().timer_ticks, 0);
}

#[test]
fn delayed_retires_after_two_cycles() {
    let sched = Arc::new(ManualScheduler::new());
    let sink = RecordingSink::new();
    let c = controller(config(QueueMode::Delayed), &sched, &sink);
    c.set_active(true);

    c.message_arrived(raw(1, 1, b"a"));
    sched.run_all();
    assert_eq!(c.current().map(|m| m.payload), Some(Bytes::from_static(b"a")));
    assert!(!c.handshake_raised());
    assert!(!sink.delivered.lock().unwrap()[0].2);

    // No acknowledgement in delayed mode.
    assert!(!c.acknowledge());

    c.cycle();
    assert!(c.current().is_some());
    c.cycle();
    assert!(c.current().is_none());
    assert_eq!(c.queue_len(), 0);
    assert_eq!(sink.retired_count(), 1);
}

#[test]
fn overflow_discards_single_oldest() {
    let sched = Arc::new(ManualScheduler::new());
    let sink = RecordingSink::new();
    let mut cfg = config(QueueMode::Handshake);
    cfg.max_depth = 3;
    let c = controller(cfg, &sched, &sink);
    c.set_active(true);

    for i in 1..=4 {
        c.message_arrived(raw(i, i as u16, &[i as u8]));
    }
    assert_eq!(sched.run_pending(), 1);
    assert_eq!(c.queue_len(), 3);
    let keys: Vec<u64> = c
        .snapshot()
        .entries
        .iter()
        .filter_map(|e| key_of(e))
        .collect();
    assert_eq!(
        keys,
        vec![raw(2, 2, &[]).key(), raw(3, 3, &[]).key(), raw(4, 4, &[]).key()]
    );

    sched.run_all();
    assert_eq!(sink.delivered_payloads(), vec![vec![2]]);
}

#[test]
fn inactive_controller_leaves_queue_alone() {
    let sched = Arc::new(ManualScheduler::new());
    let sink = RecordingSink::new();
    let c = controller(config(QueueMode::Handshake), &sched, &sink);

    assert!(!c.is_active());
    c.message_arrived(raw(1, 1, b"a"));
    assert_eq!(c.queue_len(), 0);
    assert_eq!(sched.pending(), 0);
    c.cycle();
    assert!(!c.acknowledge());
}

#[test]
fn deactivation_cancels_and_reactivation_restarts_at_head() {
    let sched = Arc::new(ManualScheduler::new());
    let sink = RecordingSink::new();
    let c = controller(config(QueueMode::Handshake), &sched, &sink);
    c.set_active(true);

    c.message_arrived(raw(1, 1, b"a"));
    sched.run_pending();
    assert_eq!(sched.pending(), 1);
    // Flip twice before the evaluation runs: the first task is stale.
    c.set_active(false);
    c.set_active(true);
    assert_eq!(sched.pending(), 2);
    sched.run_pending();
    assert_eq!(sink.delivered_payloads(), vec![b"a".to_vec()]);

    c.set_active(false);
    assert!(c.current().is_none());
    assert!(!c.handshake_raised());
    assert_eq!(c.queue_len(), 1);
    assert_eq!(sink.retired_count(), 1);

    c.set_active(true);
    sched.run_pending();
    assert_eq!(sink.delivered_payloads(), vec![b"a".to_vec(), b"a".to_vec()]);
    assert!(c.handshake_raised());
}

#[test]
fn arrivals_buffered_before_deactivation_are_dropped() {
    let sched = Arc::new(ManualScheduler::new());
    let sink = RecordingSink::new();
    let c = controller(config(QueueMode::Handshake), &sched, &sink);
    c.set_active(true);

    c.message_arrived(raw(1, 1, b"a"));
    c.set_active(false);
    sched.run_all();
    assert_eq!(c.queue_len(), 0);

    // The drain finished, so the next arrival starts a new one.
    c.set_active(true);
    c.message_arrived(raw(2, 2, b"b"));
    assert_eq!(sched.pending(), 1);
    sched.run_all();
    assert_eq!(sink.delivered_payloads(), vec![b"b".to_vec()]);
}

#[test]
fn shutdown_makes_pending_work_a_no_op() {
    let sched = Arc::new(ManualScheduler::new());
    let sink = RecordingSink::new();
    let c = controller(config(QueueMode::Handshake), &sched, &sink);
    c.set_active(true);

    c.message_arrived(raw(1, 1, b"a"));
    c.shutdown();
    sched.run_all();
    assert!(sink.delivered.lock().unwrap().is_empty());
}

#[test]
fn none_mode_delivers_each_message_directly() {
    let sched = Arc::new(ManualScheduler::new());
    let sink = RecordingSink::new();
    let c = controller(config(QueueMode::None), &sched, &sink);

    c.message_arrived(raw(1, 1, b"dropped"));
    assert_eq!(sched.pending(), 0);

    c.set_active(true);
    c.message_arrived(raw(2, 2, b"x"));
    c.message_arrived(raw(3, 3, b"y"));
    assert_eq!(sched.pending(), 1);
    sched.run_all();

    assert_eq!(sink.delivered_payloads(), vec![b"x".to_vec(), b"y".to_vec()]);
    assert!(sink.delivered.lock().unwrap().iter().all(|d| !d.2));
    assert_eq!(c.queue_len(), 0);
}

#[derive(Default)]
struct RecordingMirror {
    events: Mutex<Vec<String>>,
}

impl QueueMirror for RecordingMirror {
    fn added(&self, channel: ChannelId, entry: &Bytes) {
        let key = key_of(entry).unwrap_or_default();
        self.events
            .lock()
            .unwrap()
            .push(format!("add {:x} {:x}", channel, key));
    }

    fn removed(&self, channel: ChannelId, key: u64) {
        self.events
            .lock()
            .unwrap()
            .push(format!("remove {:x} {:x}", channel, key));
    }
}

#[test]
fn mutations_are_mirrored_in_order() {
    let sched = Arc::new(ManualScheduler::new());
    let sink = RecordingSink::new();
    let mirror = Arc::new(RecordingMirror::default());
    let log = test_logger();
    let c = DeliveryController::new(
        channel(),
        config(QueueMode::Handshake),
        PersistentQueue::in_memory(Some(&log)),
        sched.clone(),
        sink.clone(),
        Some(mirror.clone() as Arc<dyn QueueMirror>),
        Some(&log),
    );
    c.set_active(true);

    let m1 = raw(0x10, 1, b"a");
    c.message_arrived(m1.clone());
    assert!(mirror.events.lock().unwrap().is_empty());
    sched.run_all();
    c.acknowledge();

    let events = mirror.events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            format!("add {:x} {:x}", channel(), m1.key()),
            format!("remove {:x} {:x}", channel(), m1.key()),
        ]
    );
}

#[test]
fn restore_replaces_queue_and_state() {
    let sched = Arc::new(ManualScheduler::new());
    let sink = RecordingSink::new();
    let active = controller(config(QueueMode::Handshake), &sched, &sink);
    active.set_active(true);
    active.message_arrived(raw(1, 1, b"a"));
    active.message_arrived(raw(2, 2, b"b"));
    sched.run_all();

    let snap = active.snapshot();
    assert!(snap.state.awaiting_ack);
    assert_eq!(snap.entries.len(), 2);

    let backup_sink = RecordingSink::new();
    let backup = controller(config(QueueMode::Handshake), &sched, &backup_sink);
    backup.restore(snap.clone());
    assert_eq!(backup.queue_len(), 2);
    assert_eq!(backup.state(), snap.state);
    assert_eq!(sched.pending(), 0);

    // Taking over starts from the head again.
    backup.set_active(true);
    sched.run_pending();
    assert_eq!(backup_sink.delivered_payloads(), vec![b"a".to_vec()]);
}
