// Copyright 2020 Joyent, Inc.

//! Per-channel delivery state machine.
//!
//! In `None` mode every message goes straight to the consumer. In `Delayed`
//! and `Handshake` mode messages are queued and the queue head is exposed as
//! the channel's *current* message:
//!
//! * Delayed: the head is retired after it has been current for a number of
//!   consumer cycles, without any acknowledgement.
//! * Handshake: the head stays current until the consumer acknowledges it,
//!   or until it has been ignored for a number of cycles.
//!
//! Only an active node evaluates its queues. A backup keeps them in step
//! through replication and starts over from the head once it takes over.
//!
//! Arrivals come from a multiplexer thread. They are only buffered there;
//! queueing, persistence and mirroring happen in a drain task on the
//! scheduler, one drain per channel at a time so arrival order is kept.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use chrono::Utc;
use slog::{debug, o, trace, warn, Drain, Logger};

use crate::config::{QueueConfig, QueueMode};
use crate::device::ChannelId;
use crate::protocol::{key_of, RawMessage};
use crate::queue::PersistentQueue;
use crate::scheduler::Scheduler;

/// Receives what a channel exposes to its consumer.
///
/// Called with the channel lock held, so a consumer updating and reading
/// back its values never sees two messages mixed. Implementations must not
/// call back into the controller.
pub trait DeliverySink: Send + Sync {
    /// `message` is now current for `channel`. `handshake` is set when the
    /// consumer is expected to acknowledge it.
    fn deliver(&self, channel: ChannelId, message: &RawMessage, handshake: bool);

    /// Nothing is current for `channel` any more.
    fn retired(&self, _channel: ChannelId) {}
}

/// Told about every queue mutation made by an active controller.
pub trait QueueMirror: Send + Sync {
    fn added(&self, channel: ChannelId, entry: &Bytes);
    fn removed(&self, channel: ChannelId, key: u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryConfig {
    pub mode: QueueMode,
    pub max_depth: usize,
    pub handshake_timeout_cycles: u32,
    pub delay_cycles: u32,
}

impl From<&QueueConfig> for DeliveryConfig {
    fn from(q: &QueueConfig) -> DeliveryConfig {
        DeliveryConfig {
            mode: q.mode,
            max_depth: q.max_depth,
            handshake_timeout_cycles: q.handshake_timeout_cycles,
            delay_cycles: q.delay_cycles,
        }
    }
}

/// The replicated part of a channel's delivery state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryState {
    pub mode: QueueMode,
    pub awaiting_ack: bool,
    pub timer_ticks: u32,
    pub first_delivered_timestamp: Option<i64>,
}

impl DeliveryState {
    fn new(mode: QueueMode) -> DeliveryState {
        DeliveryState {
            mode,
            awaiting_ack: false,
            timer_ticks: 0,
            first_delivered_timestamp: None,
        }
    }

    fn reset(&mut self) {
        *self = DeliveryState::new(self.mode);
    }
}

/// A channel's queue content plus delivery state, for full-state transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub channel: ChannelId,
    pub state: DeliveryState,
    pub entries: Vec<Bytes>,
}

struct Inner {
    queue: PersistentQueue,
    state: DeliveryState,
    current: Option<RawMessage>,
    active: bool,
    evaluation_pending: bool,
    /// Bumped to cancel evaluations that are already scheduled.
    generation: u64,
}

/// Messages handed over by the multiplexer, not yet applied.
#[derive(Default)]
struct Inbound {
    messages: VecDeque<RawMessage>,
    draining: bool,
}

struct Shared {
    channel: ChannelId,
    config: DeliveryConfig,
    inner: Mutex<Inner>,
    inbound: Mutex<Inbound>,
    /// Mirrors `Inner::active` so arrivals can be filtered without waiting
    /// for the channel lock.
    accepting: AtomicBool,
    scheduler: Arc<dyn Scheduler>,
    sink: Arc<dyn DeliverySink>,
    mirror: Option<Arc<dyn QueueMirror>>,
    log: Logger,
}

/// Cheap to clone; all clones drive the same channel.
#[derive(Clone)]
pub struct DeliveryController {
    shared: Arc<Shared>,
}

impl DeliveryController {
    pub fn new(
        channel: ChannelId,
        config: DeliveryConfig,
        queue: PersistentQueue,
        scheduler: Arc<dyn Scheduler>,
        sink: Arc<dyn DeliverySink>,
        mirror: Option<Arc<dyn QueueMirror>>,
        log: Option<&Logger>,
    ) -> DeliveryController {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("channel" => format!("{:#010x}", channel)));

        DeliveryController {
            shared: Arc::new(Shared {
                channel,
                config,
                inner: Mutex::new(Inner {
                    queue,
                    state: DeliveryState::new(config.mode),
                    current: None,
                    active: false,
                    evaluation_pending: false,
                    generation: 0,
                }),
                inbound: Mutex::new(Inbound::default()),
                accepting: AtomicBool::new(false),
                scheduler,
                sink,
                mirror,
                log,
            }),
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.shared.channel
    }

    pub fn mode(&self) -> QueueMode {
        self.shared.config.mode
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic inside a sink must not wedge the channel for good.
        match self.shared.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn inbound(&self) -> MutexGuard<'_, Inbound> {
        match self.shared.inbound.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Hand a freshly reassembled message to the channel. Never blocks on
    /// the channel lock, the queue file or the mirror.
    pub fn message_arrived(&self, message: RawMessage) {
        if !self.shared.accepting.load(Ordering::SeqCst) {
            trace!(self.shared.log, "inactive, dropping message");
            return;
        }

        let start_drain = {
            let mut inbound = self.inbound();
            inbound.messages.push_back(message);
            !std::mem::replace(&mut inbound.draining, true)
        };
        if start_drain {
            let this = self.clone();
            self.shared
                .scheduler
                .execute(Box::new(move || this.drain_inbound()));
        }
    }

    fn drain_inbound(&self) {
        loop {
            let message = {
                let mut inbound = self.inbound();
                match inbound.messages.pop_front() {
                    Some(m) => m,
                    None => {
                        inbound.draining = false;
                        return;
                    }
                }
            };
            self.accept(message);
        }
    }

    fn accept(&self, message: RawMessage) {
        let shared = &self.shared;
        let mut inner = self.lock();
        if !inner.active {
            trace!(shared.log, "inactive, not accepting message");
            return;
        }

        if shared.config.mode == QueueMode::None {
            shared.sink.deliver(shared.channel, &message, false);
            return;
        }

        if inner.queue.len() >= shared.config.max_depth {
            warn!(shared.log, "queue full, discarding oldest message";
                  "depth" => inner.queue.len());
            self.remove_head(&mut inner);
        }

        let entry = message.encode();
        inner.queue.add(entry.clone());
        if let Some(mirror) = &shared.mirror {
            mirror.added(shared.channel, &entry);
        }
        trace!(shared.log, "message queued"; "depth" => inner.queue.len());

        self.maybe_schedule(&mut inner);
    }

    /// The consumer lowered the handshake flag. Returns false when there was
    /// nothing to acknowledge.
    pub fn acknowledge(&self) -> bool {
        let mut inner = self.lock();
        if self.shared.config.mode != QueueMode::Handshake || !inner.state.awaiting_ack {
            return false;
        }
        debug!(self.shared.log, "handshake acknowledged");
        self.retire(&mut inner);
        true
    }

    /// One consumer cycle elapsed.
    pub fn cycle(&self) {
        let mut inner = self.lock();
        if !inner.active {
            return;
        }

        match self.shared.config.mode {
            QueueMode::Handshake if inner.state.awaiting_ack => {
                inner.state.timer_ticks += 1;
                if inner.state.timer_ticks >= self.shared.config.handshake_timeout_cycles {
                    warn!(self.shared.log, "handshake not acknowledged, forcing it low";
                          "cycles" => inner.state.timer_ticks);
                    self.retire(&mut inner);
                }
            }
            QueueMode::Delayed if inner.current.is_some() => {
                inner.state.timer_ticks = inner.state.timer_ticks.saturating_sub(1);
                if inner.state.timer_ticks == 0 {
                    self.retire(&mut inner);
                }
            }
            _ => (),
        }
    }

    /// This node became active (true) or backup (false).
    pub fn set_active(&self, active: bool) {
        let mut inner = self.lock();
        if inner.active == active {
            return;
        }
        debug!(self.shared.log, "activity level changed"; "active" => active);

        inner.active = active;
        self.shared.accepting.store(active, Ordering::SeqCst);
        inner.generation += 1;
        inner.evaluation_pending = false;
        let had_current = inner.current.take().is_some();
        inner.state.reset();

        if active {
            self.maybe_schedule(&mut inner);
        } else if had_current {
            self.shared.sink.retired(self.shared.channel);
        }
    }

    /// Cancel anything scheduled; later timer firings do nothing.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        inner.generation += 1;
        inner.evaluation_pending = false;
        inner.active = false;
        self.shared.accepting.store(false, Ordering::SeqCst);
        self.inbound().messages.clear();
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    pub fn current(&self) -> Option<RawMessage> {
        self.lock().current.clone()
    }

    /// Current message and handshake flag, read under one lock.
    pub fn view(&self) -> (Option<RawMessage>, bool) {
        let inner = self.lock();
        (inner.current.clone(), inner.state.awaiting_ack)
    }

    pub fn handshake_raised(&self) -> bool {
        self.lock().state.awaiting_ack
    }

    pub fn state(&self) -> DeliveryState {
        self.lock().state
    }

    pub fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        let inner = self.lock();
        ChannelSnapshot {
            channel: self.shared.channel,
            state: inner.state,
            entries: inner.queue.iter().cloned().collect(),
        }
    }

    /// Replace queue and state wholesale from a peer's snapshot.
    pub fn restore(&self, snapshot: ChannelSnapshot) {
        let mut inner = self.lock();
        inner.queue.replace(snapshot.entries);
        inner.state = DeliveryState {
            mode: self.shared.config.mode,
            ..snapshot.state
        };
        inner.current = None;
        inner.generation += 1;
        inner.evaluation_pending = false;
        if inner.active {
            inner.state.reset();
            self.maybe_schedule(&mut inner);
        }
    }

    /// Run `f` against the queue under the channel lock. Used to apply
    /// replicated mutations on a backup.
    pub fn with_queue<R, F: FnOnce(&mut PersistentQueue, &Logger) -> R>(&self, f: F) -> R {
        let mut inner = self.lock();
        f(&mut inner.queue, &self.shared.log)
    }

    fn maybe_schedule(&self, inner: &mut Inner) {
        if !inner.active
            || inner.evaluation_pending
            || inner.current.is_some()
            || inner.state.awaiting_ack
            || inner.queue.is_empty()
        {
            return;
        }

        inner.evaluation_pending = true;
        let generation = inner.generation;
        let this = self.clone();
        self.shared
            .scheduler
            .execute(Box::new(move || this.evaluate(generation)));
    }

    fn evaluate(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        inner.evaluation_pending = false;
        if !inner.active || inner.current.is_some() || inner.state.awaiting_ack {
            return;
        }

        let head = match inner.queue.peek() {
            Some(h) => h.clone(),
            None => return,
        };
        let message = match RawMessage::parse(&head) {
            Ok(m) => m,
            Err(e) => {
                warn!(self.shared.log, "dropping unreadable queue entry"; "err" => %e);
                self.remove_head(&mut inner);
                self.maybe_schedule(&mut inner);
                return;
            }
        };

        match self.shared.config.mode {
            QueueMode::Handshake => {
                inner.state.awaiting_ack = true;
                inner.state.timer_ticks = 0;
            }
            QueueMode::Delayed => {
                inner.state.timer_ticks = self.shared.config.delay_cycles.max(1);
            }
            QueueMode::None => (),
        }
        inner.state.first_delivered_timestamp = Some(Utc::now().timestamp_millis());
        inner.current = Some(message.clone());

        let handshake = self.shared.config.mode == QueueMode::Handshake;
        self.shared.sink.deliver(self.shared.channel, &message, handshake);
    }

    /// Pop the current head and move on to the next one.
    fn retire(&self, inner: &mut Inner) {
        self.remove_head(inner);
        self.maybe_schedule(inner);
    }

    fn remove_head(&self, inner: &mut Inner) {
        let head = match inner.queue.poll() {
            Some(h) => h,
            None => return,
        };
        if let (Some(mirror), Some(key)) = (&self.shared.mirror, key_of(&head)) {
            mirror.removed(self.shared.channel, key);
        }

        let had_current = inner.current.take().is_some();
        inner.state.reset();
        if had_current {
            self.shared.sink.retired(self.shared.channel);
        }
    }
}
