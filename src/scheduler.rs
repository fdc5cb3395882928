// Copyright 2020 Joyent, Inc.

//! Task execution contract used by everything downstream of reassembly.

use std::sync::Mutex;
use std::time::Duration;

use tokio::runtime::Handle;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait Scheduler: Send + Sync {
    /// Run `task` once, as soon as possible, off the caller's thread.
    fn execute(&self, task: Task);

    /// Run `task` once after `delay`.
    fn schedule(&self, delay: Duration, task: Task);
}

/// Runs tasks on the blocking pool of a tokio runtime. Queue work touches
/// the filesystem, so it stays off the async worker threads.
#[derive(Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> TokioScheduler {
        TokioScheduler { handle }
    }
}

impl Scheduler for TokioScheduler {
    fn execute(&self, task: Task) {
        self.handle.spawn_blocking(task);
    }

    fn schedule(&self, delay: Duration, task: Task) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tokio::task::spawn_blocking(task).await;
        });
    }
}

/// Collects tasks and runs them only when asked to. Lets callers observe
/// exactly how many tasks a sequence of operations scheduled.
#[derive(Default)]
pub struct ManualScheduler {
    pending: Mutex<Vec<(Duration, Task)>>,
}

impl ManualScheduler {
    pub fn new() -> ManualScheduler {
        ManualScheduler::default()
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Run the tasks queued so far, ignoring their delays. Tasks they queue
    /// in turn stay pending. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let tasks: Vec<(Duration, Task)> = match self.pending.lock() {
            Ok(mut p) => p.drain(..).collect(),
            Err(_) => return 0,
        };
        let count = tasks.len();
        for (_, task) in tasks {
            task();
        }
        count
    }

    /// Run until nothing is left.
    pub fn run_all(&self) -> usize {
        let mut total = 0;
        loop {
            let ran = self.run_pending();
            if ran == 0 {
                return total;
            }
            total += ran;
        }
    }
}

impl Scheduler for ManualScheduler {
    fn execute(&self, task: Task) {
        self.schedule(Duration::from_millis(0), task);
    }

    fn schedule(&self, delay: Duration, task: Task) {
        if let Ok(mut p) = self.pending.lock() {
            p.push((delay, task));
        }
    }
}
