//! Serial task queue that owns the delivery state.
//!
//! Every read or write of driver, coordinator and reconciler state happens
//! inside a task run by [`EventLoop::drain`]. Other threads hold a
//! [`LoopHandle`] and post closures; nothing touches the state directly.
//!
//! A drain only runs tasks that were due when it started. Tasks posted while
//! draining wait for the next drain, which is what lets a retry be observed
//! "after exactly one drain".

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

pub type Task<S> = Box<dyn FnOnce(&mut S, &LoopHandle<S>) + Send>;

/// Cancels a delayed task before it runs.
#[derive(Debug, Clone, Default)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

enum LoopClock {
    Real(Instant),
    Manual(Mutex<Duration>),
}

impl LoopClock {
    fn elapsed(&self) -> Duration {
        match self {
            Self::Real(start) => start.elapsed(),
            Self::Manual(now) => *now.lock(),
        }
    }
}

struct Entry<S> {
    task: Task<S>,
    handle: TaskHandle,
}

struct Queue<S> {
    // Keyed by (due, sequence) so equal deadlines keep posting order.
    tasks: BTreeMap<(Duration, u64), Entry<S>>,
    next_seq: u64,
}

struct Shared<S> {
    queue: Mutex<Queue<S>>,
    notify: Notify,
    clock: LoopClock,
}

/// Posts work onto the loop from any thread.
pub struct LoopHandle<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for LoopHandle<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S: 'static> LoopHandle<S> {
    /// Runs `task` on the next drain.
    pub fn post<F>(&self, task: F) -> TaskHandle
    where
        F: FnOnce(&mut S, &LoopHandle<S>) + Send + 'static,
    {
        self.post_delayed(Duration::ZERO, task)
    }

    /// Runs `task` on the first drain at least `delay` from now.
    pub fn post_delayed<F>(&self, delay: Duration, task: F) -> TaskHandle
    where
        F: FnOnce(&mut S, &LoopHandle<S>) + Send + 'static,
    {
        let handle = TaskHandle::default();
        let due = self.now() + delay;
        {
            let mut queue = self.shared.queue.lock();
            let seq = queue.next_seq;
            queue.next_seq += 1;
            queue.tasks.insert(
                (due, seq),
                Entry {
                    task: Box::new(task),
                    handle: handle.clone(),
                },
            );
        }
        self.shared.notify.notify_one();
        handle
    }

    /// Awaits `future` on the tokio runtime, off the loop, then posts `then`
    /// with its output. Must be called from within a runtime.
    pub fn spawn_then<T, Fut, F>(&self, future: Fut, then: F) -> JoinHandle<()>
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        F: FnOnce(&mut S, &LoopHandle<S>, T) + Send + 'static,
    {
        let handle = self.clone();
        tokio::spawn(async move {
            let output = future.await;
            handle.post(move |state: &mut S, handle: &LoopHandle<S>| then(state, handle, output));
        })
    }

    /// Time since the loop was created, on the loop's own clock.
    pub fn now(&self) -> Duration {
        self.shared.clock.elapsed()
    }

    pub fn pending(&self) -> usize {
        self.shared
            .queue
            .lock()
            .tasks
            .values()
            .filter(|entry| !entry.handle.is_cancelled())
            .count()
    }

    fn next_due(&self) -> Option<Duration> {
        self.shared
            .queue
            .lock()
            .tasks
            .keys()
            .next()
            .map(|(due, _)| *due)
    }
}

pub struct EventLoop<S> {
    state: S,
    handle: LoopHandle<S>,
}

impl<S: 'static> EventLoop<S> {
    /// Loop driven by the tokio clock.
    pub fn new(state: S) -> Self {
        Self::with_clock(state, LoopClock::Real(Instant::now()))
    }

    /// Loop whose clock only moves through [`EventLoop::advance`].
    pub fn manual(state: S) -> Self {
        Self::with_clock(state, LoopClock::Manual(Mutex::new(Duration::ZERO)))
    }

    fn with_clock(state: S, clock: LoopClock) -> Self {
        Self {
            state,
            handle: LoopHandle {
                shared: Arc::new(Shared {
                    queue: Mutex::new(Queue {
                        tasks: BTreeMap::new(),
                        next_seq: 0,
                    }),
                    notify: Notify::new(),
                    clock,
                }),
            },
        }
    }

    pub fn handle(&self) -> LoopHandle<S> {
        self.handle.clone()
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    /// Moves a manual clock forward. Real clocks ignore this.
    pub fn advance(&self, by: Duration) {
        if let LoopClock::Manual(now) = &self.handle.shared.clock {
            *now.lock() += by;
        }
    }

    /// Runs every task that is due now, in order. Returns how many ran.
    pub fn drain(&mut self) -> usize {
        let now = self.handle.now();
        let due = {
            let mut queue = self.handle.shared.queue.lock();
            let later = queue.tasks.split_off(&(now, u64::MAX));
            std::mem::replace(&mut queue.tasks, later)
        };

        let mut ran = 0;
        for entry in due.into_values() {
            if entry.handle.is_cancelled() {
                continue;
            }
            (entry.task)(&mut self.state, &self.handle);
            ran += 1;
        }
        ran
    }

    /// Drains until `shutdown` resolves, then hands the state back.
    pub async fn run<F>(mut self, shutdown: F) -> S
    where
        F: Future<Output = ()>,
    {
        info!("Event loop started");
        tokio::pin!(shutdown);
        loop {
            let ran = self.drain();
            if ran > 0 {
                debug!(tasks = ran, "Drained event loop");
            }

            let notify = self.handle.shared.notify.notified();
            let wait = match self.handle.next_due() {
                Some(due) => due.saturating_sub(self.handle.now()),
                None => Duration::from_secs(3600),
            };

            tokio::select! {
                _ = &mut shutdown => break,
                _ = notify => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        info!("Event loop stopped");
        self.state
    }
}
