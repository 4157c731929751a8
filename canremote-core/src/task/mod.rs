//! Periodic transmission.
//!
//! A [`CyclicTask`] owns one worker thread that sends its message on a
//! [`Bus`] every period. [`TaskPool`] keeps the tasks of one session keyed
//! by arbitration id.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::bus::Bus;
use crate::error::CanError;
use crate::message::Message;

/// Longest a worker waits on the bus for one transmission.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Longest `stop` waits for a worker before detaching it.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(2);

// ── CyclicTask ───────────────────────────────────────────────────

struct Shared {
    bus: Bus,
    message: Mutex<Message>,
    period: Duration,
    duration: Option<Duration>,
    /// Bumped on every start and stop. A worker runs while it still
    /// holds the current value.
    epoch: Mutex<u64>,
    wake: Condvar,
    running: AtomicBool,
}

/// Sends one message periodically until stopped.
///
/// Dropping the task stops it.
pub struct CyclicTask {
    arbitration_id: u32,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl CyclicTask {
    /// Create a stopped task. Call [`start`](Self::start) to begin sending.
    pub fn new(
        bus: Bus,
        message: Message,
        period: Duration,
        duration: Option<Duration>,
    ) -> Result<Self, CanError> {
        if period.is_zero() {
            return Err(CanError::InvalidArgument("period must be positive".into()));
        }
        message.validate()?;
        Ok(Self {
            arbitration_id: message.arbitration_id,
            shared: Arc::new(Shared {
                bus,
                message: Mutex::new(message),
                period,
                duration,
                epoch: Mutex::new(0),
                wake: Condvar::new(),
                running: AtomicBool::new(false),
            }),
            worker: None,
        })
    }

    pub fn arbitration_id(&self) -> u32 {
        self.arbitration_id
    }

    pub fn period(&self) -> Duration {
        self.shared.period
    }

    pub fn duration(&self) -> Option<Duration> {
        self.shared.duration
    }

    pub fn message(&self) -> Message {
        self.shared.message.lock().clone()
    }

    /// `false` once stopped, finished, or failed.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Spawn the worker. Does nothing while already running.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        // A worker that ended on its own leaves a finished handle behind.
        if let Some(handle) = self.worker.take() {
            join_bounded(handle, STOP_TIMEOUT, "cyclic task worker");
        }
        let epoch = {
            let mut current = self.shared.epoch.lock();
            *current += 1;
            *current
        };
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let id = self.arbitration_id;
        self.worker = Some(thread::spawn(move || {
            run(&shared, id, epoch);
            let current = shared.epoch.lock();
            if *current == epoch {
                shared.running.store(false, Ordering::SeqCst);
            }
        }));
        debug!(id, period = ?self.shared.period, "cyclic task started");
    }

    /// Stop the worker and wait a bounded time for it to exit.
    ///
    /// A worker stuck in the backend past [`STOP_TIMEOUT`] is detached; it
    /// exits without sending again once the backend returns.
    pub fn stop(&mut self) {
        {
            let mut epoch = self.shared.epoch.lock();
            *epoch += 1;
            self.shared.wake.notify_all();
        }
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            join_bounded(handle, STOP_TIMEOUT, "cyclic task worker");
            debug!(id = self.arbitration_id, "cyclic task stopped");
        }
    }

    /// Replace the payload without resetting the schedule.
    pub fn modify_data(&self, message: Message) -> Result<(), CanError> {
        if message.arbitration_id != self.arbitration_id {
            return Err(CanError::InvalidArgument(format!(
                "arbitration id cannot change from {:#x} to {:#x}",
                self.arbitration_id, message.arbitration_id
            )));
        }
        message.validate()?;
        *self.shared.message.lock() = message;
        Ok(())
    }
}

impl Drop for CyclicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for CyclicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CyclicTask")
            .field("arbitration_id", &self.arbitration_id)
            .field("period", &self.shared.period)
            .field("duration", &self.shared.duration)
            .field("running", &self.is_running())
            .finish()
    }
}

fn run(shared: &Shared, id: u32, epoch: u64) {
    let started = Instant::now();
    loop {
        if *shared.epoch.lock() != epoch {
            return;
        }
        let send_start = Instant::now();
        let msg = shared.message.lock().clone();
        if let Err(e) = shared.bus.send(&msg, Some(SEND_TIMEOUT)) {
            if *shared.epoch.lock() == epoch {
                error!(id, error = %e, "cyclic transmission failed, stopping task");
            }
            return;
        }
        if shared.duration.is_some_and(|d| started.elapsed() >= d) {
            debug!(id, "cyclic task duration elapsed");
            return;
        }

        let delay = shared.period.saturating_sub(send_start.elapsed());
        let mut current = shared.epoch.lock();
        if *current == epoch && !delay.is_zero() {
            let deadline = Instant::now() + delay;
            while *current == epoch && !shared.wake.wait_until(&mut current, deadline).timed_out() {}
        }
        if *current != epoch {
            return;
        }
    }
}

// ── Threads ──────────────────────────────────────────────────────

/// Poll until `handle` has finished or `timeout` passes.
pub(crate) fn wait_finished(handle: &JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
    true
}

/// Join `handle`, giving up after `timeout`.
///
/// On expiry the thread is detached and `false` returned.
pub(crate) fn join_bounded(handle: JoinHandle<()>, timeout: Duration, name: &str) -> bool {
    if !wait_finished(&handle, timeout) {
        warn!("{name} did not stop within {timeout:?}, detaching");
        return false;
    }
    if handle.join().is_err() {
        warn!("{name} panicked");
    }
    true
}

// ── TaskPool ─────────────────────────────────────────────────────

/// The cyclic tasks of one bus, keyed by arbitration id.
pub struct TaskPool {
    bus: Bus,
    tasks: HashMap<u32, CyclicTask>,
}

impl TaskPool {
    pub fn new(bus: Bus) -> Self {
        Self {
            bus,
            tasks: HashMap::new(),
        }
    }

    /// Start sending `msg`, or update and restart the task already
    /// sending its arbitration id.
    pub fn start_or_update(
        &mut self,
        msg: Message,
        period: Duration,
        duration: Option<Duration>,
    ) -> Result<(), CanError> {
        let id = msg.arbitration_id;
        if let Some(task) = self.tasks.get_mut(&id) {
            if task.period() == period && task.duration() == duration {
                task.modify_data(msg)?;
                task.start();
                return Ok(());
            }
        }
        if let Some(mut old) = self.tasks.remove(&id) {
            old.stop();
        }
        let task = self.bus.send_periodic(msg, period, duration)?;
        self.tasks.insert(id, task);
        Ok(())
    }

    /// Swap the payload of the task sending `msg`'s arbitration id.
    pub fn update(&mut self, msg: Message) -> Result<(), CanError> {
        match self.tasks.get(&msg.arbitration_id) {
            Some(task) => task.modify_data(msg),
            None => Err(CanError::InvalidArgument(format!(
                "no periodic task for id {:#x}",
                msg.arbitration_id
            ))),
        }
    }

    /// Stop and forget the task for `arbitration_id`. Returns whether one existed.
    pub fn stop(&mut self, arbitration_id: u32) -> bool {
        match self.tasks.remove(&arbitration_id) {
            Some(mut task) => {
                task.stop();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&mut self) {
        for (_, mut task) in self.tasks.drain() {
            task.stop();
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, arbitration_id: u32) -> Option<&CyclicTask> {
        self.tasks.get(&arbitration_id)
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.stop_all();
    }
}

// ── Tests ────────────────────────────────────────────────────────
