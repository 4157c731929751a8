//! The bus abstraction every frame source and sink sits behind.
//!
//! A [`BusBackend`] is the raw driver: a vendor binding, the in-process
//! [`VirtualBus`], or a [`RemoteBus`](crate::remote::RemoteBus). [`Bus`]
//! wraps one and adds what every backend needs but should not implement
//! itself: a send lock shared with cyclic tasks, software filtering and
//! [`send_periodic`](Bus::send_periodic).

pub mod config;
pub mod virtual_bus;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::CanError;
use crate::filter::{Filter, matches_filters};
use crate::message::Message;
use crate::task::CyclicTask;

pub use config::BusConfig;
pub use virtual_bus::{VirtualBus, VirtualNetwork};

// ── Backend contract ─────────────────────────────────────────────

/// A driver for one CAN channel.
///
/// Methods take `&self`: a backend is used from a receive thread and one
/// or more transmit threads at once. `None` timeouts block indefinitely.
pub trait BusBackend: Send + Sync {
    /// Transmit `msg`, waiting up to `timeout` for room to send it.
    fn send(&self, msg: &Message, timeout: Option<Duration>) -> Result<(), CanError>;

    /// Wait up to `timeout` for the next frame.
    ///
    /// The flag is `true` when the backend already applied the filters
    /// passed to [`set_filters`](Self::set_filters).
    fn recv(&self, timeout: Option<Duration>) -> Result<(Option<Message>, bool), CanError>;

    /// Install acceptance filters in hardware, if the backend can.
    fn set_filters(&self, _filters: &[Filter]) -> Result<(), CanError> {
        Ok(())
    }

    /// Release the channel. Called at most once.
    fn shutdown(&self) -> Result<(), CanError> {
        Ok(())
    }

    fn channel_info(&self) -> String;
}

/// Opens backends on behalf of a server session.
pub trait BusFactory: Send + Sync {
    fn open(&self, config: &BusConfig) -> Result<Box<dyn BusBackend>, CanError>;
}

impl<F> BusFactory for F
where
    F: Fn(&BusConfig) -> Result<Box<dyn BusBackend>, CanError> + Send + Sync,
{
    fn open(&self, config: &BusConfig) -> Result<Box<dyn BusBackend>, CanError> {
        self(config)
    }
}

// ── Bus ──────────────────────────────────────────────────────────

struct BusInner {
    backend: Box<dyn BusBackend>,
    send_lock: Mutex<()>,
    filters: RwLock<Vec<Filter>>,
    shut_down: AtomicBool,
}

/// Cloneable handle to an open bus.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn new(backend: impl BusBackend + 'static) -> Self {
        Self::from_backend(Box::new(backend))
    }

    pub fn from_backend(backend: Box<dyn BusBackend>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                backend,
                send_lock: Mutex::new(()),
                filters: RwLock::new(Vec::new()),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Open a backend through `factory` and apply the configured filters.
    pub fn open(factory: &dyn BusFactory, config: &BusConfig) -> Result<Self, CanError> {
        let bus = Self::from_backend(factory.open(config)?);
        if let Some(filters) = &config.can_filters {
            bus.set_filters(filters.clone())?;
        }
        Ok(bus)
    }

    /// Transmit one frame. Concurrent senders, cyclic tasks included, are
    /// serialized; `timeout` also bounds the wait for the send lock.
    pub fn send(&self, msg: &Message, timeout: Option<Duration>) -> Result<(), CanError> {
        if self.is_shut_down() {
            return Err(CanError::Disconnected);
        }
        let _guard = match timeout {
            Some(t) => self
                .inner
                .send_lock
                .try_lock_for(t)
                .ok_or(CanError::Timeout(t))?,
            None => self.inner.send_lock.lock(),
        };
        self.inner.backend.send(msg, timeout)
    }

    /// Wait up to `timeout` for the next frame passing the filters.
    ///
    /// Frames rejected by the software filters do not restart the clock.
    pub fn recv(&self, timeout: Option<Duration>) -> Result<Option<Message>, CanError> {
        let start = Instant::now();
        let mut time_left = timeout;
        loop {
            let (msg, already_filtered) = self.inner.backend.recv(time_left)?;
            let Some(msg) = msg else {
                return Ok(None);
            };
            if already_filtered || matches_filters(&msg, &self.inner.filters.read()) {
                return Ok(Some(msg));
            }
            debug!(id = msg.arbitration_id, "frame rejected by filters");

            if let Some(timeout) = timeout {
                let elapsed = start.elapsed();
                if elapsed >= timeout {
                    return Ok(None);
                }
                time_left = Some(timeout - elapsed);
            }
        }
    }

    /// Replace the acceptance filters. An empty list accepts everything.
    pub fn set_filters(&self, filters: Vec<Filter>) -> Result<(), CanError> {
        self.inner.backend.set_filters(&filters)?;
        *self.inner.filters.write() = filters;
        Ok(())
    }

    pub fn filters(&self) -> Vec<Filter> {
        self.inner.filters.read().clone()
    }

    /// Start transmitting `msg` every `period`, for `duration` if given.
    pub fn send_periodic(
        &self,
        msg: Message,
        period: Duration,
        duration: Option<Duration>,
    ) -> Result<CyclicTask, CanError> {
        let mut task = CyclicTask::new(self.clone(), msg, period, duration)?;
        task.start();
        Ok(task)
    }

    /// Release the backend. Later calls are no-ops.
    pub fn shutdown(&self) -> Result<(), CanError> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.backend.shutdown()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    pub fn channel_info(&self) -> String {
        self.inner.backend.channel_info()
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("channel_info", &self.channel_info())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Bus, Bus) {
        let network = VirtualNetwork::new();
        (
            Bus::new(network.open("test")),
            Bus::new(network.open("test")),
        )
    }

    #[test]
    fn send_and_recv() {
        let (a, b) = pair();
        let msg = Message::new(0x123, vec![1, 2, 3]);
        a.send(&msg, None).unwrap();
        let got = b.recv(Some(Duration::from_secs(1))).unwrap().unwrap();
        assert!(got.equals(&msg, None));
    }

    #[test]
    fn recv_times_out() {
        let (_a, b) = pair();
        let start = Instant::now();
        assert!(b.recv(Some(Duration::from_millis(50))).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn software_filters_drop_nonmatching() {
        let (a, b) = pair();
        b.set_filters(vec![Filter::new(0x200, 0x7FF)]).unwrap();
        a.send(&Message::new(0x100, vec![1]), None).unwrap();
        a.send(&Message::new(0x200, vec![2]), None).unwrap();

        let got = b.recv(Some(Duration::from_secs(1))).unwrap().unwrap();
        assert_eq!(got.arbitration_id, 0x200);
        assert!(b.recv(Some(Duration::from_millis(20))).unwrap().is_none());
    }

    #[test]
    fn filtered_flood_respects_deadline() {
        let (a, b) = pair();
        b.set_filters(vec![Filter::new(0x7FF, 0x7FF)]).unwrap();
        for _ in 0..1000 {
            a.send(&Message::new(0x001, vec![]), None).unwrap();
        }
        let start = Instant::now();
        assert!(b.recv(Some(Duration::from_millis(100))).unwrap().is_none());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn open_applies_configured_filters() {
        let network = VirtualNetwork::new();
        let config = BusConfig::default()
            .with_channel("cfg")
            .with_filters(vec![Filter::new(0x42, 0x7FF)]);
        let bus = Bus::open(&network, &config).unwrap();
        assert_eq!(bus.filters(), vec![Filter::new(0x42, 0x7FF)]);
        assert_eq!(bus.channel_info(), "Virtual bus channel cfg");
    }

    #[test]
    fn closure_factory() {
        let factory = |_: &BusConfig| -> Result<Box<dyn BusBackend>, CanError> {
            Err(CanError::Bus("no hardware".into()))
        };
        let err = Bus::open(&factory, &BusConfig::default()).unwrap_err();
        assert!(matches!(err, CanError::Bus(_)));
    }

    #[test]
    fn send_after_shutdown_fails() {
        let (a, _b) = pair();
        a.shutdown().unwrap();
        a.shutdown().unwrap();
        assert!(matches!(
            a.send(&Message::new(1, vec![]), None),
            Err(CanError::Disconnected)
        ));
    }
}
