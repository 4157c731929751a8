//! In-process loopback bus.
//!
//! Buses opened on the same channel of one [`VirtualNetwork`] see each
//! other's frames. Nothing leaves the process.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;
use tracing::debug;

use super::{BusBackend, BusConfig, BusFactory};
use crate::error::CanError;
use crate::message::{Message, now_timestamp};

/// Channel name used when a config names none.
pub const DEFAULT_CHANNEL: &str = "default";

struct Peer {
    id: u64,
    tx: Sender<Message>,
}

/// A table of virtual channels shared by every bus opened from it.
///
/// Cloning yields another handle to the same table.
#[derive(Clone, Default)]
pub struct VirtualNetwork {
    channels: Arc<Mutex<HashMap<String, Vec<Peer>>>>,
    next_id: Arc<AtomicU64>,
}

impl VirtualNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new bus to `channel`.
    pub fn open(&self, channel: impl Into<String>) -> VirtualBus {
        let channel = channel.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded();
        self.channels
            .lock()
            .entry(channel.clone())
            .or_default()
            .push(Peer { id, tx });
        debug!(%channel, id, "virtual bus attached");
        VirtualBus {
            network: self.clone(),
            channel,
            id,
            rx,
            receive_own_messages: false,
            preserve_timestamps: false,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of buses attached to `channel`.
    pub fn peers(&self, channel: &str) -> usize {
        self.channels.lock().get(channel).map_or(0, Vec::len)
    }

    fn detach(&self, channel: &str, id: u64) {
        let mut channels = self.channels.lock();
        if let Some(peers) = channels.get_mut(channel) {
            peers.retain(|p| p.id != id);
            if peers.is_empty() {
                channels.remove(channel);
            }
        }
    }
}

impl BusFactory for VirtualNetwork {
    fn open(&self, config: &BusConfig) -> Result<Box<dyn BusBackend>, CanError> {
        let channel = config.channel.as_deref().unwrap_or(DEFAULT_CHANNEL);
        let bus = VirtualNetwork::open(self, channel)
            .with_receive_own_messages(config.receive_own_messages.unwrap_or(false));
        Ok(Box::new(bus))
    }
}

/// One attachment to a virtual channel.
pub struct VirtualBus {
    network: VirtualNetwork,
    channel: String,
    id: u64,
    rx: Receiver<Message>,
    receive_own_messages: bool,
    preserve_timestamps: bool,
    closed: AtomicBool,
}

impl VirtualBus {
    /// Also deliver this bus's own transmissions back to it.
    pub fn with_receive_own_messages(mut self, enabled: bool) -> Self {
        self.receive_own_messages = enabled;
        self
    }

    /// Keep the sender's timestamps instead of stamping frames on send.
    pub fn with_preserve_timestamps(mut self, enabled: bool) -> Self {
        self.preserve_timestamps = enabled;
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    fn check_open(&self) -> Result<(), CanError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CanError::Bus(format!(
                "virtual bus on channel {} is shut down",
                self.channel
            )));
        }
        Ok(())
    }
}

impl BusBackend for VirtualBus {
    fn send(&self, msg: &Message, _timeout: Option<Duration>) -> Result<(), CanError> {
        self.check_open()?;
        let mut frame = msg.clone();
        if !self.preserve_timestamps {
            frame.timestamp = now_timestamp();
        }
        let channels = self.network.channels.lock();
        if let Some(peers) = channels.get(&self.channel) {
            for peer in peers {
                if peer.id != self.id || self.receive_own_messages {
                    // Receivers are only dropped after detaching.
                    let _ = peer.tx.send(frame.clone());
                }
            }
        }
        Ok(())
    }

    fn recv(&self, timeout: Option<Duration>) -> Result<(Option<Message>, bool), CanError> {
        self.check_open()?;
        let result = match timeout {
            Some(timeout) => self.rx.recv_timeout(timeout),
            None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match result {
            Ok(msg) => Ok((Some(msg), false)),
            Err(RecvTimeoutError::Timeout) => Ok((None, false)),
            Err(RecvTimeoutError::Disconnected) => Err(CanError::Disconnected),
        }
    }

    fn shutdown(&self) -> Result<(), CanError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.network.detach(&self.channel, self.id);
            debug!(channel = %self.channel, id = self.id, "virtual bus detached");
        }
        Ok(())
    }

    fn channel_info(&self) -> String {
        format!("Virtual bus channel {}", self.channel)
    }
}

impl Drop for VirtualBus {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Option<Duration> = Some(Duration::from_millis(100));

    #[test]
    fn frames_reach_other_peers_only() {
        let network = VirtualNetwork::new();
        let a = network.open("ch");
        let b = network.open("ch");
        let c = network.open("other");

        a.send(&Message::new(0x10, vec![1]), None).unwrap();
        assert!(b.recv(WAIT).unwrap().0.is_some());
        assert!(a.recv(Some(Duration::ZERO)).unwrap().0.is_none());
        assert!(c.recv(Some(Duration::ZERO)).unwrap().0.is_none());
    }

    #[test]
    fn receive_own_messages() {
        let network = VirtualNetwork::new();
        let a = network.open("ch").with_receive_own_messages(true);
        a.send(&Message::new(0x10, vec![1]), None).unwrap();
        assert_eq!(a.recv(WAIT).unwrap().0.unwrap().arbitration_id, 0x10);
    }

    #[test]
    fn timestamps_stamped_unless_preserved() {
        let network = VirtualNetwork::new();
        let a = network.open("ch");
        let b = network.open("ch");
        a.send(&Message::new(1, vec![]).with_timestamp(1.0), None).unwrap();
        assert!(b.recv(WAIT).unwrap().0.unwrap().timestamp > 1.0);

        let a = a.with_preserve_timestamps(true);
        a.send(&Message::new(1, vec![]).with_timestamp(1.0), None).unwrap();
        assert_eq!(b.recv(WAIT).unwrap().0.unwrap().timestamp, 1.0);
    }

    #[test]
    fn shutdown_detaches() {
        let network = VirtualNetwork::new();
        let a = network.open("ch");
        let b = network.open("ch");
        assert_eq!(network.peers("ch"), 2);
        b.shutdown().unwrap();
        assert_eq!(network.peers("ch"), 1);
        assert!(b.recv(WAIT).is_err());
        drop(a);
        assert_eq!(network.peers("ch"), 0);
    }

    #[test]
    fn factory_uses_config() {
        let network = VirtualNetwork::new();
        let backend = BusFactory::open(&network, &BusConfig::default()).unwrap();
        assert_eq!(backend.channel_info(), "Virtual bus channel default");
        let backend = BusFactory::open(&network, &BusConfig::default().with_channel("vcan1")).unwrap();
        assert_eq!(backend.channel_info(), "Virtual bus channel vcan1");
    }
}
