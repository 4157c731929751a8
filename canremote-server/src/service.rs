//! CAN server service core logic.
//!
//! Binds the remote server over a virtual CAN network and keeps it
//! running until a stop signal arrives.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info};

use canremote_core::{CanError, RemoteServer, ServerHandle, VirtualNetwork};

use crate::config::ServerConfig;

/// How often the connected-client count is logged while idle.
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

// ── CanServerService ─────────────────────────────────────────────

/// The top-level server service.
///
/// Owns the virtual network every client session attaches to, so
/// local tools can share a channel with remote clients.
pub struct CanServerService {
    config: ServerConfig,
    network: VirtualNetwork,
}

impl CanServerService {
    /// Create a new service with the given config.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_network(config, VirtualNetwork::new())
    }

    /// Create a service serving an existing virtual network.
    pub fn with_network(config: ServerConfig, network: VirtualNetwork) -> Self {
        Self { config, network }
    }

    pub fn network(&self) -> &VirtualNetwork {
        &self.network
    }

    /// Bind the listener and start accepting clients in the background.
    pub fn start(&self) -> Result<ServerHandle, CanError> {
        let server = RemoteServer::bind(
            self.config.listen_addr(),
            self.network.clone(),
            self.config.overrides(),
        )?;
        server.spawn()
    }

    /// Run until `stop` fires or every sender is dropped.
    pub fn run(&self, stop: &Receiver<()>) -> Result<(), CanError> {
        let handle = self.start()?;
        info!("serving channel {} on {}", self.config.bus.channel, handle.local_addr());

        loop {
            match stop.recv_timeout(STATUS_INTERVAL) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    debug!("{} client(s) connected", handle.clients().len());
                }
            }
        }

        info!("stopping server");
        handle.shutdown();
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
