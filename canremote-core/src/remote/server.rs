//! Server side: accepts clients and serves each one a bus.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use super::JOIN_TIMEOUT;
use super::session::{self, SessionContext};
use super::transport;
use crate::bus::{BusConfig, BusFactory};
use crate::error::CanError;

/// How often the acceptor checks for a stop request while idle.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Snapshot of one connected client.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub id: u64,
    pub peer: SocketAddr,
    /// Client request merged with the server overrides.
    pub config: BusConfig,
    pub channel_info: String,
}

/// Live sessions of one listener.
#[derive(Clone, Default)]
pub(crate) struct Registry {
    sessions: Arc<Mutex<HashMap<u64, SessionInfo>>>,
}

impl Registry {
    pub(crate) fn insert(&self, info: SessionInfo) {
        self.sessions.lock().insert(info.id, info);
    }

    pub(crate) fn remove(&self, id: u64) {
        self.sessions.lock().remove(&id);
    }

    /// Sessions ordered by id.
    pub(crate) fn snapshot(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self.sessions.lock().values().cloned().collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }
}

/// Requests a running server to stop. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ServerStopper {
    stop: Arc<AtomicBool>,
}

impl ServerStopper {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

// ── RemoteServer ─────────────────────────────────────────────────

/// Listens for [`RemoteBus`](super::RemoteBus) clients.
pub struct RemoteServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    factory: Arc<dyn BusFactory>,
    overrides: BusConfig,
    registry: Registry,
    stop: Arc<AtomicBool>,
}

impl RemoteServer {
    /// Listen on `addr`. Each client gets a bus from `factory`, opened
    /// with its request merged under `overrides`.
    pub fn bind(
        addr: impl ToSocketAddrs,
        factory: impl BusFactory + 'static,
        overrides: BusConfig,
    ) -> Result<Self, CanError> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        info!("server listening on {local_addr}");
        Ok(Self {
            listener,
            local_addr,
            factory: Arc::new(factory),
            overrides,
            registry: Registry::default(),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn clients(&self) -> Vec<SessionInfo> {
        self.registry.snapshot()
    }

    pub fn stopper(&self) -> ServerStopper {
        ServerStopper {
            stop: Arc::clone(&self.stop),
        }
    }

    /// Accept clients on the calling thread until stopped, then end every
    /// session.
    pub fn serve_forever(&self) -> Result<(), CanError> {
        let mut sessions: Vec<JoinHandle<()>> = Vec::new();
        let mut next_id = 1u64;

        while !self.stop.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    info!("client connected from {peer}");
                    let ctx = SessionContext {
                        id: next_id,
                        peer,
                        factory: Arc::clone(&self.factory),
                        overrides: self.overrides.clone(),
                        registry: self.registry.clone(),
                        server_stop: Arc::clone(&self.stop),
                    };
                    let spawned = thread::Builder::new()
                        .name(format!("canremote-session-{next_id}"))
                        .spawn(move || session::run(stream, ctx));
                    match spawned {
                        Ok(handle) => sessions.push(handle),
                        Err(e) => error!("could not start session for {peer}: {e}"),
                    }
                    next_id += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) => {
                    warn!("accept error: {e}");
                    thread::sleep(ACCEPT_POLL);
                }
            }
            sessions.retain(|handle| !handle.is_finished());
        }

        info!("server stopping, {} session(s) open", sessions.len());
        for handle in sessions {
            transport::join_bounded(handle, JOIN_TIMEOUT * 3, "session");
        }
        info!("server on {} stopped", self.local_addr);
        Ok(())
    }

    /// Run [`serve_forever`](Self::serve_forever) on a background thread.
    pub fn spawn(self) -> Result<ServerHandle, CanError> {
        let local_addr = self.local_addr;
        let registry = self.registry.clone();
        let stopper = self.stopper();
        let thread = thread::Builder::new()
            .name("canremote-acceptor".into())
            .spawn(move || {
                if let Err(e) = self.serve_forever() {
                    error!("server failed: {e}");
                }
            })?;
        Ok(ServerHandle {
            local_addr,
            registry,
            stopper,
            thread: Some(thread),
        })
    }
}

/// A server running on its own thread. Dropping it shuts the server down.
pub struct ServerHandle {
    local_addr: SocketAddr,
    registry: Registry,
    stopper: ServerStopper,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn clients(&self) -> Vec<SessionInfo> {
        self.registry.snapshot()
    }

    pub fn stopper(&self) -> ServerStopper {
        self.stopper.clone()
    }

    /// Stop accepting, end every session and wait for the acceptor.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stopper.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("server thread panicked");
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
