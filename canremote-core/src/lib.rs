//! # canremote-core
//!
//! CAN bus access over a network link.
//!
//! This crate contains:
//! - **Message model**: `Message`, id-width and DLC validation
//! - **Filters**: id/mask acceptance rules applied in software
//! - **Events**: the bridging protocol's typed events and their binary encoding
//! - **Codec**: `EventCodec` for `tokio_util`-style framing over `BytesMut`
//! - **Network**: `Connection`, I/O-free buffering of an event stream
//! - **State**: `ConnectionPhase`, the validated link lifecycle
//! - **Bus**: the `BusBackend` driver contract, the `Bus` handle and a virtual loopback bus
//! - **Task**: `CyclicTask` and `TaskPool` for periodic transmission
//! - **Remote**: `RemoteBus` client and `RemoteServer`
//! - **Error**: `CanError`, a `thiserror`-based error hierarchy

pub mod bus;
pub mod codec;
pub mod error;
pub mod event;
pub mod filter;
pub mod flags;
pub mod message;
pub mod network;
pub mod remote;
pub mod state;
pub mod task;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use bus::{Bus, BusBackend, BusConfig, BusFactory, VirtualBus, VirtualNetwork};
pub use codec::EventCodec;
pub use error::CanError;
pub use event::{Event, EventKind, PROTOCOL_VERSION};
pub use filter::{Filter, matches_filters};
pub use flags::FrameFlags;
pub use message::Message;
pub use network::{Connection, ConnectionInfo, DEFAULT_PORT};
pub use remote::{
    ClientOptions, RemoteBus, RemotePeriodicTask, RemoteServer, ServerHandle, ServerStopper,
    SessionInfo,
};
pub use state::ConnectionPhase;
pub use task::{CyclicTask, TaskPool};
