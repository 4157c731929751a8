//! CAN over TCP.
//!
//! A [`RemoteServer`] exposes a bus opened through a [`BusFactory`] and
//! a [`RemoteBus`] on another host uses it as if it were local.
//!
//! ```text
//!  client                               server
//!  ──────                               ──────
//!  BusRequest, FilterConfig  ────────►  open bus with merged config
//!                            ◄────────  BusResponse | RemoteFault
//!  CanMessage                ────────►  bus.send
//!                            ◄────────  TransmitSuccess | TransmitFail
//!                            ◄────────  CanMessage | RemoteFault
//!  PeriodicStart/Stop/Update ────────►  session task pool
//! ```
//!
//! [`BusFactory`]: crate::bus::BusFactory

pub mod client;
pub mod queue;
pub mod server;
mod session;
mod transport;

use std::time::Duration;

pub use client::{ClientOptions, RemoteBus, RemotePeriodicTask};
pub use queue::RecvQueue;
pub use server::{RemoteServer, ServerHandle, ServerStopper, SessionInfo};

pub use crate::event::PROTOCOL_VERSION;
pub use crate::network::DEFAULT_PORT;

/// How long `RemoteBus::send` waits for TransmitSuccess/TransmitFail.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// How long either side waits for the handshake to finish.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Socket read timeout, the latency with which workers notice a stop.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Timeout for a single socket write.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the server forwarder blocks on the bus per poll.
pub const BUS_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound on joining a worker during shutdown.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Frames buffered for `RemoteBus::recv` before the oldest are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;
