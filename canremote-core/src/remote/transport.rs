//! Blocking socket plumbing shared by the client and server sessions.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tracing::trace;

use super::{POLL_INTERVAL, WRITE_TIMEOUT};
use crate::error::CanError;
use crate::event::Event;
use crate::network::Connection;

const READ_CHUNK: usize = 4096;

/// Apply the socket options every remote link uses.
pub(crate) fn configure(stream: &TcpStream) -> Result<(), CanError> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    Ok(())
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

// ── Reader ───────────────────────────────────────────────────────

/// Inbound half: socket reads feeding a [`Connection`].
pub(crate) struct EventReader {
    stream: TcpStream,
    conn: Connection,
    buf: Vec<u8>,
}

impl EventReader {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            conn: Connection::new(),
            buf: vec![0; READ_CHUNK],
        }
    }

    /// Wait for the next event.
    ///
    /// Returns `Ok(None)` once `deadline` passes or `stop` is raised, and
    /// `Disconnected` after `ConnectionClosed` was already handed out.
    pub(crate) fn next_event(
        &mut self,
        deadline: Option<Instant>,
        stop: &AtomicBool,
    ) -> Result<Option<Event>, CanError> {
        loop {
            if let Some(event) = self.conn.next_event()? {
                trace!("received {event}");
                return Ok(Some(event));
            }
            if self.conn.is_closed() {
                return Err(CanError::Disconnected);
            }
            if stop.load(Ordering::SeqCst) || deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(None);
            }
            match self.stream.read(&mut self.buf) {
                Ok(n) => self.conn.receive_data(&self.buf[..n]),
                Err(e) if is_timeout(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

// ── Writer ───────────────────────────────────────────────────────

/// Outbound half: events serialized through a [`Connection`] and written
/// out whole.
pub(crate) struct EventWriter {
    stream: TcpStream,
    conn: Connection,
}

impl EventWriter {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            conn: Connection::new(),
        }
    }

    /// Buffer `event` without writing it yet.
    pub(crate) fn queue(&mut self, event: &Event) -> Result<(), CanError> {
        self.conn.send_event(event)
    }

    pub(crate) fn flush(&mut self) -> Result<(), CanError> {
        if self.conn.data_ready() {
            let data = self.conn.next_data();
            self.stream.write_all(&data)?;
        }
        Ok(())
    }

    pub(crate) fn send(&mut self, event: &Event) -> Result<(), CanError> {
        self.queue(event)?;
        self.flush()
    }

    /// Half-close: the peer reads end of stream, reads here keep working.
    pub(crate) fn shutdown_write(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Write) {
            trace!("write half already closed: {e}");
        }
    }

    pub(crate) fn close(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            trace!("socket already closed: {e}");
        }
    }
}

// ── Threads ──────────────────────────────────────────────────────

pub(crate) use crate::task::{join_bounded, wait_finished};
