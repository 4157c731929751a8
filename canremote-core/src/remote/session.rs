//! One client connection on the server.
//!
//! A controller thread runs the handshake, opens the bus, then starts a
//! receiver (client → bus) and a forwarder (bus → client) and waits for
//! either to finish or for the server to stop.

use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::server::{Registry, SessionInfo};
use super::transport::{self, EventReader, EventWriter};
use super::{ACK_TIMEOUT, BUS_POLL_TIMEOUT, HANDSHAKE_TIMEOUT, JOIN_TIMEOUT, POLL_INTERVAL};
use crate::bus::{Bus, BusConfig, BusFactory};
use crate::error::CanError;
use crate::event::{Event, PROTOCOL_VERSION};
use crate::state::ConnectionPhase;
use crate::task::TaskPool;

/// Frames sent to the client per flush at most.
const MAX_BATCH: usize = 64;

pub(crate) struct SessionContext {
    pub id: u64,
    pub peer: SocketAddr,
    pub factory: Arc<dyn BusFactory>,
    pub overrides: BusConfig,
    pub registry: Registry,
    pub server_stop: Arc<AtomicBool>,
}

/// Entry point of the session thread.
pub(crate) fn run(stream: TcpStream, ctx: SessionContext) {
    if let Err(e) = serve(stream, &ctx) {
        warn!("session {} with {} failed: {e}", ctx.id, ctx.peer);
    }
    ctx.registry.remove(ctx.id);
    info!("session {} with {} ended", ctx.id, ctx.peer);
}

fn serve(stream: TcpStream, ctx: &SessionContext) -> Result<(), CanError> {
    let mut phase = ConnectionPhase::default();
    stream.set_nonblocking(false)?;
    transport::configure(&stream)?;
    let mut writer = EventWriter::new(stream.try_clone()?);
    let mut reader = EventReader::new(stream);
    phase.begin_handshake()?;

    let request = match handshake(&mut reader, &ctx.server_stop) {
        Ok(request) => request,
        Err(e) => {
            reject(&mut writer, &e);
            return Err(e);
        }
    };
    let config = request.merged(&ctx.overrides);
    debug!("session {}: opening bus with {config:?}", ctx.id);

    let bus = match Bus::open(ctx.factory.as_ref(), &config) {
        Ok(bus) => bus,
        Err(e) => {
            error!("could not open bus for {}: {e}", ctx.peer);
            reject(&mut writer, &e);
            return Err(e);
        }
    };
    let channel_info = bus.channel_info();
    ctx.registry.insert(SessionInfo {
        id: ctx.id,
        peer: ctx.peer,
        config,
        channel_info: channel_info.clone(),
    });
    if let Err(e) = writer.send(&Event::BusResponse {
        channel_info: channel_info.clone(),
    }) {
        let _ = bus.shutdown();
        return Err(e);
    }
    phase.open()?;
    info!("session {}: {} attached to {channel_info}", ctx.id, ctx.peer);

    let stop = Arc::new(AtomicBool::new(false));
    let writer = Arc::new(Mutex::new(writer));
    let tasks = Arc::new(Mutex::new(TaskPool::new(bus.clone())));
    let (done_tx, done_rx) = crossbeam_channel::bounded(2);

    let receiver = {
        let worker = Receiver {
            bus: bus.clone(),
            writer: Arc::clone(&writer),
            tasks: Arc::clone(&tasks),
            stop: Arc::clone(&stop),
        };
        let done = done_tx.clone();
        thread::Builder::new()
            .name(format!("canremote-session-{}-rx", ctx.id))
            .spawn(move || worker.run(reader, done))
    };
    let forwarder = {
        let bus = bus.clone();
        let writer = Arc::clone(&writer);
        let stop = Arc::clone(&stop);
        thread::Builder::new()
            .name(format!("canremote-session-{}-tx", ctx.id))
            .spawn(move || forward(bus, writer, stop, done_tx))
    };

    if receiver.is_ok() && forwarder.is_ok() {
        loop {
            match done_rx.recv_timeout(POLL_INTERVAL) {
                Ok(worker) => {
                    debug!("session {}: {worker} finished", ctx.id);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if ctx.server_stop.load(Ordering::SeqCst) {
                        debug!("session {}: server stopping", ctx.id);
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    } else {
        error!("session {}: could not start workers", ctx.id);
    }

    // ── Teardown ─────────────────────────────────────────────────
    stop.store(true, Ordering::SeqCst);
    writer.lock().shutdown_write();
    if let Ok(handle) = receiver {
        transport::join_bounded(handle, JOIN_TIMEOUT, "session receiver");
    }
    if let Ok(handle) = forwarder {
        transport::join_bounded(handle, JOIN_TIMEOUT, "session forwarder");
    }
    writer.lock().close();
    tasks.lock().stop_all();
    if let Err(e) = bus.shutdown() {
        warn!("session {}: bus shutdown failed: {e}", ctx.id);
    }
    phase.force_close();
    Ok(())
}

/// Read BusRequest then FilterConfig.
fn handshake(reader: &mut EventReader, stop: &AtomicBool) -> Result<BusConfig, CanError> {
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;

    let bitrate = match reader.next_event(Some(deadline), stop)? {
        Some(Event::BusRequest { version, bitrate }) => {
            if version != PROTOCOL_VERSION {
                warn!("client speaks protocol version {version}, expected {PROTOCOL_VERSION}");
            }
            bitrate
        }
        Some(other) => {
            return Err(CanError::Protocol(format!(
                "expected BusRequest, got {}",
                other.kind()
            )));
        }
        None => return Err(CanError::Timeout(HANDSHAKE_TIMEOUT)),
    };

    let filters = match reader.next_event(Some(deadline), stop)? {
        Some(Event::FilterConfig(filters)) => filters,
        Some(other) => {
            return Err(CanError::Protocol(format!(
                "expected FilterConfig, got {}",
                other.kind()
            )));
        }
        None => return Err(CanError::Timeout(HANDSHAKE_TIMEOUT)),
    };

    Ok(BusConfig {
        bitrate: BusConfig::bitrate_from_wire(bitrate),
        can_filters: (!filters.is_empty()).then_some(filters),
        ..Default::default()
    })
}

/// Report `e` to the client and close without entering `Open`.
fn reject(writer: &mut EventWriter, e: &CanError) {
    if let Err(send_err) = writer.send(&Event::remote_fault(e)) {
        debug!("could not report handshake failure: {send_err}");
    }
    writer.shutdown_write();
    writer.close();
}

// ── Receiver: client → bus ───────────────────────────────────────

struct Receiver {
    bus: Bus,
    writer: Arc<Mutex<EventWriter>>,
    tasks: Arc<Mutex<TaskPool>>,
    stop: Arc<AtomicBool>,
}

impl Receiver {
    fn run(self, mut reader: EventReader, done: Sender<&'static str>) {
        loop {
            let event = match reader.next_event(None, &self.stop) {
                Ok(Some(event)) => event,
                Ok(None) | Err(CanError::Disconnected) => break,
                Err(e) if e.is_fatal() => {
                    warn!("framing fault from client: {e}");
                    self.report(&e);
                    break;
                }
                Err(e) => {
                    if !self.stop.load(Ordering::SeqCst) {
                        warn!("read from client failed: {e}");
                    }
                    break;
                }
            };
            match self.handle(event) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    if !self.stop.load(Ordering::SeqCst) {
                        warn!("write to client failed: {e}");
                    }
                    break;
                }
            }
        }
        let _ = done.send("receiver");
    }

    /// Returns `Ok(false)` when the session should end.
    fn handle(&self, event: Event) -> Result<bool, CanError> {
        match event {
            Event::CanMessage(msg) => {
                let sent = msg
                    .validate()
                    .and_then(|()| self.bus.send(&msg, Some(ACK_TIMEOUT)));
                let reply = match sent {
                    Ok(()) => Event::TransmitSuccess,
                    Err(e) => {
                        warn!("transmit of {:#x} failed: {e}", msg.arbitration_id);
                        Event::TransmitFail
                    }
                };
                self.writer.lock().send(&reply)?;
            }
            Event::PeriodicStart {
                period,
                duration,
                message,
            } => {
                let id = message.arbitration_id;
                let result = self.tasks.lock().start_or_update(message, period, duration);
                match result {
                    Ok(()) => debug!("periodic {id:#x} every {period:?}"),
                    Err(e) => self.reject_task(id, e)?,
                }
            }
            Event::PeriodicStop { arbitration_id } => {
                if !self.tasks.lock().stop(arbitration_id) {
                    debug!("no periodic task for {arbitration_id:#x} to stop");
                }
            }
            Event::PeriodicUpdate(msg) => {
                let id = msg.arbitration_id;
                let result = self.tasks.lock().update(msg);
                if let Err(e) = result {
                    self.reject_task(id, e)?;
                }
            }
            Event::ConnectionClosed => {
                info!("client closed the connection");
                return Ok(false);
            }
            other => {
                let e = CanError::Protocol(format!("unexpected {} after handshake", other.kind()));
                warn!("{e}");
                self.report(&e);
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn reject_task(&self, id: u32, e: CanError) -> Result<(), CanError> {
        warn!("periodic request for {id:#x} rejected: {e}");
        self.writer.lock().send(&Event::remote_fault(&e))
    }

    fn report(&self, e: &CanError) {
        if let Err(send_err) = self.writer.lock().send(&Event::remote_fault(e)) {
            debug!("could not report fault to client: {send_err}");
        }
    }
}

// ── Forwarder: bus → client ──────────────────────────────────────

fn forward(
    bus: Bus,
    writer: Arc<Mutex<EventWriter>>,
    stop: Arc<AtomicBool>,
    done: Sender<&'static str>,
) {
    let mut fault = None;
    while fault.is_none() && !stop.load(Ordering::SeqCst) {
        let first = match bus.recv(Some(BUS_POLL_TIMEOUT)) {
            Ok(Some(msg)) => msg,
            Ok(None) => continue,
            Err(e) => {
                fault = Some(e);
                break;
            }
        };

        let mut batch = vec![first];
        while batch.len() < MAX_BATCH {
            match bus.recv(Some(Duration::ZERO)) {
                Ok(Some(msg)) => batch.push(msg),
                Ok(None) => break,
                Err(e) => {
                    fault = Some(e);
                    break;
                }
            }
        }

        let mut writer = writer.lock();
        for msg in batch {
            if let Err(e) = writer.queue(&Event::CanMessage(msg)) {
                warn!("dropping frame: {e}");
            }
        }
        if let Err(e) = writer.flush() {
            if !stop.load(Ordering::SeqCst) {
                warn!("write to client failed: {e}");
            }
            break;
        }
    }

    if let Some(e) = fault {
        error!("bus fault, ending session: {e}");
        if let Err(send_err) = writer.lock().send(&Event::remote_fault(&e)) {
            debug!("could not report bus fault: {send_err}");
        }
    }
    let _ = done.send("forwarder");
}
