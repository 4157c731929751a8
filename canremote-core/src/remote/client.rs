//! Client side: a bus whose frames travel to and from a [`RemoteServer`].
//!
//! [`RemoteServer`]: super::RemoteServer

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use super::transport::{self, EventReader, EventWriter};
use super::{ACK_TIMEOUT, DEFAULT_QUEUE_CAPACITY, HANDSHAKE_TIMEOUT, JOIN_TIMEOUT, POLL_INTERVAL};
use crate::bus::{BusBackend, BusConfig};
use crate::error::CanError;
use crate::event::{Event, PROTOCOL_VERSION};
use crate::message::Message;
use crate::network::ConnectionInfo;
use crate::state::ConnectionPhase;

// ── Options ──────────────────────────────────────────────────────

/// Settings for [`RemoteBus::connect`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Bitrate and filters requested from the server. The channel is
    /// chosen by the server.
    pub config: BusConfig,
    pub ack_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Received frames buffered before the oldest are evicted.
    pub queue_capacity: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            config: BusConfig::default(),
            ack_timeout: ACK_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl ClientOptions {
    pub fn with_config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }
}

// ── Shared state ─────────────────────────────────────────────────

/// What the receiver thread hands to `recv`.
enum Received {
    Frame(Message),
    Fault(CanError),
}

#[derive(Default)]
struct AckState {
    /// Outcome of the last transmission, `true` on success.
    result: Option<bool>,
    /// Acks still owed to senders that already timed out.
    stale: u32,
}

struct Shared {
    writer: Mutex<EventWriter>,
    send_lock: Mutex<()>,
    acks: Mutex<AckState>,
    ack_ready: Condvar,
    queue: super::RecvQueue<Received>,
    phase: Mutex<ConnectionPhase>,
    stop: AtomicBool,
}

impl Shared {
    fn is_open(&self) -> bool {
        self.phase.lock().is_open()
    }

    fn write(&self, event: &Event) -> Result<(), CanError> {
        if !self.is_open() {
            return Err(CanError::Disconnected);
        }
        self.writer.lock().send(event)
    }

    fn wake_senders(&self) {
        let _acks = self.acks.lock();
        self.ack_ready.notify_all();
    }

    fn mark_closed(&self) {
        self.phase.lock().force_close();
        self.queue.close();
        self.wake_senders();
    }

    /// Route one event from the server. Returns `false` when the
    /// connection is done.
    fn dispatch(&self, event: Event) -> bool {
        match event {
            Event::CanMessage(msg) => {
                if self.queue.push(Received::Frame(msg)) && self.queue.evicted() == 1 {
                    warn!(
                        "receive queue full ({} frames), dropping oldest",
                        self.queue.capacity()
                    );
                }
                true
            }
            Event::RemoteFault { description } => {
                warn!("remote fault: {description}");
                self.queue.push(Received::Fault(CanError::Remote(description)));
                true
            }
            Event::TransmitSuccess | Event::TransmitFail => {
                let mut acks = self.acks.lock();
                if acks.stale > 0 {
                    acks.stale -= 1;
                    debug!("discarding late {event}");
                } else {
                    acks.result = Some(event == Event::TransmitSuccess);
                    self.ack_ready.notify_all();
                }
                true
            }
            Event::ConnectionClosed => {
                info!("server closed the connection");
                false
            }
            other => {
                error!("unexpected {other} from server, closing connection");
                self.queue.push(Received::Fault(CanError::Protocol(format!(
                    "unexpected {} from server",
                    other.kind()
                ))));
                false
            }
        }
    }
}

fn receive_loop(shared: Arc<Shared>, mut reader: EventReader) {
    loop {
        match reader.next_event(None, &shared.stop) {
            Ok(Some(event)) => {
                if !shared.dispatch(event) {
                    break;
                }
            }
            Ok(None) | Err(CanError::Disconnected) => break,
            Err(e) => {
                if shared.is_open() {
                    error!("connection to server failed: {e}");
                    shared.queue.push(Received::Fault(e));
                }
                break;
            }
        }
    }
    shared.mark_closed();
}

// ── RemoteBus ────────────────────────────────────────────────────

/// A CAN bus reached through a remote server.
pub struct RemoteBus {
    shared: Arc<Shared>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    server: ConnectionInfo,
    channel_info: String,
    ack_timeout: Duration,
}

impl RemoteBus {
    /// Connect to the server named by `channel` (`"host[:port]"`) and
    /// open its bus.
    pub fn connect(channel: &str, options: ClientOptions) -> Result<Self, CanError> {
        let server: ConnectionInfo = channel.parse()?;
        let mut phase = ConnectionPhase::default();

        let stream = open_stream(&server, options.handshake_timeout)?;
        transport::configure(&stream)?;
        phase.begin_handshake()?;
        info!("connected to {server}, requesting bus");

        let mut writer = EventWriter::new(stream.try_clone()?);
        let mut reader = EventReader::new(stream);
        let server_info = match handshake(&mut writer, &mut reader, &options) {
            Ok(info) => info,
            Err(e) => {
                writer.close();
                return Err(e);
            }
        };
        phase.open()?;

        let channel_info = format!("{server_info} on {server}");
        info!("bus open: {channel_info}");

        let shared = Arc::new(Shared {
            writer: Mutex::new(writer),
            send_lock: Mutex::new(()),
            acks: Mutex::new(AckState::default()),
            ack_ready: Condvar::new(),
            queue: super::RecvQueue::new(options.queue_capacity),
            phase: Mutex::new(phase),
            stop: AtomicBool::new(false),
        });
        let receiver = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("canremote-client-rx".into())
                .spawn(move || receive_loop(shared, reader))?
        };

        Ok(Self {
            shared,
            receiver: Mutex::new(Some(receiver)),
            server,
            channel_info,
            ack_timeout: options.ack_timeout,
        })
    }

    /// Transmit `msg` and wait for the server to confirm it.
    ///
    /// Callers on several threads are served one at a time.
    pub fn send(&self, msg: &Message) -> Result<(), CanError> {
        msg.validate()?;
        let _serial = self.shared.send_lock.lock();
        self.shared.acks.lock().result = None;
        self.shared.write(&Event::CanMessage(msg.clone()))?;

        let deadline = Instant::now() + self.ack_timeout;
        let mut acks = self.shared.acks.lock();
        loop {
            if let Some(ok) = acks.result.take() {
                return if ok { Ok(()) } else { Err(CanError::TransmitFailed) };
            }
            if !self.shared.is_open() {
                return Err(CanError::Disconnected);
            }
            if Instant::now() >= deadline {
                acks.stale += 1;
                return Err(CanError::Timeout(self.ack_timeout));
            }
            self.shared.ack_ready.wait_until(&mut acks, deadline);
        }
    }

    /// Wait up to `timeout` for the next frame.
    ///
    /// A fault reported by the server is returned as an error, once, in
    /// the position it arrived.
    pub fn recv(&self, timeout: Option<Duration>) -> Result<Option<Message>, CanError> {
        match self.shared.queue.pop(timeout) {
            Some(Received::Frame(msg)) => Ok(Some(msg)),
            Some(Received::Fault(e)) => Err(e),
            None if self.shared.queue.is_closed() => Err(CanError::Disconnected),
            None => Ok(None),
        }
    }

    /// Have the server transmit `msg` every `period`.
    pub fn send_periodic(
        &self,
        msg: Message,
        period: Duration,
        duration: Option<Duration>,
    ) -> Result<RemotePeriodicTask, CanError> {
        if period.is_zero() {
            return Err(CanError::InvalidArgument("period must be positive".into()));
        }
        msg.validate()?;
        let mut task = RemotePeriodicTask {
            shared: Arc::clone(&self.shared),
            message: msg,
            period,
            duration,
            running: false,
        };
        task.start()?;
        Ok(task)
    }

    /// Close the connection and stop the receiver thread.
    ///
    /// Frames already buffered can still be read with `recv`.
    pub fn shutdown(&self) -> Result<(), CanError> {
        let Some(receiver) = self.receiver.lock().take() else {
            return Ok(());
        };
        debug!("closing connection to {}", self.server);
        let _ = self.shared.phase.lock().close();
        self.shared.wake_senders();

        // Let the server see end of stream and close its side first.
        self.shared.writer.lock().shutdown_write();
        transport::wait_finished(&receiver, JOIN_TIMEOUT);
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.writer.lock().close();
        transport::join_bounded(receiver, POLL_INTERVAL * 2, "client receiver");

        self.shared.mark_closed();
        info!("disconnected from {}", self.server);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// `"<server bus description> on <host:port>"`.
    pub fn channel_info(&self) -> &str {
        &self.channel_info
    }

    pub fn server(&self) -> &ConnectionInfo {
        &self.server
    }

    /// Frames dropped because `recv` was not keeping up.
    pub fn evicted(&self) -> u64 {
        self.shared.queue.evicted()
    }
}

impl Drop for RemoteBus {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl BusBackend for RemoteBus {
    fn send(&self, msg: &Message, _timeout: Option<Duration>) -> Result<(), CanError> {
        RemoteBus::send(self, msg)
    }

    fn recv(&self, timeout: Option<Duration>) -> Result<(Option<Message>, bool), CanError> {
        RemoteBus::recv(self, timeout).map(|msg| (msg, false))
    }

    fn shutdown(&self) -> Result<(), CanError> {
        RemoteBus::shutdown(self)
    }

    fn channel_info(&self) -> String {
        self.channel_info.clone()
    }
}

fn open_stream(server: &ConnectionInfo, timeout: Duration) -> Result<TcpStream, CanError> {
    let mut last_err = None;
    for addr in (server.host(), server.port()).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(match last_err {
        Some(e) => e.into(),
        None => CanError::InvalidArgument(format!("{server} resolves to no address")),
    })
}

/// Send BusRequest and FilterConfig, then wait for the server's answer.
fn handshake(
    writer: &mut EventWriter,
    reader: &mut EventReader,
    options: &ClientOptions,
) -> Result<String, CanError> {
    writer.queue(&Event::BusRequest {
        version: PROTOCOL_VERSION,
        bitrate: options.config.wire_bitrate(),
    })?;
    writer.queue(&Event::FilterConfig(
        options.config.can_filters.clone().unwrap_or_default(),
    ))?;
    writer.flush()?;

    let deadline = Instant::now() + options.handshake_timeout;
    let never = AtomicBool::new(false);
    match reader.next_event(Some(deadline), &never) {
        Ok(Some(Event::BusResponse { channel_info })) => Ok(channel_info),
        Ok(Some(Event::RemoteFault { description })) => Err(CanError::Initialization(description)),
        Ok(Some(other)) => Err(CanError::Initialization(format!(
            "expected BusResponse, got {}",
            other.kind()
        ))),
        Ok(None) => Err(CanError::Initialization("no response from server".into())),
        Err(CanError::Disconnected) => Err(CanError::Initialization(
            "server closed the connection".into(),
        )),
        Err(e) => Err(e),
    }
}

// ── RemotePeriodicTask ───────────────────────────────────────────

/// A periodic transmission running on the server.
///
/// Dropping the task stops it.
pub struct RemotePeriodicTask {
    shared: Arc<Shared>,
    message: Message,
    period: Duration,
    duration: Option<Duration>,
    running: bool,
}

impl RemotePeriodicTask {
    /// Ask the server to (re)start sending.
    pub fn start(&mut self) -> Result<(), CanError> {
        self.shared.write(&Event::PeriodicStart {
            period: self.period,
            duration: self.duration,
            message: self.message.clone(),
        })?;
        self.running = true;
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), CanError> {
        if !self.running {
            return Ok(());
        }
        self.running = false;
        self.shared.write(&Event::PeriodicStop {
            arbitration_id: self.message.arbitration_id,
        })
    }

    /// Replace the payload sent from the next period on.
    pub fn modify_data(&mut self, message: Message) -> Result<(), CanError> {
        if message.arbitration_id != self.message.arbitration_id {
            return Err(CanError::InvalidArgument(format!(
                "arbitration id cannot change from {:#x} to {:#x}",
                self.message.arbitration_id, message.arbitration_id
            )));
        }
        message.validate()?;
        self.shared.write(&Event::PeriodicUpdate(message.clone()))?;
        self.message = message;
        Ok(())
    }

    pub fn arbitration_id(&self) -> u32 {
        self.message.arbitration_id
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

impl Drop for RemotePeriodicTask {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            debug!("could not stop remote periodic task: {e}");
        }
    }
}
