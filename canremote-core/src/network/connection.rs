use std::fmt;
use std::str::FromStr;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::codec::{EventCodec, MAX_BUFFERED};
use crate::error::CanError;
use crate::event::Event;

/// TCP port a remote server listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 54701;

/// Byte buffers for one side of a remote bus link.
///
/// `Connection` does no I/O. The owner feeds it whatever the socket
/// produced with [`receive_data`](Self::receive_data), pulls decoded
/// events with [`next_event`](Self::next_event), and writes out whatever
/// [`next_data`](Self::next_data) hands back.
#[derive(Debug)]
pub struct Connection {
    codec: EventCodec,
    inbound: BytesMut,
    outbound: BytesMut,
    /// Peer half-closed its write side.
    eof: bool,
    /// The synthesized ConnectionClosed has been handed out.
    closed: bool,
}

impl Connection {
    pub fn new() -> Self {
        Self::with_max_buffered(MAX_BUFFERED)
    }

    pub fn with_max_buffered(max_buffered: usize) -> Self {
        Self {
            codec: EventCodec::with_max_buffered(max_buffered),
            inbound: BytesMut::with_capacity(4096),
            outbound: BytesMut::with_capacity(4096),
            eof: false,
            closed: false,
        }
    }

    /// Append bytes read from the peer. An empty slice marks end of stream.
    pub fn receive_data(&mut self, data: &[u8]) {
        if data.is_empty() {
            self.eof = true;
        } else {
            self.inbound.extend_from_slice(data);
        }
    }

    /// Serialize `event` into the outbound buffer.
    pub fn send_event(&mut self, event: &Event) -> Result<(), CanError> {
        self.codec.encode(event, &mut self.outbound)
    }

    /// Take everything queued for the peer, leaving the buffer empty.
    pub fn next_data(&mut self) -> Vec<u8> {
        self.outbound.split().to_vec()
    }

    pub fn data_ready(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Bytes received but not yet decoded.
    pub fn pending_bytes(&self) -> usize {
        self.inbound.len()
    }

    /// `true` once the peer has half-closed and every event was drained.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Decode the earliest complete event.
    ///
    /// Returns `Ok(None)` while more bytes are needed. After end of stream
    /// and once the buffer is drained, a single `ConnectionClosed` is
    /// produced.
    pub fn next_event(&mut self) -> Result<Option<Event>, CanError> {
        if self.closed {
            return Ok(None);
        }
        if let Some(event) = self.codec.decode(&mut self.inbound)? {
            return Ok(Some(event));
        }
        if !self.eof {
            return Ok(None);
        }
        if !self.inbound.is_empty() {
            warn!(
                bytes = self.inbound.len(),
                "peer closed with a partial event buffered, discarding"
            );
            self.inbound.clear();
        }
        self.closed = true;
        Ok(Some(Event::ConnectionClosed))
    }

    /// Iterate over the events decodable right now.
    ///
    /// Stops after the first error, which is yielded.
    pub fn events(&mut self) -> Events<'_> {
        Events {
            conn: self,
            failed: false,
        }
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator returned by [`Connection::events`].
pub struct Events<'a> {
    conn: &'a mut Connection,
    failed: bool,
}

impl Iterator for Events<'_> {
    type Item = Result<Event, CanError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.conn.next_event() {
            Ok(event) => event.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

// ── ConnectionInfo ───────────────────────────────────────────────

/// Where a remote server lives, parsed from `"host[:port]"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    host: String,
    port: u16,
}

impl ConnectionInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for ConnectionInfo {
    type Err = CanError;

    fn from_str(channel: &str) -> Result<Self, Self::Err> {
        let channel = channel.trim();
        let (host, port) = match channel.rsplit_once(':') {
            // Bare IPv6 addresses contain colons but no port.
            Some((host, port)) if !host.contains(':') || host.ends_with(']') => {
                let port = port.parse::<u16>().map_err(|_| {
                    CanError::InvalidArgument(format!("invalid port in channel '{channel}'"))
                })?;
                (host, port)
            }
            _ => (channel, DEFAULT_PORT),
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(CanError::InvalidArgument(format!(
                "channel '{channel}' names no host"
            )));
        }
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn sample_events() -> Vec<Event> {
        vec![
            Event::BusRequest {
                version: 1,
                bitrate: 500_000,
            },
            Event::BusResponse {
                channel_info: "virtual channel 0".into(),
            },
            Event::CanMessage(Message::new(0x123, vec![1, 2, 3]).with_timestamp(12.5)),
            Event::TransmitSuccess,
            Event::remote_fault("bus off"),
            Event::PeriodicStop { arbitration_id: 0x55 },
        ]
    }

    #[test]
    fn send_then_drain() {
        let mut conn = Connection::new();
        assert!(!conn.data_ready());
        conn.send_event(&Event::TransmitSuccess).unwrap();
        conn.send_event(&Event::TransmitFail).unwrap();
        assert!(conn.data_ready());
        assert_eq!(conn.next_data(), vec![4, 5]);
        assert!(!conn.data_ready());
        assert!(conn.next_data().is_empty());
    }

    #[test]
    fn byte_at_a_time_feeding() {
        let events = sample_events();
        let mut sender = Connection::new();
        for event in &events {
            sender.send_event(event).unwrap();
        }
        let stream = sender.next_data();

        let mut receiver = Connection::new();
        let mut decoded = Vec::new();
        for byte in stream {
            receiver.receive_data(&[byte]);
            while let Some(event) = receiver.next_event().unwrap() {
                decoded.push(event);
            }
        }
        assert_eq!(decoded, events);
        assert_eq!(receiver.pending_bytes(), 0);
    }

    #[test]
    fn events_iterator_drains_batch() {
        let mut sender = Connection::new();
        for event in sample_events() {
            sender.send_event(&event).unwrap();
        }
        let mut receiver = Connection::new();
        receiver.receive_data(&sender.next_data());
        let decoded: Vec<Event> = receiver.events().collect::<Result<_, _>>().unwrap();
        assert_eq!(decoded, sample_events());
    }

    #[test]
    fn close_yields_single_connection_closed() {
        let mut conn = Connection::new();
        conn.receive_data(&[4]);
        conn.receive_data(&[]);
        assert_eq!(conn.next_event().unwrap(), Some(Event::TransmitSuccess));
        assert!(!conn.is_closed());
        assert_eq!(conn.next_event().unwrap(), Some(Event::ConnectionClosed));
        assert!(conn.is_closed());
        assert_eq!(conn.next_event().unwrap(), None);
    }

    #[test]
    fn close_discards_partial_event() {
        let mut conn = Connection::new();
        let bytes = Event::CanMessage(Message::new(1, vec![1])).encode().unwrap();
        conn.receive_data(&bytes[..10]);
        assert_eq!(conn.next_event().unwrap(), None);
        conn.receive_data(&[]);
        assert_eq!(conn.next_event().unwrap(), Some(Event::ConnectionClosed));
        assert_eq!(conn.pending_bytes(), 0);
    }

    #[test]
    fn unknown_tag_is_fatal() {
        let mut conn = Connection::new();
        conn.receive_data(&[0x77, 0x00]);
        let mut events = conn.events();
        assert!(matches!(events.next(), Some(Err(CanError::UnknownEvent(0x77)))));
        assert!(events.next().is_none());
    }

    #[test]
    fn inbound_cap_overflow() {
        let mut conn = Connection::with_max_buffered(16);
        // BusResponse announcing 255 bytes, never completed.
        conn.receive_data(&[2, 255]);
        conn.receive_data(&[b'x'; 20]);
        assert!(matches!(
            conn.next_event(),
            Err(CanError::BufferOverflow { .. })
        ));
    }

    #[test]
    fn connection_info_parsing() {
        let info: ConnectionInfo = "localhost:1234".parse().unwrap();
        assert_eq!(info, ConnectionInfo::new("localhost", 1234));

        let info: ConnectionInfo = "10.0.0.5".parse().unwrap();
        assert_eq!(info.port(), DEFAULT_PORT);
        assert_eq!(info.to_string(), "10.0.0.5:54701");

        let info: ConnectionInfo = "[::1]:9000".parse().unwrap();
        assert_eq!(info.host(), "::1");
        assert_eq!(info.to_string(), "[::1]:9000");

        let info: ConnectionInfo = "::1".parse().unwrap();
        assert_eq!(info.port(), DEFAULT_PORT);

        assert!("host:notaport".parse::<ConnectionInfo>().is_err());
        assert!(":80".parse::<ConnectionInfo>().is_err());
    }
}
