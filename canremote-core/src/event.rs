//! Protocol events and their binary encoding.
//!
//! Every event travels as a one-byte tag followed by a body whose size is
//! either fixed or announced by a leading length byte, so the stream
//! needs no other delimiter.
//!
//! ## Wire format (big-endian)
//!
//! ```text
//! tag  event             body
//! 1    BusRequest        version:u8  bitrate:i32
//! 2    BusResponse       len:u8  channel_info:[u8; len] (UTF-8)
//! 3    CanMessage        timestamp:f64  id:i32  dlc:u8  flags:u8  data:[u8; 8]
//! 4    TransmitSuccess   -
//! 5    TransmitFail      -
//! 6    RemoteFault       len:u8  description:[u8; len] (UTF-8)
//! 7    PeriodicStart     period_ms:i32  duration_ms:i32  id:i32  dlc:u8  extended:u8  data:[u8; 8]
//! 8    PeriodicStop      id:i32
//! 9    PeriodicUpdate    same layout as CanMessage, timestamp reserved
//! 10   FilterConfig      count:u8  { can_id:u32  can_mask:u32 } * count
//! 255  ConnectionClosed  -
//! ```

use std::fmt;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::CanError;
use crate::filter::Filter;
use crate::flags::FrameFlags;
use crate::message::{CAN_MAX_DLEN, Message};

// ── Constants ────────────────────────────────────────────────────

/// Protocol version announced in `BusRequest`.
pub const PROTOCOL_VERSION: u8 = 1;

/// Longest string a length-prefixed field can carry.
pub const MAX_STRING_LEN: usize = u8::MAX as usize;

/// Most filters a single `FilterConfig` can carry.
pub const MAX_FILTERS: usize = u8::MAX as usize;

const BUS_REQUEST_LEN: usize = 1 + 4;
const CAN_MESSAGE_LEN: usize = 8 + 4 + 1 + 1 + CAN_MAX_DLEN;
const PERIODIC_START_LEN: usize = 4 + 4 + 4 + 1 + 1 + CAN_MAX_DLEN;
const PERIODIC_STOP_LEN: usize = 4;
const FILTER_LEN: usize = 4 + 4;

/// Bit 31 of a wire filter id carries the `extended` value, bit 31 of the
/// mask says whether `extended` is present at all.
const FILTER_EXTENDED_BIT: u32 = 1 << 31;

// ── EventKind ────────────────────────────────────────────────────

/// The tag byte that opens every event on the wire.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BusRequest = 1,
    BusResponse = 2,
    CanMessage = 3,
    TransmitSuccess = 4,
    TransmitFail = 5,
    RemoteFault = 6,
    PeriodicStart = 7,
    PeriodicStop = 8,
    PeriodicUpdate = 9,
    FilterConfig = 10,
    ConnectionClosed = 255,
}

impl TryFrom<u8> for EventKind {
    type Error = CanError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(EventKind::BusRequest),
            2 => Ok(EventKind::BusResponse),
            3 => Ok(EventKind::CanMessage),
            4 => Ok(EventKind::TransmitSuccess),
            5 => Ok(EventKind::TransmitFail),
            6 => Ok(EventKind::RemoteFault),
            7 => Ok(EventKind::PeriodicStart),
            8 => Ok(EventKind::PeriodicStop),
            9 => Ok(EventKind::PeriodicUpdate),
            10 => Ok(EventKind::FilterConfig),
            255 => Ok(EventKind::ConnectionClosed),
            _ => Err(CanError::UnknownEvent(value)),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── Event ────────────────────────────────────────────────────────

/// One unit of the bridging protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Client → server: open the bus.
    BusRequest { version: u8, bitrate: i32 },
    /// Server → client: the bus is open.
    BusResponse { channel_info: String },
    /// A frame received on, or to be transmitted to, the bus.
    CanMessage(Message),
    TransmitSuccess,
    TransmitFail,
    /// A fault on the far side, delivered as text.
    RemoteFault { description: String },
    /// Start (or restart) periodic transmission on the server.
    PeriodicStart {
        period: Duration,
        /// `None` transmits until stopped.
        duration: Option<Duration>,
        message: Message,
    },
    PeriodicStop { arbitration_id: u32 },
    /// Replace the payload of a running periodic task.
    PeriodicUpdate(Message),
    /// Acceptance filters for the session's bus.
    FilterConfig(Vec<Filter>),
    /// Synthesized when the peer closes its write side.
    ConnectionClosed,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::BusRequest { .. } => EventKind::BusRequest,
            Event::BusResponse { .. } => EventKind::BusResponse,
            Event::CanMessage(_) => EventKind::CanMessage,
            Event::TransmitSuccess => EventKind::TransmitSuccess,
            Event::TransmitFail => EventKind::TransmitFail,
            Event::RemoteFault { .. } => EventKind::RemoteFault,
            Event::PeriodicStart { .. } => EventKind::PeriodicStart,
            Event::PeriodicStop { .. } => EventKind::PeriodicStop,
            Event::PeriodicUpdate(_) => EventKind::PeriodicUpdate,
            Event::FilterConfig(_) => EventKind::FilterConfig,
            Event::ConnectionClosed => EventKind::ConnectionClosed,
        }
    }

    pub fn remote_fault(description: impl fmt::Display) -> Self {
        Event::RemoteFault {
            description: description.to_string(),
        }
    }

    /// Serialize tag and body into a fresh buffer.
    pub fn encode(&self) -> Result<Vec<u8>, CanError> {
        let mut buf = BytesMut::with_capacity(1 + CAN_MESSAGE_LEN);
        self.encode_into(&mut buf)?;
        Ok(buf.to_vec())
    }

    /// Append tag and body to `dst`.
    ///
    /// Nothing is written when the event cannot be represented.
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), CanError> {
        self.check_encodable()?;
        dst.put_u8(self.kind() as u8);
        match self {
            Event::BusRequest { version, bitrate } => {
                dst.put_u8(*version);
                dst.put_i32(*bitrate);
            }
            Event::BusResponse { channel_info } => put_string(dst, channel_info),
            Event::CanMessage(msg) => put_frame(dst, msg, msg.timestamp),
            Event::TransmitSuccess | Event::TransmitFail | Event::ConnectionClosed => {}
            Event::RemoteFault { description } => put_string(dst, description),
            Event::PeriodicStart {
                period,
                duration,
                message,
            } => {
                dst.put_i32(millis(*period));
                dst.put_i32(duration.map(millis).unwrap_or(0));
                dst.put_u32(message.arbitration_id);
                dst.put_u8(message.dlc);
                dst.put_u8(message.is_extended_id as u8);
                put_padded_data(dst, &message.data);
            }
            Event::PeriodicStop { arbitration_id } => dst.put_u32(*arbitration_id),
            Event::PeriodicUpdate(msg) => put_frame(dst, msg, 0.0),
            Event::FilterConfig(filters) => {
                dst.put_u8(filters.len() as u8);
                for filter in filters {
                    let (id, mask) = filter_to_wire(filter);
                    dst.put_u32(id);
                    dst.put_u32(mask);
                }
            }
        }
        Ok(())
    }

    /// Decode the earliest event in `buf`.
    ///
    /// Returns `Ok(None)` if `buf` does not yet hold a complete event, and
    /// otherwise the event plus the number of bytes it occupied (tag
    /// included). An unknown tag or malformed body is a framing fault.
    pub fn decode(buf: &[u8]) -> Result<Option<(Event, usize)>, CanError> {
        let Some((&tag, body)) = buf.split_first() else {
            return Ok(None);
        };
        let kind = EventKind::try_from(tag)?;

        let decoded = match kind {
            EventKind::BusRequest => fixed(body, BUS_REQUEST_LEN, |mut b| {
                Ok(Event::BusRequest {
                    version: b.get_u8(),
                    bitrate: b.get_i32(),
                })
            })?,
            EventKind::BusResponse => read_string(body)?
                .map(|(channel_info, n)| (Event::BusResponse { channel_info }, n)),
            EventKind::CanMessage => fixed(body, CAN_MESSAGE_LEN, |b| {
                read_frame(b).map(Event::CanMessage)
            })?,
            EventKind::TransmitSuccess => Some((Event::TransmitSuccess, 0)),
            EventKind::TransmitFail => Some((Event::TransmitFail, 0)),
            EventKind::RemoteFault => read_string(body)?
                .map(|(description, n)| (Event::RemoteFault { description }, n)),
            EventKind::PeriodicStart => fixed(body, PERIODIC_START_LEN, |mut b| {
                let period = Duration::from_millis(b.get_i32().max(0) as u64);
                let duration_ms = b.get_i32();
                let arbitration_id = b.get_u32();
                let dlc = checked_dlc(b.get_u8())?;
                let is_extended_id = b.get_u8() != 0;
                let message = Message {
                    arbitration_id,
                    is_extended_id,
                    dlc,
                    data: b[..dlc as usize].to_vec(),
                    ..Default::default()
                };
                Ok(Event::PeriodicStart {
                    period,
                    duration: (duration_ms > 0).then(|| Duration::from_millis(duration_ms as u64)),
                    message,
                })
            })?,
            EventKind::PeriodicStop => fixed(body, PERIODIC_STOP_LEN, |mut b| {
                Ok(Event::PeriodicStop {
                    arbitration_id: b.get_u32(),
                })
            })?,
            EventKind::PeriodicUpdate => fixed(body, CAN_MESSAGE_LEN, |b| {
                read_frame(b).map(|msg| Event::PeriodicUpdate(msg.with_timestamp(0.0)))
            })?,
            EventKind::FilterConfig => read_filters(body)
                .map(|(filters, n)| (Event::FilterConfig(filters), n)),
            EventKind::ConnectionClosed => Some((Event::ConnectionClosed, 0)),
        };

        Ok(decoded.map(|(event, body_len)| (event, 1 + body_len)))
    }

    fn check_encodable(&self) -> Result<(), CanError> {
        match self {
            Event::CanMessage(msg) | Event::PeriodicUpdate(msg) => check_classic(msg),
            Event::PeriodicStart { message, .. } => check_classic(message),
            Event::FilterConfig(filters) if filters.len() > MAX_FILTERS => {
                Err(CanError::InvalidArgument(format!(
                    "{} filters exceed the maximum of {MAX_FILTERS}",
                    filters.len()
                )))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::CanMessage(msg) => write!(f, "CanMessage({msg})"),
            Event::RemoteFault { description } => write!(f, "RemoteFault({description})"),
            other => fmt::Display::fmt(&other.kind(), f),
        }
    }
}

// ── Encoding helpers ─────────────────────────────────────────────

fn check_classic(msg: &Message) -> Result<(), CanError> {
    if msg.data.len() > CAN_MAX_DLEN || msg.dlc as usize > CAN_MAX_DLEN {
        return Err(CanError::InvalidMessage(format!(
            "{} data bytes cannot be carried by a classic frame event",
            msg.data.len()
        )));
    }
    Ok(())
}

fn millis(d: Duration) -> i32 {
    d.as_millis().min(i32::MAX as u128) as i32
}

/// Length-prefixed UTF-8, truncated to a char boundary within 255 bytes.
fn put_string(dst: &mut BytesMut, text: &str) {
    let mut end = text.len().min(MAX_STRING_LEN);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    dst.put_u8(end as u8);
    dst.put_slice(&text.as_bytes()[..end]);
}

fn put_padded_data(dst: &mut BytesMut, data: &[u8]) {
    let mut padded = [0u8; CAN_MAX_DLEN];
    padded[..data.len()].copy_from_slice(data);
    dst.put_slice(&padded);
}

fn put_frame(dst: &mut BytesMut, msg: &Message, timestamp: f64) {
    dst.put_f64(timestamp);
    dst.put_u32(msg.arbitration_id);
    dst.put_u8(msg.dlc);
    dst.put_u8(FrameFlags::from_message(msg).bits());
    put_padded_data(dst, &msg.data);
}

fn filter_to_wire(filter: &Filter) -> (u32, u32) {
    let mut id = filter.can_id & !FILTER_EXTENDED_BIT;
    let mut mask = filter.can_mask & !FILTER_EXTENDED_BIT;
    if let Some(extended) = filter.extended {
        mask |= FILTER_EXTENDED_BIT;
        if extended {
            id |= FILTER_EXTENDED_BIT;
        }
    }
    (id, mask)
}

// ── Decoding helpers ─────────────────────────────────────────────

/// Run `parse` over a fixed-size body once `len` bytes are available.
fn fixed<F>(body: &[u8], len: usize, parse: F) -> Result<Option<(Event, usize)>, CanError>
where
    F: FnOnce(&[u8]) -> Result<Event, CanError>,
{
    if body.len() < len {
        return Ok(None);
    }
    parse(&body[..len]).map(|event| Some((event, len)))
}

fn checked_dlc(dlc: u8) -> Result<u8, CanError> {
    if dlc as usize > CAN_MAX_DLEN {
        return Err(CanError::Protocol(format!("dlc {dlc} exceeds 8")));
    }
    Ok(dlc)
}

fn read_frame(mut b: &[u8]) -> Result<Message, CanError> {
    let timestamp = b.get_f64();
    let arbitration_id = b.get_u32();
    let dlc = checked_dlc(b.get_u8())?;
    let flags = FrameFlags::from_bits_truncate(b.get_u8());
    let is_remote_frame = flags.contains(FrameFlags::REMOTE);
    let data = if is_remote_frame {
        Vec::new()
    } else {
        b[..dlc as usize].to_vec()
    };
    Ok(Message {
        timestamp,
        arbitration_id,
        is_extended_id: flags.contains(FrameFlags::EXTENDED),
        is_remote_frame,
        is_error_frame: flags.contains(FrameFlags::ERROR),
        is_fd: false,
        dlc,
        data,
    })
}

fn read_string(body: &[u8]) -> Result<Option<(String, usize)>, CanError> {
    let Some((&len, rest)) = body.split_first() else {
        return Ok(None);
    };
    let len = len as usize;
    if rest.len() < len {
        return Ok(None);
    }
    let text = String::from_utf8(rest[..len].to_vec())?;
    Ok(Some((text, 1 + len)))
}

fn read_filters(body: &[u8]) -> Option<(Vec<Filter>, usize)> {
    let (&count, mut rest) = body.split_first()?;
    let total = 1 + count as usize * FILTER_LEN;
    if body.len() < total {
        return None;
    }
    let filters = (0..count)
        .map(|_| {
            let id = rest.get_u32();
            let mask = rest.get_u32();
            Filter {
                can_id: id & !FILTER_EXTENDED_BIT,
                can_mask: mask & !FILTER_EXTENDED_BIT,
                extended: (mask & FILTER_EXTENDED_BIT != 0).then_some(id & FILTER_EXTENDED_BIT != 0),
            }
        })
        .collect();
    Some((filters, total))
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::EXTENDED_ID_MAX;

    fn roundtrip(event: Event) -> Event {
        let buf = event.encode().unwrap();
        let (decoded, consumed) = Event::decode(&buf).unwrap().expect("complete event");
        assert_eq!(consumed, buf.len(), "consumed length for {event:?}");
        decoded
    }

    #[test]
    fn kind_roundtrip() {
        let kinds = [
            EventKind::BusRequest,
            EventKind::BusResponse,
            EventKind::CanMessage,
            EventKind::TransmitSuccess,
            EventKind::TransmitFail,
            EventKind::RemoteFault,
            EventKind::PeriodicStart,
            EventKind::PeriodicStop,
            EventKind::PeriodicUpdate,
            EventKind::FilterConfig,
            EventKind::ConnectionClosed,
        ];
        for kind in kinds {
            assert_eq!(EventKind::try_from(kind as u8).unwrap(), kind);
        }
    }

    #[test]
    fn unknown_tag_is_framing_fault() {
        let err = Event::decode(&[0xF0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, CanError::UnknownEvent(0xF0)));
        assert!(err.is_fatal());
    }

    #[test]
    fn can_message_roundtrip() {
        let messages = [
            Message::new(0x100, vec![1, 2, 3, 4]).with_timestamp(1470925506.0621243),
            Message::new(0xABCDEF, vec![0xFF; 8]),
            Message::default(),
            Message::error_frame(),
            Message::remote(0x123, 0),
            Message::remote(0x123, 8),
            Message::new(EXTENDED_ID_MAX, vec![9; 8]),
        ];
        for msg in messages {
            assert_eq!(roundtrip(Event::CanMessage(msg.clone())), Event::CanMessage(msg));
        }
    }

    #[test]
    fn can_message_layout() {
        let msg = Message::new(0x123, vec![1, 2, 3])
            .with_extended_id(true)
            .with_timestamp(2.5);
        let buf = Event::CanMessage(msg).encode().unwrap();
        assert_eq!(buf.len(), 1 + CAN_MESSAGE_LEN);
        assert_eq!(buf[0], 3);
        assert_eq!(&buf[1..9], &2.5f64.to_be_bytes());
        assert_eq!(&buf[9..13], &[0, 0, 0x01, 0x23]);
        assert_eq!(buf[13], 3);
        assert_eq!(buf[14], FrameFlags::EXTENDED.bits());
        assert_eq!(&buf[15..], &[1, 2, 3, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn fd_message_cannot_be_encoded() {
        let event = Event::CanMessage(Message::new(0x1, vec![0; 12]));
        let mut buf = BytesMut::new();
        assert!(matches!(
            event.encode_into(&mut buf),
            Err(CanError::InvalidMessage(_))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn dlc_above_eight_is_framing_fault() {
        let mut buf = Event::CanMessage(Message::new(0x1, vec![])).encode().unwrap();
        buf[13] = 9;
        assert!(matches!(Event::decode(&buf), Err(CanError::Protocol(_))));
    }

    #[test]
    fn bus_request_roundtrip() {
        let event = Event::BusRequest {
            version: 12,
            bitrate: 1_000_000,
        };
        assert_eq!(roundtrip(event.clone()), event);
    }

    #[test]
    fn string_events_roundtrip() {
        let event = Event::BusResponse {
            channel_info: "This is some channel info".into(),
        };
        assert_eq!(roundtrip(event.clone()), event);

        let event = Event::remote_fault("This is an error");
        assert_eq!(roundtrip(event.clone()), event);

        let event = Event::BusResponse {
            channel_info: String::new(),
        };
        assert_eq!(roundtrip(event.clone()), event);

        let max = "x".repeat(MAX_STRING_LEN);
        let event = Event::remote_fault(&max);
        assert_eq!(roundtrip(event.clone()), event);
    }

    #[test]
    fn long_strings_truncate_on_char_boundary() {
        // 200 two-byte chars: 400 bytes, cut to 254 rather than mid-char.
        let text = "é".repeat(200);
        let decoded = roundtrip(Event::remote_fault(&text));
        let Event::RemoteFault { description } = decoded else {
            panic!("expected RemoteFault");
        };
        assert_eq!(description.len(), 254);
        assert!(text.starts_with(&description));
    }

    #[test]
    fn invalid_utf8_is_framing_fault() {
        let buf = [EventKind::RemoteFault as u8, 2, 0xC3, 0x28];
        assert!(matches!(Event::decode(&buf), Err(CanError::InvalidUtf8(_))));
    }

    #[test]
    fn empty_body_events() {
        for event in [
            Event::TransmitSuccess,
            Event::TransmitFail,
            Event::ConnectionClosed,
        ] {
            let buf = event.encode().unwrap();
            assert_eq!(buf.len(), 1);
            assert_eq!(roundtrip(event.clone()), event);
        }
    }

    #[test]
    fn periodic_start_roundtrip() {
        let message = Message::new(0x123, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let event = Event::PeriodicStart {
            period: Duration::from_millis(10),
            duration: None,
            message,
        };
        assert_eq!(roundtrip(event.clone()), event);

        let event = Event::PeriodicStart {
            period: Duration::from_millis(100),
            duration: Some(Duration::from_secs(3)),
            message: Message::new(0x1ABCDEF, vec![7]),
        };
        assert_eq!(roundtrip(event.clone()), event);
    }

    #[test]
    fn periodic_stop_and_update_roundtrip() {
        let event = Event::PeriodicStop {
            arbitration_id: 0x1FFF_FFFF,
        };
        assert_eq!(roundtrip(event.clone()), event);

        let event = Event::PeriodicUpdate(Message::new(0x321, vec![4, 5]));
        assert_eq!(roundtrip(event.clone()), event);
    }

    #[test]
    fn periodic_update_drops_timestamp() {
        let msg = Message::new(0x321, vec![4, 5]).with_timestamp(99.0);
        let Event::PeriodicUpdate(decoded) = roundtrip(Event::PeriodicUpdate(msg)) else {
            panic!("expected PeriodicUpdate");
        };
        assert_eq!(decoded.timestamp, 0.0);
    }

    #[test]
    fn filter_config_roundtrip() {
        let event = Event::FilterConfig(vec![
            Filter::new(0x123, 0xFFF),
            Filter::new(0x001, 0x00F),
            Filter::new(0x1ABCDEF, EXTENDED_ID_MAX).with_extended(true),
            Filter::new(0x10, 0x7FF).with_extended(false),
        ]);
        assert_eq!(roundtrip(event.clone()), event);

        let event = Event::FilterConfig(Vec::new());
        assert_eq!(event.encode().unwrap(), vec![10, 0]);
        assert_eq!(roundtrip(event.clone()), event);
    }

    #[test]
    fn too_many_filters_rejected() {
        let event = Event::FilterConfig(vec![Filter::new(0, 0); MAX_FILTERS + 1]);
        assert!(matches!(event.encode(), Err(CanError::InvalidArgument(_))));
    }

    #[test]
    fn every_prefix_is_incomplete() {
        let events = [
            Event::BusRequest {
                version: PROTOCOL_VERSION,
                bitrate: 500_000,
            },
            Event::BusResponse {
                channel_info: "vcan0".into(),
            },
            Event::CanMessage(Message::new(0x42, vec![1, 2])),
            Event::remote_fault("bus off"),
            Event::PeriodicStop { arbitration_id: 7 },
            Event::FilterConfig(vec![Filter::new(1, 2), Filter::new(3, 4)]),
        ];
        for event in events {
            let buf = event.encode().unwrap();
            for end in 0..buf.len() {
                assert!(
                    Event::decode(&buf[..end]).unwrap().is_none(),
                    "{event:?} decoded from {end} of {} bytes",
                    buf.len()
                );
            }
        }
    }

    #[test]
    fn decode_ignores_trailing_bytes() {
        let mut buf = Event::TransmitSuccess.encode().unwrap();
        buf.extend_from_slice(b"hello");
        let (event, consumed) = Event::decode(&buf).unwrap().unwrap();
        assert_eq!(event, Event::TransmitSuccess);
        assert_eq!(consumed, 1);
    }
}
