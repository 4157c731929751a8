//! Framing for the event stream.
//!
//! [`EventCodec`] plugs [`Event`] encoding into `tokio_util`'s
//! `Decoder`/`Encoder` traits. [`Connection`](crate::network::Connection)
//! drives it synchronously over a `BytesMut` inbound buffer.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CanError;
use crate::event::Event;

/// Largest amount of undecoded data tolerated before the stream is
/// declared corrupt.
pub const MAX_BUFFERED: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct EventCodec {
    max_buffered: usize,
}

impl EventCodec {
    pub fn new() -> Self {
        Self {
            max_buffered: MAX_BUFFERED,
        }
    }

    pub fn with_max_buffered(max_buffered: usize) -> Self {
        Self { max_buffered }
    }
}

impl Default for EventCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for EventCodec {
    type Item = Event;
    type Error = CanError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match Event::decode(src)? {
            Some((event, consumed)) => {
                src.advance(consumed);
                Ok(Some(event))
            }
            None if src.len() > self.max_buffered => Err(CanError::BufferOverflow {
                size: src.len(),
                max: self.max_buffered,
            }),
            None => Ok(None),
        }
    }
}

impl Encoder<Event> for EventCodec {
    type Error = CanError;

    fn encode(&mut self, item: Event, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode_into(dst)
    }
}

impl Encoder<&Event> for EventCodec {
    type Error = CanError;

    fn encode(&mut self, item: &Event, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode_into(dst)
    }
}
