//! The CAN frame model shared by every bus, the codec, and the scheduler.
//!
//! A [`Message`] is a plain value: it is created per send/receive and
//! moved across threads and over the wire by value.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::CanError;

// ── Constants ────────────────────────────────────────────────────

/// Largest 11-bit (standard) arbitration id.
pub const STANDARD_ID_MAX: u32 = 0x7FF;

/// Largest 29-bit (extended) arbitration id.
pub const EXTENDED_ID_MAX: u32 = 0x1FFF_FFFF;

/// Maximum payload of a classic CAN frame.
pub const CAN_MAX_DLEN: usize = 8;

/// Maximum payload of a CAN FD frame.
pub const CANFD_MAX_DLEN: usize = 64;

/// Payload lengths addressed by FD DLC codes 9..=15.
const FD_LENGTHS: [usize; 7] = [12, 16, 20, 24, 32, 48, 64];

/// Map a DLC code to its payload length.
///
/// Classic codes above 8 saturate at 8 bytes unless `fd` is set.
pub fn dlc_to_len(dlc: u8, fd: bool) -> usize {
    match dlc {
        0..=8 => dlc as usize,
        9..=15 if fd => FD_LENGTHS[(dlc - 9) as usize],
        _ if fd => CANFD_MAX_DLEN,
        _ => CAN_MAX_DLEN,
    }
}

/// Smallest DLC code whose payload length holds `len` bytes.
///
/// Returns `None` when `len` exceeds the FD maximum.
pub fn len_to_dlc(len: usize) -> Option<u8> {
    if len <= CAN_MAX_DLEN {
        return Some(len as u8);
    }
    FD_LENGTHS
        .iter()
        .position(|&l| l >= len)
        .map(|idx| 9 + idx as u8)
}

/// Seconds since the Unix epoch, as stamped on received frames.
pub fn now_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

// ── Message ──────────────────────────────────────────────────────

/// A single CAN frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    /// Receive or creation time, seconds since the Unix epoch.
    pub timestamp: f64,
    /// 11-bit or 29-bit identifier, see `is_extended_id`.
    pub arbitration_id: u32,
    pub is_extended_id: bool,
    pub is_remote_frame: bool,
    pub is_error_frame: bool,
    pub is_fd: bool,
    /// Data Length Code as sent on the bus.
    pub dlc: u8,
    pub data: Vec<u8>,
}

impl Message {
    /// Create a data frame. The id width is inferred from the id value;
    /// use [`Message::with_extended_id`] to force it.
    pub fn new(arbitration_id: u32, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        Self {
            arbitration_id,
            is_extended_id: arbitration_id > STANDARD_ID_MAX,
            dlc: len_to_dlc(data.len()).unwrap_or(u8::MAX),
            is_fd: data.len() > CAN_MAX_DLEN,
            data,
            ..Default::default()
        }
    }

    /// Create a remote transmission request frame for `dlc` bytes.
    pub fn remote(arbitration_id: u32, dlc: u8) -> Self {
        Self {
            arbitration_id,
            is_extended_id: arbitration_id > STANDARD_ID_MAX,
            is_remote_frame: true,
            dlc,
            ..Default::default()
        }
    }

    /// Create an error frame.
    pub fn error_frame() -> Self {
        Self {
            is_error_frame: true,
            ..Default::default()
        }
    }

    pub fn with_extended_id(mut self, extended: bool) -> Self {
        self.is_extended_id = extended;
        self
    }

    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Check the id-width and DLC invariants.
    pub fn validate(&self) -> Result<(), CanError> {
        let id_max = if self.is_extended_id {
            EXTENDED_ID_MAX
        } else {
            STANDARD_ID_MAX
        };
        if self.arbitration_id > id_max {
            return Err(CanError::InvalidMessage(format!(
                "arbitration id {:#x} does not fit a {} id",
                self.arbitration_id,
                if self.is_extended_id { "29-bit" } else { "11-bit" },
            )));
        }

        if self.is_remote_frame {
            if self.is_fd {
                return Err(CanError::InvalidMessage(
                    "remote frames are not allowed in CAN FD".into(),
                ));
            }
            if !self.data.is_empty() || self.dlc as usize > CAN_MAX_DLEN {
                return Err(CanError::InvalidMessage(
                    "remote frame must carry no data and dlc <= 8".into(),
                ));
            }
            return Ok(());
        }

        let max_len = if self.is_fd { CANFD_MAX_DLEN } else { CAN_MAX_DLEN };
        if self.data.len() > max_len {
            return Err(CanError::InvalidMessage(format!(
                "{} data bytes exceed the maximum of {max_len}",
                self.data.len()
            )));
        }
        if self.data.len() != dlc_to_len(self.dlc, self.is_fd) {
            return Err(CanError::InvalidMessage(format!(
                "dlc {} is inconsistent with {} data bytes",
                self.dlc,
                self.data.len()
            )));
        }
        Ok(())
    }

    /// Compare two messages by value.
    ///
    /// Timestamps are compared within `timestamp_delta` seconds, or
    /// ignored when it is `None`.
    pub fn equals(&self, other: &Message, timestamp_delta: Option<f64>) -> bool {
        timestamp_delta.is_none_or(|delta| (self.timestamp - other.timestamp).abs() <= delta)
            && self.arbitration_id == other.arbitration_id
            && self.is_extended_id == other.is_extended_id
            && self.is_remote_frame == other.is_remote_frame
            && self.is_error_frame == other.is_error_frame
            && self.is_fd == other.is_fd
            && self.dlc == other.dlc
            && self.data == other.data
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>15.6}  ", self.timestamp)?;
        if self.is_extended_id {
            write!(f, "{:08X}", self.arbitration_id)?;
        } else {
            write!(f, "     {:03X}", self.arbitration_id)?;
        }
        let flags = match (self.is_remote_frame, self.is_error_frame) {
            (true, _) => "R",
            (_, true) => "E",
            _ => "-",
        };
        write!(f, "  {flags}  [{}]", self.dlc)?;
        for byte in &self.data {
            write!(f, " {byte:02X}")?;
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_infers_id_width() {
        assert!(!Message::new(0x7FF, vec![]).is_extended_id);
        assert!(Message::new(0x800, vec![]).is_extended_id);
        let msg = Message::new(0x10, vec![1, 2, 3]).with_extended_id(true);
        assert!(msg.is_extended_id);
        assert_eq!(msg.dlc, 3);
    }

    #[test]
    fn validate_accepts_well_formed_frames() {
        Message::new(0x123, vec![1, 2, 3]).validate().unwrap();
        Message::new(EXTENDED_ID_MAX, vec![0; 8]).validate().unwrap();
        Message::remote(0x123, 4).validate().unwrap();
        Message::error_frame().validate().unwrap();
        Message::new(0x123, vec![0; 64]).validate().unwrap();
    }

    #[test]
    fn validate_rejects_oversized_id() {
        let msg = Message::new(0x800, vec![]).with_extended_id(false);
        assert!(matches!(msg.validate(), Err(CanError::InvalidMessage(_))));
        let msg = Message::new(EXTENDED_ID_MAX + 1, vec![]);
        assert!(msg.validate().is_err());
    }

    #[test]
    fn validate_rejects_inconsistent_dlc() {
        let mut msg = Message::new(0x1, vec![1, 2]);
        msg.dlc = 5;
        assert!(msg.validate().is_err());

        let mut remote = Message::remote(0x1, 2);
        remote.data = vec![1];
        assert!(remote.validate().is_err());
    }

    #[test]
    fn fd_dlc_mapping() {
        assert_eq!(len_to_dlc(8), Some(8));
        assert_eq!(len_to_dlc(9), Some(9));
        assert_eq!(len_to_dlc(12), Some(9));
        assert_eq!(len_to_dlc(33), Some(14));
        assert_eq!(len_to_dlc(64), Some(15));
        assert_eq!(len_to_dlc(65), None);
        assert_eq!(dlc_to_len(15, true), 64);
        assert_eq!(dlc_to_len(15, false), 8);
    }

    #[test]
    fn equals_with_and_without_timestamps() {
        let a = Message::new(0x123, vec![1, 2, 3]).with_timestamp(1.0);
        let b = Message::new(0x123, vec![1, 2, 3]).with_timestamp(5.0);
        assert!(a.equals(&b, None));
        assert!(!a.equals(&b, Some(1e-6)));
        assert!(!a.equals(&Message::new(0x124, vec![1, 2, 3]), None));
    }

    #[test]
    fn display_format() {
        let text = Message::new(0x123, vec![0xAB, 0x01]).to_string();
        assert!(text.contains("123"));
        assert!(text.contains("[2] AB 01"));
    }
}
