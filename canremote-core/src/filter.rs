//! Software receive filters.
//!
//! Used by any bus whose transport cannot filter in hardware. A filter
//! admits a frame when
//! `(frame.id ^ can_id) & can_mask == 0`, optionally restricted to one id
//! width via `extended`.

use serde::{Deserialize, Serialize};

use crate::message::Message;

/// One id/mask acceptance rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filter {
    pub can_id: u32,
    pub can_mask: u32,
    /// When set, only frames with this id width match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended: Option<bool>,
}

impl Filter {
    pub fn new(can_id: u32, can_mask: u32) -> Self {
        Self {
            can_id,
            can_mask,
            extended: None,
        }
    }

    /// Restrict this filter to standard (`false`) or extended (`true`) ids.
    pub fn with_extended(mut self, extended: bool) -> Self {
        self.extended = Some(extended);
        self
    }

    pub fn matches(&self, msg: &Message) -> bool {
        if let Some(extended) = self.extended {
            if extended != msg.is_extended_id {
                return false;
            }
        }
        (msg.arbitration_id ^ self.can_id) & self.can_mask == 0
    }
}

/// Returns `true` if `filters` is empty or any member matches `msg`.
pub fn matches_filters(msg: &Message, filters: &[Filter]) -> bool {
    filters.is_empty() || filters.iter().any(|f| f.matches(msg))
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: u32) -> Message {
        Message::new(id, vec![])
    }

    #[test]
    fn zero_mask_accepts_everything() {
        let f = Filter::new(0x123, 0);
        for id in [0, 0x123, 0x7FF, 0x1FFF_FFFF] {
            assert!(f.matches(&msg(id)));
        }
    }

    #[test]
    fn full_mask_is_exact_match() {
        let f = Filter::new(0x123, u32::MAX);
        assert!(f.matches(&msg(0x123)));
        assert!(!f.matches(&msg(0x124)));
        assert!(!f.matches(&msg(0x1123)));
    }

    #[test]
    fn partial_mask_ignores_masked_bits() {
        let f = Filter::new(0x120, 0x7F0);
        assert!(f.matches(&msg(0x120)));
        assert!(f.matches(&msg(0x12F)));
        assert!(!f.matches(&msg(0x130)));
    }

    #[test]
    fn extended_flag_restricts_id_width() {
        let f = Filter::new(0x100, 0x7FF).with_extended(true);
        assert!(!f.matches(&msg(0x100)));
        assert!(f.matches(&msg(0x100).with_extended_id(true)));

        let f = Filter::new(0x100, 0x7FF).with_extended(false);
        assert!(f.matches(&msg(0x100)));
    }

    #[test]
    fn empty_set_passes_everything() {
        assert!(matches_filters(&msg(0x555), &[]));
    }

    #[test]
    fn set_passes_if_any_member_matches() {
        let filters = [Filter::new(0x12, 0xFF), Filter::new(0x13, 0xFF)];
        assert!(matches_filters(&msg(0x12), &filters));
        assert!(matches_filters(&msg(0x13), &filters));
        assert!(!matches_filters(&msg(0x14), &filters));
    }
}
