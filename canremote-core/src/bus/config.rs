use serde::{Deserialize, Serialize};

use crate::filter::Filter;

/// Parameters for opening a bus.
///
/// Every field is optional so a client request and a set of server-side
/// overrides can be layered with [`BusConfig::merged`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Backend specific channel name, e.g. `"vcan0"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Bits per second.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_filters: Option<Vec<Filter>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receive_own_messages: Option<bool>,
}

impl BusConfig {
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = Some(bitrate);
        self
    }

    pub fn with_filters(mut self, filters: Vec<Filter>) -> Self {
        self.can_filters = Some(filters);
        self
    }

    pub fn with_receive_own_messages(mut self, enabled: bool) -> Self {
        self.receive_own_messages = Some(enabled);
        self
    }

    /// Layer `overrides` on top of `self`. Fields set in `overrides` win.
    pub fn merged(&self, overrides: &BusConfig) -> BusConfig {
        BusConfig {
            channel: overrides.channel.clone().or_else(|| self.channel.clone()),
            bitrate: overrides.bitrate.or(self.bitrate),
            can_filters: overrides
                .can_filters
                .clone()
                .or_else(|| self.can_filters.clone()),
            receive_own_messages: overrides.receive_own_messages.or(self.receive_own_messages),
        }
    }

    /// Bitrate as carried by `BusRequest`, where `0` means unspecified.
    pub fn wire_bitrate(&self) -> i32 {
        self.bitrate
            .map(|b| b.min(i32::MAX as u32) as i32)
            .unwrap_or(0)
    }

    /// Inverse of [`wire_bitrate`](Self::wire_bitrate).
    pub fn bitrate_from_wire(bitrate: i32) -> Option<u32> {
        (bitrate > 0).then_some(bitrate as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_win() {
        let request = BusConfig::default()
            .with_channel("client")
            .with_bitrate(250_000)
            .with_filters(vec![Filter::new(0x10, 0xFF)]);
        let overrides = BusConfig::default().with_channel("server");

        let merged = request.merged(&overrides);
        assert_eq!(merged.channel.as_deref(), Some("server"));
        assert_eq!(merged.bitrate, Some(250_000));
        assert_eq!(merged.can_filters, Some(vec![Filter::new(0x10, 0xFF)]));
        assert_eq!(merged.receive_own_messages, None);
    }

    #[test]
    fn wire_bitrate_mapping() {
        assert_eq!(BusConfig::default().wire_bitrate(), 0);
        assert_eq!(BusConfig::default().with_bitrate(500_000).wire_bitrate(), 500_000);
        assert_eq!(BusConfig::bitrate_from_wire(0), None);
        assert_eq!(BusConfig::bitrate_from_wire(-1), None);
        assert_eq!(BusConfig::bitrate_from_wire(125_000), Some(125_000));
    }

    #[test]
    fn toml_roundtrip() {
        let config = BusConfig::default()
            .with_channel("vcan0")
            .with_filters(vec![Filter::new(0x100, 0x700).with_extended(false)]);
        let text = toml::to_string(&config).unwrap();
        let parsed: BusConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);

        let empty: BusConfig = toml::from_str("").unwrap();
        assert_eq!(empty, BusConfig::default());
    }
}
