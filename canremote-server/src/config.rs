//! Configuration for the CAN server.

use std::path::Path;

use canremote_core::{BusConfig, DEFAULT_PORT, Filter};
use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listening socket.
    pub network: NetworkConfig,
    /// Settings forced on every client's bus.
    pub bus: BusSection,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind.
    pub host: String,
    /// TCP port to listen on.
    pub port: u16,
}

/// Bus settings. These override whatever a client asks for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSection {
    /// Virtual channel served to clients.
    pub channel: String,
    /// Forced bitrate in bit/s. 0 leaves it to the client.
    pub bitrate: u32,
    /// Echo a client's own frames back to it.
    pub receive_own_messages: bool,
    /// Forced acceptance filters. Empty leaves them to the client.
    pub can_filters: Vec<Filter>,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: DEFAULT_PORT,
        }
    }
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            channel: "vcan0".into(),
            bitrate: 0,
            receive_own_messages: false,
            can_filters: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ServerConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// `host:port` to bind.
    pub fn listen_addr(&self) -> String {
        if self.network.host.contains(':') {
            format!("[{}]:{}", self.network.host, self.network.port)
        } else {
            format!("{}:{}", self.network.host, self.network.port)
        }
    }

    /// The bus settings layered over every client request.
    pub fn overrides(&self) -> BusConfig {
        BusConfig {
            channel: Some(self.bus.channel.clone()),
            bitrate: (self.bus.bitrate > 0).then_some(self.bus.bitrate),
            can_filters: (!self.bus.can_filters.is_empty()).then(|| self.bus.can_filters.clone()),
            receive_own_messages: self.bus.receive_own_messages.then_some(true),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = ServerConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        assert!(text.contains("port = 54701"));
        assert!(text.contains("channel = \"vcan0\""));
    }

    #[test]
    fn roundtrip_config() {
        let mut cfg = ServerConfig::default();
        cfg.bus.can_filters = vec![Filter::new(0x100, 0x7FF).with_extended(false)];
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed: ServerConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.port, DEFAULT_PORT);
        assert_eq!(parsed.bus.can_filters, cfg.bus.can_filters);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let parsed: ServerConfig = toml::from_str("[bus]\nbitrate = 500000\n").unwrap();
        assert_eq!(parsed.bus.bitrate, 500_000);
        assert_eq!(parsed.bus.channel, "vcan0");
        assert_eq!(parsed.logging.level, "info");
    }

    #[test]
    fn overrides_only_force_what_is_set() {
        let cfg = ServerConfig::default();
        let overrides = cfg.overrides();
        assert_eq!(overrides.channel.as_deref(), Some("vcan0"));
        assert_eq!(overrides.bitrate, None);
        assert_eq!(overrides.can_filters, None);
        assert_eq!(overrides.receive_own_messages, None);

        let mut cfg = ServerConfig::default();
        cfg.bus.bitrate = 125_000;
        cfg.bus.receive_own_messages = true;
        let overrides = cfg.overrides();
        assert_eq!(overrides.bitrate, Some(125_000));
        assert_eq!(overrides.receive_own_messages, Some(true));
    }

    #[test]
    fn listen_addr_brackets_ipv6() {
        let mut cfg = ServerConfig::default();
        assert_eq!(cfg.listen_addr(), "0.0.0.0:54701");
        cfg.network.host = "::1".into();
        cfg.network.port = 9000;
        assert_eq!(cfg.listen_addr(), "[::1]:9000");
    }

    #[test]
    fn write_default_then_load() {
        let path = std::env::temp_dir().join(format!(
            "canremote-server-{}.toml",
            std::process::id()
        ));
        ServerConfig::write_default(&path).unwrap();
        let cfg = ServerConfig::load(&path);
        std::fs::remove_file(&path).unwrap();
        assert_eq!(cfg.network.port, DEFAULT_PORT);
        assert_eq!(cfg.bus.channel, "vcan0");
    }

    #[test]
    fn missing_file_uses_defaults() {
        let cfg = ServerConfig::load(Path::new("/nonexistent/canremote-server.toml"));
        assert_eq!(cfg.network.port, DEFAULT_PORT);
    }
}
