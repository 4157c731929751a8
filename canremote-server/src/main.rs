//! canremote-server: entry point.
//!
//! ```text
//! canremote-server                   Serve the default channel on port 54701
//! canremote-server --config <path>   Load a custom config TOML
//! canremote-server --port 9000       Override the listening port
//! canremote-server --gen-config      Write default config to stdout
//! canremote-server --init-config     Write default config to the --config path
//! canremote-server -vv               Trace-level logging
//! ```

use std::path::PathBuf;

use clap::{ArgAction, Parser};
use tracing::info;
use tracing_subscriber::EnvFilter;

use canremote_server::config::ServerConfig;
use canremote_server::service::CanServerService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "canremote-server", about = "Share a CAN channel over TCP")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "canremote-server.toml")]
    config: PathBuf,

    /// Address to bind.
    #[arg(long)]
    host: Option<String>,

    /// TCP port to listen on.
    #[arg(short, long)]
    port: Option<u16>,

    /// Virtual channel served to clients.
    #[arg(long)]
    channel: Option<String>,

    /// Bitrate forced on every client, in bit/s.
    #[arg(short, long)]
    bitrate: Option<u32>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Write the default configuration to the --config path and exit.
    #[arg(long)]
    init_config: bool,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(host) = &self.host {
            config.network.host = host.clone();
        }
        if let Some(port) = self.port {
            config.network.port = port;
        }
        if let Some(channel) = &self.channel {
            config.bus.channel = channel.clone();
        }
        if let Some(bitrate) = self.bitrate {
            config.bus.bitrate = bitrate;
        }
        match self.verbose {
            0 => {}
            1 => config.logging.level = "debug".into(),
            _ => config.logging.level = "trace".into(),
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&ServerConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    // --init-config: bootstrap a config file and exit.
    if cli.init_config {
        ServerConfig::write_default(&cli.config)?;
        println!("wrote {}", cli.config.display());
        return Ok(());
    }

    let mut config = ServerConfig::load(&cli.config);
    cli.apply(&mut config);

    let filter = if cli.verbose > 0 {
        EnvFilter::new(&config.logging.level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("canremote-server v{}", env!("CARGO_PKG_VERSION"));
    info!("listen address: {}", config.listen_addr());
    info!("channel: {}", config.bus.channel);
    if config.bus.bitrate > 0 {
        info!("bitrate: {}", config.bus.bitrate);
    }

    let service = CanServerService::new(config);

    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        info!("ctrl-c received, shutting down");
        let _ = stop_tx.try_send(());
    })?;

    service.run(&stop_rx)?;
    Ok(())
}
