use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use housedog::device::{Device, DeviceParts};
use housedog::device_config::{self, DeviceConfig};
use housedog::logging;
use housedog::mq_rpc;
use housedog::protocol::{self, DeviceStatus, MotionFlags, Opcode};

#[derive(Parser)]
#[command(name = "housedog", version)]
#[command(about = "Motion watchdog with alarm, RTMP push and an MQTT command channel")]
struct Cli {
    /// Config file (defaults to ./housedog.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the device
    Run {
        /// Camera source passed to ffmpeg
        #[arg(long)] source:     Option<String>,
        /// RTMP publish URL
        #[arg(long)] stream_url: Option<String>,
        #[arg(long)] host:       Option<String>,
        #[arg(long)] queue:      Option<String>,
    },

    /// Send one command to a device and print its reply
    Send {
        #[command(subcommand)]
        action: Action,
        #[arg(long)] host:  Option<String>,
        #[arg(long)] queue: Option<String>,
        /// Seconds to wait for the reply
        #[arg(long, default_value = "5")] timeout: u64,
        #[arg(long)] json: bool,
    },
}

#[derive(Subcommand)]
enum Action {
    /// Configure motion detection
    Motion {
        #[arg(long)] camera:       bool,
        #[arg(long)] flash:        bool,
        #[arg(long)] auto_warning: bool,
    },
    /// Switch the RTMP stream
    Stream { state: Switch },
    /// Switch the alarm sound
    Alarm { state: Switch },
    /// Ask for streaming/alarm status
    Status,
    /// Send raw bytes given as hex, e.g. `0105`
    Raw { hex: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum Switch {
    On,
    Off,
}

impl Switch {
    fn arg(self) -> u8 {
        match self {
            Switch::On => 1,
            Switch::Off => 0,
        }
    }
}

impl Action {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(match self {
            Action::Motion { camera, flash, auto_warning } => protocol::encode(
                Opcode::MotionDetection,
                Some(MotionFlags::new(*camera, *flash, *auto_warning).bits()),
            ),
            Action::Stream { state } => protocol::encode(Opcode::RtmpVideo, Some(state.arg())),
            Action::Alarm { state } => protocol::encode(Opcode::WarningSound, Some(state.arg())),
            Action::Status => protocol::encode(Opcode::InspectStatus, None),
            Action::Raw { hex } => protocol::parse_hex(hex)?,
        })
    }
}

fn load(path: Option<&PathBuf>) -> DeviceConfig {
    let loaded = match path {
        Some(p) => device_config::load_config_from(p),
        None => device_config::load_config(),
    };
    loaded.unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        device_config::default_config()
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { source, stream_url, host, queue } => {
            logging::init_logging(true);
            let mut cfg = load(cli.config.as_ref());
            if let Some(s) = source     { cfg.camera.source = s; }
            if let Some(u) = stream_url { cfg.stream.url    = u; }
            if let Some(h) = host       { cfg.broker.host   = h; }
            if let Some(q) = queue      { cfg.broker.queue  = q; }
            print_startup_info(&cfg);

            let parts = DeviceParts::from_config(&cfg);
            let device = Device::start(cfg, parts)?;
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            device.shutdown().await;
        }

        Command::Send { action, host, queue, timeout, json } => {
            logging::init_logging(false);
            let mut cfg = load(cli.config.as_ref());
            if let Some(h) = host  { cfg.broker.host  = h; }
            if let Some(q) = queue { cfg.broker.queue = q; }

            let message = action.encode()?;
            let reply = mq_rpc::request(&cfg.broker, &message, Duration::from_secs(timeout.max(1)))
                .await
                .with_context(|| format!("no reply from {}:{}", cfg.broker.host, cfg.broker.port))?;
            print_reply(&reply, json)?;
        }
    }

    Ok(())
}

fn print_startup_info(cfg: &DeviceConfig) {
    println!("╔══════════════════════════════════════════╗");
    println!("║  housedog v{:<29} ║", env!("CARGO_PKG_VERSION"));
    println!("╚══════════════════════════════════════════╝");
    println!("  Camera:  {} ({}x{} @ {} fps)", cfg.camera.source, cfg.camera.width, cfg.camera.height, cfg.camera.frame_rate);
    println!("  Motion:  scale 1/{}  threshold {}", cfg.camera.scale, cfg.camera.diff_threshold);
    println!("  Broker:  {}:{}  queue={}", cfg.broker.host, cfg.broker.port, cfg.broker.queue);
    if cfg.stream.url.is_empty() {
        println!("  Stream:  (no RTMP url)");
    } else {
        let audio = if cfg.stream.audio { "mic" } else { "no audio" };
        println!("  Stream:  {} (1/{}, {})", cfg.stream.url, cfg.stream.scale, audio);
    }
    println!();
}

fn print_reply(reply: &[u8], json: bool) -> Result<()> {
    let status = DeviceStatus::from_reply(reply);
    if json {
        let value = serde_json::json!({
            "reply":  protocol::to_hex(reply),
            "status": status,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    match status {
        Some(s) => println!("streaming={} alarm={}", s.streaming, s.alarm),
        None if reply == [protocol::NOOP_ACK] => println!("not understood (no-op ack)"),
        None => println!("{}", protocol::to_hex(reply)),
    }
    Ok(())
}
