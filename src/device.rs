/// Device host — wires the pipeline, the command channel and the network
/// monitor together and owns shutdown.
///
/// While running it logs a status line every `log.status_interval_secs`; on
/// shutdown it logs the last commands seen.

use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::alert::{AlertController, RodioTone, SilentTone, ToneGenerator};
use crate::camera::{CameraSession, FfmpegInput, FfmpegOpener, ReconnectPolicy, SourceOpener};
use crate::command_log::{CommandLog, Direction};
use crate::device_config::DeviceConfig;
use crate::dispatcher::{CameraControl, CommandDispatcher, MotionSettings};
use crate::frame::BufferLedger;
use crate::frame_slot::LatestFrameSlot;
use crate::microphone::AudioFeed;
use crate::motion::DetectorState;
use crate::mq_rpc::MqRpcServer;
use crate::network::{forward_to_gate, NetworkMonitor};
use crate::pipeline::FramePipeline;
use crate::preprocess::FramePreprocessor;
use crate::stream_gate::{FfmpegStreamEncoder, StreamEncoder, StreamGate, StreamSettings};

/// Platform collaborators. Tests swap in fakes.
pub struct DeviceParts {
    pub opener: Arc<dyn SourceOpener>,
    pub tone: Box<dyn ToneGenerator>,
    pub encoder: Box<dyn StreamEncoder>,
    /// Samples muxed into the stream; `None` streams video only.
    pub audio: Option<AudioFeed>,
}

/// Command-log entries written out at shutdown.
const SHUTDOWN_LOG_TAIL: usize = 10;

impl DeviceParts {
    /// ffmpeg camera and encoder, rodio alarm (silent if no audio output),
    /// cpal microphone for the stream (video only if there is none).
    pub fn from_config(cfg: &DeviceConfig) -> Self {
        let opener = FfmpegOpener::new(FfmpegInput {
            binary: cfg.camera.ffmpeg_binary.clone(),
            source: cfg.camera.source.clone(),
            input_format: cfg.camera.input_format.clone(),
            pixel_format: cfg.camera.pixel_format,
            width: cfg.camera.width,
            height: cfg.camera.height,
        });

        let tone: Box<dyn ToneGenerator> = if cfg.alarm.audible {
            match RodioTone::open(cfg.alarm.frequency_hz, cfg.alarm.volume) {
                Ok(tone) => Box::new(tone),
                Err(e) => {
                    warn!("alarm will be silent: {}", e);
                    Box::new(SilentTone::default())
                }
            }
        } else {
            Box::new(SilentTone::default())
        };

        let audio = if cfg.stream.audio && !cfg.stream.url.is_empty() {
            match AudioFeed::open(cfg.stream.sample_rate) {
                Ok(feed) => Some(feed),
                Err(e) => {
                    warn!("stream will carry no audio: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Self {
            opener: Arc::new(opener),
            tone,
            encoder: Box::new(FfmpegStreamEncoder::new(cfg.stream.ffmpeg_binary.clone())),
            audio,
        }
    }
}

pub struct Device {
    cfg: DeviceConfig,
    slot: LatestFrameSlot,
    detector: Arc<Mutex<DetectorState>>,
    camera: Arc<CameraSession>,
    alert: Arc<AlertController>,
    gate: Arc<StreamGate>,
    motion: Arc<MotionSettings>,
    dispatcher: Arc<CommandDispatcher>,
    network: Arc<NetworkMonitor>,
    log: Arc<CommandLog>,
    ledger: BufferLedger,
    audio: Option<AudioFeed>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Device {
    /// Assemble every component without starting anything. Fails only when
    /// no usable frame source exists.
    pub fn build(cfg: DeviceConfig, parts: DeviceParts) -> Result<Self> {
        parts
            .opener
            .check_available()
            .with_context(|| format!("no usable frame source at {}", cfg.camera.source))?;

        let ledger = BufferLedger::new();
        let slot = LatestFrameSlot::new();
        let detector = Arc::new(Mutex::new(DetectorState::new(cfg.camera.detector_settings())));

        let camera = Arc::new(
            CameraSession::new(
                Arc::clone(&parts.opener),
                slot.clone(),
                Arc::clone(&detector),
                cfg.camera.frame_rate,
            )
            .with_ledger(ledger.clone())
            .with_reconnect(ReconnectPolicy {
                attempts: cfg.camera.reconnect_attempts,
                ..ReconnectPolicy::default()
            }),
        );

        let stream_scale = cfg.stream.scale.max(1);
        let gate = Arc::new(StreamGate::new(
            parts.encoder,
            StreamSettings {
                url: cfg.stream.url.clone(),
                width: cfg.camera.width / stream_scale,
                height: cfg.camera.height / stream_scale,
                frame_rate: cfg.camera.frame_rate,
                sample_rate: cfg.stream.sample_rate,
                audio: parts.audio.is_some(),
            },
        ));

        let alert = Arc::new(AlertController::new(parts.tone));
        let motion = Arc::new(MotionSettings::new(cfg.camera.flash_light, cfg.camera.auto_warning));
        let dispatcher = Arc::new(CommandDispatcher::new(
            camera.clone(),
            Arc::clone(&alert),
            Arc::clone(&gate),
            Arc::clone(&motion),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            log: Arc::new(CommandLog::new(cfg.log.command_log_capacity)),
            network: Arc::new(NetworkMonitor::new(false)),
            cfg,
            slot,
            detector,
            camera,
            alert,
            gate,
            motion,
            dispatcher,
            ledger,
            audio: parts.audio,
            shutdown_tx,
            tasks: Vec::new(),
        })
    }

    /// Build and start everything: pipeline, network polling, command channel.
    pub fn start(cfg: DeviceConfig, parts: DeviceParts) -> Result<Self> {
        let mut device = Self::build(cfg, parts)?;
        device.network.set(NetworkMonitor::detect());
        device.spawn_pipeline();
        device.spawn_network();
        device.spawn_command_channel();
        device.spawn_audio();
        device.spawn_status_line();
        device.open_initial_camera();
        Ok(device)
    }

    /// Open the camera if configured to start with motion detection on.
    pub fn open_initial_camera(&self) {
        if !self.cfg.camera.open_on_start {
            return;
        }
        if let Err(e) = self.camera.open(self.cfg.camera.flash_light) {
            warn!("camera not opened at startup: {}", e);
        }
    }

    pub fn spawn_pipeline(&mut self) {
        let pipeline = FramePipeline::new(
            self.slot.clone(),
            FramePreprocessor::with_ledger(self.ledger.clone()),
            Arc::clone(&self.detector),
            self.camera.clone(),
            Arc::clone(&self.alert),
            Arc::clone(&self.gate),
            Arc::clone(&self.motion),
            self.cfg.stream.scale,
        );
        let stop = self.shutdown_tx.subscribe();
        let handle = tokio::task::spawn_blocking(move || pipeline.run(stop));
        self.tasks.push(handle);
    }

    pub fn spawn_network(&mut self) {
        let monitor = Arc::clone(&self.network);
        let interval = self.cfg.network.poll_interval();
        self.tasks
            .push(tokio::spawn(monitor.run(interval, self.shutdown_tx.subscribe())));
        self.spawn_gate_forwarder();
    }

    /// Keep the stream gate in step with the network monitor.
    pub fn spawn_gate_forwarder(&mut self) {
        self.tasks.push(tokio::spawn(forward_to_gate(
            self.network.subscribe(),
            Arc::clone(&self.gate),
            self.shutdown_tx.subscribe(),
        )));
    }

    pub fn spawn_command_channel(&mut self) {
        let server = MqRpcServer::new(
            self.cfg.broker.clone(),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.log),
        );
        let network = self.network.subscribe();
        let shutdown = self.shutdown_tx.subscribe();
        self.tasks
            .push(tokio::spawn(async move { server.run(network, shutdown).await }));
    }

    /// Forward microphone samples to the stream gate. No-op without audio.
    pub fn spawn_audio(&mut self) {
        let Some(feed) = self.audio.take() else {
            return;
        };
        let gate = Arc::clone(&self.gate);
        let stop = self.shutdown_tx.subscribe();
        self.tasks
            .push(tokio::task::spawn_blocking(move || feed.pump(gate, stop)));
    }

    /// Log `status_line` on the configured interval until shutdown.
    pub fn spawn_status_line(&mut self) {
        let Some(every) = self.cfg.log.status_interval() else {
            return;
        };
        let report = self.status_report();
        let mut shutdown = self.shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(every) => info!("{}", report.render()),
                }
            }
        }));
    }

    fn status_report(&self) -> StatusReport {
        StatusReport {
            dispatcher: Arc::clone(&self.dispatcher),
            detector: Arc::clone(&self.detector),
            ledger: self.ledger.clone(),
            log: Arc::clone(&self.log),
            network: Arc::clone(&self.network),
        }
    }

    /// One-line summary of network, streaming, alarm, motion flags and buffers.
    pub fn status_line(&self) -> String {
        self.status_report().render()
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    pub fn command_log(&self) -> &Arc<CommandLog> {
        &self.log
    }

    pub fn camera(&self) -> &Arc<CameraSession> {
        &self.camera
    }

    /// Live pixel buffers (raw and normalized) currently allocated.
    pub fn ledger(&self) -> &BufferLedger {
        &self.ledger
    }

    /// Stop every task, then close camera, stream and alarm. Nothing owned
    /// by the device stays allocated afterwards.
    pub async fn shutdown(mut self) {
        info!("device shutting down");
        self.log.record(Direction::Event, "shutdown");
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("task ended abnormally: {}", e);
            }
        }
        self.close();
        for entry in self.log.tail(SHUTDOWN_LOG_TAIL) {
            info!("  {}", entry);
        }
        info!("device stopped ({} buffers live)", self.ledger.live());
    }

    /// Release camera, stream session and alarm. Safe to call repeatedly.
    pub fn close(&self) {
        self.camera.close();
        self.gate.close();
        self.alert.close();
    }
}

struct StatusReport {
    dispatcher: Arc<CommandDispatcher>,
    detector: Arc<Mutex<DetectorState>>,
    ledger: BufferLedger,
    log: Arc<CommandLog>,
    network: Arc<NetworkMonitor>,
}

impl StatusReport {
    fn render(&self) -> String {
        let status = self.dispatcher.status();
        let flags = self.dispatcher.motion_flags();
        let primed = self
            .detector
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .has_previous();
        format!(
            "status: network={} streaming={} alarm={} camera={} flash={} auto_warning={} primed={} buffers={} commands={}",
            self.network.is_available(),
            status.streaming,
            status.alarm,
            flags.camera(),
            flags.flash_light(),
            flags.auto_warning(),
            primed,
            self.ledger.live(),
            self.log.len()
        )
    }
}
