use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::frame::PixelFormat;
use crate::motion::DetectorSettings;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct DeviceConfig {
    pub camera:  CameraConfig,
    pub broker:  BrokerConfig,
    pub stream:  StreamConfig,
    pub alarm:   AlarmConfig,
    pub network: NetworkConfig,
    pub log:     LogConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CameraConfig {
    /// Anything ffmpeg can open: `/dev/video0`, `rtsp://…`, a file.
    pub source:             String,
    /// ffmpeg demuxer for the source (`v4l2`, `avfoundation`, …).
    pub input_format:       Option<String>,
    pub ffmpeg_binary:      String,
    pub pixel_format:       PixelFormat,
    pub width:              u32,
    pub height:             u32,
    pub frame_rate:         u32,
    /// Downscale factor before motion comparison.
    pub scale:              u32,
    pub diff_threshold:     u8,
    pub min_region_pixels:  u32,
    /// Initial motion-detection flags.
    pub open_on_start:      bool,
    pub flash_light:        bool,
    pub auto_warning:       bool,
    pub reconnect_attempts: u32,
}
impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source:             "/dev/video0".into(),
            input_format:       None,
            ffmpeg_binary:      "ffmpeg".into(),
            pixel_format:       PixelFormat::I420,
            width:              1920,
            height:             1080,
            frame_rate:         10,
            scale:              8,
            diff_threshold:     150,
            min_region_pixels:  1,
            open_on_start:      true,
            flash_light:        false,
            auto_warning:       false,
            reconnect_attempts: 5,
        }
    }
}

impl CameraConfig {
    pub fn detector_settings(&self) -> DetectorSettings {
        DetectorSettings {
            scale:             self.scale,
            diff_threshold:    self.diff_threshold,
            min_region_pixels: self.min_region_pixels,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct BrokerConfig {
    pub host:                 String,
    pub port:                 u16,
    pub username:             Option<String>,
    pub password:             Option<String>,
    /// Request topic the device consumes commands from.
    pub queue:                String,
    pub client_id:            Option<String>,
    pub keep_alive_secs:      u64,
    pub reconnect_delay_secs: u64,
}
impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host:                 "localhost".into(),
            port:                 1883,
            username:             None,
            password:             None,
            queue:                "housedog".into(),
            client_id:            None,
            keep_alive_secs:      30,
            reconnect_delay_secs: 2,
        }
    }
}

impl BrokerConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.max(5))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs.max(1))
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct StreamConfig {
    /// RTMP publish URL; streaming commands fail while empty.
    pub url:           String,
    /// Downscale factor applied to frames pushed to the stream.
    pub scale:         u32,
    pub sample_rate:   u32,
    /// Capture the default microphone into the stream.
    pub audio:         bool,
    pub ffmpeg_binary: String,
}
impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url:           String::new(),
            scale:         4,
            sample_rate:   44100,
            audio:         true,
            ffmpeg_binary: "ffmpeg".into(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct AlarmConfig {
    /// Play through the default audio output; otherwise the alarm is silent.
    pub audible:      bool,
    pub frequency_hz: f32,
    pub volume:       f32,
}
impl Default for AlarmConfig {
    fn default() -> Self {
        Self { audible: true, frequency_hz: 1000.0, volume: 1.0 }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub poll_interval_secs: u64,
}
impl Default for NetworkConfig {
    fn default() -> Self {
        Self { poll_interval_secs: 5 }
    }
}

impl NetworkConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    /// Entries kept in the command log ring buffer.
    pub command_log_capacity: usize,
    /// Seconds between status lines; 0 turns them off.
    pub status_interval_secs: u64,
}
impl Default for LogConfig {
    fn default() -> Self {
        Self { command_log_capacity: 100, status_interval_secs: 60 }
    }
}

impl LogConfig {
    pub fn status_interval(&self) -> Option<Duration> {
        (self.status_interval_secs > 0).then(|| Duration::from_secs(self.status_interval_secs))
    }
}

/// `housedog.toml` (optional, working directory) overlaid by
/// `HOUSEDOG__SECTION__KEY` environment variables.
pub fn load_config() -> Result<DeviceConfig> {
    build(config::File::with_name("housedog").required(false))
}

/// Same layering, but the file must exist at `path`.
pub fn load_config_from(path: &Path) -> Result<DeviceConfig> {
    build(config::File::from(path).required(true))
}

fn build<S>(file: S) -> Result<DeviceConfig>
where
    S: config::Source + Send + Sync + 'static,
{
    let cfg = config::Config::builder()
        .add_source(file)
        .add_source(config::Environment::with_prefix("HOUSEDOG").separator("__"))
        .build()?;
    let device: DeviceConfig = cfg.try_deserialize()?;
    Ok(validate(device))
}

pub fn default_config() -> DeviceConfig {
    DeviceConfig::default()
}

/// Clamp values the pipeline cannot work with.
pub fn validate(mut cfg: DeviceConfig) -> DeviceConfig {
    let cam = &mut cfg.camera;
    if cam.scale == 0 {
        warn!("camera.scale must be at least 1, using 1");
        cam.scale = 1;
    }
    if cam.frame_rate == 0 {
        warn!("camera.frame_rate must be at least 1, using 1");
        cam.frame_rate = 1;
    }
    if cam.diff_threshold == 0 {
        warn!("camera.diff_threshold must be at least 1, using 1");
        cam.diff_threshold = 1;
    }
    if cam.min_region_pixels == 0 {
        cam.min_region_pixels = 1;
    }
    if cam.width % 2 != 0 || cam.height % 2 != 0 {
        warn!("camera size {}x{} is odd, rounding down", cam.width, cam.height);
        cam.width &= !1;
        cam.height &= !1;
    }
    if cfg.stream.scale == 0 {
        cfg.stream.scale = 1;
    }
    cfg.alarm.volume = cfg.alarm.volume.clamp(0.0, 1.0);
    cfg
}
