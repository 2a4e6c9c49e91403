pub mod alert;
pub mod camera;
pub mod command_log;
pub mod device;
pub mod device_config;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod frame_slot;
pub mod logging;
pub mod microphone;
pub mod motion;
pub mod mq_rpc;
pub mod network;
pub mod pipeline;
pub mod preprocess;
pub mod protocol;
pub mod stream_gate;

pub use alert::{AlertController, AlertState, ToneGenerator};
pub use camera::{CameraSession, CameraState, FrameSource, SourceOpener};
pub use device::{Device, DeviceParts};
pub use device_config::DeviceConfig;
pub use dispatcher::{CameraControl, CommandDispatcher, MotionSettings};
pub use error::{DeviceError, DeviceResult};
pub use frame::{BufferLedger, NormalizedFrame, PixelFormat, RawFrame};
pub use microphone::AudioFeed;
pub use protocol::{DeviceStatus, MotionFlags, Opcode};
pub use stream_gate::{StreamEncoder, StreamGate, StreamSettings};
