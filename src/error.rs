/// Device error taxonomy.
///
/// Every failure in the frame pipeline or command dispatcher is caught at its
/// local boundary and reported through this enum; none of them is fatal to
/// the process.

use thiserror::Error;

use crate::frame::PixelFormat;

#[derive(Debug, Error)]
pub enum DeviceError {
    /// Raw frame planes do not match the declared layout. The frame is dropped.
    #[error("unsupported {format:?} frame {width}x{height}: {reason}")]
    UnsupportedFrameFormat {
        format: PixelFormat,
        width: u32,
        height: u32,
        reason: String,
    },

    /// Inbound command could not be understood. Answered with the no-op ack.
    #[error("malformed command: {0}")]
    MalformedCommand(String),

    /// Camera, network, audio output or encoder not ready.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// Command channel lost; the host loop reconnects.
    #[error("transport disconnected: {0}")]
    TransportDisconnected(String),

    /// Streaming encoder refused a push (bad size, non-increasing timestamp, dead child).
    #[error("stream encoder: {0}")]
    StreamEncoder(String),

    #[error("no permission to access the camera")]
    NoPermissions,

    #[error("no camera available")]
    NoCamera,

    #[error("camera {0} does not exist")]
    CameraNotExist(String),
}

pub type DeviceResult<T> = Result<T, DeviceError>;

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => DeviceError::NoPermissions,
            std::io::ErrorKind::NotFound => DeviceError::NoCamera,
            _ => DeviceError::ResourceUnavailable(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_camera_variants() {
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(DeviceError::from(denied), DeviceError::NoPermissions));

        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(DeviceError::from(missing), DeviceError::NoCamera));

        let other = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert!(matches!(DeviceError::from(other), DeviceError::ResourceUnavailable(_)));
    }

    #[test]
    fn camera_not_exist_names_the_id() {
        let err = DeviceError::CameraNotExist("cam7".into());
        assert_eq!(err.to_string(), "camera cam7 does not exist");
    }
}
