//! Error types for the console engine.

use std::path::PathBuf;

use thiserror::Error;

use crate::device::{DeviceId, OutputRole};

/// Errors surfaced by engine, host and settings operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Capture permission was declined, blocked or never answered.
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    /// The requested device is no longer present.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(DeviceId),

    /// Neither the direct nor the stream mechanism can reach the device.
    /// Playback continues on the current route.
    #[error("cannot route {role} output to {device}")]
    RoutingUnsupported {
        /// Which output was being switched.
        role: OutputRole,
        /// The device that could not be reached.
        device: DeviceId,
    },

    /// No processing context could be created; the engine cannot run.
    #[error("audio graph construction failed: {0}")]
    GraphConstructionFailed(String),

    /// Operation not allowed in the engine's current lifecycle state.
    #[error("operation `{operation}` not allowed while {state}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// Lifecycle state at the time.
        state: &'static str,
    },

    /// A platform stream failed to open or run.
    #[error("stream error: {0}")]
    Stream(String),

    /// Reading or writing the settings file failed.
    #[error("settings file '{path}': {source}")]
    SettingsIo {
        /// Settings file path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Settings content could not be (de)serialized.
    #[error("settings format: {0}")]
    SettingsFormat(#[from] serde_json::Error),
}

impl Error {
    /// Create a settings I/O error.
    pub fn settings_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::SettingsIo {
            path: path.into(),
            source,
        }
    }

    /// Whether this failure should be shown to the user rather than recovered locally.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Error::PermissionDenied(_) | Error::GraphConstructionFailed(_) | Error::RoutingUnsupported { .. }
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn routing_unsupported_names_role_and_device() {
        let err = Error::RoutingUnsupported {
            role: OutputRole::Monitor,
            device: DeviceId::new("headphones"),
        };
        assert_eq!(err.to_string(), "cannot route monitor output to headphones");
        assert!(err.is_user_visible());
    }

    #[test]
    fn settings_io_exposes_source() {
        let err = Error::settings_io("/tmp/micdeck.json", std::io::Error::other("disk full"));
        assert!(err.source().is_some());
        assert!(err.to_string().contains("/tmp/micdeck.json"));
        assert!(!err.is_user_visible());
    }

    #[test]
    fn device_unavailable_is_recovered_locally() {
        assert!(!Error::DeviceUnavailable(DeviceId::new("usb-mic")).is_user_visible());
    }
}
