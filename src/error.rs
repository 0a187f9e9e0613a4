use thiserror::Error;

use crate::backend::ChannelAttribute;

/// Library errors using thiserror for structured error handling.
///
/// Backend failures are separated from playback-layer failures so callers
/// can tell a device problem apart from a misused handle.

/// Errors reported by an [`AudioBackend`](crate::backend::AudioBackend)
/// implementation.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to open audio stream: {path}")]
    StreamOpenFailed {
        path: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Failed to decode audio stream: {0}")]
    DecodeFailed(String),

    #[error("Invalid or freed channel handle")]
    InvalidHandle,

    #[error("Attribute {attribute:?} rejected: {reason}")]
    AttributeRejected {
        attribute: ChannelAttribute,
        reason: String,
    },

    #[error("Non-finite attribute value")]
    NonFiniteValue,

    #[error("Seek failed: {0}")]
    SeekFailed(String),

    #[error("No output device available")]
    NoDevice,

    #[error("Failed to open output device: {0}")]
    DeviceOpenFailed(String),

    #[error("Failed to start output device: {0}")]
    DeviceStartFailed(String),

    #[error("Mixer operation failed: {0}")]
    MixerFailed(String),
}

/// Startup failures, one variant per initialization stage.
///
/// A failure at any stage rolls back the stages before it; the manager is
/// left `Uninitialized` and the host must not proceed with audio.
#[derive(Error, Debug)]
pub enum InitError {
    #[error("Failed to open output device")]
    Device(#[source] BackendError),

    #[error("Failed to create mixer")]
    MixerCreate(#[source] BackendError),

    #[error("Failed to connect mixers")]
    MixerConnect(#[source] BackendError),

    #[error("Failed to start output device")]
    DeviceStart(#[source] BackendError),
}

/// Playback-layer errors.
#[derive(Error, Debug)]
pub enum AudioError {
    /// Operation on a disposed [`Audio`](crate::Audio). Disposed
    /// [`AudioInstance`](crate::AudioInstance)s are advisory no-ops instead,
    /// so automatic pruning never races against stale external handles.
    #[error("Audio object has been disposed")]
    Disposed,

    /// Asset operations require a running manager (the mixer graph must
    /// exist before voices can attach to it).
    #[error("Audio manager is not running")]
    NotRunning,

    #[error("Failed to load audio file: {path}")]
    LoadFailed {
        path: String,
        #[source]
        source: BackendError,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Result alias for playback-layer operations.
pub type AudioResult<T> = Result<T, AudioError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_error_display() {
        let err = AudioError::Disposed;
        assert_eq!(err.to_string(), "Audio object has been disposed");

        let err = BackendError::InvalidHandle;
        assert_eq!(err.to_string(), "Invalid or freed channel handle");
    }

    #[test]
    fn test_init_error_stage_chain() {
        let err = InitError::MixerConnect(BackendError::MixerFailed(
            "outer mixer rejected input".to_string(),
        ));

        assert_eq!(err.to_string(), "Failed to connect mixers");
        assert!(err.source().is_some());
    }

    #[test]
    fn test_load_failed_chain() {
        let err = AudioError::LoadFailed {
            path: "missing.ogg".to_string(),
            source: BackendError::StreamOpenFailed {
                path: "missing.ogg".to_string(),
                source: None,
            },
        };

        assert_eq!(err.to_string(), "Failed to load audio file: missing.ogg");
        assert!(err.source().is_some());
    }
}
