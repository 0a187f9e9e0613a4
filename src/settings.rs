use serde::{Deserialize, Serialize};

/// Output device settings passed to [`AudioManager::init`](crate::AudioManager::init).
///
/// Zero means "let the backend pick" for the buffer and period fields;
/// backends that cannot honor a field log what they used instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSettings {
    /// Open the device in exclusive mode when the backend supports it.
    pub exclusive: bool,

    /// Requested sample rate in Hz.
    pub sample_rate: u32,

    /// Output buffer length in seconds (0 = automatic).
    pub buffer_length: f32,

    /// Device update period in seconds (0 = automatic).
    pub period: f32,

    /// Output device index from
    /// [`enumerate_output_devices`](crate::backend::AudioBackend::enumerate_output_devices);
    /// `None` selects the system default.
    pub device_index: Option<usize>,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            exclusive: false,
            sample_rate: 44_100,
            buffer_length: 0.0,
            period: 0.0,
            device_index: None,
        }
    }
}

impl AudioSettings {
    /// Serialize to a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Deserialize from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
