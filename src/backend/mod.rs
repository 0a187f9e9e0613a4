/// Audio backend boundary
///
/// The playback layer never talks to a device or decoder directly; it goes
/// through [`AudioBackend`], which mirrors what a mixing backend actually
/// provides: decode streams, a mixer graph, per-channel attributes and
/// transport, and one output device. [`rodio::RodioBackend`] is the
/// production implementation; [`mock::MockBackend`] is a deterministic
/// stand-in for tests.
pub mod mock;
pub mod rodio;

use std::path::Path;

use crate::error::BackendError;
use crate::settings::AudioSettings;

/// Handle to a decode stream attached (or attachable) to a mixer.
///
/// Valid from `open_decode_stream` until `free_stream`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub(crate) u64);

impl StreamHandle {
    /// Raw handle value, for diagnostics only.
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Handle to a mixer node in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MixerHandle(pub(crate) u64);

impl MixerHandle {
    /// Raw handle value, for diagnostics only.
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Per-channel attributes a backend exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelAttribute {
    /// Linear gain, 0.0..=1.0.
    Volume,

    /// Stereo pan, -1.0..=1.0.
    Pan,

    /// Pitch shift in semitones, independent of speed.
    Pitch,

    /// Absolute playback frequency in Hz. Speed control is expressed as a
    /// ratio of this attribute to the stream's native frequency.
    Frequency,
}

/// Transport state of a mixer channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Playing,
    Paused,
    Stopped,
}

/// Metadata captured from a decode stream probe.
#[derive(Debug, Clone, Copy)]
pub struct StreamInfo {
    /// Native sample rate in Hz.
    pub sample_rate: f32,

    /// Channel count.
    pub channels: u16,

    /// Total decoded length in bytes.
    pub length_bytes: u64,
}

impl StreamInfo {
    /// Decoded bytes per second of playback at native speed.
    pub fn bytes_per_second(&self) -> f64 {
        f64::from(self.sample_rate) * f64::from(self.channels) * 4.0
    }

    /// Total duration in seconds.
    pub fn duration_seconds(&self) -> f64 {
        let bps = self.bytes_per_second();
        if bps > 0.0 {
            self.length_bytes as f64 / bps
        } else {
            0.0
        }
    }
}

/// Output device description, fixed for the lifetime of a running manager.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Contract consumed by the playback layer.
///
/// All methods must be safe to call from the update thread while the
/// backend's real-time output callback is running; cross-thread hazards
/// inside the graph are the implementation's responsibility. Channels are
/// created paused and stay paused through `attach_channel`.
pub trait AudioBackend: Send + Sync {
    // --- Decode streams ---

    /// Open a decode stream for `path`. The stream is not audible until it
    /// is attached to a mixer and played.
    fn open_decode_stream(&self, path: &Path) -> Result<StreamHandle, BackendError>;

    /// Probe metadata for an open stream.
    fn stream_info(&self, stream: StreamHandle) -> Result<StreamInfo, BackendError>;

    /// Add speed/pitch control capability to a decode stream. Returns the
    /// handle to use for all further operations; on failure the input
    /// stream is still owned by the caller.
    fn wrap_with_tempo(&self, stream: StreamHandle) -> Result<StreamHandle, BackendError>;

    /// Toggle whole-stream looping.
    fn set_stream_looping(&self, stream: StreamHandle, looping: bool) -> Result<(), BackendError>;

    /// Free a stream and everything decoded for it. Detaches first if
    /// needed. Freeing an already-freed handle is a no-op.
    fn free_stream(&self, stream: StreamHandle);

    // --- Mixer graph ---

    fn create_mixer(&self, sample_rate: u32, channels: u16) -> Result<MixerHandle, BackendError>;

    /// Feed mixer `src` into mixer `dst` as one input.
    fn connect_mixer(&self, dst: MixerHandle, src: MixerHandle) -> Result<(), BackendError>;

    /// Set a mixer node's gain.
    fn set_mixer_volume(&self, mixer: MixerHandle, volume: f32) -> Result<(), BackendError>;

    fn free_mixer(&self, mixer: MixerHandle);

    /// Attach a stream to a mixer as a new channel, initially paused.
    fn attach_channel(&self, mixer: MixerHandle, stream: StreamHandle) -> Result<(), BackendError>;

    /// Detach a channel from its mixer. The stream handle stays valid.
    fn detach_channel(&self, mixer: MixerHandle, stream: StreamHandle);

    // --- Channel control ---

    fn set_channel_attribute(
        &self,
        stream: StreamHandle,
        attribute: ChannelAttribute,
        value: f32,
    ) -> Result<(), BackendError>;

    fn get_channel_attribute(
        &self,
        stream: StreamHandle,
        attribute: ChannelAttribute,
    ) -> Result<f32, BackendError>;

    fn play_channel(&self, stream: StreamHandle) -> Result<(), BackendError>;

    fn pause_channel(&self, stream: StreamHandle) -> Result<(), BackendError>;

    fn channel_state(&self, stream: StreamHandle) -> ChannelState;

    fn channel_position_bytes(&self, stream: StreamHandle) -> Result<u64, BackendError>;

    fn set_channel_position_bytes(
        &self,
        stream: StreamHandle,
        bytes: u64,
    ) -> Result<(), BackendError>;

    /// Convert seconds to a byte offset in the stream's native format.
    fn seconds_to_bytes(&self, stream: StreamHandle, seconds: f64) -> u64;

    /// Inverse of [`seconds_to_bytes`](Self::seconds_to_bytes).
    fn bytes_to_seconds(&self, stream: StreamHandle, bytes: u64) -> f64;

    // --- Output device ---

    /// Names of available output devices, for diagnostics.
    fn enumerate_output_devices(&self) -> Vec<String>;

    /// Open the output device (the system default when the settings name
    /// none). Sample rate and channel count are fixed from here on.
    fn open_device(&self, settings: &AudioSettings) -> Result<DeviceInfo, BackendError>;

    /// Start the output callback, pulling mixed PCM from `output_mixer`.
    fn start_device(&self, output_mixer: MixerHandle) -> Result<(), BackendError>;

    fn stop_device(&self);

    fn close_device(&self);

    /// Device-wide gain applied after the mixer graph.
    fn set_device_gain(&self, gain: f32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_info_conversions() {
        let info = StreamInfo {
            sample_rate: 44_100.0,
            channels: 2,
            length_bytes: 3_528_000,
        };

        assert_eq!(info.bytes_per_second(), 352_800.0);
        assert!((info.duration_seconds() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_rate_duration() {
        let info = StreamInfo {
            sample_rate: 0.0,
            channels: 0,
            length_bytes: 1000,
        };

        assert_eq!(info.duration_seconds(), 0.0);
    }
}
