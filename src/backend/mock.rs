/// Deterministic in-memory backend for tests
///
/// No device, no decoding: clips are registered up front with a duration,
/// and time only moves when [`MockBackend::advance`] is called. Stage
/// failures can be injected to exercise init rollback. Rodio needs real
/// audio hardware, so every playback-layer test in this crate runs against
/// this backend instead.
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::{
    AudioBackend, ChannelAttribute, ChannelState, DeviceInfo, MixerHandle, StreamHandle,
    StreamInfo,
};
use crate::error::BackendError;
use crate::settings::AudioSettings;

const MOCK_SAMPLE_RATE: f32 = 44_100.0;
const MOCK_CHANNELS: u16 = 2;

#[derive(Debug, Clone, Copy)]
struct ClipSpec {
    length_bytes: u64,
}

#[derive(Debug)]
struct MockStream {
    info: StreamInfo,
    position_bytes: f64,
    state: ChannelState,
    looping: bool,
    tempo: bool,
    attached_to: Option<u64>,
    attributes: HashMap<ChannelAttribute, f32>,
}

impl MockStream {
    fn attribute(&self, attribute: ChannelAttribute) -> f32 {
        match self.attributes.get(&attribute) {
            Some(value) => *value,
            None => match attribute {
                ChannelAttribute::Volume => 1.0,
                ChannelAttribute::Frequency => self.info.sample_rate,
                ChannelAttribute::Pan | ChannelAttribute::Pitch => 0.0,
            },
        }
    }
}

#[derive(Debug, Default)]
struct MockMixer {
    mixer_inputs: Vec<u64>,
    volume: f32,
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    clips: HashMap<String, ClipSpec>,
    streams: HashMap<u64, MockStream>,
    mixers: HashMap<u64, MockMixer>,
    device: Option<DeviceInfo>,
    device_started: bool,
    device_gain: f32,
    freed_streams: u64,
    fail_device_open: bool,
    fail_mixer_create: bool,
    fail_mixer_connect: bool,
    fail_device_start: bool,
}

/// In-memory [`AudioBackend`] with a manually advanced clock.
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                device_gain: 1.0,
                ..MockState::default()
            }),
        }
    }

    /// Make `path` openable as a clip of the given duration.
    pub fn register_clip(&self, path: &str, duration: Duration) {
        let length_bytes =
            (duration.as_secs_f64() * f64::from(MOCK_SAMPLE_RATE) * f64::from(MOCK_CHANNELS) * 4.0)
                .round() as u64;
        self.state
            .lock()
            .clips
            .insert(path.to_string(), ClipSpec { length_bytes });
    }

    /// Advance the simulated clock: every playing attached channel moves
    /// forward by `dt`, scaled by its frequency ratio. Channels that reach
    /// the end stop (or wrap when looping).
    pub fn advance(&self, dt: f64) {
        let mut state = self.state.lock();
        for stream in state.streams.values_mut() {
            if stream.state != ChannelState::Playing || stream.attached_to.is_none() {
                continue;
            }

            let speed =
                f64::from(stream.attribute(ChannelAttribute::Frequency)) / f64::from(stream.info.sample_rate);
            stream.position_bytes += dt * stream.info.bytes_per_second() * speed;

            let length = stream.info.length_bytes as f64;
            if length > 0.0 && stream.position_bytes >= length {
                if stream.looping {
                    stream.position_bytes %= length;
                } else {
                    stream.position_bytes = length;
                    stream.state = ChannelState::Stopped;
                }
            }
        }
    }

    // --- Test introspection ---

    pub fn stream_count(&self) -> usize {
        self.state.lock().streams.len()
    }

    pub fn mixer_count(&self) -> usize {
        self.state.lock().mixers.len()
    }

    /// Number of mixer nodes feeding into `mixer`.
    pub fn mixer_input_count(&self, mixer: MixerHandle) -> usize {
        self.state
            .lock()
            .mixers
            .get(&mixer.0)
            .map(|m| m.mixer_inputs.len())
            .unwrap_or(0)
    }

    /// Number of stream channels attached to `mixer`.
    pub fn attached_channel_count(&self, mixer: MixerHandle) -> usize {
        self.state
            .lock()
            .streams
            .values()
            .filter(|s| s.attached_to == Some(mixer.0))
            .count()
    }

    pub fn mixer_volume(&self, mixer: MixerHandle) -> Option<f32> {
        self.state.lock().mixers.get(&mixer.0).map(|m| m.volume)
    }

    pub fn attribute(&self, stream: StreamHandle, attribute: ChannelAttribute) -> Option<f32> {
        self.state
            .lock()
            .streams
            .get(&stream.0)
            .map(|s| s.attribute(attribute))
    }

    pub fn device_open(&self) -> bool {
        self.state.lock().device.is_some()
    }

    pub fn device_started(&self) -> bool {
        self.state.lock().device_started
    }

    pub fn device_gain(&self) -> f32 {
        self.state.lock().device_gain
    }

    pub fn freed_stream_count(&self) -> u64 {
        self.state.lock().freed_streams
    }

    // --- Failure injection ---

    pub fn fail_device_open(&self, fail: bool) {
        self.state.lock().fail_device_open = fail;
    }

    pub fn fail_mixer_create(&self, fail: bool) {
        self.state.lock().fail_mixer_create = fail;
    }

    pub fn fail_mixer_connect(&self, fail: bool) {
        self.state.lock().fail_mixer_connect = fail;
    }

    pub fn fail_device_start(&self, fail: bool) {
        self.state.lock().fail_device_start = fail;
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for MockBackend {
    fn open_decode_stream(&self, path: &Path) -> Result<StreamHandle, BackendError> {
        let mut state = self.state.lock();
        let key = path.to_string_lossy().to_string();
        let clip = state
            .clips
            .get(&key)
            .copied()
            .ok_or_else(|| BackendError::StreamOpenFailed {
                path: key.clone(),
                source: None,
            })?;

        state.next_id += 1;
        let id = state.next_id;
        state.streams.insert(
            id,
            MockStream {
                info: StreamInfo {
                    sample_rate: MOCK_SAMPLE_RATE,
                    channels: MOCK_CHANNELS,
                    length_bytes: clip.length_bytes,
                },
                position_bytes: 0.0,
                state: ChannelState::Paused,
                looping: false,
                tempo: false,
                attached_to: None,
                attributes: HashMap::new(),
            },
        );
        Ok(StreamHandle(id))
    }

    fn stream_info(&self, stream: StreamHandle) -> Result<StreamInfo, BackendError> {
        self.state
            .lock()
            .streams
            .get(&stream.0)
            .map(|s| s.info)
            .ok_or(BackendError::InvalidHandle)
    }

    fn wrap_with_tempo(&self, stream: StreamHandle) -> Result<StreamHandle, BackendError> {
        let mut state = self.state.lock();
        let entry = state
            .streams
            .get_mut(&stream.0)
            .ok_or(BackendError::InvalidHandle)?;
        entry.tempo = true;
        Ok(stream)
    }

    fn set_stream_looping(&self, stream: StreamHandle, looping: bool) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let entry = state
            .streams
            .get_mut(&stream.0)
            .ok_or(BackendError::InvalidHandle)?;
        entry.looping = looping;
        Ok(())
    }

    fn free_stream(&self, stream: StreamHandle) {
        let mut state = self.state.lock();
        if state.streams.remove(&stream.0).is_some() {
            state.freed_streams += 1;
        }
    }

    fn create_mixer(&self, _sample_rate: u32, _channels: u16) -> Result<MixerHandle, BackendError> {
        let mut state = self.state.lock();
        if state.fail_mixer_create {
            return Err(BackendError::MixerFailed("injected create failure".to_string()));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.mixers.insert(
            id,
            MockMixer {
                mixer_inputs: Vec::new(),
                volume: 1.0,
            },
        );
        Ok(MixerHandle(id))
    }

    fn connect_mixer(&self, dst: MixerHandle, src: MixerHandle) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if state.fail_mixer_connect {
            return Err(BackendError::MixerFailed("injected connect failure".to_string()));
        }
        if !state.mixers.contains_key(&src.0) {
            return Err(BackendError::InvalidHandle);
        }
        let mixer = state
            .mixers
            .get_mut(&dst.0)
            .ok_or(BackendError::InvalidHandle)?;
        mixer.mixer_inputs.push(src.0);
        Ok(())
    }

    fn set_mixer_volume(&self, mixer: MixerHandle, volume: f32) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let entry = state
            .mixers
            .get_mut(&mixer.0)
            .ok_or(BackendError::InvalidHandle)?;
        entry.volume = volume;
        Ok(())
    }

    fn free_mixer(&self, mixer: MixerHandle) {
        self.state.lock().mixers.remove(&mixer.0);
    }

    fn attach_channel(&self, mixer: MixerHandle, stream: StreamHandle) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if !state.mixers.contains_key(&mixer.0) {
            return Err(BackendError::InvalidHandle);
        }
        let entry = state
            .streams
            .get_mut(&stream.0)
            .ok_or(BackendError::InvalidHandle)?;
        entry.attached_to = Some(mixer.0);
        entry.state = ChannelState::Paused;
        Ok(())
    }

    fn detach_channel(&self, mixer: MixerHandle, stream: StreamHandle) {
        let mut state = self.state.lock();
        if let Some(entry) = state.streams.get_mut(&stream.0) {
            if entry.attached_to == Some(mixer.0) {
                entry.attached_to = None;
                entry.state = ChannelState::Stopped;
            }
        }
    }

    fn set_channel_attribute(
        &self,
        stream: StreamHandle,
        attribute: ChannelAttribute,
        value: f32,
    ) -> Result<(), BackendError> {
        if !value.is_finite() {
            return Err(BackendError::NonFiniteValue);
        }
        let mut state = self.state.lock();
        let entry = state
            .streams
            .get_mut(&stream.0)
            .ok_or(BackendError::InvalidHandle)?;
        entry.attributes.insert(attribute, value);
        Ok(())
    }

    fn get_channel_attribute(
        &self,
        stream: StreamHandle,
        attribute: ChannelAttribute,
    ) -> Result<f32, BackendError> {
        self.state
            .lock()
            .streams
            .get(&stream.0)
            .map(|s| s.attribute(attribute))
            .ok_or(BackendError::InvalidHandle)
    }

    fn play_channel(&self, stream: StreamHandle) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let entry = state
            .streams
            .get_mut(&stream.0)
            .ok_or(BackendError::InvalidHandle)?;
        if entry.attached_to.is_none() {
            return Err(BackendError::InvalidHandle);
        }
        entry.state = ChannelState::Playing;
        Ok(())
    }

    fn pause_channel(&self, stream: StreamHandle) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let entry = state
            .streams
            .get_mut(&stream.0)
            .ok_or(BackendError::InvalidHandle)?;
        entry.state = ChannelState::Paused;
        Ok(())
    }

    fn channel_state(&self, stream: StreamHandle) -> ChannelState {
        self.state
            .lock()
            .streams
            .get(&stream.0)
            .map(|s| s.state)
            .unwrap_or(ChannelState::Stopped)
    }

    fn channel_position_bytes(&self, stream: StreamHandle) -> Result<u64, BackendError> {
        self.state
            .lock()
            .streams
            .get(&stream.0)
            .map(|s| s.position_bytes as u64)
            .ok_or(BackendError::InvalidHandle)
    }

    fn set_channel_position_bytes(
        &self,
        stream: StreamHandle,
        bytes: u64,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let entry = state
            .streams
            .get_mut(&stream.0)
            .ok_or(BackendError::InvalidHandle)?;
        entry.position_bytes = (bytes.min(entry.info.length_bytes)) as f64;
        Ok(())
    }

    fn seconds_to_bytes(&self, stream: StreamHandle, seconds: f64) -> u64 {
        let bps = self
            .state
            .lock()
            .streams
            .get(&stream.0)
            .map(|s| s.info.bytes_per_second())
            .unwrap_or(0.0);
        (seconds.max(0.0) * bps).round() as u64
    }

    fn bytes_to_seconds(&self, stream: StreamHandle, bytes: u64) -> f64 {
        let bps = self
            .state
            .lock()
            .streams
            .get(&stream.0)
            .map(|s| s.info.bytes_per_second())
            .unwrap_or(0.0);
        if bps > 0.0 {
            bytes as f64 / bps
        } else {
            0.0
        }
    }

    fn enumerate_output_devices(&self) -> Vec<String> {
        vec!["mock output".to_string()]
    }

    fn open_device(&self, settings: &AudioSettings) -> Result<DeviceInfo, BackendError> {
        let mut state = self.state.lock();
        if state.fail_device_open {
            return Err(BackendError::DeviceOpenFailed("injected open failure".to_string()));
        }
        let info = DeviceInfo {
            name: "mock output".to_string(),
            sample_rate: settings.sample_rate,
            channels: MOCK_CHANNELS,
        };
        state.device = Some(info.clone());
        Ok(info)
    }

    fn start_device(&self, _output_mixer: MixerHandle) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if state.fail_device_start {
            return Err(BackendError::DeviceStartFailed("injected start failure".to_string()));
        }
        if state.device.is_none() {
            return Err(BackendError::NoDevice);
        }
        state.device_started = true;
        Ok(())
    }

    fn stop_device(&self) {
        self.state.lock().device_started = false;
    }

    fn close_device(&self) {
        let mut state = self.state.lock();
        state.device_started = false;
        state.device = None;
    }

    fn set_device_gain(&self, gain: f32) {
        self.state.lock().device_gain = gain;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_attached(backend: &MockBackend) -> (StreamHandle, MixerHandle) {
        backend.register_clip("clip.ogg", Duration::from_secs(10));
        let stream = backend.open_decode_stream(Path::new("clip.ogg")).unwrap();
        let mixer = backend.create_mixer(44_100, 2).unwrap();
        backend.attach_channel(mixer, stream).unwrap();
        (stream, mixer)
    }

    #[test]
    fn test_unregistered_clip_fails_to_open() {
        let backend = MockBackend::new();
        assert!(backend.open_decode_stream(Path::new("nope.ogg")).is_err());
    }

    #[test]
    fn test_advance_moves_playing_channels_only() {
        let backend = MockBackend::new();
        let (stream, _mixer) = open_attached(&backend);

        backend.advance(1.0);
        assert_eq!(backend.channel_position_bytes(stream).unwrap(), 0);

        backend.play_channel(stream).unwrap();
        backend.advance(1.0);
        let info = backend.stream_info(stream).unwrap();
        assert_eq!(
            backend.channel_position_bytes(stream).unwrap(),
            info.bytes_per_second() as u64
        );
    }

    #[test]
    fn test_channel_stops_at_end() {
        let backend = MockBackend::new();
        let (stream, _mixer) = open_attached(&backend);
        backend.play_channel(stream).unwrap();

        backend.advance(11.0);
        assert_eq!(backend.channel_state(stream), ChannelState::Stopped);
    }

    #[test]
    fn test_looping_channel_wraps() {
        let backend = MockBackend::new();
        let (stream, _mixer) = open_attached(&backend);
        backend.set_stream_looping(stream, true).unwrap();
        backend.play_channel(stream).unwrap();

        backend.advance(11.0);
        assert_eq!(backend.channel_state(stream), ChannelState::Playing);
        let position = backend.bytes_to_seconds(stream, backend.channel_position_bytes(stream).unwrap());
        assert!((position - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_frequency_scales_advance() {
        let backend = MockBackend::new();
        let (stream, _mixer) = open_attached(&backend);
        backend.play_channel(stream).unwrap();
        backend
            .set_channel_attribute(stream, ChannelAttribute::Frequency, 88_200.0)
            .unwrap();

        backend.advance(1.0);
        let position = backend.bytes_to_seconds(stream, backend.channel_position_bytes(stream).unwrap());
        assert!((position - 2.0).abs() < 0.01);
    }

    #[test]
    fn test_non_finite_attribute_rejected() {
        let backend = MockBackend::new();
        let (stream, _mixer) = open_attached(&backend);
        assert!(backend
            .set_channel_attribute(stream, ChannelAttribute::Volume, f32::NAN)
            .is_err());
    }
}
