/// Individual playback voice
///
/// One live instance of an [`Audio`](crate::Audio) asset: a decode+tempo
/// chain attached to the mixer graph, plus the fade-ramp state machine.
/// Handles are cheap clones of shared state; the owning asset keeps one and
/// prunes the voice once it is neither playing nor ramping.
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::{AudioBackend, ChannelAttribute, ChannelState, MixerHandle, StreamHandle};
use crate::error::AudioResult;

/// Below this distance from the target a ramp counts as finished.
const FADE_THRESHOLD: f32 = 0.001;

/// Perceptual loudness curve exponent. Low exponent: small linear changes
/// near silence produce large perceived-loudness changes.
const VOLUME_CURVE_EXPONENT: f32 = 0.2;

const SPEED_MIN: f32 = 0.1;
const SPEED_MAX: f32 = 10.0;

struct InstanceState {
    backend: Arc<dyn AudioBackend>,
    mixer: MixerHandle,
    /// `None` once disposed; the handle is valid exactly while `Some`.
    handle: Option<StreamHandle>,
    base_frequency: f32,
    stream_length_bytes: u64,
    /// Linear base volume, clamped >= 0 before the gain curve.
    volume: f32,
    fade_volume: f32,
    fade_target: f32,
    fade_rate: f32,
    stop_after_fade: bool,
    disposed: bool,
}

/// Handle to one playback voice.
///
/// Every operation on a disposed instance is an advisory no-op rather than
/// an error, so a stale handle held by a caller can never conflict with the
/// automatic pruning inside [`Audio::update`](crate::Audio::update).
#[derive(Clone)]
pub struct AudioInstance {
    state: Arc<Mutex<InstanceState>>,
}

/// Non-owning reference used by the stop scheduler; upgrading fails once
/// the owning asset has dropped the voice.
#[derive(Clone)]
pub(crate) struct WeakAudioInstance {
    state: Weak<Mutex<InstanceState>>,
}

impl WeakAudioInstance {
    pub(crate) fn upgrade(&self) -> Option<AudioInstance> {
        self.state.upgrade().map(|state| AudioInstance { state })
    }
}

impl AudioInstance {
    /// Open the decode chain for `path`, wrap it with tempo control and
    /// attach it to `mixer`, initially paused. Partial failures free
    /// whatever was created.
    pub(crate) fn new(
        backend: Arc<dyn AudioBackend>,
        mixer: MixerHandle,
        path: &Path,
        base_frequency: f32,
        stream_length_bytes: u64,
        looping: bool,
    ) -> AudioResult<Self> {
        let stream = backend.open_decode_stream(path)?;

        let handle = match backend.wrap_with_tempo(stream) {
            Ok(handle) => handle,
            Err(err) => {
                backend.free_stream(stream);
                return Err(err.into());
            }
        };

        if looping {
            if let Err(err) = backend.set_stream_looping(handle, true) {
                tracing::warn!("Failed to enable looping: {err}");
            }
        }

        if let Err(err) = backend.attach_channel(mixer, handle) {
            backend.free_stream(handle);
            return Err(err.into());
        }

        tracing::debug!(handle = handle.raw(), "Voice attached to mixer");

        Ok(Self {
            state: Arc::new(Mutex::new(InstanceState {
                backend,
                mixer,
                handle: Some(handle),
                base_frequency,
                stream_length_bytes,
                volume: 1.0,
                fade_volume: 1.0,
                fade_target: 1.0,
                fade_rate: 0.0,
                stop_after_fade: false,
                disposed: false,
            })),
        })
    }

    pub(crate) fn downgrade(&self) -> WeakAudioInstance {
        WeakAudioInstance {
            state: Arc::downgrade(&self.state),
        }
    }

    pub(crate) fn ptr_eq(&self, other: &AudioInstance) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Start playback from the beginning of the stream.
    pub fn play(&self) {
        let state = self.state.lock();
        let handle = match state.valid_handle() {
            Some(handle) => handle,
            None => return,
        };

        // Rewind before starting; replay of a finished voice restarts it.
        if let Err(err) = state.backend.set_channel_position_bytes(handle, 0) {
            tracing::warn!("Failed to rewind channel: {err}");
        }

        match state.backend.play_channel(handle) {
            Ok(()) => tracing::debug!(handle = handle.raw(), "Playback started"),
            Err(err) => tracing::warn!("Failed to start playback: {err}"),
        }
    }

    /// Stop playback. Without a fade the channel is paused synchronously;
    /// with one this delegates to [`fade_out`](Self::fade_out).
    pub fn stop(&self, fade_out: Option<Duration>) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        match fade_out {
            Some(duration) => state.begin_fade_out(duration),
            None => state.stop_now(),
        }
    }

    /// Pause without resetting the position.
    pub fn pause(&self) {
        let state = self.state.lock();
        if let Some(handle) = state.valid_handle() {
            if let Err(err) = state.backend.pause_channel(handle) {
                tracing::warn!("Failed to pause channel: {err}");
            }
        }
    }

    /// Resume from the paused position.
    pub fn resume(&self) {
        let state = self.state.lock();
        if let Some(handle) = state.valid_handle() {
            if let Err(err) = state.backend.play_channel(handle) {
                tracing::warn!("Failed to resume channel: {err}");
            }
        }
    }

    /// Ramp from silence up to `target_volume` over `duration`. No-op when
    /// the duration is zero.
    pub fn fade_in(&self, duration: Duration, target_volume: f32) {
        let seconds = duration.as_secs_f32();
        if seconds <= 0.0 {
            return;
        }

        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        state.fade_volume = 0.0;
        state.fade_target = target_volume.clamp(0.0, 1.0);
        state.fade_rate = state.fade_target / seconds;
        state.stop_after_fade = false;
    }

    /// Ramp down to silence over `duration`, then stop. A zero duration
    /// stops immediately instead.
    pub fn fade_out(&self, duration: Duration) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        state.begin_fade_out(duration);
    }

    /// Ramp to `target_volume` over `duration` without stopping afterwards.
    /// A zero duration jumps straight to the target.
    pub fn fade_to(&self, target_volume: f32, duration: Duration) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }

        let target = target_volume.clamp(0.0, 1.0);
        let seconds = duration.as_secs_f32();
        if seconds <= 0.0 {
            state.fade_volume = target;
            state.fade_target = target;
            state.apply_volume();
            return;
        }

        state.fade_rate = (target - state.fade_volume).abs() / seconds;
        state.fade_target = target;
        state.stop_after_fade = false;
    }

    /// Per-frame tick: advance the fade ramp and apply the resulting gain.
    pub fn update(&self, dt: f32) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        state.process_fade(dt);
    }

    /// Linear base volume (the seed value, not the ramped gain).
    pub fn volume(&self) -> f32 {
        self.state.lock().volume
    }

    /// Set the linear base volume and re-apply the gain curve immediately.
    /// An active ramp keeps modulating on top of this value.
    pub fn set_volume(&self, volume: f32) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        state.volume = volume.max(0.0);
        state.apply_volume();
    }

    /// Stereo pan, -1.0..=1.0.
    pub fn pan(&self) -> f32 {
        self.state.lock().get_attribute(ChannelAttribute::Pan)
    }

    pub fn set_pan(&self, pan: f32) {
        self.state
            .lock()
            .set_attribute(ChannelAttribute::Pan, pan.clamp(-1.0, 1.0));
    }

    /// Pitch shift in semitones.
    pub fn pitch(&self) -> f32 {
        self.state.lock().get_attribute(ChannelAttribute::Pitch)
    }

    pub fn set_pitch(&self, pitch: f32) {
        self.state.lock().set_attribute(ChannelAttribute::Pitch, pitch);
    }

    /// Playback speed as a ratio of the channel frequency to the stream's
    /// native frequency. Falls back to the neutral 1.0 when the channel
    /// cannot be read.
    pub fn speed(&self) -> f32 {
        let state = self.state.lock();
        let handle = match state.valid_handle() {
            Some(handle) => handle,
            None => return 1.0,
        };
        if state.base_frequency <= 0.0 {
            return 1.0;
        }
        match state.backend.get_channel_attribute(handle, ChannelAttribute::Frequency) {
            Ok(frequency) => frequency / state.base_frequency,
            Err(err) => {
                tracing::warn!("Failed to read channel frequency: {err}");
                1.0
            }
        }
    }

    /// Set the playback speed, clamped to 0.1..=10.0.
    pub fn set_speed(&self, speed: f32) {
        let mut state = self.state.lock();
        let frequency = state.base_frequency * speed.clamp(SPEED_MIN, SPEED_MAX);
        state.set_attribute(ChannelAttribute::Frequency, frequency);
    }

    /// Playback position in seconds.
    pub fn position(&self) -> f64 {
        let state = self.state.lock();
        let handle = match state.valid_handle() {
            Some(handle) => handle,
            None => return 0.0,
        };
        match state.backend.channel_position_bytes(handle) {
            Ok(bytes) => state.backend.bytes_to_seconds(handle, bytes),
            Err(err) => {
                tracing::warn!("Failed to read channel position: {err}");
                0.0
            }
        }
    }

    /// Seek to `seconds` (negative values clamp to the start).
    pub fn set_position(&self, seconds: f64) {
        let state = self.state.lock();
        let handle = match state.valid_handle() {
            Some(handle) => handle,
            None => return,
        };
        let bytes = state.backend.seconds_to_bytes(handle, seconds.max(0.0));
        if let Err(err) = state.backend.set_channel_position_bytes(handle, bytes) {
            tracing::warn!("Failed to seek channel: {err}");
        }
    }

    /// Seek back to `seconds`, resuming playback when the channel had run
    /// off the end of the stream. Loop windows that extend to the stream
    /// end rely on this: the channel stops there and a plain seek would
    /// leave it stopped.
    pub(crate) fn wrap_to(&self, seconds: f64) {
        let state = self.state.lock();
        let handle = match state.valid_handle() {
            Some(handle) => handle,
            None => return,
        };
        let ended = state.backend.channel_state(handle) == ChannelState::Stopped;

        let bytes = state.backend.seconds_to_bytes(handle, seconds.max(0.0));
        if let Err(err) = state.backend.set_channel_position_bytes(handle, bytes) {
            tracing::warn!("Failed to seek channel: {err}");
            return;
        }
        if ended {
            if let Err(err) = state.backend.play_channel(handle) {
                tracing::warn!("Failed to resume channel: {err}");
            }
        }
    }

    pub fn is_playing(&self) -> bool {
        let state = self.state.lock();
        match state.valid_handle() {
            Some(handle) => state.backend.channel_state(handle) == ChannelState::Playing,
            None => false,
        }
    }

    /// True while the fade ramp has not yet reached its target.
    pub fn is_fading(&self) -> bool {
        self.state.lock().is_fading()
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// Current ramp value, 0.0..=1.0.
    pub fn fade_volume(&self) -> f32 {
        self.state.lock().fade_volume
    }

    /// Channel handle, for diagnostics. `None` once disposed.
    pub fn channel_handle(&self) -> Option<StreamHandle> {
        self.state.lock().handle
    }

    /// One-line status string for debugging.
    pub fn detailed_status(&self) -> String {
        let state = self.state.lock();
        if state.disposed {
            return "Disposed".to_string();
        }
        let handle = match state.handle {
            Some(handle) => handle,
            None => return "Invalid Handle".to_string(),
        };
        let channel_state = state.backend.channel_state(handle);
        let position = state.backend.channel_position_bytes(handle).unwrap_or(0);
        format!(
            "Handle:{}, State:{:?}, Pos:{}/{}, Fade:{:.3}->{:.3}",
            handle.raw(),
            channel_state,
            position,
            state.stream_length_bytes,
            state.fade_volume,
            state.fade_target,
        )
    }

    /// Detach the channel from the mixer and free the decode chain.
    /// Idempotent; the instance is permanently unusable afterwards.
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        state.release_stream();
        state.disposed = true;
        tracing::debug!("Voice disposed");
    }
}

impl Drop for InstanceState {
    fn drop(&mut self) {
        self.release_stream();
    }
}

impl InstanceState {
    fn valid_handle(&self) -> Option<StreamHandle> {
        if self.disposed {
            None
        } else {
            self.handle
        }
    }

    fn is_fading(&self) -> bool {
        (self.fade_volume - self.fade_target).abs() > FADE_THRESHOLD
    }

    fn begin_fade_out(&mut self, duration: Duration) {
        let seconds = duration.as_secs_f32();
        if seconds <= 0.0 {
            self.stop_now();
            return;
        }
        self.fade_target = 0.0;
        self.fade_rate = self.fade_volume / seconds;
        self.stop_after_fade = true;
    }

    fn stop_now(&mut self) {
        if let Some(handle) = self.valid_handle() {
            if let Err(err) = self.backend.pause_channel(handle) {
                tracing::warn!("Failed to stop channel: {err}");
            }
        }
    }

    /// Step the ramp toward the target, clamped so it never crosses it.
    fn process_fade(&mut self, dt: f32) {
        if !self.is_fading() {
            return;
        }

        let step = self.fade_rate * dt;
        self.fade_volume = if self.fade_volume < self.fade_target {
            (self.fade_volume + step).min(self.fade_target)
        } else {
            (self.fade_volume - step).max(self.fade_target)
        };

        self.apply_volume();

        if !self.is_fading() && self.stop_after_fade {
            self.stop_now();
        }
    }

    /// Apply perceptual gain `(volume * fade)^0.2` to the channel.
    fn apply_volume(&mut self) {
        let gain = (self.volume * self.fade_volume).powf(VOLUME_CURVE_EXPONENT);
        self.set_attribute(ChannelAttribute::Volume, gain);
    }

    /// Attribute failures are logged and ignored; playback continues.
    fn set_attribute(&mut self, attribute: ChannelAttribute, value: f32) {
        let handle = match self.valid_handle() {
            Some(handle) => handle,
            None => return,
        };
        if !value.is_finite() {
            tracing::warn!(?attribute, value, "Ignoring non-finite attribute value");
            return;
        }
        if let Err(err) = self.backend.set_channel_attribute(handle, attribute, value) {
            tracing::warn!(?attribute, value, "Attribute set failed: {err}");
        }
    }

    /// Safety net for voices dropped without `dispose`; frees the decode
    /// chain so a leaked handle never leaks a backend stream.
    fn release_stream(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.backend.detach_channel(self.mixer, handle);
            self.backend.free_stream(handle);
        }
    }

    fn get_attribute(&self, attribute: ChannelAttribute) -> f32 {
        let handle = match self.valid_handle() {
            Some(handle) => handle,
            None => return 0.0,
        };
        match self.backend.get_channel_attribute(handle, attribute) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(?attribute, "Attribute get failed: {err}");
                0.0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;

    fn make_instance(backend: &Arc<MockBackend>) -> AudioInstance {
        backend.register_clip("clip.ogg", Duration::from_secs(10));
        let mixer = backend.create_mixer(44_100, 2).unwrap();
        AudioInstance::new(
            backend.clone() as Arc<dyn AudioBackend>,
            mixer,
            Path::new("clip.ogg"),
            44_100.0,
            3_528_000,
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_starts_paused_and_plays_from_zero() {
        let backend = Arc::new(MockBackend::new());
        let instance = make_instance(&backend);

        assert!(!instance.is_playing());

        backend.advance(1.0); // paused channels must not move
        instance.play();
        assert!(instance.is_playing());
        assert_eq!(instance.position(), 0.0);
    }

    #[test]
    fn test_play_resets_position() {
        let backend = Arc::new(MockBackend::new());
        let instance = make_instance(&backend);

        instance.play();
        backend.advance(3.0);
        assert!(instance.position() > 2.9);

        instance.play();
        assert_eq!(instance.position(), 0.0);
        assert!(instance.is_playing());
    }

    #[test]
    fn test_stop_without_fade_is_synchronous() {
        let backend = Arc::new(MockBackend::new());
        let instance = make_instance(&backend);

        instance.play();
        instance.stop(None);
        assert!(!instance.is_playing());
    }

    #[test]
    fn test_fade_never_overshoots() {
        let backend = Arc::new(MockBackend::new());
        let instance = make_instance(&backend);
        instance.play();
        instance.fade_in(Duration::from_secs(1), 1.0);

        let mut previous_gap = (instance.fade_volume() - 1.0f32).abs();
        for _ in 0..30 {
            instance.update(0.1);
            let gap = (instance.fade_volume() - 1.0f32).abs();
            assert!(gap <= previous_gap + f32::EPSILON);
            assert!(instance.fade_volume() <= 1.0);
            previous_gap = gap;
        }
        assert_eq!(instance.fade_volume(), 1.0);
        assert!(!instance.is_fading());
    }

    #[test]
    fn test_fade_out_stops_after_ramp() {
        let backend = Arc::new(MockBackend::new());
        let instance = make_instance(&backend);
        instance.play();
        instance.fade_out(Duration::from_secs(1));
        assert!(instance.is_fading());

        for _ in 0..11 {
            instance.update(0.1);
        }
        assert!(!instance.is_fading());
        assert!(!instance.is_playing());
        assert_eq!(instance.fade_volume(), 0.0);
    }

    #[test]
    fn test_zero_duration_fade_out_stops_immediately() {
        let backend = Arc::new(MockBackend::new());
        let instance = make_instance(&backend);
        instance.play();
        instance.fade_out(Duration::ZERO);
        assert!(!instance.is_playing());
        assert!(!instance.is_fading());
    }

    #[test]
    fn test_fade_to_jumps_on_zero_duration() {
        let backend = Arc::new(MockBackend::new());
        let instance = make_instance(&backend);
        instance.play();

        instance.fade_to(0.5, Duration::ZERO);
        assert_eq!(instance.fade_volume(), 0.5);
        assert!(!instance.is_fading());

        // Ramp target modulates on top of the base volume.
        let handle = instance.channel_handle().unwrap();
        let gain = backend.attribute(handle, ChannelAttribute::Volume).unwrap();
        assert!((gain - 0.5f32.powf(0.2)).abs() < 1e-6);
    }

    #[test]
    fn test_gain_formula_endpoints() {
        let backend = Arc::new(MockBackend::new());
        let instance = make_instance(&backend);
        instance.play();
        let handle = instance.channel_handle().unwrap();

        instance.set_volume(1.0);
        assert_eq!(backend.attribute(handle, ChannelAttribute::Volume), Some(1.0));

        instance.set_volume(0.0);
        assert_eq!(backend.attribute(handle, ChannelAttribute::Volume), Some(0.0));
    }

    #[test]
    fn test_negative_volume_clamped() {
        let backend = Arc::new(MockBackend::new());
        let instance = make_instance(&backend);
        instance.set_volume(-2.0);
        assert_eq!(instance.volume(), 0.0);
    }

    #[test]
    fn test_speed_is_frequency_ratio() {
        let backend = Arc::new(MockBackend::new());
        let instance = make_instance(&backend);

        assert_eq!(instance.speed(), 1.0);

        instance.set_speed(2.0);
        assert!((instance.speed() - 2.0).abs() < 1e-6);

        instance.set_speed(100.0); // clamped to 10.0
        assert!((instance.speed() - 10.0).abs() < 1e-6);

        instance.set_speed(0.0); // clamped to 0.1
        assert!((instance.speed() - 0.1).abs() < 1e-4);
    }

    #[test]
    fn test_pan_clamped() {
        let backend = Arc::new(MockBackend::new());
        let instance = make_instance(&backend);
        instance.set_pan(3.0);
        assert_eq!(instance.pan(), 1.0);
        instance.set_pan(-3.0);
        assert_eq!(instance.pan(), -1.0);
    }

    #[test]
    fn test_dispose_is_idempotent_and_frees_stream() {
        let backend = Arc::new(MockBackend::new());
        let instance = make_instance(&backend);
        assert_eq!(backend.stream_count(), 1);

        instance.dispose();
        instance.dispose();
        assert!(instance.is_disposed());
        assert_eq!(backend.stream_count(), 0);
        assert_eq!(backend.freed_stream_count(), 1);
    }

    #[test]
    fn test_dropped_voice_frees_its_stream() {
        let backend = Arc::new(MockBackend::new());
        let instance = make_instance(&backend);
        instance.play();
        assert_eq!(backend.stream_count(), 1);

        // Dropping the last handle without dispose must still free the
        // decode chain.
        drop(instance);
        assert_eq!(backend.stream_count(), 0);
        assert_eq!(backend.freed_stream_count(), 1);
    }

    #[test]
    fn test_speed_neutral_when_channel_unreadable() {
        let backend = Arc::new(MockBackend::new());
        let instance = make_instance(&backend);
        instance.set_speed(2.0);

        // Free the stream behind the voice's back; the read fails and the
        // getter reports the neutral ratio, never a value outside the
        // speed range.
        backend.free_stream(instance.channel_handle().unwrap());
        assert_eq!(instance.speed(), 1.0);
    }

    #[test]
    fn test_disposed_instance_is_advisory_noop() {
        let backend = Arc::new(MockBackend::new());
        let instance = make_instance(&backend);
        instance.dispose();

        // None of these may panic or error.
        instance.play();
        instance.stop(None);
        instance.pause();
        instance.resume();
        instance.fade_in(Duration::from_secs(1), 1.0);
        instance.set_volume(0.5);
        instance.set_position(1.0);
        instance.update(0.1);

        assert!(!instance.is_playing());
        assert_eq!(instance.position(), 0.0);
        assert_eq!(instance.detailed_status(), "Disposed");
    }
}
