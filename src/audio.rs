/// Logical sound asset
///
/// One sound file with a dynamic set of concurrently playing voices.
/// Aggregate controls seed new voices and mutate live ones; the per-frame
/// update advances each voice's ramp, prunes finished ones and applies the
/// section-loop policy.
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{AudioError, AudioResult};
use crate::instance::AudioInstance;
use crate::manager::AudioManager;

struct AudioState {
    manager: AudioManager,
    file_path: String,
    looping: bool,
    loop_begin: Option<Duration>,
    loop_end: Option<Duration>,
    base_frequency: f32,
    stream_length_bytes: u64,
    duration_seconds: f64,
    instances: Vec<AudioInstance>,
    initial_volume: f32,
    initial_pan: f32,
    initial_pitch: f32,
    initial_speed: f32,
    disposed: bool,
}

/// Handle to a logical sound asset registered with an [`AudioManager`].
///
/// Unlike [`AudioInstance`], playing a disposed asset is an error
/// ([`AudioError::Disposed`]), not a no-op.
#[derive(Clone)]
pub struct Audio {
    state: Arc<Mutex<AudioState>>,
}

impl Audio {
    /// Load metadata for `path` and register the asset with `manager`.
    ///
    /// Fails if the manager is not running or the file cannot be opened by
    /// the decode backend; the caller decides whether to retry or skip.
    pub fn new(manager: &AudioManager, path: impl AsRef<Path>, looping: bool) -> AudioResult<Self> {
        Self::new_inner(manager, path.as_ref(), looping, None, None)
    }

    /// Like [`new`](Self::new) with a section-loop window: whenever a
    /// voice's position reaches `loop_end`, the next update seeks it back
    /// to `loop_begin`.
    pub fn with_section_loop(
        manager: &AudioManager,
        path: impl AsRef<Path>,
        loop_begin: Duration,
        loop_end: Duration,
    ) -> AudioResult<Self> {
        Self::new_inner(manager, path.as_ref(), true, Some(loop_begin), Some(loop_end))
    }

    fn new_inner(
        manager: &AudioManager,
        path: &Path,
        looping: bool,
        loop_begin: Option<Duration>,
        loop_end: Option<Duration>,
    ) -> AudioResult<Self> {
        if !manager.is_running() {
            return Err(AudioError::NotRunning);
        }

        let backend = manager.backend();
        let file_path = path.to_string_lossy().to_string();

        // Metadata probe: base frequency, stream length and duration are
        // captured once here and reused for every voice.
        let probe = backend
            .open_decode_stream(path)
            .map_err(|source| AudioError::LoadFailed {
                path: file_path.clone(),
                source,
            })?;
        let info = match backend.stream_info(probe) {
            Ok(info) => info,
            Err(source) => {
                backend.free_stream(probe);
                return Err(AudioError::LoadFailed {
                    path: file_path,
                    source,
                });
            }
        };
        backend.free_stream(probe);

        tracing::info!(
            path = %file_path,
            sample_rate = info.sample_rate,
            duration = info.duration_seconds(),
            "Audio asset loaded"
        );

        let audio = Self {
            state: Arc::new(Mutex::new(AudioState {
                manager: manager.clone(),
                file_path,
                looping,
                loop_begin,
                loop_end,
                base_frequency: info.sample_rate,
                stream_length_bytes: info.length_bytes,
                duration_seconds: info.duration_seconds(),
                instances: Vec::new(),
                initial_volume: 1.0,
                initial_pan: 0.0,
                initial_pitch: 0.0,
                initial_speed: 1.0,
                disposed: false,
            })),
        };
        manager.register(&audio);
        Ok(audio)
    }

    pub(crate) fn ptr_eq(&self, other: &Audio) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Start a new voice seeded with the asset's aggregate parameters.
    /// Existing voices keep playing; overlap is expected.
    pub fn play(
        &self,
        fade_in: Option<Duration>,
        start_position: Option<Duration>,
    ) -> AudioResult<AudioInstance> {
        let mut state = self.state.lock();
        if state.disposed {
            return Err(AudioError::Disposed);
        }

        let manager = state.manager.clone();
        let mixer = manager.mixer().ok_or(AudioError::NotRunning)?;
        let instance = AudioInstance::new(
            manager.backend(),
            mixer,
            Path::new(&state.file_path),
            state.base_frequency,
            state.stream_length_bytes,
            // A section-loop window drives its own seek policy in update();
            // whole-stream looping is the backend's job only without one.
            state.looping && state.loop_begin.is_none(),
        )?;

        instance.set_pan(state.initial_pan);
        instance.set_pitch(state.initial_pitch);
        instance.set_volume(state.initial_volume);
        instance.set_speed(state.initial_speed);
        state.instances.push(instance.clone());
        drop(state);

        instance.play();

        if let Some(position) = start_position {
            instance.set_position(position.as_secs_f64());
        }
        if let Some(duration) = fade_in {
            instance.fade_in(duration, 1.0);
        }

        Ok(instance)
    }

    /// Stop (immediately or faded) every existing voice, then start one.
    pub fn play_once(
        &self,
        fade_in: Option<Duration>,
        start_position: Option<Duration>,
        fade_out: Option<Duration>,
    ) -> AudioResult<AudioInstance> {
        if self.state.lock().disposed {
            return Err(AudioError::Disposed);
        }
        self.stop(fade_out);
        self.play(fade_in, start_position)
    }

    /// Play, then stop automatically after `duration` (the stop is issued
    /// `fade_out` early so the ramp finishes on time). The deferred stop is
    /// cancelled by disposal and unordered against manual stops.
    pub fn play_with_duration(
        &self,
        duration: Duration,
        fade_in: Option<Duration>,
        fade_out: Option<Duration>,
    ) -> AudioResult<AudioInstance> {
        let instance = self.play(fade_in, None)?;

        let delay = duration.saturating_sub(fade_out.unwrap_or_default());
        match self.state.lock().manager.scheduler() {
            Some(scheduler) => scheduler.schedule_stop(&instance, delay, fade_out),
            None => tracing::warn!("No stop scheduler running; deferred stop dropped"),
        }
        Ok(instance)
    }

    /// Stop every voice: without a fade they are stopped and disposed
    /// synchronously; with one, each starts its fade-out and is disposed by
    /// [`update`](Self::update) once the ramp completes.
    pub fn stop(&self, fade_out: Option<Duration>) {
        let mut state = self.state.lock();
        match fade_out {
            Some(duration) => {
                for instance in &state.instances {
                    instance.fade_out(duration);
                }
            }
            None => {
                for instance in state.instances.drain(..) {
                    instance.stop(None);
                    instance.dispose();
                }
            }
        }
    }

    /// [`stop`](Self::stop) scoped to one voice; no-op when the voice does
    /// not belong to this asset.
    pub fn stop_instance(&self, instance: &AudioInstance, fade_out: Option<Duration>) {
        let state = self.state.lock();
        if !state.instances.iter().any(|i| i.ptr_eq(instance)) {
            return;
        }
        match fade_out {
            Some(duration) => instance.fade_out(duration),
            None => instance.stop(None),
        }
    }

    /// Per-frame tick: update each voice, prune finished ones (iterating in
    /// reverse so removal never skips an element) and apply section
    /// looping.
    pub fn update(&self, dt: f32) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }

        let section = match (state.looping, state.loop_begin, state.loop_end) {
            (true, Some(begin), Some(end)) => Some((begin.as_secs_f64(), end.as_secs_f64())),
            _ => None,
        };

        for index in (0..state.instances.len()).rev() {
            let instance = state.instances[index].clone();
            instance.update(dt);

            // The section loop runs before pruning: a window ending at the
            // stream end leaves the channel stopped, and the seek must
            // revive the voice instead of letting it get pruned.
            if let Some((begin, end)) = section {
                if instance.position() >= end {
                    instance.wrap_to(begin);
                }
            }

            if !instance.is_playing() && !instance.is_fading() {
                instance.dispose();
                state.instances.remove(index);
            }
        }
    }

    // --- Aggregate parameters ---
    //
    // Setters write the seed value and apply to every live voice. Getters
    // read the most recently created voice when one exists, else the seed.
    // The most-recently-created tie-break matches long-standing observed
    // behavior and is kept as documented, not strengthened.

    /// Aggregate volume. While the newest voice is ramping this reports its
    /// ramp value rather than the base volume.
    pub fn volume(&self) -> f32 {
        let state = self.state.lock();
        match state.instances.last() {
            Some(instance) if instance.is_fading() => instance.fade_volume(),
            Some(instance) => instance.volume(),
            None => state.initial_volume,
        }
    }

    pub fn set_volume(&self, volume: f32) {
        let mut state = self.state.lock();
        state.initial_volume = volume;
        for instance in &state.instances {
            instance.set_volume(volume);
        }
    }

    pub fn pan(&self) -> f32 {
        let state = self.state.lock();
        match state.instances.last() {
            Some(instance) => instance.pan(),
            None => state.initial_pan,
        }
    }

    pub fn set_pan(&self, pan: f32) {
        let mut state = self.state.lock();
        state.initial_pan = pan;
        for instance in &state.instances {
            instance.set_pan(pan);
        }
    }

    pub fn pitch(&self) -> f32 {
        let state = self.state.lock();
        match state.instances.last() {
            Some(instance) => instance.pitch(),
            None => state.initial_pitch,
        }
    }

    pub fn set_pitch(&self, pitch: f32) {
        let mut state = self.state.lock();
        state.initial_pitch = pitch;
        for instance in &state.instances {
            instance.set_pitch(pitch);
        }
    }

    pub fn speed(&self) -> f32 {
        let state = self.state.lock();
        match state.instances.last() {
            Some(instance) => instance.speed(),
            None => state.initial_speed,
        }
    }

    pub fn set_speed(&self, speed: f32) {
        let mut state = self.state.lock();
        state.initial_speed = speed;
        for instance in &state.instances {
            instance.set_speed(speed);
        }
    }

    /// Position of the most recently created voice, in seconds.
    pub fn position(&self) -> f64 {
        let state = self.state.lock();
        match state.instances.last() {
            Some(instance) => instance.position(),
            None => 0.0,
        }
    }

    /// Seek every live voice.
    pub fn set_position(&self, seconds: f64) {
        let state = self.state.lock();
        for instance in &state.instances {
            instance.set_position(seconds);
        }
    }

    // --- Introspection ---

    /// True when any voice is playing.
    pub fn is_playing(&self) -> bool {
        self.state.lock().instances.iter().any(|i| i.is_playing())
    }

    /// Voices that are playing or currently ramping. Pruned voices are
    /// excluded.
    pub fn active_instance_count(&self) -> usize {
        self.state
            .lock()
            .instances
            .iter()
            .filter(|i| i.is_playing() || i.is_fading())
            .count()
    }

    pub fn instance_count(&self) -> usize {
        self.state.lock().instances.len()
    }

    /// Voice by creation order, oldest first.
    pub fn instance_by_index(&self, index: usize) -> Option<AudioInstance> {
        self.state.lock().instances.get(index).cloned()
    }

    /// Total duration in seconds, captured at construction.
    pub fn duration(&self) -> f64 {
        self.state.lock().duration_seconds
    }

    pub fn file_path(&self) -> String {
        self.state.lock().file_path.clone()
    }

    pub fn looping(&self) -> bool {
        self.state.lock().looping
    }

    /// Toggle whole-stream looping for voices created after this call.
    pub fn set_looping(&self, looping: bool) {
        self.state.lock().looping = looping;
    }

    pub fn loop_section(&self) -> Option<(Duration, Duration)> {
        let state = self.state.lock();
        match (state.loop_begin, state.loop_end) {
            (Some(begin), Some(end)) => Some((begin, end)),
            _ => None,
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// Stop and dispose every voice, then unregister from the manager.
    /// Safe to call at any point, including from within the update cascade.
    pub fn dispose(&self) {
        let manager = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            for instance in state.instances.drain(..) {
                instance.stop(None);
                instance.dispose();
            }
            state.disposed = true;
            state.manager.clone()
        };
        // Unregister outside our own lock; the manager lock is a leaf.
        manager.unregister(self);
        tracing::debug!("Audio asset disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use crate::settings::AudioSettings;

    fn running_manager() -> (AudioManager, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::new());
        let manager = AudioManager::new(backend.clone());
        manager.init(&AudioSettings::default()).unwrap();
        (manager, backend)
    }

    fn clip(manager: &AudioManager, backend: &MockBackend) -> Audio {
        backend.register_clip("clip.ogg", Duration::from_secs(10));
        Audio::new(manager, "clip.ogg", false).unwrap()
    }

    #[test]
    fn test_missing_file_is_fatal_at_construction() {
        let (manager, _backend) = running_manager();
        let result = Audio::new(&manager, "missing.ogg", false);
        assert!(matches!(result, Err(AudioError::LoadFailed { .. })));
        assert_eq!(manager.registered_count(), 0);
        manager.free();
    }

    #[test]
    fn test_construction_requires_running_manager() {
        let backend = Arc::new(MockBackend::new());
        backend.register_clip("clip.ogg", Duration::from_secs(10));
        let manager = AudioManager::new(backend);
        assert!(matches!(
            Audio::new(&manager, "clip.ogg", false),
            Err(AudioError::NotRunning)
        ));
    }

    #[test]
    fn test_metadata_probe_does_not_leak_streams() {
        let (manager, backend) = running_manager();
        let _audio = clip(&manager, &backend);
        assert_eq!(backend.stream_count(), 0);
        manager.free();
    }

    #[test]
    fn test_overlapping_voices() {
        let (manager, backend) = running_manager();
        let audio = clip(&manager, &backend);

        audio.play(None, None).unwrap();
        audio.play(None, None).unwrap();
        assert_eq!(audio.active_instance_count(), 2);
        manager.free();
    }

    #[test]
    fn test_play_seeds_aggregate_parameters() {
        let (manager, backend) = running_manager();
        let audio = clip(&manager, &backend);

        audio.set_volume(0.5);
        audio.set_speed(2.0);
        audio.set_pan(-0.25);
        let instance = audio.play(None, None).unwrap();

        assert_eq!(instance.volume(), 0.5);
        assert!((instance.speed() - 2.0).abs() < 1e-6);
        assert!((instance.pan() + 0.25).abs() < 1e-6);
        manager.free();
    }

    #[test]
    fn test_getters_read_newest_instance_else_seed() {
        let (manager, backend) = running_manager();
        let audio = clip(&manager, &backend);

        audio.set_volume(0.8);
        assert_eq!(audio.volume(), 0.8); // no instances: seed value

        let first = audio.play(None, None).unwrap();
        let _second = audio.play(None, None).unwrap();
        first.set_volume(0.1); // older voice must not win
        assert!((audio.volume() - 0.8).abs() < 1e-6);
        manager.free();
    }

    #[test]
    fn test_play_once_stops_existing_voices() {
        let (manager, backend) = running_manager();
        let audio = clip(&manager, &backend);

        let first = audio.play(None, None).unwrap();
        let second = audio.play(None, None).unwrap();
        let survivor = audio.play_once(None, None, None).unwrap();

        assert!(!first.is_playing());
        assert!(!second.is_playing());
        assert!(survivor.is_playing());
        assert_eq!(audio.active_instance_count(), 1);
        manager.free();
    }

    #[test]
    fn test_stop_with_fade_disposes_after_ramp() {
        let (manager, backend) = running_manager();
        let audio = clip(&manager, &backend);

        audio.play(None, None).unwrap();
        audio.play(None, None).unwrap();
        audio.stop(Some(Duration::from_secs(1)));

        // Fading voices are still active until their ramps complete.
        assert_eq!(audio.active_instance_count(), 2);

        for _ in 0..12 {
            backend.advance(0.1);
            audio.update(0.1);
        }
        assert_eq!(audio.active_instance_count(), 0);
        assert_eq!(audio.instance_count(), 0);
        manager.free();
    }

    #[test]
    fn test_update_prunes_finished_voices() {
        let (manager, backend) = running_manager();
        let audio = clip(&manager, &backend);

        audio.play(None, None).unwrap();
        backend.advance(11.0); // past the 10s clip end
        audio.update(0.016);

        assert_eq!(audio.instance_count(), 0);
        assert_eq!(backend.stream_count(), 0);
        manager.free();
    }

    #[test]
    fn test_section_loop_seeks_back() {
        let (manager, backend) = running_manager();
        backend.register_clip("clip.ogg", Duration::from_secs(10));
        let audio = Audio::with_section_loop(
            &manager,
            "clip.ogg",
            Duration::from_secs(2),
            Duration::from_secs(5),
        )
        .unwrap();

        let instance = audio.play(None, None).unwrap();
        backend.advance(5.0);
        assert!(instance.position() >= 5.0);

        audio.update(0.016);
        assert!((instance.position() - 2.0).abs() < 0.01);
        manager.free();
    }

    #[test]
    fn test_section_loop_window_ending_at_stream_end() {
        let (manager, backend) = running_manager();
        backend.register_clip("clip.ogg", Duration::from_secs(10));
        let audio = Audio::with_section_loop(
            &manager,
            "clip.ogg",
            Duration::from_secs(2),
            Duration::from_secs(10),
        )
        .unwrap();

        // The channel stops at the stream end; the next update must seek
        // back into the window and resume instead of pruning the voice.
        let instance = audio.play(None, None).unwrap();
        backend.advance(10.0);
        audio.update(0.016);

        assert_eq!(audio.instance_count(), 1);
        assert!(instance.is_playing());
        assert!((instance.position() - 2.0).abs() < 0.01);
        manager.free();
    }

    #[test]
    fn test_stop_instance_ignores_foreign_voice() {
        let (manager, backend) = running_manager();
        let audio = clip(&manager, &backend);
        backend.register_clip("other.ogg", Duration::from_secs(4));
        let other = Audio::new(&manager, "other.ogg", false).unwrap();

        let foreign = other.play(None, None).unwrap();
        audio.stop_instance(&foreign, None);
        assert!(foreign.is_playing());

        let own = audio.play(None, None).unwrap();
        audio.stop_instance(&own, None);
        assert!(!own.is_playing());
        manager.free();
    }

    #[test]
    fn test_disposed_asset_rejects_play() {
        let (manager, backend) = running_manager();
        let audio = clip(&manager, &backend);
        audio.dispose();

        assert!(matches!(audio.play(None, None), Err(AudioError::Disposed)));
        assert!(matches!(
            audio.play_once(None, None, None),
            Err(AudioError::Disposed)
        ));
        assert_eq!(manager.registered_count(), 0);

        // Dispose is idempotent.
        audio.dispose();
        manager.free();
    }

    #[test]
    fn test_play_with_duration_auto_stops() {
        let (manager, backend) = running_manager();
        let audio = clip(&manager, &backend);

        let instance = audio
            .play_with_duration(Duration::from_millis(30), None, None)
            .unwrap();
        assert!(instance.is_playing());

        std::thread::sleep(Duration::from_millis(250));
        assert!(!instance.is_playing());
        manager.free();
    }

    #[test]
    fn test_play_with_duration_stop_cancelled_by_dispose() {
        let (manager, backend) = running_manager();
        let audio = clip(&manager, &backend);

        let instance = audio
            .play_with_duration(Duration::from_millis(30), None, None)
            .unwrap();
        audio.dispose();
        assert!(instance.is_disposed());

        // The deferred stop must find the disposed voice and do nothing.
        std::thread::sleep(Duration::from_millis(250));
        manager.free();
    }
}
