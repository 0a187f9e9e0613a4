/// Playback subsystem root
///
/// Owns the output device, the two-stage mixer graph and the registry of
/// loaded [`Audio`] assets. One manager per output device; handles are
/// cheap clones sharing the same state, so a host can pass the manager
/// around freely. There is deliberately no global instance.
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::audio::Audio;
use crate::backend::{AudioBackend, DeviceInfo, MixerHandle};
use crate::error::InitError;
use crate::scheduler::StopScheduler;
use crate::settings::AudioSettings;

/// Lifecycle of an [`AudioManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// No device, no mixers. The initial state, and the state after
    /// [`free`](AudioManager::free) or a failed init.
    Uninitialized,

    /// [`init`](AudioManager::init) is partway through its stages.
    Initializing,

    /// Device started, mixer graph live, assets may be loaded and played.
    Running,

    /// [`free`](AudioManager::free) is tearing things down.
    ShuttingDown,
}

struct ManagerInner {
    state: ManagerState,
    /// Inner mixer: every voice attaches here.
    mixer: Option<MixerHandle>,
    /// Outer mixer: feeds the device, its only input is the inner mixer.
    output_mixer: Option<MixerHandle>,
    device: Option<DeviceInfo>,
    registry: Vec<Audio>,
    master_volume: f32,
    scheduler: Option<StopScheduler>,
}

/// Handle to the playback subsystem. Clones share the same device, mixer
/// graph and asset registry.
#[derive(Clone)]
pub struct AudioManager {
    backend: Arc<dyn AudioBackend>,
    inner: Arc<Mutex<ManagerInner>>,
}

impl AudioManager {
    /// Create an uninitialized manager over `backend`. Nothing touches the
    /// device until [`init`](Self::init).
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        Self {
            backend,
            inner: Arc::new(Mutex::new(ManagerInner {
                state: ManagerState::Uninitialized,
                mixer: None,
                output_mixer: None,
                device: None,
                registry: Vec::new(),
                master_volume: 1.0,
                scheduler: None,
            })),
        }
    }

    /// Bring the subsystem up: open the device, build the mixer graph,
    /// start the output callback and the stop scheduler.
    ///
    /// Each stage that fails rolls back the stages before it and leaves the
    /// manager `Uninitialized`; the error names the failing stage. Calling
    /// `init` on a running manager is a no-op.
    pub fn init(&self, settings: &AudioSettings) -> Result<(), InitError> {
        let mut inner = self.inner.lock();
        if inner.state == ManagerState::Running {
            tracing::debug!("Audio manager already running, init skipped");
            return Ok(());
        }
        inner.state = ManagerState::Initializing;

        let device = match self.backend.open_device(settings) {
            Ok(device) => device,
            Err(source) => {
                inner.state = ManagerState::Uninitialized;
                return Err(InitError::Device(source));
            }
        };
        tracing::info!(
            name = %device.name,
            sample_rate = device.sample_rate,
            channels = device.channels,
            "Output device opened"
        );

        let mixer = match self.backend.create_mixer(device.sample_rate, device.channels) {
            Ok(mixer) => mixer,
            Err(source) => {
                self.backend.close_device();
                inner.state = ManagerState::Uninitialized;
                return Err(InitError::MixerCreate(source));
            }
        };

        let output_mixer = match self.backend.create_mixer(device.sample_rate, device.channels) {
            Ok(mixer) => mixer,
            Err(source) => {
                self.backend.free_mixer(mixer);
                self.backend.close_device();
                inner.state = ManagerState::Uninitialized;
                return Err(InitError::MixerCreate(source));
            }
        };

        if let Err(source) = self.backend.connect_mixer(output_mixer, mixer) {
            self.backend.free_mixer(output_mixer);
            self.backend.free_mixer(mixer);
            self.backend.close_device();
            inner.state = ManagerState::Uninitialized;
            return Err(InitError::MixerConnect(source));
        }

        if let Err(source) = self.backend.start_device(output_mixer) {
            self.backend.free_mixer(output_mixer);
            self.backend.free_mixer(mixer);
            self.backend.close_device();
            inner.state = ManagerState::Uninitialized;
            return Err(InitError::DeviceStart(source));
        }

        inner.device = Some(device);
        inner.mixer = Some(mixer);
        inner.output_mixer = Some(output_mixer);
        inner.scheduler = Some(StopScheduler::start());
        inner.state = ManagerState::Running;
        tracing::info!("Audio manager running");
        Ok(())
    }

    /// Per-frame tick: advance fades, prune finished voices and apply
    /// section loops on every registered asset. No-op unless running.
    pub fn update(&self, dt: f32) {
        // Snapshot under the lock, tick outside it: an asset's update may
        // dispose voices, and disposal takes asset locks.
        let assets = {
            let inner = self.inner.lock();
            if inner.state != ManagerState::Running {
                return;
            }
            inner.registry.clone()
        };

        for audio in assets {
            audio.update(dt);
        }
    }

    /// Master gain for everything routed through this manager, clamped to
    /// 0.0..=1.0.
    pub fn set_master_volume(&self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        let mixer = {
            let mut inner = self.inner.lock();
            inner.master_volume = volume;
            inner.mixer
        };

        if let Some(mixer) = mixer {
            if let Err(error) = self.backend.set_mixer_volume(mixer, volume) {
                tracing::warn!(%error, "Failed to set master mixer volume");
            }
        }
        self.backend.set_device_gain(volume);
    }

    pub fn master_volume(&self) -> f32 {
        self.inner.lock().master_volume
    }

    /// Stop every voice of every registered asset, optionally faded. The
    /// assets themselves stay registered and playable.
    pub fn stop_all(&self, fade_out: Option<Duration>) {
        let assets = self.inner.lock().registry.clone();
        for audio in assets {
            audio.stop(fade_out);
        }
    }

    pub(crate) fn register(&self, audio: &Audio) {
        self.inner.lock().registry.push(audio.clone());
    }

    /// Remove `audio` from the registry. Already-removed assets are a
    /// no-op, so dispose can race with free.
    pub(crate) fn unregister(&self, audio: &Audio) {
        let mut inner = self.inner.lock();
        inner.registry.retain(|a| !a.ptr_eq(audio));
    }

    /// Number of registered assets.
    pub fn registered_count(&self) -> usize {
        self.inner.lock().registry.len()
    }

    /// Tear the subsystem down: dispose every asset, stop the scheduler,
    /// free the mixer graph and close the device. The manager returns to
    /// `Uninitialized` and may be re-initialized later. Idempotent.
    pub fn free(&self) {
        let (assets, scheduler) = {
            let mut inner = self.inner.lock();
            if inner.state != ManagerState::Running {
                return;
            }
            inner.state = ManagerState::ShuttingDown;
            (std::mem::take(&mut inner.registry), inner.scheduler.take())
        };

        // Disposal re-enters unregister, so the manager lock is released.
        for audio in assets {
            audio.dispose();
        }
        if let Some(scheduler) = scheduler {
            scheduler.shutdown();
        }

        let mut inner = self.inner.lock();
        self.backend.stop_device();
        if let Some(mixer) = inner.output_mixer.take() {
            self.backend.free_mixer(mixer);
        }
        if let Some(mixer) = inner.mixer.take() {
            self.backend.free_mixer(mixer);
        }
        self.backend.close_device();
        inner.device = None;
        inner.state = ManagerState::Uninitialized;
        tracing::info!("Audio manager freed");
    }

    // --- Accessors ---

    pub fn state(&self) -> ManagerState {
        self.inner.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == ManagerState::Running
    }

    /// The inner mixer voices attach to, while running.
    pub(crate) fn mixer(&self) -> Option<MixerHandle> {
        self.inner.lock().mixer
    }

    /// The outer mixer feeding the device, while running.
    pub fn output_mixer(&self) -> Option<MixerHandle> {
        self.inner.lock().output_mixer
    }

    /// Description of the opened device, while running.
    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.inner.lock().device.clone()
    }

    pub(crate) fn scheduler(&self) -> Option<StopScheduler> {
        self.inner.lock().scheduler.clone()
    }

    pub(crate) fn backend(&self) -> Arc<dyn AudioBackend> {
        self.backend.clone()
    }
}
