/// Rodio-backed implementation of [`AudioBackend`]
///
/// Each decode stream is an idle [`Sink`] whose queue output is attached to
/// a [`dynamic_mixer`] controller; mixers chain by feeding one mixer's
/// consumer into another's controller through a [`GainStage`]. The output
/// device lives on its own thread because [`OutputStream`] is not `Send`:
/// the thread opens the stream, hands a `Send` handle back, then parks
/// until shutdown.
///
/// Rodio has no pan or pitch-shift control on a sink, so `Pan` and `Pitch`
/// are accepted and cached but do not affect output. `Frequency` maps to
/// `Sink::set_speed` as a ratio against the stream's native rate.
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Sender};
use parking_lot::Mutex;
use rodio::cpal::traits::{DeviceTrait, HostTrait};
use rodio::dynamic_mixer::{self, DynamicMixer, DynamicMixerController};
use rodio::queue::SourcesQueueOutput;
use rodio::source::Source;
use rodio::{cpal, Decoder, OutputStream, OutputStreamHandle, Sink};

use crate::backend::{
    AudioBackend, ChannelAttribute, ChannelState, DeviceInfo, MixerHandle, StreamHandle,
    StreamInfo,
};
use crate::error::BackendError;
use crate::settings::AudioSettings;

/// Multiplies a source by a gain that can be retargeted from any thread.
/// The gain lives in an `AtomicU32` as f32 bits so the audio callback never
/// takes a lock.
struct GainStage<S> {
    inner: S,
    gain: Arc<AtomicU32>,
}

impl<S> GainStage<S> {
    fn new(inner: S, gain: Arc<AtomicU32>) -> Self {
        Self { inner, gain }
    }
}

impl<S: Source<Item = f32>> Iterator for GainStage<S> {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        let gain = f32::from_bits(self.gain.load(Ordering::Relaxed));
        self.inner.next().map(|sample| sample * gain)
    }
}

impl<S: Source<Item = f32>> Source for GainStage<S> {
    fn current_frame_len(&self) -> Option<usize> {
        self.inner.current_frame_len()
    }

    fn channels(&self) -> u16 {
        self.inner.channels()
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn total_duration(&self) -> Option<Duration> {
        self.inner.total_duration()
    }
}

fn gain_cell(value: f32) -> Arc<AtomicU32> {
    Arc::new(AtomicU32::new(value.to_bits()))
}

struct VoiceSlot {
    path: PathBuf,
    info: StreamInfo,
    sink: Sink,
    /// Queue output, held until the slot is attached to a mixer.
    queue: Option<SourcesQueueOutput<f32>>,
    attached_to: Option<u64>,
    looping: bool,
    attributes: HashMap<ChannelAttribute, f32>,
}

impl VoiceSlot {
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

    fn open_source(&self) -> Result<Box<dyn Source<Item = i16> + Send>, BackendError> {
        let file = File::open(&self.path).map_err(|e| BackendError::StreamOpenFailed {
            path: self.path.to_string_lossy().to_string(),
            source: Some(Box::new(e)),
        })?;
        let reader = BufReader::new(file);
        if self.looping {
            let decoder = Decoder::new_looped(reader)
                .map_err(|e| BackendError::DecodeFailed(e.to_string()))?;
            Ok(Box::new(decoder))
        } else {
            let decoder =
                Decoder::new(reader).map_err(|e| BackendError::DecodeFailed(e.to_string()))?;
            Ok(Box::new(decoder))
        }
    }
}

struct MixerSlot {
    controller: Arc<DynamicMixerController<f32>>,
    /// Consumer end, taken when this mixer is connected downstream.
    consumer: Option<DynamicMixer<f32>>,
    gain: Arc<AtomicU32>,
}

struct DeviceSlot {
    handle: OutputStreamHandle,
    shutdown: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

// Tearing the slot down on drop means a backend that is dropped without
// close_device still reclaims its thread and output stream.
impl Drop for DeviceSlot {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Output device thread panicked");
            }
        }
    }
}

#[derive(Default)]
struct RodioState {
    next_id: u64,
    streams: HashMap<u64, VoiceSlot>,
    mixers: HashMap<u64, MixerSlot>,
    device: Option<DeviceSlot>,
}

/// Production [`AudioBackend`] over rodio and cpal.
pub struct RodioBackend {
    state: Mutex<RodioState>,
    device_gain: Arc<AtomicU32>,
}

impl RodioBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RodioState::default()),
            device_gain: gain_cell(1.0),
        }
    }

    fn probe(path: &Path) -> Result<StreamInfo, BackendError> {
        let file = File::open(path).map_err(|e| BackendError::StreamOpenFailed {
            path: path.to_string_lossy().to_string(),
            source: Some(Box::new(e)),
        })?;
        let decoder = Decoder::new(BufReader::new(file))
            .map_err(|e| BackendError::DecodeFailed(e.to_string()))?;

        let sample_rate = decoder.sample_rate() as f32;
        let channels = decoder.channels();
        let length_bytes = match decoder.total_duration() {
            Some(duration) => {
                (duration.as_secs_f64() * f64::from(sample_rate) * f64::from(channels) * 4.0)
                    .round() as u64
            }
            None => {
                tracing::warn!(path = %path.display(), "Decoder reports no duration");
                0
            }
        };

        Ok(StreamInfo {
            sample_rate,
            channels,
            length_bytes,
        })
    }
}

impl Default for RodioBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for RodioBackend {
    fn open_decode_stream(&self, path: &Path) -> Result<StreamHandle, BackendError> {
        let info = Self::probe(path)?;
        let (sink, queue) = Sink::new_idle();
        sink.pause();

        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.streams.insert(
            id,
            VoiceSlot {
                path: path.to_path_buf(),
                info,
                sink,
                queue: Some(queue),
                attached_to: None,
                looping: false,
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
        // Speed is native to a sink (set_speed), so the wrap is a handle
        // identity check rather than a new node.
        if self.state.lock().streams.contains_key(&stream.0) {
            Ok(stream)
        } else {
            Err(BackendError::InvalidHandle)
        }
    }

    fn set_stream_looping(&self, stream: StreamHandle, looping: bool) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let slot = state
            .streams
            .get_mut(&stream.0)
            .ok_or(BackendError::InvalidHandle)?;
        slot.looping = looping;
        Ok(())
    }

    fn free_stream(&self, stream: StreamHandle) {
        let mut state = self.state.lock();
        if let Some(slot) = state.streams.remove(&stream.0) {
            slot.sink.stop();
        }
    }

    fn create_mixer(&self, sample_rate: u32, channels: u16) -> Result<MixerHandle, BackendError> {
        let (controller, consumer) = dynamic_mixer::mixer::<f32>(channels, sample_rate);

        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.mixers.insert(
            id,
            MixerSlot {
                controller,
                consumer: Some(consumer),
                gain: gain_cell(1.0),
            },
        );
        Ok(MixerHandle(id))
    }

    fn connect_mixer(&self, dst: MixerHandle, src: MixerHandle) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let consumer = state
            .mixers
            .get_mut(&src.0)
            .ok_or(BackendError::InvalidHandle)?
            .consumer
            .take()
            .ok_or_else(|| {
                BackendError::MixerFailed("mixer is already connected downstream".to_string())
            })?;
        let gain = state.mixers[&src.0].gain.clone();

        let dst_slot = state
            .mixers
            .get(&dst.0)
            .ok_or(BackendError::InvalidHandle)?;
        dst_slot.controller.add(GainStage::new(consumer, gain));
        Ok(())
    }

    fn set_mixer_volume(&self, mixer: MixerHandle, volume: f32) -> Result<(), BackendError> {
        if !volume.is_finite() {
            return Err(BackendError::NonFiniteValue);
        }
        let state = self.state.lock();
        let slot = state.mixers.get(&mixer.0).ok_or(BackendError::InvalidHandle)?;
        slot.gain.store(volume.to_bits(), Ordering::Relaxed);
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

        let slot = state
            .streams
            .get_mut(&stream.0)
            .ok_or(BackendError::InvalidHandle)?;
        let queue = slot.queue.take().ok_or_else(|| {
            BackendError::MixerFailed("stream is already attached to a mixer".to_string())
        })?;
        let source = slot.open_source()?;

        slot.sink.pause();
        slot.sink.append(source);
        slot.attached_to = Some(mixer.0);
        state.mixers[&mixer.0].controller.add(queue);
        Ok(())
    }

    fn detach_channel(&self, mixer: MixerHandle, stream: StreamHandle) {
        // The queue cannot be pulled back out of the mixer; stopping the
        // sink leaves it producing silence until the stream is freed.
        let mut state = self.state.lock();
        if let Some(slot) = state.streams.get_mut(&stream.0) {
            if slot.attached_to == Some(mixer.0) {
                slot.sink.stop();
                slot.attached_to = None;
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
        let slot = state
            .streams
            .get_mut(&stream.0)
            .ok_or(BackendError::InvalidHandle)?;

        match attribute {
            ChannelAttribute::Volume => slot.sink.set_volume(value.max(0.0)),
            ChannelAttribute::Frequency => {
                if value <= 0.0 {
                    return Err(BackendError::AttributeRejected {
                        attribute,
                        reason: "frequency must be positive".to_string(),
                    });
                }
                slot.sink.set_speed(value / slot.info.sample_rate);
            }
            // No rodio equivalent; cached so a host reads back what it set.
            ChannelAttribute::Pan | ChannelAttribute::Pitch => {}
        }
        slot.attributes.insert(attribute, value);
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
        let slot = state
            .streams
            .get_mut(&stream.0)
            .ok_or(BackendError::InvalidHandle)?;
        if slot.attached_to.is_none() {
            return Err(BackendError::InvalidHandle);
        }

        // A stopped sink has drained its queue; give it a fresh source so
        // replay starts from the beginning.
        if slot.sink.empty() {
            let source = slot.open_source()?;
            slot.sink.append(source);
        }
        slot.sink.play();
        Ok(())
    }

    fn pause_channel(&self, stream: StreamHandle) -> Result<(), BackendError> {
        let state = self.state.lock();
        let slot = state
            .streams
            .get(&stream.0)
            .ok_or(BackendError::InvalidHandle)?;
        slot.sink.pause();
        Ok(())
    }

    fn channel_state(&self, stream: StreamHandle) -> ChannelState {
        let state = self.state.lock();
        match state.streams.get(&stream.0) {
            Some(slot) if slot.attached_to.is_none() => ChannelState::Stopped,
            Some(slot) if slot.sink.empty() => ChannelState::Stopped,
            Some(slot) if slot.sink.is_paused() => ChannelState::Paused,
            Some(_) => ChannelState::Playing,
            None => ChannelState::Stopped,
        }
    }

    fn channel_position_bytes(&self, stream: StreamHandle) -> Result<u64, BackendError> {
        let state = self.state.lock();
        let slot = state
            .streams
            .get(&stream.0)
            .ok_or(BackendError::InvalidHandle)?;
        let seconds = slot.sink.get_pos().as_secs_f64();
        Ok((seconds * slot.info.bytes_per_second()).round() as u64)
    }

    fn set_channel_position_bytes(
        &self,
        stream: StreamHandle,
        bytes: u64,
    ) -> Result<(), BackendError> {
        let state = self.state.lock();
        let slot = state
            .streams
            .get(&stream.0)
            .ok_or(BackendError::InvalidHandle)?;
        let bps = slot.info.bytes_per_second();
        if bps <= 0.0 {
            return Err(BackendError::SeekFailed("stream has no duration".to_string()));
        }
        let target = Duration::from_secs_f64(bytes as f64 / bps);
        slot.sink
            .try_seek(target)
            .map_err(|e| BackendError::SeekFailed(e.to_string()))
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
        let host = cpal::default_host();
        match host.output_devices() {
            Ok(devices) => devices
                .map(|d| d.name().unwrap_or_else(|_| "unknown".to_string()))
                .collect(),
            Err(error) => {
                tracing::warn!(%error, "Failed to enumerate output devices");
                Vec::new()
            }
        }
    }

    fn open_device(&self, settings: &AudioSettings) -> Result<DeviceInfo, BackendError> {
        let mut state = self.state.lock();
        if state.device.is_some() {
            return Err(BackendError::DeviceOpenFailed(
                "device is already open".to_string(),
            ));
        }

        let (ready_tx, ready_rx) = bounded(1);
        let (shutdown_tx, shutdown_rx) = unbounded::<()>();
        let device_index = settings.device_index;

        // OutputStream is not Send, so it must be created and dropped on
        // one thread. The thread reports readiness and then parks on the
        // shutdown channel, keeping the stream alive.
        let thread = thread::spawn(move || {
            let opened = (|| {
                let host = cpal::default_host();
                let device = match device_index {
                    Some(index) => host
                        .output_devices()
                        .map_err(|e| BackendError::DeviceOpenFailed(e.to_string()))?
                        .nth(index)
                        .ok_or(BackendError::NoDevice)?,
                    None => host.default_output_device().ok_or(BackendError::NoDevice)?,
                };
                let name = device.name().unwrap_or_else(|_| "unknown".to_string());
                let config = device
                    .default_output_config()
                    .map_err(|e| BackendError::DeviceOpenFailed(e.to_string()))?;
                let (stream, handle) = OutputStream::try_from_device(&device)
                    .map_err(|e| BackendError::DeviceOpenFailed(e.to_string()))?;
                let info = DeviceInfo {
                    name,
                    sample_rate: config.sample_rate().0,
                    channels: config.channels(),
                };
                Ok((stream, handle, info))
            })();

            match opened {
                Ok((stream, handle, info)) => {
                    if ready_tx.send(Ok((handle, info))).is_err() {
                        return;
                    }
                    let _stream = stream;
                    let _ = shutdown_rx.recv();
                }
                Err(error) => {
                    let _ = ready_tx.send(Err(error));
                }
            }
        });

        let (handle, info) = ready_rx
            .recv()
            .map_err(|_| BackendError::DeviceOpenFailed("device thread terminated".to_string()))??;

        if settings.sample_rate != 0 && settings.sample_rate != info.sample_rate {
            tracing::info!(
                requested = settings.sample_rate,
                actual = info.sample_rate,
                "Device uses its own sample rate"
            );
        }
        if settings.exclusive || settings.buffer_length > 0.0 || settings.period > 0.0 {
            tracing::info!("Exclusive mode and buffer tuning are not supported; using shared mode defaults");
        }

        state.device = Some(DeviceSlot {
            handle,
            shutdown: shutdown_tx,
            thread: Some(thread),
        });
        Ok(info)
    }

    fn start_device(&self, output_mixer: MixerHandle) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let consumer = state
            .mixers
            .get_mut(&output_mixer.0)
            .ok_or(BackendError::InvalidHandle)?
            .consumer
            .take()
            .ok_or_else(|| {
                BackendError::MixerFailed("output mixer is already connected".to_string())
            })?;
        let gain = self.device_gain.clone();

        let device = state.device.as_ref().ok_or(BackendError::NoDevice)?;
        device
            .handle
            .play_raw(GainStage::new(consumer, gain))
            .map_err(|e| BackendError::DeviceStartFailed(e.to_string()))
    }

    fn stop_device(&self) {
        let state = self.state.lock();
        if let Some(device) = state.device.as_ref() {
            // Dropping the output stream on its thread stops the callback.
            let _ = device.shutdown.send(());
        }
    }

    fn close_device(&self) {
        // Taken out of the lock first so the join in the slot's drop never
        // runs while the state mutex is held.
        let device = self.state.lock().device.take();
        drop(device);
    }

    fn set_device_gain(&self, gain: f32) {
        if gain.is_finite() {
            self.device_gain.store(gain.to_bits(), Ordering::Relaxed);
        }
    }
}
