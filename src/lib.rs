//! Frame-driven audio playback and mixing.
//!
//! The host owns an [`AudioManager`] (no global instance), loads sounds as
//! [`Audio`] assets and plays them as overlapping [`AudioInstance`] voices.
//! Fades, voice pruning and section loops advance only when the host calls
//! [`AudioManager::update`] from its frame loop; everything else is safe to
//! call from any thread.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use polyvoice::{Audio, AudioManager, AudioSettings, RodioBackend};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = AudioManager::new(Arc::new(RodioBackend::new()));
//! manager.init(&AudioSettings::default())?;
//!
//! let music = Audio::new(&manager, "music.ogg", true)?;
//! music.play(Some(Duration::from_secs(2)), None)?;
//!
//! // each frame:
//! manager.update(1.0 / 60.0);
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod backend;
pub mod error;
pub mod instance;
pub mod manager;
pub mod scheduler;
pub mod settings;

pub use audio::Audio;
pub use backend::mock::MockBackend;
pub use backend::rodio::RodioBackend;
pub use backend::{AudioBackend, ChannelState, DeviceInfo, StreamInfo};
pub use error::{AudioError, AudioResult, BackendError, InitError};
pub use instance::AudioInstance;
pub use manager::{AudioManager, ManagerState};
pub use settings::AudioSettings;
