//! Audio backend capability used by the scheduler
//!
//! The scheduler never touches an audio API directly. It asks a backend for
//! the current audio-clock time, for gain stages, and for voices that start
//! at an absolute time on that clock.

mod offline;
mod renderer;

use std::sync::Arc;

use thiserror::Error;

pub use offline::{DispatchLog, GainRecord, OfflineBackend, StopRecord, VoiceRecord};
pub use renderer::Renderer;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Audio output is locked")]
    Locked,
    #[error("Audio device error: {0}")]
    Device(String),
    #[error("Unknown gain stage: {0:?}")]
    UnknownGain(GainId),
    #[error("Invalid voice request: {0}")]
    InvalidVoice(String),
}

/// Handle to a gain stage owned by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GainId(pub u64);

/// Handle to a scheduled or sounding voice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoiceHandle(pub u64);

/// Mono sample data shared between the bank and playing voices
pub type SampleData = Arc<Vec<f32>>;

/// Everything a backend needs to play one region of a buffer
#[derive(Debug, Clone)]
pub struct VoiceRequest {
    pub buffer: SampleData,
    /// Sample rate of `buffer`
    pub buffer_rate: u32,
    pub output: GainId,
    /// Audio-clock time the voice begins
    pub start_time: f64,
    /// Seconds into the buffer where the region begins
    pub offset: f64,
    /// Seconds of buffer the region covers
    pub duration: f64,
    pub playback_rate: f64,
    pub fade_in: f64,
    pub fade_out: f64,
    /// Play the region from its end back to its start
    pub reverse: bool,
}

impl VoiceRequest {
    /// Wall-clock length of the voice after rate scaling
    pub fn audible_duration(&self) -> f64 {
        self.duration / self.playback_rate
    }

    pub fn validate(&self) -> Result<(), BackendError> {
        let fields = [
            self.start_time,
            self.offset,
            self.duration,
            self.playback_rate,
            self.fade_in,
            self.fade_out,
        ];
        if fields.iter().any(|v| !v.is_finite()) {
            return Err(BackendError::InvalidVoice("non-finite timing".into()));
        }
        if self.playback_rate <= 0.0 || self.duration <= 0.0 {
            return Err(BackendError::InvalidVoice(format!(
                "duration {} at rate {}",
                self.duration, self.playback_rate
            )));
        }
        if self.buffer.is_empty() || self.buffer_rate == 0 {
            return Err(BackendError::InvalidVoice("empty buffer".into()));
        }
        Ok(())
    }
}

/// Audio output as seen by the transport.
///
/// All times are seconds on the backend's monotonic audio clock. Operations
/// on handles the backend no longer knows about are no-ops.
pub trait AudioBackend {
    /// Current audio-clock time in seconds
    fn current_time(&self) -> f64;

    fn sample_rate(&self) -> u32;

    /// Enable sound output. Called once before the first start.
    fn unlock(&mut self) -> Result<(), BackendError>;

    fn is_unlocked(&self) -> bool;

    /// Create a gain stage feeding the master output
    fn create_gain(&mut self, initial: f32) -> GainId;

    /// Schedule the gain to reach `value` at `at`
    fn set_gain(&mut self, gain: GainId, value: f32, at: f64) -> Result<(), BackendError>;

    /// Drop gain changes scheduled at or after `from`
    fn cancel_gain_ramps(&mut self, gain: GainId, from: f64) -> Result<(), BackendError>;

    fn remove_gain(&mut self, gain: GainId);

    fn start_voice(&mut self, request: VoiceRequest) -> Result<VoiceHandle, BackendError>;

    /// Stop a voice at `at`, cutting any envelope still in progress
    fn stop_voice(&mut self, voice: VoiceHandle, at: f64);

    /// Free a voice's resources immediately
    fn release_voice(&mut self, voice: VoiceHandle);

    /// Voice is scheduled or still sounding
    fn is_voice_active(&self, voice: VoiceHandle) -> bool;

    /// Cancel every voice scheduled to begin at or after `from`.
    /// Returns how many were dropped.
    fn cancel_scheduled(&mut self, from: f64) -> usize;
}
