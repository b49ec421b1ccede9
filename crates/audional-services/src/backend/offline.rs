//! Deterministic backend driven by rendering instead of a device clock

use tracing::debug;

use super::{AudioBackend, BackendError, GainId, Renderer, VoiceHandle, VoiceRequest};

/// Frames rendered per block when advancing the clock
const BLOCK_FRAMES: usize = 512;

/// A voice start as the backend received it
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceRecord {
    pub handle: VoiceHandle,
    pub output: GainId,
    pub start_time: f64,
    pub offset: f64,
    pub duration: f64,
    pub playback_rate: f64,
    pub fade_in: f64,
    pub fade_out: f64,
    pub reverse: bool,
}

impl VoiceRecord {
    pub fn audible_duration(&self) -> f64 {
        self.duration / self.playback_rate
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopRecord {
    pub handle: VoiceHandle,
    pub at: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainRecord {
    pub gain: GainId,
    pub value: f32,
    pub at: f64,
}

/// Everything the scheduler asked of the backend, in call order
#[derive(Debug, Clone, Default)]
pub struct DispatchLog {
    pub voices: Vec<VoiceRecord>,
    pub stops: Vec<StopRecord>,
    pub gains: Vec<GainRecord>,
    pub cancelled: usize,
}

impl DispatchLog {
    /// Voices sent to `output`
    pub fn voices_on(&self, output: GainId) -> impl Iterator<Item = &VoiceRecord> {
        self.voices.iter().filter(move |v| v.output == output)
    }

    pub fn was_stopped(&self, handle: VoiceHandle) -> bool {
        self.stops.iter().any(|s| s.handle == handle)
    }
}

/// Backend whose clock only moves when audio is rendered.
///
/// Used for bouncing projects to disk and for exercising the scheduler
/// without a sound card.
#[derive(Debug)]
pub struct OfflineBackend {
    renderer: Renderer,
    unlocked: bool,
    unlock_calls: usize,
    fail_unlock: bool,
    log: DispatchLog,
}

impl OfflineBackend {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            renderer: Renderer::new(sample_rate),
            unlocked: false,
            unlock_calls: 0,
            fail_unlock: false,
            log: DispatchLog::default(),
        }
    }

    /// Make every unlock attempt fail, as a device that refuses to open would
    pub fn with_failing_unlock(mut self) -> Self {
        self.fail_unlock = true;
        self
    }

    pub fn log(&self) -> &DispatchLog {
        &self.log
    }

    pub fn take_log(&mut self) -> DispatchLog {
        std::mem::take(&mut self.log)
    }

    pub fn unlock_calls(&self) -> usize {
        self.unlock_calls
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    /// Render `frames` mono frames and return them
    pub fn render(&mut self, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; frames];
        self.renderer.render(&mut out, 1);
        out
    }

    /// Move the clock forward by `seconds`, discarding the audio
    pub fn advance(&mut self, seconds: f64) {
        let mut frames = (seconds * self.renderer.sample_rate() as f64).round() as usize;
        let mut scratch = [0.0f32; BLOCK_FRAMES];
        while frames > 0 {
            let n = frames.min(BLOCK_FRAMES);
            self.renderer.render(&mut scratch[..n], 1);
            frames -= n;
        }
    }
}

impl AudioBackend for OfflineBackend {
    fn current_time(&self) -> f64 {
        self.renderer.current_time()
    }

    fn sample_rate(&self) -> u32 {
        self.renderer.sample_rate()
    }

    fn unlock(&mut self) -> Result<(), BackendError> {
        self.unlock_calls += 1;
        if self.fail_unlock {
            return Err(BackendError::Device("output refused to start".into()));
        }
        if !self.unlocked {
            debug!("Offline output unlocked");
            self.unlocked = true;
        }
        Ok(())
    }

    fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    fn create_gain(&mut self, initial: f32) -> GainId {
        self.renderer.create_gain(initial)
    }

    fn set_gain(&mut self, gain: GainId, value: f32, at: f64) -> Result<(), BackendError> {
        self.renderer.set_gain(gain, value, at)?;
        self.log.gains.push(GainRecord { gain, value, at });
        Ok(())
    }

    fn cancel_gain_ramps(&mut self, gain: GainId, from: f64) -> Result<(), BackendError> {
        self.renderer.cancel_gain_ramps(gain, from)
    }

    fn remove_gain(&mut self, gain: GainId) {
        self.renderer.remove_gain(gain);
    }

    fn start_voice(&mut self, request: VoiceRequest) -> Result<VoiceHandle, BackendError> {
        if !self.unlocked {
            return Err(BackendError::Locked);
        }
        let mut record = VoiceRecord {
            handle: VoiceHandle(0),
            output: request.output,
            start_time: request.start_time,
            offset: request.offset,
            duration: request.duration,
            playback_rate: request.playback_rate,
            fade_in: request.fade_in,
            fade_out: request.fade_out,
            reverse: request.reverse,
        };
        record.handle = self.renderer.start_voice(request)?;
        let handle = record.handle;
        self.log.voices.push(record);
        Ok(handle)
    }

    fn stop_voice(&mut self, voice: VoiceHandle, at: f64) {
        self.log.stops.push(StopRecord { handle: voice, at });
        self.renderer.stop_voice(voice, at);
    }

    fn release_voice(&mut self, voice: VoiceHandle) {
        self.renderer.release_voice(voice);
    }

    fn is_voice_active(&self, voice: VoiceHandle) -> bool {
        self.renderer.is_voice_active(voice)
    }

    fn cancel_scheduled(&mut self, from: f64) -> usize {
        let cancelled = self.renderer.cancel_scheduled(from);
        self.log.cancelled += cancelled;
        cancelled
    }
}
