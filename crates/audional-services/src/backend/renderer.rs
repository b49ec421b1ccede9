//! Software mixer shared by the offline and realtime backends

use std::collections::HashMap;

use tracing::trace;

use super::{BackendError, GainId, SampleData, VoiceHandle, VoiceRequest};

/// Gain changes slew over this long to avoid zipper noise
const GAIN_SLEW_SECONDS: f64 = 0.005;
/// Declick applied when a voice is stopped early
const STOP_FADE_SECONDS: f64 = 0.003;
const MASTER_GAIN: f32 = 0.8;

/// Per-gain state: current value plus changes waiting on the clock
struct GainStage {
    value: f32,
    target: f32,
    /// (time, value), sorted by time
    events: Vec<(f64, f32)>,
}

impl GainStage {
    fn new(initial: f32) -> Self {
        Self {
            value: initial,
            target: initial,
            events: Vec::new(),
        }
    }

    fn schedule(&mut self, at: f64, value: f32) {
        let idx = self.events.partition_point(|(t, _)| *t <= at);
        self.events.insert(idx, (at, value));
    }

    fn tick(&mut self, time: f64, max_step: f32) {
        let due = self.events.partition_point(|(t, _)| *t <= time);
        if due > 0 {
            self.target = self.events[due - 1].1;
            self.events.drain(..due);
        }
        let delta = self.target - self.value;
        if delta.abs() <= max_step {
            self.value = self.target;
        } else {
            self.value += max_step * delta.signum();
        }
    }
}

/// One playing region of a buffer
struct RenderVoice {
    buffer: SampleData,
    output: GainId,
    start_time: f64,
    /// Region bounds in buffer frames
    region_start: f64,
    region_end: f64,
    /// Read head in buffer frames
    position: f64,
    /// Buffer frames per output frame, negative when reversed
    increment: f64,
    audible: f64,
    fade_in: f64,
    fade_out: f64,
    elapsed_frames: u64,
    stop_at: Option<f64>,
    stop_gain: f32,
    finished: bool,
}

impl RenderVoice {
    fn new(request: VoiceRequest, output_rate: f64) -> Self {
        let buffer_rate = request.buffer_rate as f64;
        let last = request.buffer.len().saturating_sub(1) as f64;
        let region_start = (request.offset * buffer_rate).clamp(0.0, last);
        let region_end = ((request.offset + request.duration) * buffer_rate).clamp(region_start, last);
        let speed = request.playback_rate * buffer_rate / output_rate;
        let (position, increment) = if request.reverse {
            (region_end, -speed)
        } else {
            (region_start, speed)
        };
        Self {
            audible: request.audible_duration(),
            buffer: request.buffer,
            output: request.output,
            start_time: request.start_time,
            region_start,
            region_end,
            position,
            increment,
            fade_in: request.fade_in,
            fade_out: request.fade_out,
            elapsed_frames: 0,
            stop_at: None,
            stop_gain: 1.0,
            finished: false,
        }
    }

    fn envelope(&self, elapsed: f64) -> f32 {
        let attack = if self.fade_in > 0.0 {
            (elapsed / self.fade_in).min(1.0)
        } else {
            1.0
        };
        let release = if self.fade_out > 0.0 {
            ((self.audible - elapsed) / self.fade_out).clamp(0.0, 1.0)
        } else {
            1.0
        };
        attack.min(release) as f32
    }

    fn render(&mut self, time: f64, output_rate: f64, stop_step: f32) -> f32 {
        if self.finished || time < self.start_time {
            return 0.0;
        }

        let elapsed = self.elapsed_frames as f64 / output_rate;
        if elapsed >= self.audible
            || self.position < self.region_start
            || self.position > self.region_end
        {
            self.finished = true;
            return 0.0;
        }

        if self.stop_at.is_some_and(|stop| time >= stop) {
            self.stop_gain -= stop_step;
            if self.stop_gain <= 0.0 {
                self.finished = true;
                return 0.0;
            }
        }

        // Linear interpolation
        let idx = self.position as usize;
        let frac = (self.position - idx as f64) as f32;
        let s0 = self.buffer.get(idx).copied().unwrap_or(0.0);
        let s1 = self.buffer.get(idx + 1).copied().unwrap_or(s0);
        let sample = s0 + frac * (s1 - s0);

        self.position += self.increment;
        self.elapsed_frames += 1;

        sample * self.envelope(elapsed) * self.stop_gain
    }
}

/// Mixes scheduled voices through their gain stages into an interleaved
/// output buffer. The audio clock is the number of frames rendered so far.
pub struct Renderer {
    sample_rate: u32,
    frames_rendered: u64,
    next_id: u64,
    gains: HashMap<GainId, GainStage>,
    voices: HashMap<VoiceHandle, RenderVoice>,
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("sample_rate", &self.sample_rate)
            .field("time", &self.current_time())
            .field("gains", &self.gains.len())
            .field("voices", &self.voices.len())
            .finish()
    }
}

impl Renderer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            frames_rendered: 0,
            next_id: 1,
            gains: HashMap::new(),
            voices: HashMap::new(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn current_time(&self) -> f64 {
        self.frames_rendered as f64 / self.sample_rate as f64
    }

    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    pub fn gain_count(&self) -> usize {
        self.gains.len()
    }

    /// Current (slewed) value of a gain stage
    pub fn gain_value(&self, gain: GainId) -> Option<f32> {
        self.gains.get(&gain).map(|g| g.value)
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn create_gain(&mut self, initial: f32) -> GainId {
        let id = GainId(self.allocate_id());
        self.gains.insert(id, GainStage::new(initial.max(0.0)));
        id
    }

    pub fn set_gain(&mut self, gain: GainId, value: f32, at: f64) -> Result<(), BackendError> {
        let stage = self
            .gains
            .get_mut(&gain)
            .ok_or(BackendError::UnknownGain(gain))?;
        stage.schedule(at, value.max(0.0));
        Ok(())
    }

    pub fn cancel_gain_ramps(&mut self, gain: GainId, from: f64) -> Result<(), BackendError> {
        let stage = self
            .gains
            .get_mut(&gain)
            .ok_or(BackendError::UnknownGain(gain))?;
        stage.events.retain(|(t, _)| *t < from);
        Ok(())
    }

    pub fn remove_gain(&mut self, gain: GainId) {
        self.gains.remove(&gain);
    }

    pub fn start_voice(&mut self, request: VoiceRequest) -> Result<VoiceHandle, BackendError> {
        request.validate()?;
        if !self.gains.contains_key(&request.output) {
            return Err(BackendError::UnknownGain(request.output));
        }
        let handle = VoiceHandle(self.allocate_id());
        self.voices
            .insert(handle, RenderVoice::new(request, self.sample_rate as f64));
        Ok(handle)
    }

    pub fn stop_voice(&mut self, voice: VoiceHandle, at: f64) {
        let Some(v) = self.voices.get_mut(&voice) else {
            return;
        };
        if at <= v.start_time && v.elapsed_frames == 0 {
            // Never started
            self.voices.remove(&voice);
            return;
        }
        v.stop_at = Some(v.stop_at.map_or(at, |s| s.min(at)));
    }

    pub fn release_voice(&mut self, voice: VoiceHandle) {
        self.voices.remove(&voice);
    }

    pub fn is_voice_active(&self, voice: VoiceHandle) -> bool {
        self.voices.get(&voice).is_some_and(|v| !v.finished)
    }

    pub fn cancel_scheduled(&mut self, from: f64) -> usize {
        let before = self.voices.len();
        self.voices
            .retain(|_, v| v.start_time < from || v.elapsed_frames > 0);
        let cancelled = before - self.voices.len();
        if cancelled > 0 {
            trace!(cancelled, from, "Cancelled scheduled voices");
        }
        cancelled
    }

    /// Render interleaved frames into `output`, advancing the clock by
    /// `output.len() / channels` frames.
    pub fn render(&mut self, output: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let rate = self.sample_rate as f64;
        let max_step = (1.0 / (GAIN_SLEW_SECONDS * rate)).min(1.0) as f32;
        let stop_step = (1.0 / (STOP_FADE_SECONDS * rate)).min(1.0) as f32;

        for frame in output.chunks_mut(channels) {
            let time = self.current_time();
            for stage in self.gains.values_mut() {
                stage.tick(time, max_step);
            }

            let mut mix = 0.0f32;
            for voice in self.voices.values_mut() {
                let sample = voice.render(time, rate, stop_step);
                if sample != 0.0 {
                    let gain = self.gains.get(&voice.output).map_or(0.0, |g| g.value);
                    mix += sample * gain;
                }
            }

            frame.fill((mix * MASTER_GAIN).clamp(-1.0, 1.0));
            self.frames_rendered += 1;
        }

        self.voices.retain(|_, v| !v.finished);
    }
}
