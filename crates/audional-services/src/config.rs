//! Engine timing configuration

use std::time::Duration;

use audional_core::STEPS_PER_BEAT;

pub const DEFAULT_LOOKAHEAD: f64 = 0.12;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(25);
pub const DEFAULT_START_DELAY: f64 = 0.1;
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Seconds ahead of the audio clock that steps are scheduled
    pub lookahead: f64,
    /// How often the host should call `poll`
    pub poll_interval: Duration,
    /// Gap between `start` and the first step
    pub start_delay: f64,
    /// Rate used when no device dictates one
    pub sample_rate: u32,
    pub steps_per_beat: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lookahead: DEFAULT_LOOKAHEAD,
            poll_interval: DEFAULT_POLL_INTERVAL,
            start_delay: DEFAULT_START_DELAY,
            sample_rate: DEFAULT_SAMPLE_RATE,
            steps_per_beat: STEPS_PER_BEAT,
        }
    }
}

impl EngineConfig {
    /// Replace unusable values with defaults
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if !self.lookahead.is_finite() || self.lookahead <= 0.0 {
            self.lookahead = defaults.lookahead;
        }
        if self.poll_interval.is_zero() {
            self.poll_interval = defaults.poll_interval;
        }
        if !self.start_delay.is_finite() || self.start_delay < 0.0 {
            self.start_delay = defaults.start_delay;
        }
        if self.sample_rate == 0 {
            self.sample_rate = defaults.sample_rate;
        }
        self.steps_per_beat = self.steps_per_beat.max(1);
        self
    }

    /// Lookahead must cover at least one poll or steps arrive late
    pub fn covers_poll_interval(&self) -> bool {
        self.lookahead >= self.poll_interval.as_secs_f64()
    }
}
