//! Transport state and step timing

use serde::{Deserialize, Serialize};

/// 16th-note grid
pub const STEPS_PER_BEAT: u32 = 4;

/// Transport playback state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransportState {
    #[default]
    Stopped,
    /// Waiting for the audio output to unlock
    Starting,
    Running,
}

impl TransportState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Events the transport broadcasts to instruments and other listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportEvent {
    Start,
    Stop,
}

impl TransportEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "transport-start",
            Self::Stop => "transport-stop",
        }
    }
}

/// Seconds per step at `bpm`
pub fn step_duration(bpm: f64, steps_per_beat: u32) -> f64 {
    60.0 / bpm / steps_per_beat.max(1) as f64
}

/// Seconds for one pass over `step_count` steps
pub fn loop_duration(bpm: f64, steps_per_beat: u32, step_count: usize) -> f64 {
    step_duration(bpm, steps_per_beat) * step_count as f64
}

/// Playback position published for UI consumption
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlaybackPosition {
    /// Step most recently scheduled, `None` while stopped
    pub step: Option<usize>,
    /// Sequence being played
    pub sequence: usize,
    /// Completed passes over the sequence grid
    pub cycle: u64,
}

impl PlaybackPosition {
    /// Format as `seq:step` for status lines
    pub fn format(&self) -> String {
        match self.step {
            Some(step) => format!("{:02}:{:02}", self.sequence + 1, step + 1),
            None => format!("{:02}:--", self.sequence + 1),
        }
    }
}
