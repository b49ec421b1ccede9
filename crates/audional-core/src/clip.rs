//! Recorded instrument clips

use serde::{Deserialize, Serialize};

pub const DEFAULT_NOTE_VELOCITY: f32 = 0.8;
pub const MIN_NOTE_DURATION: f64 = 0.001;

/// A note captured while an instrument was recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipNote {
    /// Note name, e.g. "C4"
    pub note: String,
    /// Start in seconds from the loop start
    pub start: f64,
    /// Duration in seconds
    pub dur: f64,
    /// Velocity (0.0 to 1.0)
    #[serde(default = "default_velocity")]
    pub vel: f32,
}

fn default_velocity() -> f32 {
    DEFAULT_NOTE_VELOCITY
}

impl ClipNote {
    pub fn new(note: impl Into<String>, start: f64, dur: f64, vel: f32) -> Self {
        Self {
            note: note.into(),
            start,
            dur,
            vel,
        }
    }
}

/// A note resolved to absolute audio-clock time
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledNote {
    pub note: String,
    pub time: f64,
    pub duration: f64,
    pub velocity: f32,
}

/// Loop of notes an instrument replays each time its channel fires
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstrumentClip {
    /// Notes sorted by start
    pub notes: Vec<ClipNote>,
    /// Tempo the notes were recorded at
    #[serde(default)]
    pub record_bpm: Option<f64>,
}

impl InstrumentClip {
    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    /// Add a note, keeping notes sorted by start
    pub fn add_note(&mut self, note: ClipNote) {
        let idx = self
            .notes
            .iter()
            .position(|n| n.start > note.start)
            .unwrap_or(self.notes.len());
        self.notes.insert(idx, note);
    }

    pub fn clear(&mut self) {
        self.notes.clear();
    }

    /// Stretch factor applied to recorded times when replaying at `bpm`
    pub fn time_scale(&self, bpm: f64) -> f64 {
        match self.record_bpm {
            Some(source) if source > 0.0 && bpm > 0.0 => source / bpm,
            _ => 1.0,
        }
    }

    /// Notes of this clip placed after `at_time`, scaled to the playing tempo
    pub fn schedule(&self, at_time: f64, bpm: f64) -> impl Iterator<Item = ScheduledNote> + '_ {
        let scale = self.time_scale(bpm);
        self.notes.iter().map(move |n| {
            let start = if n.start.is_finite() { n.start.max(0.0) } else { 0.0 };
            let dur = if n.dur.is_finite() { n.dur.max(MIN_NOTE_DURATION) } else { MIN_NOTE_DURATION };
            let velocity = if n.vel.is_finite() { n.vel.clamp(0.0, 1.0) } else { DEFAULT_NOTE_VELOCITY };
            ScheduledNote {
                note: n.note.clone(),
                time: at_time + start * scale,
                duration: dur * scale,
                velocity,
            }
        })
    }
}
