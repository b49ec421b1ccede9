//! Instrument that loops a recorded clip through a note engine

use std::collections::HashMap;

use audional_core::clip::{DEFAULT_NOTE_VELOCITY, MIN_NOTE_DURATION};
use audional_core::{ClipNote, InstrumentClip, ScheduledNote, TransportEvent};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::rack::{InstrumentError, InstrumentState, LiveInstrument};

/// Sound source behind a [`ClipInstrument`]
pub trait NoteEngine: Send {
    fn play_note(&mut self, note: &ScheduledNote) -> Result<(), String>;

    fn release_all(&mut self);

    /// Engine parameters, opaque to the sequencer
    fn parameters(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn set_parameters(&mut self, _params: &serde_json::Value) -> Result<(), String> {
        Ok(())
    }
}

/// Persisted form of a clip instrument
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ClipPatch {
    #[serde(default)]
    params: serde_json::Value,
    #[serde(default)]
    loop_seconds: Option<f64>,
}

/// Notes held while recording, keyed by note name
#[derive(Debug, Default)]
struct Take {
    /// Audio-clock time of the first note; the loop is anchored here
    anchor: Option<f64>,
    held: HashMap<String, (f64, f32)>,
    last_event: f64,
}

/// Plays its clip each time its channel fires and records new notes while
/// the transport runs.
///
/// Arm it, start the transport, and every `note_on`/`note_off` pair lands in
/// the clip relative to the first recorded note. Stopping the transport closes
/// held notes and returns to idle.
pub struct ClipInstrument<E: NoteEngine> {
    name: String,
    engine: E,
    clip: InstrumentClip,
    state: InstrumentState,
    take: Option<Take>,
    record_bpm: Option<f64>,
    /// Recorded start times wrap at this length
    loop_seconds: Option<f64>,
    disposed: bool,
}

impl<E: NoteEngine> ClipInstrument<E> {
    pub fn new(name: impl Into<String>, engine: E) -> Self {
        Self {
            name: name.into(),
            engine,
            clip: InstrumentClip::default(),
            state: InstrumentState::Idle,
            take: None,
            record_bpm: None,
            loop_seconds: None,
            disposed: false,
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn set_loop_seconds(&mut self, seconds: Option<f64>) {
        self.loop_seconds = seconds.filter(|s| s.is_finite() && *s > 0.0);
    }

    fn wrap(&self, start: f64) -> f64 {
        match self.loop_seconds {
            Some(len) => start.rem_euclid(len),
            None => start,
        }
    }

    fn begin_take(&mut self) {
        self.state = InstrumentState::Recording;
        self.clip.record_bpm = self.record_bpm;
        self.take = Some(Take::default());
        info!(name = %self.name, "Recording started");
    }

    /// Close held notes at the last event seen and return to idle
    fn finish_take(&mut self) {
        if let Some(take) = self.take.take() {
            if let Some(anchor) = take.anchor {
                let end = take.last_event - anchor;
                for (note, (start, velocity)) in take.held {
                    let dur = (end - start).max(MIN_NOTE_DURATION);
                    let start = self.wrap(start);
                    self.clip.add_note(ClipNote::new(note, start, dur, velocity));
                }
            }
            info!(name = %self.name, notes = self.clip.notes.len(), "Recording finished");
        }
        self.state = InstrumentState::Idle;
    }
}

impl<E: NoteEngine> LiveInstrument for ClipInstrument<E> {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> InstrumentState {
        self.state
    }

    fn trigger_note_events(&mut self, at_time: f64, bpm: f64) -> Result<usize, InstrumentError> {
        if self.disposed {
            return Err(InstrumentError::Disposed);
        }
        let mut played = 0;
        for note in self.clip.schedule(at_time, bpm) {
            match self.engine.play_note(&note) {
                Ok(()) => played += 1,
                Err(e) => warn!(name = %self.name, note = %note.note, error = %e, "Note failed"),
            }
        }
        Ok(played)
    }

    fn release_all(&mut self) -> Result<(), InstrumentError> {
        if self.disposed {
            return Err(InstrumentError::Disposed);
        }
        self.engine.release_all();
        Ok(())
    }

    fn notify(&mut self, event: TransportEvent) -> Result<(), InstrumentError> {
        if self.disposed {
            return Err(InstrumentError::Disposed);
        }
        match event {
            TransportEvent::Start => {
                if self.state == InstrumentState::Armed {
                    self.begin_take();
                }
            }
            TransportEvent::Stop => {
                self.finish_take();
                self.engine.release_all();
            }
        }
        Ok(())
    }

    fn get_state(&self) -> serde_json::Value {
        let patch = ClipPatch {
            params: self.engine.parameters(),
            loop_seconds: self.loop_seconds,
        };
        serde_json::to_value(patch).unwrap_or(serde_json::Value::Null)
    }

    fn load_state(&mut self, patch: &serde_json::Value) -> Result<(), InstrumentError> {
        let patch: ClipPatch = serde_json::from_value(patch.clone())
            .map_err(|e| InstrumentError::InvalidPatch(e.to_string()))?;
        self.engine
            .set_parameters(&patch.params)
            .map_err(InstrumentError::InvalidPatch)?;
        self.set_loop_seconds(patch.loop_seconds);
        Ok(())
    }

    fn clip(&self) -> Option<InstrumentClip> {
        Some(self.clip.clone())
    }

    fn load_clip(&mut self, clip: &InstrumentClip) {
        self.clip = clip.clone();
    }

    fn arm(&mut self, bpm: f64) -> Result<(), InstrumentError> {
        if self.disposed {
            return Err(InstrumentError::Disposed);
        }
        if self.state == InstrumentState::Idle {
            self.state = InstrumentState::Armed;
            self.record_bpm = (bpm.is_finite() && bpm > 0.0).then_some(bpm);
            debug!(name = %self.name, "Armed for recording");
        }
        Ok(())
    }

    fn disarm(&mut self) {
        if self.state == InstrumentState::Armed {
            self.state = InstrumentState::Idle;
        }
    }

    fn note_on(&mut self, note: &str, velocity: f32, now: f64) {
        let Some(take) = self.take.as_mut() else {
            return;
        };
        let anchor = *take.anchor.get_or_insert(now);
        let velocity = if velocity.is_finite() {
            velocity.clamp(0.0, 1.0)
        } else {
            DEFAULT_NOTE_VELOCITY
        };
        take.held.insert(note.to_string(), (now - anchor, velocity));
        take.last_event = take.last_event.max(now);
    }

    fn note_off(&mut self, note: &str, now: f64) {
        let Some(take) = self.take.as_mut() else {
            return;
        };
        let Some(anchor) = take.anchor else {
            return;
        };
        if let Some((start, velocity)) = take.held.remove(note) {
            take.last_event = take.last_event.max(now);
            let dur = (now - anchor - start).max(MIN_NOTE_DURATION);
            let start = self.wrap(start);
            self.clip.add_note(ClipNote::new(note, start, dur, velocity));
        }
    }

    fn clear_clip(&mut self) {
        self.clip.clear();
    }

    fn dispose(&mut self) {
        if !self.disposed {
            self.take = None;
            self.state = InstrumentState::Idle;
            self.engine.release_all();
            self.disposed = true;
        }
    }
}

/// Note engine that only logs, for hosts without a synthesizer attached
#[derive(Debug, Default)]
pub struct TraceNoteEngine {
    played: usize,
}

impl TraceNoteEngine {
    pub fn played(&self) -> usize {
        self.played
    }
}

impl NoteEngine for TraceNoteEngine {
    fn play_note(&mut self, note: &ScheduledNote) -> Result<(), String> {
        self.played += 1;
        debug!(
            note = %note.note,
            time = note.time,
            duration = note.duration,
            velocity = note.velocity,
            "Note"
        );
        Ok(())
    }

    fn release_all(&mut self) {}
}
