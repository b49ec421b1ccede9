//! Live instruments bound to instrument channels

use std::collections::BTreeMap;

use audional_core::{InstrumentClip, TransportEvent};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Error)]
pub enum InstrumentError {
    #[error("Instrument id must not be empty")]
    EmptyId,
    #[error("Instrument has been disposed")]
    Disposed,
    #[error("Invalid patch: {0}")]
    InvalidPatch(String),
    #[error("Instrument engine error: {0}")]
    Engine(String),
    #[error("No instrument registered as {0:?}")]
    NotFound(String),
    #[error("Instrument cannot {0}")]
    Unsupported(&'static str),
}

/// Recording state an instrument tracks privately
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstrumentState {
    #[default]
    Idle,
    /// Waiting for the transport to start before recording
    Armed,
    Recording,
}

/// An instrument engine the transport can drive.
///
/// The sequencer only ever tells an instrument when a step fires and when the
/// transport starts or stops. What the instrument plays is its own business.
pub trait LiveInstrument: Send {
    fn name(&self) -> &str;

    fn state(&self) -> InstrumentState;

    /// Play whatever the instrument has queued for one step at `at_time`.
    /// Returns the number of notes scheduled.
    fn trigger_note_events(&mut self, at_time: f64, bpm: f64) -> Result<usize, InstrumentError>;

    /// Silence every sounding note
    fn release_all(&mut self) -> Result<(), InstrumentError>;

    fn notify(&mut self, event: TransportEvent) -> Result<(), InstrumentError>;

    /// Snapshot of the instrument's parameters
    fn get_state(&self) -> serde_json::Value;

    fn load_state(&mut self, patch: &serde_json::Value) -> Result<(), InstrumentError>;

    /// Recorded loop, for instruments that keep one
    fn clip(&self) -> Option<InstrumentClip> {
        None
    }

    fn load_clip(&mut self, _clip: &InstrumentClip) {}

    /// Record on the next transport start. Instruments without a recorder
    /// refuse.
    fn arm(&mut self, _bpm: f64) -> Result<(), InstrumentError> {
        Err(InstrumentError::Unsupported("record"))
    }

    fn disarm(&mut self) {}

    /// Key pressed at audio-clock time `now`
    fn note_on(&mut self, _note: &str, _velocity: f32, _now: f64) {}

    /// Key released at audio-clock time `now`
    fn note_off(&mut self, _note: &str, _now: f64) {}

    fn clear_clip(&mut self) {}

    fn dispose(&mut self);
}

/// Result of notifying every rack entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Instruments keyed by id
#[derive(Default)]
pub struct InstrumentRack {
    entries: BTreeMap<String, Box<dyn LiveInstrument>>,
}

impl std::fmt::Debug for InstrumentRack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentRack")
            .field("ids", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl InstrumentRack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instrument under `id`, disposing whatever held the id before
    pub fn register(
        &mut self,
        id: impl Into<String>,
        instrument: Box<dyn LiveInstrument>,
    ) -> Result<(), InstrumentError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(InstrumentError::EmptyId);
        }
        let name = instrument.name().to_string();
        if let Some(mut previous) = self.entries.insert(id.clone(), instrument) {
            debug!(id = %id, previous = %previous.name(), "Replacing instrument");
            previous.dispose();
        }
        info!(id = %id, name = %name, "Instrument registered");
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&dyn LiveInstrument> {
        self.entries.get(id).map(|i| i.as_ref())
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut (dyn LiveInstrument + 'static)> {
        self.entries.get_mut(id).map(|i| i.as_mut())
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fire the instrument bound under `id`. Unbound or unknown ids do nothing.
    pub fn trigger(&mut self, id: Option<&str>, at_time: f64, bpm: f64) -> Result<usize, InstrumentError> {
        let Some(instrument) = id.and_then(|id| self.entries.get_mut(id)) else {
            trace!(id = ?id, "No instrument bound, skipping trigger");
            return Ok(0);
        };
        instrument.trigger_note_events(at_time, bpm)
    }

    /// Release every note of one instrument. Unknown ids do nothing.
    pub fn release_all_for(&mut self, id: &str) -> Result<(), InstrumentError> {
        match self.entries.get_mut(id) {
            Some(instrument) => instrument.release_all(),
            None => Ok(()),
        }
    }

    fn entry_mut(&mut self, id: &str) -> Result<&mut Box<dyn LiveInstrument>, InstrumentError> {
        self.entries
            .get_mut(id)
            .ok_or_else(|| InstrumentError::NotFound(id.to_string()))
    }

    /// Arm the instrument under `id` to record from the next start
    pub fn arm(&mut self, id: &str, bpm: f64) -> Result<(), InstrumentError> {
        self.entry_mut(id)?.arm(bpm)?;
        debug!(id = %id, bpm, "Instrument armed");
        Ok(())
    }

    pub fn disarm(&mut self, id: &str) -> Result<(), InstrumentError> {
        self.entry_mut(id)?.disarm();
        Ok(())
    }

    pub fn note_on(&mut self, id: &str, note: &str, velocity: f32, now: f64) -> Result<(), InstrumentError> {
        self.entry_mut(id)?.note_on(note, velocity, now);
        Ok(())
    }

    pub fn note_off(&mut self, id: &str, note: &str, now: f64) -> Result<(), InstrumentError> {
        self.entry_mut(id)?.note_off(note, now);
        Ok(())
    }

    /// Notify every entry; a failing entry never stops the others
    pub fn broadcast(&mut self, event: TransportEvent) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for (id, instrument) in &mut self.entries {
            match instrument.notify(event) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(id = %id, event = event.name(), error = %e, "Instrument rejected transport event");
                }
            }
        }
        report
    }

    /// Remove and dispose the instrument under `id`
    pub fn remove(&mut self, id: &str) -> bool {
        match self.entries.remove(id) {
            Some(mut instrument) => {
                instrument.dispose();
                debug!(id = %id, "Instrument removed");
                true
            }
            None => false,
        }
    }

    pub fn dispose_all(&mut self) {
        let count = self.entries.len();
        for (_, mut instrument) in std::mem::take(&mut self.entries) {
            instrument.dispose();
        }
        if count > 0 {
            debug!(count, "Disposed all instruments");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Records every call it receives
    #[derive(Debug, Default)]
    pub(crate) struct CallLog {
        pub triggers: Vec<f64>,
        pub events: Vec<TransportEvent>,
        pub releases: usize,
        pub disposed: bool,
    }

    pub(crate) struct StubInstrument {
        pub name: String,
        pub log: Arc<Mutex<CallLog>>,
        pub fail_notify: bool,
        pub patch: serde_json::Value,
    }

    impl StubInstrument {
        pub fn new(name: &str) -> (Self, Arc<Mutex<CallLog>>) {
            let log = Arc::new(Mutex::new(CallLog::default()));
            let stub = Self {
                name: name.into(),
                log: log.clone(),
                fail_notify: false,
                patch: serde_json::Value::Null,
            };
            (stub, log)
        }
    }

    impl LiveInstrument for StubInstrument {
        fn name(&self) -> &str {
            &self.name
        }

        fn state(&self) -> InstrumentState {
            InstrumentState::Idle
        }

        fn trigger_note_events(&mut self, at_time: f64, _bpm: f64) -> Result<usize, InstrumentError> {
            self.log.lock().unwrap().triggers.push(at_time);
            Ok(1)
        }

        fn release_all(&mut self) -> Result<(), InstrumentError> {
            self.log.lock().unwrap().releases += 1;
            Ok(())
        }

        fn notify(&mut self, event: TransportEvent) -> Result<(), InstrumentError> {
            if self.fail_notify {
                return Err(InstrumentError::Engine("listener exploded".into()));
            }
            self.log.lock().unwrap().events.push(event);
            Ok(())
        }

        fn get_state(&self) -> serde_json::Value {
            self.patch.clone()
        }

        fn load_state(&mut self, patch: &serde_json::Value) -> Result<(), InstrumentError> {
            self.patch = patch.clone();
            Ok(())
        }

        fn dispose(&mut self) {
            self.log.lock().unwrap().disposed = true;
        }
    }

    #[test]
    fn test_register_rejects_empty_id() {
        let mut rack = InstrumentRack::new();
        let (stub, _) = StubInstrument::new("synth");
        assert!(matches!(rack.register("  ", Box::new(stub)), Err(InstrumentError::EmptyId)));
        assert!(rack.is_empty());
    }

    #[test]
    fn test_rebind_disposes_previous() {
        let mut rack = InstrumentRack::new();
        let (first, first_log) = StubInstrument::new("first");
        let (second, second_log) = StubInstrument::new("second");
        rack.register("lead", Box::new(first)).unwrap();
        rack.register("lead", Box::new(second)).unwrap();

        assert_eq!(rack.len(), 1);
        assert_eq!(rack.get("lead").map(|i| i.name().to_string()), Some("second".into()));
        assert!(first_log.lock().unwrap().disposed);
        assert!(!second_log.lock().unwrap().disposed);
    }

    #[test]
    fn test_missing_instrument_is_noop() {
        let mut rack = InstrumentRack::new();
        assert_eq!(rack.trigger(Some("ghost"), 1.0, 120.0).unwrap(), 0);
        assert_eq!(rack.trigger(None, 1.0, 120.0).unwrap(), 0);
        assert!(rack.release_all_for("ghost").is_ok());
        assert!(!rack.remove("ghost"));
    }

    #[test]
    fn test_trigger_passes_time() {
        let mut rack = InstrumentRack::new();
        let (stub, log) = StubInstrument::new("bass");
        rack.register("bass", Box::new(stub)).unwrap();
        assert_eq!(rack.trigger(Some("bass"), 2.5, 120.0).unwrap(), 1);
        assert_eq!(log.lock().unwrap().triggers, vec![2.5]);
    }

    #[test]
    fn test_broadcast_isolates_failures() {
        let mut rack = InstrumentRack::new();
        let (mut bad, _) = StubInstrument::new("bad");
        bad.fail_notify = true;
        let (good, good_log) = StubInstrument::new("good");
        // "a-bad" sorts before "b-good" so the failure happens first
        rack.register("a-bad", Box::new(bad)).unwrap();
        rack.register("b-good", Box::new(good)).unwrap();

        let report = rack.broadcast(TransportEvent::Start);
        assert_eq!(report, BroadcastReport { delivered: 1, failed: 1 });
        assert_eq!(good_log.lock().unwrap().events, vec![TransportEvent::Start]);
    }

    #[test]
    fn test_dispose_all() {
        let mut rack = InstrumentRack::new();
        let (stub, log) = StubInstrument::new("pad");
        rack.register("pad", Box::new(stub)).unwrap();
        rack.dispose_all();
        assert!(rack.is_empty());
        assert!(log.lock().unwrap().disposed);
    }

    #[test]
    fn test_arm_needs_a_recorder() {
        let mut rack = InstrumentRack::new();
        let (stub, _) = StubInstrument::new("drums");
        rack.register("drums", Box::new(stub)).unwrap();
        assert!(matches!(rack.arm("drums", 120.0), Err(InstrumentError::Unsupported(_))));
        assert!(matches!(rack.arm("ghost", 120.0), Err(InstrumentError::NotFound(_))));
        assert!(rack.note_on("drums", "C4", 1.0, 0.0).is_ok());
        assert!(matches!(rack.note_off("ghost", "C4", 0.0), Err(InstrumentError::NotFound(_))));
    }
}
