//! Lookahead transport scheduler
//!
//! The host calls [`TransportScheduler::poll`] from a coarse timer (every
//! `poll_interval`). Each poll schedules every step whose start falls inside
//! the lookahead window, stamped with its exact audio-clock time, so timer
//! jitter never reaches the audio.

use std::cmp::Ordering;
use std::collections::{BTreeSet, VecDeque};

use audional_core::{
    step_duration, Channel, ChannelMix, CoreError, PlayMode, PlaybackPosition, ProjectState,
    TransportEvent, TransportState, DEFAULT_BPM,
};
use crossbeam_channel::Receiver;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::backend::{AudioBackend, BackendError};
use crate::broadcast::TransportBus;
use crate::config::EngineConfig;
use crate::mixer::ChannelMixer;
use crate::rack::{InstrumentError, InstrumentRack, LiveInstrument};
use crate::sample_bank::SampleBank;
use crate::voice_pool::{PoolStats, VoicePool};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Audio backend error: {0}")]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("Instrument error: {0}")]
    Instrument(#[from] InstrumentError),
    #[error("Channel {0} is not an instrument channel")]
    NotInstrumentChannel(usize),
}

/// Something the audio clock has to reach before the published position moves
#[derive(Debug, Clone, Copy, PartialEq)]
enum Mark {
    Step {
        at: f64,
        step: usize,
        cycle: u64,
        sequence: usize,
    },
    /// Play-all moves on to `sequence`
    Advance { at: f64, sequence: usize },
}

impl Mark {
    fn at(&self) -> f64 {
        match self {
            Self::Step { at, .. } | Self::Advance { at, .. } => *at,
        }
    }
}

/// Transient state rebuilt from the project, never persisted
#[derive(Debug, Default)]
struct Runtime {
    voices: VoicePool,
    mixer: ChannelMixer,
    rack: InstrumentRack,
    bus: TransportBus,
    position: PlaybackPosition,
    output_unlocked: bool,
}

/// Snapshot for status displays and debug logs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Diagnostics {
    pub state: TransportState,
    pub position: PlaybackPosition,
    pub bpm: f64,
    pub voices: PoolStats,
    pub gains: usize,
    pub instruments: usize,
    pub subscribers: usize,
    pub pending_marks: usize,
}

/// Owns the project and everything needed to play it
pub struct TransportScheduler<B: AudioBackend> {
    config: EngineConfig,
    backend: B,
    project: ProjectState,
    samples: SampleBank,
    runtime: Runtime,
    state: TransportState,
    /// Audio-clock time of the first step not yet scheduled
    next_step_time: f64,
    /// Steps scheduled since start
    tick_counter: u64,
    /// Sequence the lookahead resolves steps against in play-all mode
    schedule_sequence: usize,
    marks: VecDeque<Mark>,
}

impl<B: AudioBackend> TransportScheduler<B> {
    pub fn new(backend: B, mut project: ProjectState, samples: SampleBank, config: EngineConfig) -> Self {
        project.normalize();
        project.is_playing = false;
        project.play_mode = None;
        let position = PlaybackPosition {
            step: None,
            sequence: project.current_sequence_index,
            cycle: 0,
        };
        Self {
            config: config.sanitized(),
            backend,
            project,
            samples,
            runtime: Runtime {
                position,
                ..Runtime::default()
            },
            state: TransportState::Stopped,
            next_step_time: 0.0,
            tick_counter: 0,
            schedule_sequence: 0,
            marks: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn project(&self) -> &ProjectState {
        &self.project
    }

    /// Direct project access for step and sample edits. Mix changes made
    /// here take effect after [`Self::refresh_gains`].
    pub fn project_mut(&mut self) -> &mut ProjectState {
        &mut self.project
    }

    pub fn samples(&self) -> &SampleBank {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut SampleBank {
        &mut self.samples
    }

    pub fn rack(&self) -> &InstrumentRack {
        &self.runtime.rack
    }

    pub fn rack_mut(&mut self) -> &mut InstrumentRack {
        &mut self.runtime.rack
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn position(&self) -> PlaybackPosition {
        self.runtime.position
    }

    /// Step currently sounding, `None` while stopped or before the first step
    pub fn current_step_index(&self) -> Option<usize> {
        self.runtime.position.step
    }

    pub fn current_playback_sequence_index(&self) -> usize {
        self.runtime.position.sequence
    }

    pub fn subscribe(&mut self) -> Receiver<TransportEvent> {
        self.runtime.bus.subscribe()
    }

    fn step_duration(&self) -> f64 {
        let bpm = if self.project.bpm.is_finite() && self.project.bpm > 0.0 {
            self.project.bpm
        } else {
            DEFAULT_BPM
        };
        step_duration(bpm, self.config.steps_per_beat)
    }

    /// Begin playback. The first call unlocks the audio output; if that
    /// fails the transport stays stopped and the error is returned.
    pub fn start(&mut self, mode: PlayMode) -> Result<(), EngineError> {
        if self.state != TransportState::Stopped {
            debug!("Start ignored, transport already running");
            return Ok(());
        }

        self.state = TransportState::Starting;
        if !self.runtime.output_unlocked {
            if let Err(e) = self.backend.unlock() {
                self.state = TransportState::Stopped;
                warn!(error = %e, "Audio output failed to unlock");
                return Err(e.into());
            }
            self.runtime.output_unlocked = true;
            info!("Audio output unlocked");
        }

        let sequence = self.project.current_sequence_index;
        self.project.is_playing = true;
        self.project.play_mode = Some(mode);
        self.schedule_sequence = sequence;
        self.runtime.position = PlaybackPosition {
            step: None,
            sequence,
            cycle: 0,
        };
        self.tick_counter = 0;
        self.marks.clear();
        self.next_step_time = self.backend.current_time() + self.config.start_delay;

        self.refresh_sequence_gains(sequence);
        self.broadcast(TransportEvent::Start);
        self.state = TransportState::Running;
        info!(
            mode = ?mode,
            bpm = self.project.bpm,
            sequence,
            first_step_at = self.next_step_time,
            "Transport started"
        );

        self.poll();
        Ok(())
    }

    /// Stop playback and cancel everything not yet sounding. Safe to call
    /// at any time, any number of times.
    pub fn stop(&mut self) {
        if self.state == TransportState::Stopped {
            return;
        }

        self.marks.clear();
        let now = self.backend.current_time();
        let cancelled = self.backend.cancel_scheduled(now);
        self.broadcast(TransportEvent::Stop);

        self.project.is_playing = false;
        self.project.play_mode = None;
        self.runtime.position.step = None;
        self.tick_counter = 0;
        self.state = TransportState::Stopped;
        info!(cancelled, "Transport stopped");
    }

    /// Change tempo. Steps already scheduled keep their times; the next
    /// unscheduled step stays where it was and later steps use the new
    /// spacing.
    pub fn set_tempo(&mut self, bpm: f64) -> Result<(), EngineError> {
        self.project.set_bpm(bpm)?;
        info!(bpm, "Tempo changed");
        Ok(())
    }

    /// Select the sequence played in single mode
    pub fn set_current_sequence(&mut self, index: usize) -> Result<(), EngineError> {
        self.project.set_current_sequence(index)?;
        if self.project.play_mode != Some(PlayMode::All) {
            self.refresh_sequence_gains(index);
        }
        Ok(())
    }

    /// Schedule every step inside the lookahead window. Returns the number
    /// of steps scheduled.
    pub fn poll(&mut self) -> usize {
        if !self.state.is_running() {
            return 0;
        }

        let now = self.backend.current_time();
        self.apply_marks(now);

        if self.next_step_time + self.config.lookahead < now {
            let behind = now - self.next_step_time;
            let skipped = self.skip_missed_steps(now);
            warn!(behind, skipped, "Scheduler fell behind the audio clock, skipping missed steps");
        }

        let horizon = now + self.config.lookahead;
        let mut scheduled = 0;
        while self.next_step_time < horizon {
            let at = self.next_step_time;
            self.schedule_step(at);
            self.next_step_time = at + self.step_duration();
            scheduled += 1;
        }

        self.runtime.voices.collect(&mut self.backend, now);
        scheduled
    }

    /// Move past every step that should already have started, keeping the
    /// step grid and play-all sequence order aligned. Nothing is dispatched.
    fn skip_missed_steps(&mut self, now: f64) -> u64 {
        let steps = self.project.step_count().max(1) as u64;
        let all = self.project.play_mode == Some(PlayMode::All);
        let mut skipped = 0;
        while self.next_step_time < now {
            if all && self.tick_counter % steps == steps - 1 {
                self.schedule_sequence = (self.schedule_sequence + 1) % self.project.sequences.len().max(1);
                self.runtime.position.sequence = self.schedule_sequence;
            }
            self.tick_counter += 1;
            self.next_step_time += self.step_duration();
            skipped += 1;
        }
        skipped
    }

    fn apply_marks(&mut self, now: f64) {
        while self.marks.front().is_some_and(|m| m.at() <= now) {
            let Some(mark) = self.marks.pop_front() else {
                break;
            };
            match mark {
                Mark::Step {
                    step,
                    cycle,
                    sequence,
                    ..
                } => {
                    let position = &mut self.runtime.position;
                    position.step = Some(step);
                    position.cycle = cycle;
                    position.sequence = sequence;
                    if step == 0 {
                        let diagnostics = self.diagnostics();
                        debug!(
                            sequence,
                            cycle,
                            voices = diagnostics.voices.slots,
                            busy = diagnostics.voices.busy,
                            instruments = diagnostics.instruments,
                            "Loop start"
                        );
                    }
                }
                Mark::Advance { sequence, .. } => {
                    self.runtime.position.sequence = sequence;
                    debug!(sequence, "Advanced to next sequence");
                }
            }
        }
    }

    fn scheduling_sequence(&self) -> usize {
        match self.project.play_mode {
            Some(PlayMode::All) => self.schedule_sequence,
            _ => self.project.current_sequence_index,
        }
    }

    fn schedule_step(&mut self, at: f64) {
        let steps = self.project.step_count().max(1) as u64;
        let step = (self.tick_counter % steps) as usize;
        let cycle = self.tick_counter / steps;
        let sequence = self.scheduling_sequence();

        self.marks.push_back(Mark::Step {
            at,
            step,
            cycle,
            sequence,
        });
        self.dispatch_step(sequence, step, at);

        if self.project.play_mode == Some(PlayMode::All) && step as u64 == steps - 1 {
            let next = (sequence + 1) % self.project.sequences.len().max(1);
            self.schedule_sequence = next;
            self.marks.push_back(Mark::Advance {
                at: at + self.step_duration(),
                sequence: next,
            });
        }

        self.tick_counter += 1;
    }

    /// Fire every audible lit channel of one step. Failures are logged per
    /// channel and never abort the step.
    fn dispatch_step(&mut self, sequence_index: usize, step: usize, at: f64) {
        let Self {
            project,
            runtime,
            backend,
            samples,
            ..
        } = self;

        let Some(sequence) = project.sequence(sequence_index) else {
            trace!(sequence = sequence_index, "No such sequence, nothing to play");
            return;
        };
        let bpm = project.bpm;

        for (channel_index, channel) in sequence.lit_channels(step) {
            if !ChannelMixer::is_audible(channel, sequence) {
                continue;
            }
            let result: Result<(), EngineError> = match channel {
                Channel::Sampler(sampler) => {
                    let output = runtime.mixer.ensure_gain(backend, channel, sequence);
                    let reverse = sampler.steps.is_reversed(step);
                    runtime
                        .voices
                        .trigger(backend, samples, sampler, output, at, reverse)
                        .map(|_| ())
                        .map_err(Into::into)
                }
                Channel::Instrument(instrument) => runtime
                    .rack
                    .trigger(instrument.instrument_id.as_deref(), at, bpm)
                    .map(|_| ())
                    .map_err(Into::into),
            };
            match result {
                Ok(()) => trace!(channel = channel_index, step, at, "Dispatched"),
                Err(e) => warn!(channel = channel_index, step, error = %e, "Dispatch failed"),
            }
        }
    }

    fn broadcast(&mut self, event: TransportEvent) {
        let report = self.runtime.rack.broadcast(event);
        let subscribers = self.runtime.bus.broadcast(event);
        debug!(
            event = event.name(),
            instruments = report.delivered,
            failed = report.failed,
            subscribers,
            "Transport event sent"
        );
    }

    fn edit_mix(
        &mut self,
        sequence: usize,
        channel: usize,
        edit: impl FnOnce(&mut ChannelMix),
    ) -> Result<(), EngineError> {
        let seq = self
            .project
            .sequence_mut(sequence)
            .ok_or(CoreError::SequenceNotFound(sequence))?;
        let target = seq
            .channel_mut(channel)
            .ok_or(CoreError::ChannelNotFound(channel))?;
        edit(target.mix_mut());
        self.refresh_sequence_gains(sequence);
        Ok(())
    }

    pub fn set_mute(&mut self, sequence: usize, channel: usize, mute: bool) -> Result<(), EngineError> {
        self.edit_mix(sequence, channel, |mix| mix.mute = mute)
    }

    pub fn set_solo(&mut self, sequence: usize, channel: usize, solo: bool) -> Result<(), EngineError> {
        self.edit_mix(sequence, channel, |mix| mix.solo = solo)
    }

    pub fn set_volume(&mut self, sequence: usize, channel: usize, volume: f32) -> Result<(), EngineError> {
        if !volume.is_finite() {
            warn!(volume, "Ignoring non-finite volume");
            return Ok(());
        }
        self.edit_mix(sequence, channel, |mix| mix.volume = volume.clamp(0.0, 1.0))
    }

    /// Push every channel gain of one sequence to the backend, silencing
    /// channels that just became inaudible.
    fn refresh_sequence_gains(&mut self, sequence_index: usize) {
        let Self {
            project,
            runtime,
            backend,
            ..
        } = self;
        let Some(sequence) = project.sequence(sequence_index) else {
            return;
        };
        let now = backend.current_time();

        for (id, update) in runtime.mixer.update_all(backend, sequence, now) {
            if !update.silenced() {
                continue;
            }
            runtime.voices.force_silence(backend, id, now);
            if let Some(Channel::Instrument(channel)) = sequence.channel_by_id(id) {
                if let Some(instrument_id) = channel.instrument_id.as_deref() {
                    if let Err(e) = runtime.rack.release_all_for(instrument_id) {
                        warn!(id = %instrument_id, error = %e, "Failed to release instrument");
                    }
                }
            }
        }
    }

    /// Re-evaluate every gain after edits made through [`Self::project_mut`]
    pub fn refresh_gains(&mut self) {
        for index in 0..self.project.sequences.len() {
            self.refresh_sequence_gains(index);
        }
    }

    fn instrument_ids_at(&self, channel: usize) -> BTreeSet<String> {
        self.project
            .sequences
            .iter()
            .filter_map(|s| match s.channel(channel) {
                Some(Channel::Instrument(c)) => c.instrument_id.clone(),
                _ => None,
            })
            .collect()
    }

    fn is_instrument_referenced(&self, id: &str) -> bool {
        self.project
            .sequences
            .iter()
            .flat_map(|s| s.channels.iter())
            .any(|c| matches!(c, Channel::Instrument(i) if i.instrument_id.as_deref() == Some(id)))
    }

    fn drop_unreferenced(&mut self, ids: impl IntoIterator<Item = String>) {
        for id in ids {
            if !self.is_instrument_referenced(&id) {
                self.runtime.rack.remove(&id);
            }
        }
    }

    /// Remove a channel from every sequence along with its voices, gain and
    /// any instrument no other channel uses.
    pub fn remove_channel(&mut self, channel: usize) -> Result<(), EngineError> {
        let instruments = self.instrument_ids_at(channel);
        let removed = self.project.remove_channel(channel)?;
        for id in &removed {
            self.runtime.voices.dispose_channel(&mut self.backend, *id);
            self.runtime.mixer.remove_channel(&mut self.backend, *id);
        }
        self.drop_unreferenced(instruments);
        self.refresh_gains();
        info!(channel, removed = removed.len(), "Channel removed");
        Ok(())
    }

    /// Remove a sequence along with the voices, gains and unshared
    /// instruments of its channels. Sequence indices held by the transport
    /// are moved down to follow the removal.
    pub fn remove_sequence(&mut self, index: usize) -> Result<(), EngineError> {
        let removed = self.project.remove_sequence(index)?;
        let len = self.project.sequences.len();
        let mut instruments = BTreeSet::new();
        for channel in &removed.channels {
            self.runtime.voices.dispose_channel(&mut self.backend, channel.id());
            self.runtime.mixer.remove_channel(&mut self.backend, channel.id());
            if let Channel::Instrument(c) = channel {
                instruments.extend(c.instrument_id.clone());
            }
        }
        self.drop_unreferenced(instruments);

        let follow = |sequence: usize| match sequence.cmp(&index) {
            Ordering::Greater => sequence - 1,
            Ordering::Equal => sequence % len,
            Ordering::Less => sequence,
        };
        self.schedule_sequence = follow(self.schedule_sequence);
        self.runtime.position.sequence = follow(self.runtime.position.sequence);
        for mark in &mut self.marks {
            match mark {
                Mark::Step { sequence, .. } | Mark::Advance { sequence, .. } => {
                    *sequence = follow(*sequence);
                }
            }
        }

        self.refresh_sequence_gains(self.scheduling_sequence());
        info!(sequence = index, channels = removed.channels.len(), "Sequence removed");
        Ok(())
    }

    /// Attach `instrument` to an instrument channel under `id`. The
    /// channel's saved patch and clip are loaded into it first.
    pub fn bind_instrument(
        &mut self,
        sequence: usize,
        channel: usize,
        id: impl Into<String>,
        mut instrument: Box<dyn LiveInstrument>,
    ) -> Result<(), EngineError> {
        let id = id.into();
        let target = match self.project.channel(sequence, channel) {
            Some(Channel::Instrument(c)) => c,
            Some(Channel::Sampler(_)) => return Err(EngineError::NotInstrumentChannel(channel)),
            None => return Err(CoreError::ChannelNotFound(channel).into()),
        };

        if let Some(patch) = &target.patch {
            if let Err(e) = instrument.load_state(patch) {
                warn!(id = %id, error = %e, "Saved patch rejected, using instrument defaults");
            }
        }
        if !target.clip.is_empty() {
            instrument.load_clip(&target.clip);
        }

        self.runtime.rack.register(id.clone(), instrument)?;

        let previous = match self.project.channel_mut(sequence, channel) {
            Some(Channel::Instrument(c)) => c.instrument_id.replace(id.clone()),
            _ => None,
        };
        if let Some(previous) = previous.filter(|p| *p != id) {
            self.drop_unreferenced([previous]);
        }
        Ok(())
    }

    /// Detach the instrument from a channel, saving its patch first.
    /// Returns the id that was bound.
    pub fn unbind_instrument(&mut self, sequence: usize, channel: usize) -> Result<Option<String>, EngineError> {
        self.sync_patches();
        let previous = match self.project.channel_mut(sequence, channel) {
            Some(Channel::Instrument(c)) => c.instrument_id.take(),
            Some(Channel::Sampler(_)) => return Err(EngineError::NotInstrumentChannel(channel)),
            None => return Err(CoreError::ChannelNotFound(channel).into()),
        };
        if let Some(id) = previous.clone() {
            self.drop_unreferenced([id]);
        }
        Ok(previous)
    }

    /// Arm the instrument under `id` to record from the next start at the
    /// project tempo
    pub fn arm_instrument(&mut self, id: &str) -> Result<(), EngineError> {
        let bpm = self.project.bpm;
        Ok(self.runtime.rack.arm(id, bpm)?)
    }

    pub fn disarm_instrument(&mut self, id: &str) -> Result<(), EngineError> {
        Ok(self.runtime.rack.disarm(id)?)
    }

    /// Feed a key press to the instrument under `id`, stamped with the
    /// current audio-clock time
    pub fn note_on(&mut self, id: &str, note: &str, velocity: f32) -> Result<(), EngineError> {
        let now = self.backend.current_time();
        Ok(self.runtime.rack.note_on(id, note, velocity, now)?)
    }

    pub fn note_off(&mut self, id: &str, note: &str) -> Result<(), EngineError> {
        let now = self.backend.current_time();
        Ok(self.runtime.rack.note_off(id, note, now)?)
    }

    /// Copy every bound instrument's patch and clip into the project
    pub fn sync_patches(&mut self) {
        let rack = &self.runtime.rack;
        for channel in self.project.sequences.iter_mut().flat_map(|s| s.channels.iter_mut()) {
            let Channel::Instrument(c) = channel else {
                continue;
            };
            let Some(instrument) = c.instrument_id.as_deref().and_then(|id| rack.get(id)) else {
                continue;
            };
            c.patch = Some(instrument.get_state());
            if let Some(clip) = instrument.clip() {
                c.clip = clip;
            }
        }
    }

    /// Replace the project, tearing down all runtime state first
    pub fn load_project(&mut self, project: ProjectState) {
        self.teardown();
        self.project = project;
        self.project.normalize();
        self.project.is_playing = false;
        self.project.play_mode = None;
        self.runtime.position = PlaybackPosition {
            step: None,
            sequence: self.project.current_sequence_index,
            cycle: 0,
        };
        info!(
            sequences = self.project.sequences.len(),
            channels = self.project.channel_count(),
            "Project loaded"
        );
    }

    /// Stop and release every voice, gain and instrument
    pub fn teardown(&mut self) {
        self.stop();
        self.runtime.voices.dispose_all(&mut self.backend);
        self.runtime.mixer.dispose_all(&mut self.backend);
        self.runtime.rack.dispose_all();
        debug!("Runtime state torn down");
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let now = self.backend.current_time();
        Diagnostics {
            state: self.state,
            position: self.runtime.position,
            bpm: self.project.bpm,
            voices: self.runtime.voices.stats(now),
            gains: self.runtime.mixer.len(),
            instruments: self.runtime.rack.len(),
            subscribers: self.runtime.bus.subscriber_count(),
            pending_marks: self.marks.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use audional_core::{ClipNote, InstrumentClip, SampleRegion};

    use super::*;
    use crate::backend::{GainId, OfflineBackend};
    use crate::clip_instrument::{ClipInstrument, TraceNoteEngine};
    use crate::rack::tests::{CallLog, StubInstrument};
    use crate::rack::InstrumentState;
    use crate::sample_bank::SampleBuffer;

    const RATE: u32 = 8000;
    const EPS: f64 = 1e-6;

    type Scheduler = TransportScheduler<OfflineBackend>;

    fn bank() -> SampleBank {
        let mut bank = SampleBank::new();
        bank.push(SampleBuffer::new("kick", vec![0.5; RATE as usize / 5], RATE));
        bank.push(SampleBuffer::new("hat", vec![0.25; RATE as usize / 10], RATE));
        bank
    }

    /// 64 steps, one kick channel lit on every beat
    fn kick_project(sequences: usize) -> ProjectState {
        let mut project = ProjectState::new(sequences, 64);
        project.add_sampler_channel(0);
        for step in (0..64).step_by(4) {
            project.set_step(0, 0, step, true).unwrap();
        }
        project
    }

    fn scheduler(project: ProjectState) -> Scheduler {
        TransportScheduler::new(OfflineBackend::new(RATE), project, bank(), EngineConfig::default())
    }

    /// Advance the clock one poll interval at a time, polling after each
    fn run_for(s: &mut Scheduler, seconds: f64) {
        let slice = s.config().poll_interval.as_secs_f64();
        let polls = (seconds / slice).round() as usize;
        for _ in 0..polls {
            s.backend_mut().advance(slice);
            s.poll();
        }
    }

    fn gain_of(s: &Scheduler, sequence: usize, channel: usize) -> GainId {
        let id = s.project().channel(sequence, channel).unwrap().id();
        s.runtime.mixer.gain_for(id).unwrap()
    }

    fn voice_times(s: &Scheduler, gain: GainId) -> Vec<f64> {
        s.backend().log().voices_on(gain).map(|v| v.start_time).collect()
    }

    #[test]
    fn test_kick_timing_scenario() {
        let mut s = scheduler(kick_project(1));
        s.start(PlayMode::Single).unwrap();
        run_for(&mut s, 8.0);

        let gain = gain_of(&s, 0, 0);
        let loop_end = 0.1 + 8.0 - EPS;
        let times: Vec<f64> = voice_times(&s, gain).into_iter().filter(|t| *t < loop_end).collect();

        assert_eq!(times.len(), 16);
        assert!((times[0] - 0.1).abs() < EPS);
        for pair in times.windows(2) {
            // Every fourth step at 0.125s per step
            assert!((pair[1] - pair[0] - 4.0 * 0.125).abs() < EPS);
        }
        assert!((times[15] - times[0] - 7.5).abs() < EPS);
    }

    #[test]
    fn test_every_step_scheduled_once() {
        let mut project = kick_project(1);
        for step in 0..64 {
            project.set_step(0, 0, step, true).unwrap();
        }
        let mut s = scheduler(project);
        s.start(PlayMode::Single).unwrap();
        run_for(&mut s, 2.0);

        let times = voice_times(&s, gain_of(&s, 0, 0));
        for pair in times.windows(2) {
            assert!((pair[1] - pair[0] - 0.125).abs() < EPS);
        }
    }

    #[test]
    fn test_first_step_after_start_delay() {
        let mut s = scheduler(kick_project(1));
        s.backend_mut().advance(1.0);
        s.start(PlayMode::Single).unwrap();
        let times = voice_times(&s, gain_of(&s, 0, 0));
        assert_eq!(times.len(), 1);
        assert!((times[0] - 1.1).abs() < EPS);
        assert_eq!(s.state(), TransportState::Running);
        assert!(s.project().is_playing);
    }

    #[test]
    fn test_position_follows_audio_clock() {
        let mut s = scheduler(kick_project(1));
        s.start(PlayMode::Single).unwrap();
        assert_eq!(s.current_step_index(), None);

        run_for(&mut s, 0.125);
        assert_eq!(s.current_step_index(), Some(0));

        run_for(&mut s, 0.25);
        assert_eq!(s.current_step_index(), Some(2));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut s = scheduler(kick_project(1));
        let events = s.subscribe();

        s.stop();
        assert!(events.try_recv().is_err());

        s.start(PlayMode::Single).unwrap();
        run_for(&mut s, 0.5);
        s.stop();
        s.stop();

        let received: Vec<_> = events.try_iter().collect();
        assert_eq!(received, vec![TransportEvent::Start, TransportEvent::Stop]);
        assert_eq!(s.state(), TransportState::Stopped);
        assert_eq!(s.current_step_index(), None);
        assert!(!s.project().is_playing);
        assert!(s.project().play_mode.is_none());
        assert_eq!(s.poll(), 0);
    }

    #[test]
    fn test_stop_cancels_scheduled_voices() {
        let mut project = kick_project(1);
        for step in 0..64 {
            project.set_step(0, 0, step, true).unwrap();
        }
        let mut s = scheduler(project);
        s.start(PlayMode::Single).unwrap();
        run_for(&mut s, 0.5);
        s.stop();

        // At least one step sat inside the lookahead window
        assert!(s.backend().log().cancelled >= 1);
        assert_eq!(s.diagnostics().pending_marks, 0);

        let before = s.backend().log().voices.len();
        run_for(&mut s, 1.0);
        assert_eq!(s.backend().log().voices.len(), before);
    }

    #[test]
    fn test_restart_is_clean() {
        let mut s = scheduler(kick_project(1));
        s.start(PlayMode::Single).unwrap();
        run_for(&mut s, 1.3);
        s.stop();
        let gain = gain_of(&s, 0, 0);
        let first_run: Vec<f64> = voice_times(&s, gain);
        s.backend_mut().take_log();

        let restart_at = s.backend().current_time();
        s.start(PlayMode::Single).unwrap();
        run_for(&mut s, 0.125);
        assert_eq!(s.current_step_index(), Some(0));
        run_for(&mut s, 1.2);
        s.stop();

        let second_run: Vec<f64> = voice_times(&s, gain).iter().map(|t| t - restart_at).collect();
        assert_eq!(first_run.len(), second_run.len());
        for (a, b) in first_run.iter().zip(&second_run) {
            assert!((a - b).abs() < EPS);
        }
    }

    #[test]
    fn test_unlock_failure_leaves_transport_stopped() {
        let backend = OfflineBackend::new(RATE).with_failing_unlock();
        let mut s = TransportScheduler::new(backend, kick_project(1), bank(), EngineConfig::default());
        let events = s.subscribe();

        assert!(matches!(s.start(PlayMode::Single), Err(EngineError::Backend(_))));
        assert_eq!(s.state(), TransportState::Stopped);
        assert!(!s.project().is_playing);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_unlock_happens_once() {
        let mut s = scheduler(kick_project(1));
        s.start(PlayMode::Single).unwrap();
        s.stop();
        s.start(PlayMode::Single).unwrap();
        s.start(PlayMode::All).unwrap();
        assert_eq!(s.backend().unlock_calls(), 1);
        // Second start while running changed nothing
        assert_eq!(s.project().play_mode, Some(PlayMode::Single));
    }

    #[test]
    fn test_tempo_change_never_double_fires() {
        let mut project = kick_project(1);
        for step in 0..64 {
            project.set_step(0, 0, step, true).unwrap();
        }
        let mut s = scheduler(project);
        s.start(PlayMode::Single).unwrap();
        run_for(&mut s, 0.5);

        let scheduled_before = s.tick_counter;
        let boundary = s.next_step_time;
        s.set_tempo(60.0).unwrap();
        assert_eq!(s.next_step_time, boundary);
        run_for(&mut s, 1.0);

        let times = voice_times(&s, gain_of(&s, 0, 0));
        assert_eq!(times.len() as u64, s.tick_counter);
        for pair in times.windows(2) {
            assert!(pair[1] > pair[0]);
        }
        let split = scheduled_before as usize;
        assert!((times[split] - boundary).abs() < EPS);
        // New spacing is 0.25s at 60 BPM
        assert!((times[split + 1] - times[split] - 0.25).abs() < EPS);
        assert!(matches!(s.set_tempo(0.0), Err(EngineError::Core(CoreError::InvalidTempo(_)))));
    }

    #[test]
    fn test_play_all_advances_sequences() {
        let mut project = ProjectState::new(3, 4);
        project.add_sampler_channel(0);
        for sequence in 0..3 {
            project.set_step(sequence, 0, 0, true).unwrap();
        }
        project.set_current_sequence(1).unwrap();
        let mut s = scheduler(project);

        s.start(PlayMode::All).unwrap();
        assert_eq!(s.current_playback_sequence_index(), 1);

        // One pass over 4 steps takes 0.5s
        run_for(&mut s, 0.625);
        assert_eq!(s.current_playback_sequence_index(), 2);
        run_for(&mut s, 0.5);
        assert_eq!(s.current_playback_sequence_index(), 0);

        let hits = |seq: usize| voice_times(&s, gain_of(&s, seq, 0));
        assert!((hits(1)[0] - 0.1).abs() < EPS);
        assert!((hits(2)[0] - 0.6).abs() < EPS);
        assert!((hits(0)[0] - 1.1).abs() < EPS);
    }

    #[test]
    fn test_single_mode_follows_selection() {
        let mut project = ProjectState::new(2, 4);
        project.add_sampler_channel(0);
        project.set_step(0, 0, 0, true).unwrap();
        project.set_step(1, 0, 0, true).unwrap();
        let mut s = scheduler(project);

        s.start(PlayMode::Single).unwrap();
        run_for(&mut s, 0.4);
        s.set_current_sequence(1).unwrap();
        run_for(&mut s, 0.5);

        assert_eq!(voice_times(&s, gain_of(&s, 0, 0)).len(), 1);
        assert_eq!(voice_times(&s, gain_of(&s, 1, 0)).len(), 1);
        assert!(s.set_current_sequence(5).is_err());
    }

    #[test]
    fn test_mute_cuts_immediately() {
        let mut s = scheduler(kick_project(1));
        s.start(PlayMode::Single).unwrap();
        run_for(&mut s, 0.125);

        let gain = gain_of(&s, 0, 0);
        let playing = s.backend().log().voices_on(gain).next().unwrap().handle;
        assert!(s.backend().is_voice_active(playing));

        let now = s.backend().current_time();
        s.set_mute(0, 0, true).unwrap();

        let stop = s.backend().log().stops.iter().find(|st| st.handle == playing).unwrap();
        assert_eq!(stop.at, now);
        let last_gain = s.backend().log().gains.last().unwrap();
        assert_eq!((last_gain.gain, last_gain.value), (gain, 0.0));

        // Muted channel dispatches nothing further
        let count = s.backend().log().voices.len();
        run_for(&mut s, 2.0);
        assert_eq!(s.backend().log().voices.len(), count);
    }

    #[test]
    fn test_solo_silences_siblings() {
        let mut project = kick_project(1);
        project.add_sampler_channel(1);
        for step in (0..64).step_by(4) {
            project.set_step(0, 1, step, true).unwrap();
        }
        let mut s = scheduler(project);
        s.set_solo(0, 1, true).unwrap();
        s.start(PlayMode::Single).unwrap();
        run_for(&mut s, 1.0);

        assert!(voice_times(&s, gain_of(&s, 0, 0)).is_empty());
        assert!(!voice_times(&s, gain_of(&s, 0, 1)).is_empty());
        assert_eq!(s.runtime.mixer.value_for(s.project().channel(0, 0).unwrap().id()), Some(0.0));
    }

    #[test]
    fn test_volume_edits() {
        let mut s = scheduler(kick_project(1));
        s.set_volume(0, 0, 3.0).unwrap();
        assert_eq!(s.project().channel(0, 0).unwrap().mix().volume, 1.0);
        s.set_volume(0, 0, f32::NAN).unwrap();
        assert_eq!(s.project().channel(0, 0).unwrap().mix().volume, 1.0);
        assert!(matches!(
            s.set_volume(4, 0, 0.5),
            Err(EngineError::Core(CoreError::SequenceNotFound(4)))
        ));
        assert!(matches!(
            s.set_mute(0, 9, true),
            Err(EngineError::Core(CoreError::ChannelNotFound(9)))
        ));
    }

    #[test]
    fn test_reversed_step_plays_backwards() {
        let mut project = kick_project(1);
        if let Some(Channel::Sampler(c)) = project.channel_mut(0, 0) {
            c.steps.set_reversed(4, true);
        }
        let mut s = scheduler(project);
        s.start(PlayMode::Single).unwrap();
        run_for(&mut s, 1.0);

        let reversed: Vec<bool> = s.backend().log().voices.iter().map(|v| v.reverse).collect();
        assert_eq!(&reversed[..3], &[false, true, false]);
    }

    #[test]
    fn test_region_scenario_through_scheduler() {
        let mut project = kick_project(1);
        if let Some(Channel::Sampler(c)) = project.channel_mut(0, 0) {
            c.selected_sample_index = 2;
            c.region = SampleRegion { start: 0.25, end: 0.5 };
            c.playback_rate = 2.0;
            c.fade_in = 0.5;
            c.fade_out = 1.0;
        }
        let mut s = scheduler(project);
        s.samples_mut().insert(2, SampleBuffer::new("loop", vec![0.1; RATE as usize * 4], RATE));
        s.start(PlayMode::Single).unwrap();

        let voice = &s.backend().log().voices[0];
        assert!((voice.offset - 1.0).abs() < EPS);
        assert!((voice.duration - 1.0).abs() < EPS);
        assert!((voice.audible_duration() - 0.5).abs() < EPS);
        assert!(voice.fade_in <= 0.25 + EPS);
        assert!(voice.fade_out <= 0.25 + EPS);
    }

    #[test]
    fn test_missing_sample_is_skipped() {
        let mut project = kick_project(1);
        if let Some(Channel::Sampler(c)) = project.channel_mut(0, 0) {
            c.selected_sample_index = 40;
        }
        let mut s = scheduler(project);
        s.start(PlayMode::Single).unwrap();
        run_for(&mut s, 1.0);
        assert!(s.backend().log().voices.is_empty());
        assert!(s.is_running());
    }

    fn instrument_project() -> ProjectState {
        let mut project = ProjectState::new(1, 16);
        project.add_instrument_channel(None);
        project.set_step(0, 0, 0, true).unwrap();
        project.set_step(0, 0, 8, true).unwrap();
        project
    }

    fn bind_stub(s: &mut Scheduler, id: &str) -> Arc<Mutex<CallLog>> {
        let (stub, log) = StubInstrument::new(id);
        s.bind_instrument(0, 0, id, Box::new(stub)).unwrap();
        log
    }

    #[test]
    fn test_instrument_triggered_at_step_time() {
        let mut s = scheduler(instrument_project());
        let log = bind_stub(&mut s, "lead");
        s.start(PlayMode::Single).unwrap();
        run_for(&mut s, 1.5);

        let log = log.lock().unwrap();
        assert_eq!(log.events, vec![TransportEvent::Start]);
        assert!((log.triggers[0] - 0.1).abs() < EPS);
        assert!((log.triggers[1] - 1.1).abs() < EPS);
    }

    #[test]
    fn test_unbound_instrument_channel_is_silent() {
        let mut s = scheduler(instrument_project());
        s.start(PlayMode::Single).unwrap();
        run_for(&mut s, 1.5);
        assert!(s.is_running());
        assert!(s.backend().log().voices.is_empty());
    }

    #[test]
    fn test_broadcast_isolation() {
        let mut project = instrument_project();
        project.add_instrument_channel(None);
        let mut s = scheduler(project);

        let (mut bad, _) = StubInstrument::new("bad");
        bad.fail_notify = true;
        s.bind_instrument(0, 0, "a-bad", Box::new(bad)).unwrap();
        let (good, good_log) = StubInstrument::new("good");
        s.bind_instrument(0, 1, "b-good", Box::new(good)).unwrap();
        let events = s.subscribe();

        s.start(PlayMode::Single).unwrap();
        s.stop();

        assert_eq!(
            good_log.lock().unwrap().events,
            vec![TransportEvent::Start, TransportEvent::Stop]
        );
        assert_eq!(events.try_iter().count(), 2);
    }

    #[test]
    fn test_mute_releases_instrument() {
        let mut s = scheduler(instrument_project());
        let log = bind_stub(&mut s, "pad");
        s.start(PlayMode::Single).unwrap();
        s.set_mute(0, 0, true).unwrap();
        assert_eq!(log.lock().unwrap().releases, 1);
        s.set_mute(0, 0, true).unwrap();
        assert_eq!(log.lock().unwrap().releases, 1);
    }

    #[test]
    fn test_bind_rejects_sampler_and_empty_id() {
        let mut s = scheduler(kick_project(1));
        let (stub, _) = StubInstrument::new("x");
        assert!(matches!(
            s.bind_instrument(0, 0, "x", Box::new(stub)),
            Err(EngineError::NotInstrumentChannel(0))
        ));

        let mut s = scheduler(instrument_project());
        let (stub, _) = StubInstrument::new("x");
        assert!(matches!(
            s.bind_instrument(0, 0, "", Box::new(stub)),
            Err(EngineError::Instrument(InstrumentError::EmptyId))
        ));
        assert!(s.rack().is_empty());
    }

    #[test]
    fn test_rebind_disposes_previous_instrument() {
        let mut s = scheduler(instrument_project());
        let first = bind_stub(&mut s, "one");
        let _second = bind_stub(&mut s, "two");
        assert!(first.lock().unwrap().disposed);
        assert!(!s.rack().contains("one"));
        assert!(s.rack().contains("two"));
    }

    #[test]
    fn test_bind_loads_saved_patch_and_clip() {
        let mut project = instrument_project();
        if let Some(Channel::Instrument(c)) = project.channel_mut(0, 0) {
            c.patch = Some(serde_json::json!({ "params": null, "loop_seconds": 4.0 }));
            let mut clip = InstrumentClip::default();
            clip.add_note(ClipNote::new("C4", 0.0, 0.1, 0.8));
            c.clip = clip;
        }
        let mut s = scheduler(project);
        let instrument = ClipInstrument::new("keys", TraceNoteEngine::default());
        s.bind_instrument(0, 0, "keys", Box::new(instrument)).unwrap();

        let bound = s.rack().get("keys").unwrap();
        assert_eq!(bound.get_state()["loop_seconds"], 4.0);
        assert_eq!(bound.clip().map(|c| c.notes.len()), Some(1));
    }

    #[test]
    fn test_armed_instrument_records_through_transport() {
        let mut s = scheduler(instrument_project());
        let instrument = ClipInstrument::new("keys", TraceNoteEngine::default());
        s.bind_instrument(0, 0, "keys", Box::new(instrument)).unwrap();

        s.arm_instrument("keys").unwrap();
        assert_eq!(s.rack().get("keys").unwrap().state(), InstrumentState::Armed);

        s.start(PlayMode::Single).unwrap();
        assert_eq!(s.rack().get("keys").unwrap().state(), InstrumentState::Recording);
        run_for(&mut s, 0.5);
        s.note_on("keys", "C4", 0.8).unwrap();
        run_for(&mut s, 0.25);
        s.note_off("keys", "C4").unwrap();

        s.stop();
        assert_eq!(s.rack().get("keys").unwrap().state(), InstrumentState::Idle);

        s.sync_patches();
        let Some(Channel::Instrument(c)) = s.project().channel(0, 0) else {
            panic!("expected instrument channel");
        };
        assert_eq!(c.clip.notes.len(), 1);
        assert_eq!(c.clip.notes[0].note, "C4");
        assert!((c.clip.notes[0].dur - 0.25).abs() < 1e-6);
        assert_eq!(c.clip.record_bpm, Some(s.project().bpm));
    }

    #[test]
    fn test_arm_unknown_instrument_fails() {
        let mut s = scheduler(instrument_project());
        assert!(matches!(
            s.arm_instrument("nobody"),
            Err(EngineError::Instrument(InstrumentError::NotFound(_)))
        ));
    }

    #[test]
    fn test_unbind_saves_patch() {
        let mut s = scheduler(instrument_project());
        let (mut stub, log) = StubInstrument::new("fm");
        stub.patch = serde_json::json!({ "ratio": 3 });
        s.bind_instrument(0, 0, "fm", Box::new(stub)).unwrap();

        assert_eq!(s.unbind_instrument(0, 0).unwrap(), Some("fm".to_string()));
        assert!(log.lock().unwrap().disposed);
        let Some(Channel::Instrument(c)) = s.project().channel(0, 0) else {
            panic!("expected instrument channel");
        };
        assert_eq!(c.patch, Some(serde_json::json!({ "ratio": 3 })));
        assert!(c.instrument_id.is_none());
    }

    #[test]
    fn test_remove_channel_disposes_runtime() {
        let mut project = kick_project(2);
        project.add_instrument_channel(None);
        let mut s = scheduler(project);
        let log = {
            let (stub, log) = StubInstrument::new("bass");
            s.bind_instrument(0, 1, "bass", Box::new(stub)).unwrap();
            log
        };
        s.start(PlayMode::Single).unwrap();
        run_for(&mut s, 0.2);
        let kick = s.project().channel(0, 0).unwrap().id();
        assert!(s.runtime.mixer.gain_for(kick).is_some());

        s.remove_channel(0).unwrap();
        assert!(s.runtime.mixer.gain_for(kick).is_none());
        assert!(!s.runtime.voices.has_channel(kick));
        assert!(s.rack().contains("bass"));

        s.remove_channel(0).unwrap();
        assert!(log.lock().unwrap().disposed);
        assert!(s.rack().is_empty());
        assert!(matches!(s.remove_channel(0), Err(EngineError::Core(CoreError::ChannelNotFound(0)))));
    }

    #[test]
    fn test_stall_skips_missed_steps() {
        let mut s = scheduler(kick_project(1));
        s.start(PlayMode::Single).unwrap();
        run_for(&mut s, 0.5);
        let gain = gain_of(&s, 0, 0);
        let before = voice_times(&s, gain).len();

        s.backend_mut().advance(2.0);
        let now = s.backend().current_time();
        s.poll();

        let late: Vec<f64> = voice_times(&s, gain).into_iter().skip(before).collect();
        assert!(!late.is_empty());
        for t in &late {
            assert!(*t >= now - EPS, "voice at {t} started before {now}");
            let beats = (t - 0.1) / 0.5;
            assert!((beats - beats.round()).abs() < 1e-6, "voice at {t} off the beat grid");
        }
    }

    #[test]
    fn test_remove_sequence_releases_gains() {
        let mut project = kick_project(3);
        project.add_sampler_channel(1);
        let mut s = scheduler(project);
        s.start(PlayMode::All).unwrap();
        run_for(&mut s, 2.0);
        s.refresh_gains();
        assert_eq!(s.diagnostics().gains, 6);
        let doomed = s.project().channel(2, 0).unwrap().id();

        s.remove_sequence(2).unwrap();
        s.remove_sequence(1).unwrap();

        assert_eq!(s.diagnostics().gains, 2);
        assert_eq!(s.backend().renderer().gain_count(), 2);
        assert!(s.runtime.mixer.gain_for(doomed).is_none());
        assert!(matches!(
            s.remove_sequence(0),
            Err(EngineError::Core(CoreError::LastSequence))
        ));
    }

    #[test]
    fn test_remove_playing_sequence_keeps_indices_valid() {
        let mut project = ProjectState::new(3, 16);
        project.add_instrument_channel(None);
        project.set_current_sequence(2).unwrap();
        let mut s = scheduler(project);
        let (stub, log) = StubInstrument::new("pad");
        s.bind_instrument(2, 0, "pad", Box::new(stub)).unwrap();
        s.start(PlayMode::All).unwrap();
        run_for(&mut s, 0.25);

        s.remove_sequence(2).unwrap();
        assert!(log.lock().unwrap().disposed);
        assert!(s.rack().is_empty());
        assert_eq!(s.project().current_sequence_index, 1);
        assert_eq!(s.current_playback_sequence_index(), 0);

        run_for(&mut s, 3.0);
        assert!(s.current_playback_sequence_index() < 2);
    }

    #[test]
    fn test_load_project_tears_down() {
        let mut s = scheduler(instrument_project());
        let log = bind_stub(&mut s, "lead");
        s.start(PlayMode::Single).unwrap();

        let mut next = kick_project(2);
        next.current_sequence_index = 9;
        s.load_project(next);

        assert_eq!(s.state(), TransportState::Stopped);
        assert!(log.lock().unwrap().disposed);
        assert!(s.rack().is_empty());
        assert_eq!(s.project().current_sequence_index, 0);
        assert_eq!(s.diagnostics().gains, 0);
    }

    #[test]
    fn test_diagnostics() {
        let mut s = scheduler(kick_project(1));
        let _rx = s.subscribe();
        s.start(PlayMode::Single).unwrap();
        run_for(&mut s, 0.2);
        let d = s.diagnostics();
        assert_eq!(d.state, TransportState::Running);
        assert_eq!(d.gains, 1);
        assert_eq!(d.subscribers, 1);
        assert_eq!(d.voices.channels, 1);
        assert_eq!(d.bpm, 120.0);
        assert_eq!(d.position.step, Some(0));
    }
}
