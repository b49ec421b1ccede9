//! Project state: sequences, tempo and the playback fields the transport owns

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::channel::{Channel, ChannelId, InstrumentChannel, SamplerChannel};
use crate::error::{CoreError, Result};
use crate::sequence::Sequence;
use crate::steps::{DEFAULT_STEP_COUNT, MAX_STEP_COUNT};

pub const DEFAULT_BPM: f64 = 120.0;

/// Which sequences the transport walks through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayMode {
    /// Loop the selected sequence
    Single,
    /// Play every sequence in order, wrapping at the end
    All,
}

fn default_bpm() -> f64 {
    DEFAULT_BPM
}

fn default_step_count() -> usize {
    DEFAULT_STEP_COUNT
}

/// Durable description of a project.
///
/// Every sequence holds the same number of channels with the same step count,
/// so switching sequences during playback never changes the grid shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectState {
    pub sequences: Vec<Sequence>,
    #[serde(default)]
    pub current_sequence_index: usize,
    #[serde(default = "default_bpm")]
    pub bpm: f64,
    #[serde(default = "default_step_count")]
    step_count: usize,
    #[serde(default)]
    next_channel_id: u64,
    /// Owned by the transport while playing
    #[serde(skip)]
    pub is_playing: bool,
    /// Owned by the transport while playing
    #[serde(skip)]
    pub play_mode: Option<PlayMode>,
}

impl Default for ProjectState {
    fn default() -> Self {
        Self::new(1, DEFAULT_STEP_COUNT)
    }
}

impl ProjectState {
    pub fn new(sequence_count: usize, step_count: usize) -> Self {
        Self {
            sequences: (0..sequence_count.max(1)).map(|_| Sequence::new()).collect(),
            current_sequence_index: 0,
            bpm: DEFAULT_BPM,
            step_count: step_count.clamp(1, MAX_STEP_COUNT),
            next_channel_id: 1,
            is_playing: false,
            play_mode: None,
        }
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn channel_count(&self) -> usize {
        self.sequences.first().map(|s| s.channels.len()).unwrap_or(0)
    }

    pub fn sequence(&self, index: usize) -> Option<&Sequence> {
        self.sequences.get(index)
    }

    pub fn sequence_mut(&mut self, index: usize) -> Option<&mut Sequence> {
        self.sequences.get_mut(index)
    }

    pub fn current_sequence(&self) -> Option<&Sequence> {
        self.sequences.get(self.current_sequence_index)
    }

    pub fn set_current_sequence(&mut self, index: usize) -> Result<()> {
        if index >= self.sequences.len() {
            return Err(CoreError::SequenceNotFound(index));
        }
        self.current_sequence_index = index;
        Ok(())
    }

    pub fn set_bpm(&mut self, bpm: f64) -> Result<()> {
        if !bpm.is_finite() || bpm <= 0.0 {
            return Err(CoreError::InvalidTempo(bpm));
        }
        self.bpm = bpm;
        Ok(())
    }

    fn allocate_id(&mut self) -> ChannelId {
        self.next_channel_id = self.next_channel_id.max(1);
        let id = ChannelId(self.next_channel_id);
        self.next_channel_id = self.next_channel_id.saturating_add(1);
        id
    }

    fn push_channel(&mut self, make: impl Fn(ChannelId) -> Channel) -> usize {
        let index = self.channel_count();
        for seq_idx in 0..self.sequences.len() {
            let id = self.allocate_id();
            self.sequences[seq_idx].channels.push(make(id));
        }
        index
    }

    /// Add a sampler channel to every sequence. Returns the channel index.
    pub fn add_sampler_channel(&mut self, sample_index: usize) -> usize {
        let steps = self.step_count;
        self.push_channel(|id| Channel::Sampler(SamplerChannel::new(id, steps, sample_index)))
    }

    /// Add an instrument channel to every sequence. Returns the channel index.
    pub fn add_instrument_channel(&mut self, instrument_id: Option<String>) -> usize {
        let steps = self.step_count;
        self.push_channel(|id| {
            let mut channel = InstrumentChannel::new(id, steps);
            channel.instrument_id = instrument_id.clone();
            Channel::Instrument(channel)
        })
    }

    /// Remove the channel at `index` from every sequence, returning the ids
    /// that were dropped.
    pub fn remove_channel(&mut self, index: usize) -> Result<Vec<ChannelId>> {
        if index >= self.channel_count() {
            return Err(CoreError::ChannelNotFound(index));
        }
        Ok(self
            .sequences
            .iter_mut()
            .map(|seq| seq.channels.remove(index).id())
            .collect())
    }

    /// Append an empty sequence shaped like the current one
    pub fn add_sequence(&mut self) -> usize {
        let template: Vec<Channel> = self
            .current_sequence()
            .map(|s| s.channels.clone())
            .unwrap_or_default();
        let channels = template
            .iter()
            .map(|c| {
                let id = self.allocate_id();
                c.blank_copy(id)
            })
            .collect();
        self.sequences.push(Sequence { channels });
        self.sequences.len() - 1
    }

    /// Insert a copy of sequence `index` right after it
    pub fn duplicate_sequence(&mut self, index: usize) -> Result<usize> {
        let mut copy = self
            .sequences
            .get(index)
            .cloned()
            .ok_or(CoreError::SequenceNotFound(index))?;
        for channel in &mut copy.channels {
            let id = self.allocate_id();
            channel.set_id(id);
        }
        self.sequences.insert(index + 1, copy);
        Ok(index + 1)
    }

    pub fn remove_sequence(&mut self, index: usize) -> Result<Sequence> {
        if index >= self.sequences.len() {
            return Err(CoreError::SequenceNotFound(index));
        }
        if self.sequences.len() == 1 {
            return Err(CoreError::LastSequence);
        }
        let removed = self.sequences.remove(index);
        if self.current_sequence_index >= self.sequences.len() || self.current_sequence_index > index {
            self.current_sequence_index = self.current_sequence_index.saturating_sub(1);
        }
        Ok(removed)
    }

    pub fn channel(&self, sequence: usize, channel: usize) -> Option<&Channel> {
        self.sequences.get(sequence)?.channels.get(channel)
    }

    pub fn channel_mut(&mut self, sequence: usize, channel: usize) -> Option<&mut Channel> {
        self.sequences.get_mut(sequence)?.channels.get_mut(channel)
    }

    fn channel_mut_checked(&mut self, sequence: usize, channel: usize) -> Result<&mut Channel> {
        let seq = self
            .sequences
            .get_mut(sequence)
            .ok_or(CoreError::SequenceNotFound(sequence))?;
        seq.channels
            .get_mut(channel)
            .ok_or(CoreError::ChannelNotFound(channel))
    }

    pub fn set_step(&mut self, sequence: usize, channel: usize, step: usize, lit: bool) -> Result<()> {
        let count = self.step_count;
        if step >= count {
            return Err(CoreError::StepOutOfRange { step, count });
        }
        self.channel_mut_checked(sequence, channel)?.steps_mut().set(step, lit);
        Ok(())
    }

    pub fn toggle_step(&mut self, sequence: usize, channel: usize, step: usize) -> Result<bool> {
        let count = self.step_count;
        if step >= count {
            return Err(CoreError::StepOutOfRange { step, count });
        }
        let steps = self.channel_mut_checked(sequence, channel)?.steps_mut();
        steps.toggle(step);
        Ok(steps.is_lit(step))
    }

    fn max_channel_id(&self) -> u64 {
        self.sequences
            .iter()
            .flat_map(|s| s.channels.iter().map(|c| c.id().0))
            .max()
            .unwrap_or(0)
    }

    /// True when no fresh channel id can be handed out any more
    pub fn ids_exhausted(&self) -> bool {
        self.next_channel_id == u64::MAX || self.max_channel_id() == u64::MAX
    }

    /// Repair a freshly loaded project so every invariant holds again:
    /// at least one sequence, a valid current index, a positive tempo,
    /// unique channel ids and equal grid shapes across sequences.
    pub fn normalize(&mut self) {
        if self.sequences.is_empty() {
            self.sequences.push(Sequence::new());
        }
        if self.current_sequence_index >= self.sequences.len() {
            self.current_sequence_index = 0;
        }
        if !self.bpm.is_finite() || self.bpm <= 0.0 {
            self.bpm = DEFAULT_BPM;
        }

        let longest = self.sequences.iter().map(|s| s.step_count()).max().unwrap_or(0);
        self.step_count = self.step_count.max(longest).clamp(1, MAX_STEP_COUNT);

        self.next_channel_id = self.next_channel_id.max(self.max_channel_id().saturating_add(1));

        let mut seen = HashSet::new();
        for seq_idx in 0..self.sequences.len() {
            for ch_idx in 0..self.sequences[seq_idx].channels.len() {
                let id = self.sequences[seq_idx].channels[ch_idx].id();
                if id.0 == 0 || !seen.insert(id) {
                    let fresh = self.allocate_id();
                    seen.insert(fresh);
                    self.sequences[seq_idx].channels[ch_idx].set_id(fresh);
                }
            }
        }

        let widest = self
            .sequences
            .iter()
            .enumerate()
            .max_by_key(|(_, s)| s.channels.len())
            .map(|(i, _)| i)
            .unwrap_or(0);
        let template = self.sequences[widest].channels.clone();
        for seq_idx in 0..self.sequences.len() {
            let have = self.sequences[seq_idx].channels.len();
            for channel in template.iter().skip(have) {
                let id = self.allocate_id();
                self.sequences[seq_idx].channels.push(channel.blank_copy(id));
            }
        }

        let steps = self.step_count;
        for channel in self.sequences.iter_mut().flat_map(|s| s.channels.iter_mut()) {
            channel.steps_mut().resize(steps);
            let mix = channel.mix_mut();
            mix.volume = if mix.volume.is_finite() { mix.volume.clamp(0.0, 1.0) } else { 1.0 };
            if let Channel::Sampler(sampler) = channel {
                sampler.sanitize();
            }
        }
    }
}
