//! Channel gain policy: mute, sequence-scoped solo, volume

use std::collections::HashMap;

use audional_core::{Channel, ChannelId, Sequence};
use tracing::{trace, warn};

use crate::backend::{AudioBackend, BackendError, GainId};

/// Outcome of pushing a channel's target gain to the backend
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainUpdate {
    pub gain: GainId,
    pub previous: f32,
    pub target: f32,
}

impl GainUpdate {
    /// The channel just went from audible to silent
    pub fn silenced(&self) -> bool {
        self.previous > 0.0 && self.target <= 0.0
    }
}

#[derive(Debug, Clone, Copy)]
struct ChannelGain {
    id: GainId,
    value: f32,
}

/// One gain stage per channel, created on first use
#[derive(Debug, Default)]
pub struct ChannelMixer {
    gains: HashMap<ChannelId, ChannelGain>,
}

impl ChannelMixer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a lit step on `channel` should produce sound
    pub fn is_audible(channel: &Channel, sequence: &Sequence) -> bool {
        let mix = channel.mix();
        if mix.mute {
            return false;
        }
        if !mix.solo && sequence.has_solo() {
            return false;
        }
        mix.volume > 0.0
    }

    pub fn target_gain(channel: &Channel, sequence: &Sequence) -> f32 {
        let mix = channel.mix();
        if mix.mute || (!mix.solo && sequence.has_solo()) {
            return 0.0;
        }
        if mix.volume.is_finite() {
            mix.volume.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// Gain stage for `channel`, created at its target gain if missing
    pub fn ensure_gain(
        &mut self,
        backend: &mut dyn AudioBackend,
        channel: &Channel,
        sequence: &Sequence,
    ) -> GainId {
        let entry = self.gains.entry(channel.id()).or_insert_with(|| {
            let value = Self::target_gain(channel, sequence);
            ChannelGain {
                id: backend.create_gain(value),
                value,
            }
        });
        entry.id
    }

    /// Push the target gain of `channel` to the backend at `at`
    pub fn update_gain(
        &mut self,
        backend: &mut dyn AudioBackend,
        channel: &Channel,
        sequence: &Sequence,
        at: f64,
    ) -> Result<GainUpdate, BackendError> {
        let target = Self::target_gain(channel, sequence);
        let id = self.ensure_gain(backend, channel, sequence);
        let Some(entry) = self.gains.get_mut(&channel.id()) else {
            return Err(BackendError::UnknownGain(id));
        };
        let previous = entry.value;
        backend.cancel_gain_ramps(id, at)?;
        backend.set_gain(id, target, at)?;
        entry.value = target;
        trace!(channel = channel.id().0, previous, target, "Gain updated");
        Ok(GainUpdate {
            gain: id,
            previous,
            target,
        })
    }

    /// Refresh every channel of a sequence. Failures are logged and skipped.
    pub fn update_all(
        &mut self,
        backend: &mut dyn AudioBackend,
        sequence: &Sequence,
        at: f64,
    ) -> Vec<(ChannelId, GainUpdate)> {
        let mut updates = Vec::with_capacity(sequence.channels.len());
        for channel in &sequence.channels {
            match self.update_gain(backend, channel, sequence, at) {
                Ok(update) => updates.push((channel.id(), update)),
                Err(e) => warn!(channel = channel.id().0, error = %e, "Failed to update gain"),
            }
        }
        updates
    }

    pub fn gain_for(&self, channel: ChannelId) -> Option<GainId> {
        self.gains.get(&channel).map(|g| g.id)
    }

    /// Last gain value pushed for `channel`
    pub fn value_for(&self, channel: ChannelId) -> Option<f32> {
        self.gains.get(&channel).map(|g| g.value)
    }

    pub fn len(&self) -> usize {
        self.gains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gains.is_empty()
    }

    pub fn remove_channel(&mut self, backend: &mut dyn AudioBackend, channel: ChannelId) {
        if let Some(gain) = self.gains.remove(&channel) {
            backend.remove_gain(gain.id);
        }
    }

    pub fn dispose_all(&mut self, backend: &mut dyn AudioBackend) {
        for (_, gain) in self.gains.drain() {
            backend.remove_gain(gain.id);
        }
    }
}
