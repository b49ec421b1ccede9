//! Per-channel playback voices for sampler channels

use std::collections::HashMap;

use audional_core::channel::sanitize_playback_rate;
use audional_core::{ChannelId, SamplerChannel};
use tracing::{debug, trace, warn};

use crate::backend::{AudioBackend, BackendError, GainId, VoiceHandle, VoiceRequest};
use crate::sample_bank::SampleBank;

pub const MAX_OVERLAP_VOICES: usize = 8;
/// Extra time a voice stays reserved after its audible end
pub const RELEASE_TAIL: f64 = 0.05;
/// Channels with no busy voice for this long are reclaimed
pub const IDLE_TIMEOUT: f64 = 4.0;
/// Slack when deciding whether a slot is free at the trigger time
const REUSE_TOLERANCE: f64 = 0.004;

/// Where in the buffer a hit plays and for how long
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceTiming {
    /// Buffer seconds skipped before the region
    pub offset: f64,
    /// Buffer seconds inside the region
    pub selection: f64,
    /// Wall-clock seconds the hit sounds, after rate scaling
    pub audible: f64,
    pub fade_in: f64,
    pub fade_out: f64,
    pub playback_rate: f64,
}

impl VoiceTiming {
    /// Resolve a channel's region against a buffer of `buffer_duration`
    /// seconds. `None` when the region, rate or buffer cannot be played.
    pub fn resolve(channel: &SamplerChannel, buffer_duration: f64) -> Option<Self> {
        if !channel.region.is_finite() || !buffer_duration.is_finite() || buffer_duration <= 0.0 {
            return None;
        }
        let playback_rate = sanitize_playback_rate(channel.playback_rate)?;
        let region = channel.region.clamped();

        let offset = region.start * buffer_duration;
        let selection = region.span() * buffer_duration;
        let audible = selection / playback_rate;
        if !audible.is_finite() || audible <= 0.0 {
            return None;
        }

        let half = audible / 2.0;
        let fade = |value: f64| if value.is_finite() { value.clamp(0.0, half) } else { 0.0 };

        Some(Self {
            offset,
            selection,
            audible,
            fade_in: fade(channel.fade_in),
            fade_out: fade(channel.fade_out),
            playback_rate,
        })
    }
}

/// Result of a successful trigger
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggeredVoice {
    pub handle: VoiceHandle,
    pub timing: VoiceTiming,
    pub busy_until: f64,
}

#[derive(Debug, Clone, Default)]
struct VoiceSlot {
    handle: Option<VoiceHandle>,
    busy_until: f64,
}

impl VoiceSlot {
    fn is_free_at(&self, time: f64) -> bool {
        self.handle.is_none() || self.busy_until <= time + REUSE_TOLERANCE
    }
}

#[derive(Debug, Default)]
struct ChannelVoices {
    slots: Vec<VoiceSlot>,
    last_busy_until: f64,
}

impl ChannelVoices {
    /// Pick the slot for a hit at `at_time`, stopping whatever it still plays
    fn acquire(
        &mut self,
        backend: &mut dyn AudioBackend,
        allow_overlap: bool,
        at_time: f64,
    ) -> &mut VoiceSlot {
        let index = if !allow_overlap {
            if self.slots.is_empty() {
                self.slots.push(VoiceSlot::default());
            }
            0
        } else if let Some(free) = self.slots.iter().position(|s| s.is_free_at(at_time)) {
            free
        } else if self.slots.len() < MAX_OVERLAP_VOICES {
            self.slots.push(VoiceSlot::default());
            self.slots.len() - 1
        } else {
            // Steal the voice that frees earliest
            self.slots
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| a.busy_until.total_cmp(&b.busy_until))
                .map(|(i, _)| i)
                .unwrap_or(0)
        };

        let slot = &mut self.slots[index];
        if let Some(previous) = slot.handle.take() {
            if slot.busy_until > at_time {
                backend.stop_voice(previous, at_time);
            } else {
                backend.release_voice(previous);
            }
        }
        slot
    }
}

/// Counts reported by [`VoicePool::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub channels: usize,
    pub slots: usize,
    /// Slots still reserved at the queried time
    pub busy: usize,
}

/// Lazily created voice slots keyed by channel
#[derive(Debug, Default)]
pub struct VoicePool {
    channels: HashMap<ChannelId, ChannelVoices>,
}

impl VoicePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule one hit of `channel` at `at_time` through `output`.
    ///
    /// Returns `Ok(None)` when the hit is skipped: no buffer for the selected
    /// sample, or a region/rate that cannot be played.
    pub fn trigger(
        &mut self,
        backend: &mut dyn AudioBackend,
        samples: &SampleBank,
        channel: &SamplerChannel,
        output: GainId,
        at_time: f64,
        reverse: bool,
    ) -> Result<Option<TriggeredVoice>, BackendError> {
        let Some(buffer) = samples.get(channel.selected_sample_index) else {
            debug!(
                channel = channel.id.0,
                sample = channel.selected_sample_index,
                "No buffer loaded, skipping hit"
            );
            return Ok(None);
        };

        let Some(timing) = VoiceTiming::resolve(channel, buffer.duration()) else {
            warn!(
                channel = channel.id.0,
                start = channel.region.start,
                end = channel.region.end,
                rate = channel.playback_rate,
                "Unplayable region or rate, skipping hit"
            );
            return Ok(None);
        };

        let entry = self.channels.entry(channel.id).or_default();
        let slot = entry.acquire(backend, channel.allow_overlap, at_time);

        let handle = backend.start_voice(VoiceRequest {
            buffer: buffer.frames().clone(),
            buffer_rate: buffer.sample_rate(),
            output,
            start_time: at_time,
            offset: timing.offset,
            duration: timing.selection,
            playback_rate: timing.playback_rate,
            fade_in: timing.fade_in,
            fade_out: timing.fade_out,
            reverse,
        })?;

        let busy_until = at_time + timing.audible + RELEASE_TAIL;
        slot.handle = Some(handle);
        slot.busy_until = busy_until;
        entry.last_busy_until = entry.last_busy_until.max(busy_until);

        trace!(channel = channel.id.0, at_time, audible = timing.audible, "Voice scheduled");
        Ok(Some(TriggeredVoice {
            handle,
            timing,
            busy_until,
        }))
    }

    /// Cut every voice of a channel at `at`, including hits scheduled ahead
    pub fn force_silence(
        &mut self,
        backend: &mut dyn AudioBackend,
        channel: ChannelId,
        at: f64,
    ) -> usize {
        let Some(entry) = self.channels.get_mut(&channel) else {
            return 0;
        };
        let mut stopped = 0;
        for slot in &mut entry.slots {
            if let Some(handle) = slot.handle.take() {
                backend.stop_voice(handle, at);
                slot.busy_until = at;
                stopped += 1;
            }
        }
        if stopped > 0 {
            debug!(channel = channel.0, stopped, "Forced channel silent");
        }
        stopped
    }

    /// Release and forget every voice of a channel
    pub fn dispose_channel(&mut self, backend: &mut dyn AudioBackend, channel: ChannelId) {
        if let Some(entry) = self.channels.remove(&channel) {
            for handle in entry.slots.into_iter().filter_map(|s| s.handle) {
                backend.release_voice(handle);
            }
        }
    }

    pub fn dispose_all(&mut self, backend: &mut dyn AudioBackend) {
        let ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        for id in ids {
            self.dispose_channel(backend, id);
        }
    }

    /// Release finished voices and drop channels idle for `IDLE_TIMEOUT`
    pub fn collect(&mut self, backend: &mut dyn AudioBackend, now: f64) -> usize {
        let mut released = 0;
        for entry in self.channels.values_mut() {
            for slot in &mut entry.slots {
                if let Some(handle) = slot.handle {
                    if slot.busy_until <= now && !backend.is_voice_active(handle) {
                        backend.release_voice(handle);
                        slot.handle = None;
                        released += 1;
                    }
                }
            }
        }

        let before = self.channels.len();
        self.channels.retain(|_, entry| {
            entry.slots.iter().any(|s| s.handle.is_some())
                || now - entry.last_busy_until < IDLE_TIMEOUT
        });
        let dropped = before - self.channels.len();
        if dropped > 0 {
            debug!(dropped, "Reclaimed idle channel voices");
        }
        released
    }

    pub fn has_channel(&self, channel: ChannelId) -> bool {
        self.channels.contains_key(&channel)
    }

    pub fn stats(&self, now: f64) -> PoolStats {
        let slots = self.channels.values().map(|e| e.slots.len()).sum();
        let busy = self
            .channels
            .values()
            .flat_map(|e| e.slots.iter())
            .filter(|s| s.handle.is_some() && s.busy_until > now)
            .count();
        PoolStats {
            channels: self.channels.len(),
            slots,
            busy,
        }
    }
}

#[cfg(test)]
mod tests {
    use audional_core::SampleRegion;

    use super::*;
    use crate::backend::OfflineBackend;
    use crate::sample_bank::SampleBuffer;

    const RATE: u32 = 8000;

    fn setup(buffer_seconds: f64) -> (OfflineBackend, SampleBank, GainId) {
        let mut backend = OfflineBackend::new(RATE);
        backend.unlock().unwrap();
        let gain = backend.create_gain(1.0);
        let mut bank = SampleBank::new();
        let frames = (buffer_seconds * RATE as f64) as usize;
        bank.push(SampleBuffer::new("kick", vec![0.5; frames], RATE));
        (backend, bank, gain)
    }

    fn channel(id: u64) -> SamplerChannel {
        SamplerChannel::new(ChannelId(id), 16, 0)
    }

    #[test]
    fn test_region_and_fade_clamp() {
        let (mut backend, bank, gain) = setup(4.0);
        let mut ch = channel(1);
        ch.region = SampleRegion { start: 0.25, end: 0.5 };
        ch.playback_rate = 2.0;
        ch.fade_in = 0.5;
        ch.fade_out = 0.6;

        let mut pool = VoicePool::new();
        let hit = pool
            .trigger(&mut backend, &bank, &ch, gain, 0.0, false)
            .unwrap()
            .unwrap();

        assert!((hit.timing.offset - 1.0).abs() < 1e-9);
        assert!((hit.timing.selection - 1.0).abs() < 1e-9);
        assert!((hit.timing.audible - 0.5).abs() < 1e-9);
        assert!(hit.timing.fade_in <= 0.25 + 1e-12);
        assert!(hit.timing.fade_out <= 0.25 + 1e-12);
        assert!((hit.busy_until - 0.55).abs() < 1e-9);

        let record = &backend.log().voices[0];
        assert!((record.offset - 1.0).abs() < 1e-9);
        assert!((record.duration - 1.0).abs() < 1e-9);
        assert_eq!(record.playback_rate, 2.0);
    }

    #[test]
    fn test_missing_buffer_skips() {
        let (mut backend, bank, gain) = setup(1.0);
        let mut ch = channel(1);
        ch.selected_sample_index = 7;
        let mut pool = VoicePool::new();
        let hit = pool.trigger(&mut backend, &bank, &ch, gain, 0.0, false).unwrap();
        assert!(hit.is_none());
        assert!(backend.log().voices.is_empty());
        assert!(!pool.has_channel(ChannelId(1)));
    }

    #[test]
    fn test_invalid_region_or_rate_skips() {
        let (mut backend, bank, gain) = setup(1.0);
        let mut pool = VoicePool::new();

        let mut ch = channel(1);
        ch.region = SampleRegion { start: f64::NAN, end: 1.0 };
        assert!(pool.trigger(&mut backend, &bank, &ch, gain, 0.0, false).unwrap().is_none());

        let mut ch = channel(2);
        ch.playback_rate = 0.0;
        assert!(pool.trigger(&mut backend, &bank, &ch, gain, 0.0, false).unwrap().is_none());
        assert!(backend.log().voices.is_empty());
    }

    #[test]
    fn test_non_overlap_restarts_single_slot() {
        let (mut backend, bank, gain) = setup(1.0);
        let ch = channel(1);
        let mut pool = VoicePool::new();

        let first = pool.trigger(&mut backend, &bank, &ch, gain, 0.0, false).unwrap().unwrap();
        let second = pool.trigger(&mut backend, &bank, &ch, gain, 0.25, false).unwrap().unwrap();

        assert_ne!(first.handle, second.handle);
        let stop = backend.log().stops.iter().find(|s| s.handle == first.handle).unwrap();
        assert_eq!(stop.at, 0.25);
        assert_eq!(pool.stats(0.3).slots, 1);
    }

    #[test]
    fn test_overlap_grows_then_steals() {
        let (mut backend, bank, gain) = setup(1.0);
        let mut ch = channel(1);
        ch.allow_overlap = true;
        let mut pool = VoicePool::new();

        let mut handles = Vec::new();
        for i in 0..MAX_OVERLAP_VOICES {
            let hit = pool
                .trigger(&mut backend, &bank, &ch, gain, i as f64 * 0.01, false)
                .unwrap()
                .unwrap();
            handles.push(hit.handle);
        }
        assert_eq!(pool.stats(0.0).slots, MAX_OVERLAP_VOICES);
        assert!(backend.log().stops.is_empty());

        pool.trigger(&mut backend, &bank, &ch, gain, 0.1, false).unwrap().unwrap();
        assert_eq!(pool.stats(0.0).slots, MAX_OVERLAP_VOICES);
        // The first voice frees earliest and is the one stolen
        assert!(backend.log().was_stopped(handles[0]));
    }

    #[test]
    fn test_overlap_reuses_free_slot() {
        let (mut backend, bank, gain) = setup(0.1);
        let mut ch = channel(1);
        ch.allow_overlap = true;
        let mut pool = VoicePool::new();

        pool.trigger(&mut backend, &bank, &ch, gain, 0.0, false).unwrap();
        // First hit is busy until 0.15
        pool.trigger(&mut backend, &bank, &ch, gain, 0.5, false).unwrap();
        assert_eq!(pool.stats(0.5).slots, 1);
    }

    #[test]
    fn test_force_silence_stops_scheduled_voices() {
        let (mut backend, bank, gain) = setup(1.0);
        let mut ch = channel(1);
        ch.allow_overlap = true;
        let mut pool = VoicePool::new();

        let a = pool.trigger(&mut backend, &bank, &ch, gain, 0.0, false).unwrap().unwrap();
        let b = pool.trigger(&mut backend, &bank, &ch, gain, 0.1, false).unwrap().unwrap();

        assert_eq!(pool.force_silence(&mut backend, ChannelId(1), 0.05), 2);
        assert!(backend.log().was_stopped(a.handle));
        assert!(backend.log().was_stopped(b.handle));
        assert_eq!(pool.stats(0.05).busy, 0);
        assert_eq!(pool.force_silence(&mut backend, ChannelId(99), 0.05), 0);
    }

    #[test]
    fn test_collect_reclaims_idle_channels() {
        let (mut backend, bank, gain) = setup(0.1);
        let ch = channel(1);
        let mut pool = VoicePool::new();
        pool.trigger(&mut backend, &bank, &ch, gain, 0.0, false).unwrap();

        backend.advance(0.5);
        assert_eq!(pool.collect(&mut backend, 0.5), 1);
        assert!(pool.has_channel(ChannelId(1)));

        pool.collect(&mut backend, 5.0);
        assert!(!pool.has_channel(ChannelId(1)));
    }

    #[test]
    fn test_dispose() {
        let (mut backend, bank, gain) = setup(1.0);
        let mut pool = VoicePool::new();
        pool.trigger(&mut backend, &bank, &channel(1), gain, 0.0, false).unwrap();
        pool.trigger(&mut backend, &bank, &channel(2), gain, 0.0, false).unwrap();

        pool.dispose_channel(&mut backend, ChannelId(1));
        assert!(!pool.has_channel(ChannelId(1)));
        assert_eq!(pool.stats(0.0).channels, 1);

        pool.dispose_all(&mut backend);
        assert_eq!(pool.stats(0.0), PoolStats::default());
        assert_eq!(backend.renderer().voice_count(), 0);
    }
}
