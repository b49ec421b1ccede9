//! Sequencer channels

use serde::{Deserialize, Serialize};

use crate::clip::InstrumentClip;
use crate::steps::StepGrid;

pub const MIN_REGION_SPAN: f64 = 0.01;
pub const MAX_REGION_START: f64 = 0.99;
pub const MIN_PLAYBACK_RATE: f64 = 0.25;
pub const MAX_PLAYBACK_RATE: f64 = 4.0;
pub const MAX_FADE_SECONDS: f64 = 2.0;
pub const DEFAULT_FADE_IN: f64 = 0.005;
pub const DEFAULT_FADE_OUT: f64 = 0.05;

/// Unique identifier for channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ChannelId(pub u64);

/// Normalized selection of a sample buffer, both ends in 0..=1
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleRegion {
    pub start: f64,
    pub end: f64,
}

impl Default for SampleRegion {
    fn default() -> Self {
        Self { start: 0.0, end: 1.0 }
    }
}

impl SampleRegion {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }.clamped()
    }

    /// Both bounds are finite numbers
    pub fn is_finite(&self) -> bool {
        self.start.is_finite() && self.end.is_finite()
    }

    /// Clamp into `start` in `[0, 0.99]` and `end` in `(start, 1]`, keeping a
    /// minimum span.
    pub fn clamped(self) -> Self {
        let start = if self.start.is_finite() {
            self.start.clamp(0.0, MAX_REGION_START)
        } else {
            0.0
        };
        let min_end = (start + MIN_REGION_SPAN).min(1.0);
        let end = if self.end.is_finite() {
            self.end.min(1.0).max(min_end)
        } else {
            min_end
        };
        Self { start, end }
    }

    pub fn span(&self) -> f64 {
        self.end - self.start
    }
}

/// Clamp a playback rate into the supported range; `None` for rates that
/// cannot be played at all.
pub fn sanitize_playback_rate(rate: f64) -> Option<f64> {
    (rate.is_finite() && rate > 0.0).then(|| rate.clamp(MIN_PLAYBACK_RATE, MAX_PLAYBACK_RATE))
}

/// Clamp a fade length into `[0, MAX_FADE_SECONDS]`
pub fn sanitize_fade(seconds: f64, fallback: f64) -> f64 {
    let value = if seconds.is_finite() { seconds } else { fallback };
    value.clamp(0.0, MAX_FADE_SECONDS)
}

/// Mute/solo/volume state shared by every channel kind
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelMix {
    pub mute: bool,
    pub solo: bool,
    /// Volume (0.0 to 1.0)
    pub volume: f32,
}

impl Default for ChannelMix {
    fn default() -> Self {
        Self {
            mute: false,
            solo: false,
            volume: 1.0,
        }
    }
}

/// Channel that plays a region of a sample buffer on every lit step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerChannel {
    pub id: ChannelId,
    #[serde(default)]
    pub name: String,
    pub steps: StepGrid,
    pub selected_sample_index: usize,
    #[serde(default)]
    pub region: SampleRegion,
    #[serde(default = "default_playback_rate")]
    pub playback_rate: f64,
    /// Fade in, seconds
    #[serde(default = "default_fade_in")]
    pub fade_in: f64,
    /// Fade out, seconds
    #[serde(default = "default_fade_out")]
    pub fade_out: f64,
    /// Let retriggers overlap the previous hit instead of cutting it
    #[serde(default)]
    pub allow_overlap: bool,
    #[serde(default)]
    pub mix: ChannelMix,
}

fn default_playback_rate() -> f64 {
    1.0
}

fn default_fade_in() -> f64 {
    DEFAULT_FADE_IN
}

fn default_fade_out() -> f64 {
    DEFAULT_FADE_OUT
}

impl SamplerChannel {
    pub fn new(id: ChannelId, step_count: usize, sample_index: usize) -> Self {
        Self {
            id,
            name: String::new(),
            steps: StepGrid::new(step_count),
            selected_sample_index: sample_index,
            region: SampleRegion::default(),
            playback_rate: 1.0,
            fade_in: DEFAULT_FADE_IN,
            fade_out: DEFAULT_FADE_OUT,
            allow_overlap: false,
            mix: ChannelMix::default(),
        }
    }

    /// Repair out-of-range parameters in place
    pub fn sanitize(&mut self) {
        self.region = self.region.clamped();
        self.playback_rate = sanitize_playback_rate(self.playback_rate).unwrap_or(1.0);
        self.fade_in = sanitize_fade(self.fade_in, DEFAULT_FADE_IN);
        self.fade_out = sanitize_fade(self.fade_out, DEFAULT_FADE_OUT);
    }
}

/// Channel that triggers a live instrument from the rack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentChannel {
    pub id: ChannelId,
    #[serde(default)]
    pub name: String,
    pub steps: StepGrid,
    /// Rack key of the bound instrument
    #[serde(default)]
    pub instrument_id: Option<String>,
    /// Last known instrument parameters, opaque to the sequencer
    #[serde(default)]
    pub patch: Option<serde_json::Value>,
    /// Notes recorded into the instrument for loop playback
    #[serde(default)]
    pub clip: InstrumentClip,
    #[serde(default)]
    pub mix: ChannelMix,
}

impl InstrumentChannel {
    pub fn new(id: ChannelId, step_count: usize) -> Self {
        Self {
            id,
            name: String::new(),
            steps: StepGrid::new(step_count),
            instrument_id: None,
            patch: None,
            clip: InstrumentClip::default(),
            mix: ChannelMix::default(),
        }
    }
}

/// Channel kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelKind {
    Sampler,
    Instrument,
}

/// A channel in a sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Channel {
    Sampler(SamplerChannel),
    Instrument(InstrumentChannel),
}

impl Channel {
    pub fn id(&self) -> ChannelId {
        match self {
            Self::Sampler(c) => c.id,
            Self::Instrument(c) => c.id,
        }
    }

    pub(crate) fn set_id(&mut self, id: ChannelId) {
        match self {
            Self::Sampler(c) => c.id = id,
            Self::Instrument(c) => c.id = id,
        }
    }

    pub fn kind(&self) -> ChannelKind {
        match self {
            Self::Sampler(_) => ChannelKind::Sampler,
            Self::Instrument(_) => ChannelKind::Instrument,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Sampler(c) => &c.name,
            Self::Instrument(c) => &c.name,
        }
    }

    pub fn steps(&self) -> &StepGrid {
        match self {
            Self::Sampler(c) => &c.steps,
            Self::Instrument(c) => &c.steps,
        }
    }

    pub fn steps_mut(&mut self) -> &mut StepGrid {
        match self {
            Self::Sampler(c) => &mut c.steps,
            Self::Instrument(c) => &mut c.steps,
        }
    }

    pub fn mix(&self) -> &ChannelMix {
        match self {
            Self::Sampler(c) => &c.mix,
            Self::Instrument(c) => &c.mix,
        }
    }

    pub fn mix_mut(&mut self) -> &mut ChannelMix {
        match self {
            Self::Sampler(c) => &mut c.mix,
            Self::Instrument(c) => &mut c.mix,
        }
    }

    pub fn is_step_lit(&self, step: usize) -> bool {
        self.steps().is_lit(step)
    }

    /// Empty channel of the same kind and settings, used to keep sibling
    /// sequences the same shape.
    pub(crate) fn blank_copy(&self, id: ChannelId) -> Self {
        let mut copy = self.clone();
        copy.set_id(id);
        copy.steps_mut().clear();
        copy.mix_mut().solo = false;
        if let Self::Instrument(c) = &mut copy {
            c.clip = InstrumentClip::default();
        }
        copy
    }
}
