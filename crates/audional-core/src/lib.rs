//! audional-core: Domain types for the audional step sequencer

pub mod channel;
pub mod clip;
pub mod document;
mod error;
mod project;
mod sequence;
pub mod steps;
mod transport;

pub use channel::{
    Channel, ChannelId, ChannelKind, ChannelMix, InstrumentChannel, SampleRegion, SamplerChannel,
};
pub use clip::{ClipNote, InstrumentClip, ScheduledNote};
pub use document::{load_from_path, load_project, save_project, save_to_path};
pub use error::{CoreError, Result};
pub use project::{PlayMode, ProjectState, DEFAULT_BPM};
pub use sequence::Sequence;
pub use steps::{CompactStep, StepGrid, StepRef, DEFAULT_STEP_COUNT, MAX_STEP_COUNT};
pub use transport::{
    loop_duration, step_duration, PlaybackPosition, TransportEvent, TransportState, STEPS_PER_BEAT,
};
