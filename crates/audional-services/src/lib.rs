//! audional-services: Transport scheduling, voices and audio backends

pub mod audio_io;
pub mod backend;
mod broadcast;
mod clip_instrument;
pub mod config;
mod mixer;
mod rack;
mod sample_bank;
mod scheduler;
mod voice_pool;

pub use audio_io::{default_output_info, AudioOutputError, RealtimeBackend};
pub use backend::{AudioBackend, BackendError, GainId, OfflineBackend, VoiceHandle, VoiceRequest};
pub use broadcast::TransportBus;
pub use clip_instrument::{ClipInstrument, NoteEngine, TraceNoteEngine};
pub use config::EngineConfig;
pub use mixer::{ChannelMixer, GainUpdate};
pub use rack::{BroadcastReport, InstrumentError, InstrumentRack, InstrumentState, LiveInstrument};
pub use sample_bank::{resample, SampleBank, SampleBuffer, SampleError};
pub use scheduler::{Diagnostics, EngineError, TransportScheduler};
pub use voice_pool::{
    PoolStats, TriggeredVoice, VoicePool, VoiceTiming, IDLE_TIMEOUT, MAX_OVERLAP_VOICES,
    RELEASE_TAIL,
};
