//! Project loading and engine setup shared by the commands

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use audional_core::{loop_duration, Channel, PlayMode, ProjectState};
use audional_services::{
    AudioBackend, ClipInstrument, EngineConfig, SampleBank, SampleBuffer, TraceNoteEngine,
    TransportScheduler,
};
use tracing::{info, warn};

pub fn read_project(path: &Path) -> Result<ProjectState> {
    let project = audional_core::load_from_path(path)
        .with_context(|| format!("Failed to load project {}", path.display()))?;
    info!(
        path = %path.display(),
        sequences = project.sequences.len(),
        channels = project.channel_count(),
        bpm = project.bpm,
        "Loaded project"
    );
    Ok(project)
}

/// Load each file into the slot matching its position. Files that fail to
/// decode leave their slot empty so later indices stay put.
pub fn load_samples(paths: &[PathBuf], sample_rate: u32) -> SampleBank {
    let mut bank = SampleBank::new();
    for (index, path) in paths.iter().enumerate() {
        match SampleBuffer::from_wav(path, sample_rate) {
            Ok(buffer) => {
                info!(index, name = %buffer.name(), seconds = buffer.duration(), "Loaded sample");
                bank.insert(index, buffer);
            }
            Err(e) => warn!(index, path = %path.display(), error = %e, "Skipping sample"),
        }
    }
    bank
}

/// Register a clip instrument for every instrument id the project names.
/// Returns how many were bound.
pub fn bind_instruments<B: AudioBackend>(scheduler: &mut TransportScheduler<B>) -> usize {
    let mut wanted = Vec::new();
    for (seq_idx, sequence) in scheduler.project().sequences.iter().enumerate() {
        for (ch_idx, channel) in sequence.channels.iter().enumerate() {
            if let Channel::Instrument(c) = channel {
                if let Some(id) = &c.instrument_id {
                    wanted.push((seq_idx, ch_idx, id.clone()));
                }
            }
        }
    }

    let mut bound = 0;
    for (seq_idx, ch_idx, id) in wanted {
        if scheduler.rack().contains(&id) {
            continue;
        }
        let instrument = ClipInstrument::new(id.clone(), TraceNoteEngine::default());
        match scheduler.bind_instrument(seq_idx, ch_idx, id.clone(), Box::new(instrument)) {
            Ok(()) => bound += 1,
            Err(e) => warn!(id = %id, error = %e, "Failed to bind instrument"),
        }
    }
    bound
}

/// Length of `loops` passes over the project in `mode`
pub fn session_seconds(project: &ProjectState, config: &EngineConfig, mode: PlayMode, loops: u32) -> f64 {
    let one = loop_duration(project.bpm, config.steps_per_beat, project.step_count());
    let sequences = match mode {
        PlayMode::Single => 1,
        PlayMode::All => project.sequences.len(),
    };
    one * sequences as f64 * loops.max(1) as f64
}
