//! Offline render of a project to WAV

use std::path::Path;

use anyhow::{Context, Result};
use audional_core::{PlayMode, ProjectState};
use audional_services::{EngineConfig, OfflineBackend, SampleBank, TransportScheduler};
use tracing::{debug, info};

/// Silence rendered after the transport stops so release tails finish
const TAIL_SECONDS: f64 = 0.5;

/// Drive the transport against the offline clock for `seconds` of playback
/// and return the mono mix.
pub fn render(
    project: ProjectState,
    samples: SampleBank,
    config: EngineConfig,
    mode: PlayMode,
    seconds: f64,
) -> Result<Vec<f32>> {
    let rate = config.sample_rate;
    let block = ((config.poll_interval.as_secs_f64() * rate as f64) as usize).max(1);
    let total = ((seconds + config.start_delay) * rate as f64).round() as usize;
    let tail = (TAIL_SECONDS * rate as f64).round() as usize;

    let mut scheduler = TransportScheduler::new(OfflineBackend::new(rate), project, samples, config);
    crate::session::bind_instruments(&mut scheduler);
    scheduler.start(mode)?;

    let mut out = Vec::with_capacity(total + tail);
    while out.len() < total {
        scheduler.poll();
        let frames = block.min(total - out.len());
        out.extend(scheduler.backend_mut().render(frames));
    }
    debug!(diagnostics = ?scheduler.diagnostics(), "Bounce finished");

    scheduler.stop();
    out.extend(scheduler.backend_mut().render(tail));
    scheduler.teardown();
    Ok(out)
}

pub fn write_wav(path: &Path, frames: &[f32], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for &sample in frames {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    info!(
        path = %path.display(),
        seconds = frames.len() as f64 / sample_rate as f64,
        "Wrote bounce"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use audional_services::SampleBuffer;

    const RATE: u32 = 8000;

    fn kick_project() -> (ProjectState, SampleBank) {
        let mut project = ProjectState::new(1, 16);
        let ch = project.add_sampler_channel(0);
        project.set_step(0, ch, 0, true).unwrap();
        let mut bank = SampleBank::new();
        bank.push(SampleBuffer::new("kick", vec![0.5; 800], RATE));
        (project, bank)
    }

    fn config() -> EngineConfig {
        EngineConfig {
            sample_rate: RATE,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_first_hit_lands_after_start_delay() {
        let (project, bank) = kick_project();
        let out = render(project, bank, config(), PlayMode::Single, 2.0).unwrap();

        // 0.1 s start delay at 8 kHz
        assert!(out[..790].iter().all(|s| *s == 0.0));
        let peak = out[800..1600].iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak > 0.1, "peak {peak}");
    }

    #[test]
    fn test_length_includes_delay_and_tail() {
        let (project, bank) = kick_project();
        let out = render(project, bank, config(), PlayMode::Single, 1.0).unwrap();
        let expected = ((1.0 + 0.1 + TAIL_SECONDS) * RATE as f64).round() as usize;
        assert_eq!(out.len(), expected);
    }

    #[test]
    fn test_wav_written() {
        let path = std::env::temp_dir().join(format!("audional-bounce-{}.wav", std::process::id()));
        write_wav(&path, &[0.0, 0.25, -0.25], RATE).unwrap();
        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, RATE);
        assert_eq!(reader.len(), 3);
        let _ = std::fs::remove_file(&path);
    }
}
