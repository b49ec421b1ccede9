//! Decoded sample buffers addressed by index

use std::path::Path;
use std::sync::Arc;

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::backend::SampleData;

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("Failed to read WAV: {0}")]
    Wav(#[from] hound::Error),
    #[error("Sample '{0}' is empty")]
    Empty(String),
    #[error("Resample error: {0}")]
    Resample(String),
}

/// Mono sample data and the rate it was decoded at
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    name: String,
    frames: SampleData,
    sample_rate: u32,
}

impl SampleBuffer {
    pub fn new(name: impl Into<String>, frames: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            name: name.into(),
            frames: Arc::new(frames),
            sample_rate,
        }
    }

    /// Decode a WAV file, mix to mono and resample to `target_rate`
    pub fn from_wav(path: &Path, target_rate: u32) -> Result<Self, SampleError> {
        let reader = hound::WavReader::open(path)?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let raw: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader.into_samples::<f32>().collect::<Result<_, _>>()?,
            hound::SampleFormat::Int => {
                let max_val = (1_i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / max_val))
                    .collect::<Result<_, _>>()?
            }
        };

        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("sample")
            .to_string();

        if raw.is_empty() {
            return Err(SampleError::Empty(name));
        }

        let mono: Vec<f32> = if channels == 1 {
            raw
        } else {
            raw.chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                .collect()
        };

        let frames = resample(&mono, spec.sample_rate, target_rate)?;
        debug!(
            name = %name,
            source_rate = spec.sample_rate,
            target_rate,
            frames = frames.len(),
            "Decoded sample"
        );
        Ok(Self::new(name, frames, target_rate))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frames(&self) -> &SampleData {
        &self.frames
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Length in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames.len() as f64 / self.sample_rate as f64
    }
}

/// Band-limited resampling to the engine rate
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, SampleError> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f32>::new(
        to_rate as f64 / from_rate as f64,
        2.0,
        params,
        samples.len(),
        1,
    )
    .map_err(|e| SampleError::Resample(e.to_string()))?;

    let input = vec![samples.to_vec()];
    let output = resampler
        .process(&input, None)
        .map_err(|e| SampleError::Resample(e.to_string()))?;

    Ok(output.into_iter().flatten().collect())
}

/// Sample slots referenced by `selected_sample_index`
#[derive(Debug, Clone, Default)]
pub struct SampleBank {
    slots: Vec<Option<SampleBuffer>>,
}

impl SampleBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a buffer, returning its index
    pub fn push(&mut self, buffer: SampleBuffer) -> usize {
        self.slots.push(Some(buffer));
        self.slots.len() - 1
    }

    /// Put a buffer at `index`, growing the bank with empty slots if needed
    pub fn insert(&mut self, index: usize, buffer: SampleBuffer) -> Option<SampleBuffer> {
        if index >= self.slots.len() {
            self.slots.resize(index + 1, None);
        }
        self.slots[index].replace(buffer)
    }

    pub fn remove(&mut self, index: usize) -> Option<SampleBuffer> {
        self.slots.get_mut(index).and_then(Option::take)
    }

    pub fn get(&self, index: usize) -> Option<&SampleBuffer> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Number of slots, including empty ones
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Decode `path` and append it
    pub fn load_wav(&mut self, path: &Path, target_rate: u32) -> Result<usize, SampleError> {
        let buffer = SampleBuffer::from_wav(path, target_rate)?;
        info!(name = %buffer.name(), seconds = buffer.duration(), "Loaded sample");
        Ok(self.push(buffer))
    }
}
