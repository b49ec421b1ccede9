//! Error types for audional

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid tempo: {0}")]
    InvalidTempo(f64),
    #[error("Sequence not found: {0}")]
    SequenceNotFound(usize),
    #[error("Channel not found: {0}")]
    ChannelNotFound(usize),
    #[error("Step {step} out of range (step count {count})")]
    StepOutOfRange { step: usize, count: usize },
    #[error("A project must keep at least one sequence")]
    LastSequence,
    #[error("Invalid project document: {0}")]
    InvalidDocument(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
