use std::path::{Path, PathBuf};
use std::time::Duration;

use audional_services::config::{
    DEFAULT_LOOKAHEAD, DEFAULT_POLL_INTERVAL, DEFAULT_SAMPLE_RATE, DEFAULT_START_DELAY,
};
use audional_services::EngineConfig;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub samples: SamplesConfig,
    #[serde(default)]
    pub bounce: BounceConfig,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub lookahead_ms: u64,
    pub poll_interval_ms: u64,
    pub start_delay_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            lookahead_ms: (DEFAULT_LOOKAHEAD * 1000.0).round() as u64,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            start_delay_ms: (DEFAULT_START_DELAY * 1000.0).round() as u64,
        }
    }
}

/// WAV files loaded into the sample bank, in slot order
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Default)]
pub struct SamplesConfig {
    #[serde(default)]
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BounceConfig {
    pub sample_rate: u32,
}

impl Default for BounceConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }
}

impl AppConfig {
    /// Engine timing for a backend running at `sample_rate`
    pub fn engine_config(&self, sample_rate: u32) -> EngineConfig {
        EngineConfig {
            lookahead: self.audio.lookahead_ms as f64 / 1000.0,
            poll_interval: Duration::from_millis(self.audio.poll_interval_ms),
            start_delay: self.audio.start_delay_ms as f64 / 1000.0,
            sample_rate,
            ..EngineConfig::default()
        }
        .sanitized()
    }
}

pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("audional")
        .join("config.toml")
}

pub fn load_config(path: &Path) -> AppConfig {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| parse_config(&s))
        .unwrap_or_default()
}

fn parse_config(text: &str) -> Option<AppConfig> {
    match toml::from_str(text) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring malformed config file");
            None
        }
    }
}

pub fn save_config(config: &AppConfig, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, toml::to_string_pretty(config)?)?;
    Ok(())
}
