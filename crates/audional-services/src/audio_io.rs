//! Realtime audio output through cpal

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use thiserror::Error;
use tracing::{error, info};

use crate::backend::{AudioBackend, BackendError, GainId, Renderer, VoiceHandle, VoiceRequest};

#[derive(Debug, Error)]
pub enum AudioOutputError {
    #[error("No audio output devices found")]
    NoDevices,
    #[error("Failed to get default output config: {0}")]
    ConfigError(String),
    #[error("Failed to build output stream: {0}")]
    StreamError(String),
}

impl From<AudioOutputError> for BackendError {
    fn from(e: AudioOutputError) -> Self {
        BackendError::Device(e.to_string())
    }
}

/// Default output device name, sample rate and channel count
pub fn default_output_info() -> Result<(String, u32, u16), AudioOutputError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(AudioOutputError::NoDevices)?;

    let config = device
        .default_output_config()
        .map_err(|e| AudioOutputError::ConfigError(e.to_string()))?;

    let name = device.name().unwrap_or_default();
    Ok((name, config.sample_rate().0, config.channels()))
}

/// Device stream that pulls interleaved frames from a shared renderer
pub struct RealtimeOutputStream {
    stop_flag: Arc<AtomicBool>,
    _stream: cpal::Stream,
}

impl RealtimeOutputStream {
    pub fn start(renderer: Arc<Mutex<Renderer>>) -> Result<Self, AudioOutputError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(AudioOutputError::NoDevices)?;

        let supported_config = device
            .default_output_config()
            .map_err(|e| AudioOutputError::ConfigError(e.to_string()))?;

        let sample_rate = supported_config.sample_rate().0;
        let channels = supported_config.channels();

        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_clone = stop_flag.clone();

        let config: StreamConfig = supported_config.into();

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if stop_clone.load(Ordering::SeqCst) {
                        data.fill(0.0);
                        return;
                    }
                    let Ok(mut renderer) = renderer.lock() else {
                        data.fill(0.0);
                        return;
                    };
                    renderer.render(data, channels as usize);
                },
                move |err| error!("Output stream error: {}", err),
                None,
            )
            .map_err(|e| AudioOutputError::StreamError(e.to_string()))?;

        stream.play().map_err(|e| AudioOutputError::StreamError(e.to_string()))?;

        info!(
            device = %device.name().unwrap_or_default(),
            sample_rate,
            channels,
            "Started realtime output stream"
        );

        Ok(Self { stop_flag, _stream: stream })
    }

    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }
}

impl Drop for RealtimeOutputStream {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }
}

/// Backend playing through the default output device.
///
/// The audio clock only starts moving once the device stream is open, which
/// happens on the first `unlock`.
pub struct RealtimeBackend {
    renderer: Arc<Mutex<Renderer>>,
    stream: Option<RealtimeOutputStream>,
}

impl RealtimeBackend {
    /// Prepare a renderer at the default device's sample rate
    pub fn new() -> Result<Self, AudioOutputError> {
        let (name, sample_rate, channels) = default_output_info()?;
        info!(device = %name, sample_rate, channels, "Using default output device");
        Ok(Self::with_sample_rate(sample_rate))
    }

    pub fn with_sample_rate(sample_rate: u32) -> Self {
        Self {
            renderer: Arc::new(Mutex::new(Renderer::new(sample_rate))),
            stream: None,
        }
    }

    fn renderer(&self) -> MutexGuard<'_, Renderer> {
        self.renderer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Close the device stream
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop();
            info!("Realtime output closed");
        }
    }
}

impl AudioBackend for RealtimeBackend {
    fn current_time(&self) -> f64 {
        self.renderer().current_time()
    }

    fn sample_rate(&self) -> u32 {
        self.renderer().sample_rate()
    }

    fn unlock(&mut self) -> Result<(), BackendError> {
        if self.stream.is_none() {
            self.stream = Some(RealtimeOutputStream::start(self.renderer.clone())?);
        }
        Ok(())
    }

    fn is_unlocked(&self) -> bool {
        self.stream.is_some()
    }

    fn create_gain(&mut self, initial: f32) -> GainId {
        self.renderer().create_gain(initial)
    }

    fn set_gain(&mut self, gain: GainId, value: f32, at: f64) -> Result<(), BackendError> {
        self.renderer().set_gain(gain, value, at)
    }

    fn cancel_gain_ramps(&mut self, gain: GainId, from: f64) -> Result<(), BackendError> {
        self.renderer().cancel_gain_ramps(gain, from)
    }

    fn remove_gain(&mut self, gain: GainId) {
        self.renderer().remove_gain(gain);
    }

    fn start_voice(&mut self, request: VoiceRequest) -> Result<VoiceHandle, BackendError> {
        if self.stream.is_none() {
            return Err(BackendError::Locked);
        }
        self.renderer().start_voice(request)
    }

    fn stop_voice(&mut self, voice: VoiceHandle, at: f64) {
        self.renderer().stop_voice(voice, at);
    }

    fn release_voice(&mut self, voice: VoiceHandle) {
        self.renderer().release_voice(voice);
    }

    fn is_voice_active(&self, voice: VoiceHandle) -> bool {
        self.renderer().is_voice_active(voice)
    }

    fn cancel_scheduled(&mut self, from: f64) -> usize {
        self.renderer().cancel_scheduled(from)
    }
}
