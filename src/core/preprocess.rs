use anyhow::{bail, Result};
use nnnoiseless::DenoiseState;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::core::audio::{read_wav_mono, resample, write_wav};

/// RNNoise only runs at 48 kHz
const DENOISE_RATE: u32 = 48_000;
/// RNNoise works on 16-bit sample magnitudes
const PCM_SCALE: f32 = i16::MAX as f32;
const PEAK_TARGET: f32 = 0.98;
const DENOISE_FRAME: usize = DenoiseState::FRAME_SIZE;

/// Outcome of a best-effort preprocessing step.
///
/// A degraded step hands back the audio it was given, plus why it could not do better.
#[derive(Debug, Clone, PartialEq)]
pub enum Processed {
    Clean(PathBuf),
    Degraded { audio: PathBuf, reason: String },
}

impl Processed {
    pub fn audio(&self) -> &Path {
        match self {
            Processed::Clean(audio) => audio,
            Processed::Degraded { audio, .. } => audio,
        }
    }

    pub fn degradation(&self) -> Option<&str> {
        match self {
            Processed::Clean(_) => None,
            Processed::Degraded { reason, .. } => Some(reason),
        }
    }

    pub fn into_audio(self) -> PathBuf {
        match self {
            Processed::Clean(audio) => audio,
            Processed::Degraded { audio, .. } => audio,
        }
    }

    fn from_result(original: &Path, step: &str, result: Result<PathBuf>) -> Self {
        match result {
            Ok(audio) => Processed::Clean(audio),
            Err(e) => {
                warn!("{} failed for {:?}, continuing with input audio: {:#}", step, original, e);
                Processed::Degraded {
                    audio: original.to_path_buf(),
                    reason: format!("{}: {:#}", step, e),
                }
            }
        }
    }
}

/// Audio cleanup applied before transcription. Neither step may fail a call.
#[cfg_attr(test, mockall::automock)]
pub trait Preprocess: Send + Sync {
    fn reduce_noise(&self, audio: &Path) -> Processed;
    fn normalize(&self, audio: &Path) -> Processed;
}

/// RNNoise suppression and peak normalizer for mono WAV files
pub struct WavPreprocessor {
    /// How much of the denoised signal replaces the original, 0 to 1
    reduction: f32,
}

impl WavPreprocessor {
    pub fn new(reduction: f32) -> Self {
        Self {
            reduction: reduction.clamp(0.0, 1.0),
        }
    }

    fn denoise(&self, audio: &Path) -> Result<PathBuf> {
        let (samples, sample_rate) = read_wav_mono(audio)?;
        if samples.is_empty() {
            bail!("audio contains no samples");
        }

        let upsampled = resample(&samples, sample_rate, DENOISE_RATE)?;
        let denoised = suppress_noise(&upsampled);
        let mut restored = resample(&denoised, DENOISE_RATE, sample_rate)?;
        restored.resize(samples.len(), 0.0);

        // `reduction` is the share of denoised signal in the mix
        let keep = 1.0 - self.reduction;
        let cleaned: Vec<f32> = samples
            .iter()
            .zip(&restored)
            .map(|(&original, &clean)| original * keep + clean * self.reduction)
            .collect();

        let stem = audio
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("audio");
        let output = audio.with_file_name(format!("{}_cleaned.wav", stem));
        write_wav(&output, &cleaned, sample_rate, 1)?;

        info!("Noise-reduced audio saved to: {}", output.display());
        Ok(output)
    }

    fn normalize_peak(&self, audio: &Path) -> Result<PathBuf> {
        let (samples, sample_rate) = read_wav_mono(audio)?;
        let peak = samples.iter().fold(0.0f32, |max, &s| max.max(s.abs()));

        if peak == 0.0 {
            info!("Audio is silent, skipping normalization: {}", audio.display());
            return Ok(audio.to_path_buf());
        }

        let scale = PEAK_TARGET / peak;
        let normalized: Vec<f32> = samples.iter().map(|&s| s * scale).collect();

        // Write beside the original, then swap in place
        let temp = audio.with_extension("normalizing.wav");
        write_wav(&temp, &normalized, sample_rate, 1)?;
        std::fs::rename(&temp, audio)?;

        info!("Audio normalized: {}", audio.display());
        Ok(audio.to_path_buf())
    }
}

impl Default for WavPreprocessor {
    fn default() -> Self {
        Self::new(0.8)
    }
}

impl Preprocess for WavPreprocessor {
    fn reduce_noise(&self, audio: &Path) -> Processed {
        info!("Applying noise reduction to: {}", audio.display());
        Processed::from_result(audio, "noise reduction", self.denoise(audio))
    }

    fn normalize(&self, audio: &Path) -> Processed {
        Processed::from_result(audio, "normalization", self.normalize_peak(audio))
    }
}

/// Run RNNoise over 48 kHz mono samples in [-1, 1]
fn suppress_noise(samples: &[f32]) -> Vec<f32> {
    let mut state = DenoiseState::new();
    let mut output = Vec::with_capacity(samples.len());
    let mut frame_in = [0.0f32; DENOISE_FRAME];
    let mut frame_out = [0.0f32; DENOISE_FRAME];

    let mut voice_total = 0.0f32;
    let mut frames = 0;

    for chunk in samples.chunks(DENOISE_FRAME) {
        frame_in.fill(0.0);
        for (dst, &sample) in frame_in.iter_mut().zip(chunk) {
            *dst = sample * PCM_SCALE;
        }
        voice_total += state.process_frame(&mut frame_out, &frame_in);
        frames += 1;
        output.extend(frame_out[..chunk.len()].iter().map(|&s| s / PCM_SCALE));
    }

    debug!(
        "RNNoise processed {} frames, mean voice probability {:.2}",
        frames,
        voice_total / frames.max(1) as f32
    );
    output
}
