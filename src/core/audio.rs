use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Local;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use parking_lot::Mutex;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::core::config::AudioConfig;

const BITS_PER_SAMPLE: u16 = 16;
const RESAMPLE_CHUNK: usize = 1024;

/// Where call audio comes from: a live recording or an existing file.
///
/// Both produce a WAV file in the pipeline's audio directory that the call owns.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudioSource: Send + Sync {
    async fn record(&self, duration_secs: u64) -> Result<PathBuf>;
    async fn load_file(&self, path: &Path) -> Result<PathBuf>;
}

/// Audio recorder using CPAL for cross-platform audio capture
pub struct AudioRecorder {
    device: Device,
    config: StreamConfig,
    buffer: Arc<Mutex<Vec<f32>>>,
    stream: Option<Stream>,
    is_recording: Arc<Mutex<bool>>,
}

impl AudioRecorder {
    /// Create a recorder on the named device, or the default input device
    pub fn new(sample_rate: u32, channels: u16, device_name: Option<&str>) -> Result<Self> {
        let host = cpal::default_host();

        let device = match device_name {
            Some(name) => host
                .input_devices()?
                .find(|d| d.name().unwrap_or_default() == name)
                .ok_or_else(|| anyhow!("Device '{}' not found", name))?,
            None => host
                .default_input_device()
                .ok_or_else(|| anyhow!("No input device available"))?,
        };

        info!("Using audio device: {}", device.name()?);

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        Ok(Self {
            device,
            config,
            buffer: Arc::new(Mutex::new(Vec::new())),
            stream: None,
            is_recording: Arc::new(Mutex::new(false)),
        })
    }

    /// Start recording audio
    pub fn start_recording(&mut self) -> Result<()> {
        self.buffer.lock().clear();
        *self.is_recording.lock() = true;

        let buffer = Arc::clone(&self.buffer);
        let is_recording = Arc::clone(&self.is_recording);

        let stream = self.device.build_input_stream(
            &self.config,
            move |data: &[f32], _: &_| {
                if *is_recording.lock() {
                    buffer.lock().extend_from_slice(data);
                }
            },
            |err| error!("Audio stream error: {}", err),
            None,
        )?;

        stream.play()?;
        self.stream = Some(stream);

        info!("Recording started");
        Ok(())
    }

    /// Stop recording and save to a WAV file at `output_path`
    pub fn stop_recording(&mut self, output_path: &Path) -> Result<()> {
        *self.is_recording.lock() = false;

        if let Some(stream) = self.stream.take() {
            stream.pause()?;
            drop(stream);
        }

        info!("Recording stopped");

        let buffer = self.buffer.lock();
        write_wav(output_path, &buffer, self.config.sample_rate.0, self.config.channels)
    }
}

/// Microphone and file acquisition into the configured audio directory
pub struct CpalAudioSource {
    audio_dir: PathBuf,
    sample_rate: u32,
    channels: u16,
    device: Option<String>,
}

impl CpalAudioSource {
    pub fn new(config: &AudioConfig, audio_dir: &Path) -> Self {
        Self {
            audio_dir: audio_dir.to_path_buf(),
            sample_rate: config.sample_rate,
            channels: config.channels,
            device: config.device.clone(),
        }
    }
}

#[async_trait]
impl AudioSource for CpalAudioSource {
    async fn record(&self, duration_secs: u64) -> Result<PathBuf> {
        if duration_secs == 0 {
            bail!("Recording duration must be at least one second");
        }

        let output_path = unique_audio_path(&self.audio_dir, "call")?;
        let (sample_rate, channels, device) = (self.sample_rate, self.channels, self.device.clone());
        let path = output_path.clone();

        // cpal streams are not Send, so the whole recording lives on one blocking thread
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut recorder = AudioRecorder::new(sample_rate, channels, device.as_deref())?;
            info!("Starting audio recording for {} seconds...", duration_secs);
            recorder.start_recording()?;
            thread::sleep(Duration::from_secs(duration_secs));
            recorder.stop_recording(&path)
        })
        .await
        .context("Recording task panicked")??;

        info!("Audio saved to: {}", output_path.display());
        Ok(output_path)
    }

    async fn load_file(&self, path: &Path) -> Result<PathBuf> {
        info!("Loading audio file: {}", path.display());

        let source = path.to_path_buf();
        let output_path = unique_audio_path(&self.audio_dir, "uploaded")?;
        let target = output_path.clone();
        let sample_rate = self.sample_rate;

        tokio::task::spawn_blocking(move || -> Result<()> {
            let (samples, source_rate) = read_wav_mono(&source)?;
            let resampled = resample(&samples, source_rate, sample_rate)?;
            write_wav(&target, &resampled, sample_rate, 1)
        })
        .await
        .context("Audio load task panicked")??;

        info!("Audio file loaded and saved to: {}", output_path.display());
        Ok(output_path)
    }
}

/// Fresh WAV path so concurrent calls never share an artifact
fn unique_audio_path(dir: &Path, prefix: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create audio directory {:?}", dir))?;

    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    Ok(dir.join(format!("{}_{}_{}.wav", prefix, timestamp, &suffix[..8])))
}

/// Read a WAV file, averaging channels down to mono
pub fn read_wav_mono(path: &Path) -> Result<(Vec<f32>, u32)> {
    let mut reader =
        WavReader::open(path).with_context(|| format!("Failed to open audio {:?}", path))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };

    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();

    Ok((mono, spec.sample_rate))
}

/// Write 16-bit PCM samples, clamping to [-1, 1]
pub fn write_wav(path: &Path, samples: &[f32], sample_rate: u32, channels: u16) -> Result<()> {
    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample: BITS_PER_SAMPLE,
        sample_format: SampleFormat::Int,
    };

    let mut writer = WavWriter::create(path, spec)
        .with_context(|| format!("Failed to create {:?}", path))?;

    info!("Saving {} samples to {}", samples.len(), path.display());

    for &sample in samples {
        let amplitude = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer.write_sample(amplitude)?;
    }

    writer.finalize()?;
    Ok(())
}

/// Band-limited sinc resampler for mono audio.
///
/// Output length is `len * to_rate / from_rate`, rounded, with the filter delay removed.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let (sinc_len, interpolation) = if ratio >= 2.0 || ratio <= 0.5 {
        (256, SincInterpolationType::Cubic)
    } else {
        (128, SincInterpolationType::Linear)
    };
    debug!("Resampling {}Hz -> {}Hz (ratio: {:.2}x)", from_rate, to_rate, ratio);

    let params = SincInterpolationParameters {
        sinc_len,
        f_cutoff: 0.95,
        interpolation,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, RESAMPLE_CHUNK, 1)?;

    let expected = (samples.len() as f64 * ratio).round() as usize;
    let delay = resampler.output_delay();
    let mut output = Vec::with_capacity(expected + delay);

    let mut chunks = samples.chunks_exact(RESAMPLE_CHUNK);
    for chunk in &mut chunks {
        let frame: [&[f32]; 1] = [chunk];
        let out = resampler.process(&frame[..], None)?;
        output.extend_from_slice(&out[0]);
    }
    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        let frame: [&[f32]; 1] = [remainder];
        let out = resampler.process_partial(Some(&frame[..]), None)?;
        output.extend_from_slice(&out[0]);
    }

    // Flush the filter tail
    while output.len() < expected + delay {
        let out = resampler.process_partial(None::<&[&[f32]]>, None)?;
        if out[0].is_empty() {
            break;
        }
        output.extend_from_slice(&out[0]);
    }

    output.drain(..delay.min(output.len()));
    output.resize(expected, 0.0);
    Ok(output)
}

/// List all available audio input devices
pub fn list_audio_devices() -> Result<()> {
    let host = cpal::default_host();

    println!("\nAvailable audio input devices:");
    println!("==============================");

    let default_name = host
        .default_input_device()
        .and_then(|d| d.name().ok())
        .unwrap_or_else(|| "None".to_string());

    for (index, device) in host.input_devices()?.enumerate() {
        let name = device.name()?;
        let is_default = name == default_name;

        let configs: Vec<_> = device.supported_input_configs()?.collect();
        let sample_rates: Vec<u32> = configs.iter().map(|c| c.max_sample_rate().0).collect();

        println!(
            "{:2}. {} {}",
            index + 1,
            name,
            if is_default { "(DEFAULT)" } else { "" }
        );
        println!("    Sample rates: {:?}", sample_rates);
        println!(
            "    Channels: {}",
            configs.first().map(|c| c.channels()).unwrap_or(0)
        );
    }

    Ok(())
}
