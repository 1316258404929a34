use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::core::config::WhisperConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    pub language: String,
    pub segments: Vec<TranscriptSegment>,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f32,
    pub end: f32,
    pub text: String,
}

impl Transcript {
    pub fn new(text: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            language: language.into(),
            segments: Vec::new(),
            succeeded: true,
            error: None,
        }
    }

    pub fn failed(language: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            language: language.into(),
            segments: Vec::new(),
            succeeded: false,
            error: Some(reason.into()),
        }
    }

    pub fn with_segments(mut self, segments: Vec<TranscriptSegment>) -> Self {
        self.segments = segments;
        self
    }
}

/// Speech-to-text engine.
///
/// Recoverable problems (bad audio, engine exit codes) come back as a transcript with
/// `succeeded == false`, never as a panic or error.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transcribe: Send + Sync {
    async fn transcribe(&self, audio_path: &Path, language: &str) -> Transcript;
}

/// whisper.cpp command line transcriber
pub struct Transcriber {
    whisper_path: PathBuf,
    model_path: PathBuf,
    threads: u32,
    output_dir: PathBuf,
}

impl Transcriber {
    pub fn new(config: &WhisperConfig, output_dir: &Path) -> Result<Self> {
        let whisper_path = match &config.binary {
            Some(path) => path.clone(),
            None => Self::find_binary()?,
        };

        info!("Found whisper binary at: {:?}", whisper_path);

        let model_path = match &config.model_path {
            Some(path) => path.clone(),
            None => {
                let whisper_dir = whisper_path
                    .parent()
                    .and_then(|p| p.parent())
                    .ok_or_else(|| anyhow::anyhow!("Invalid whisper path"))?;
                whisper_dir.join(format!("models/ggml-{}.bin", config.model))
            }
        };

        if !model_path.exists() {
            warn!("Model {:?} not found, transcription will fail until it is installed", model_path);
        }

        Ok(Self {
            whisper_path,
            model_path,
            threads: config.threads,
            output_dir: output_dir.to_path_buf(),
        })
    }

    fn find_binary() -> Result<PathBuf> {
        // Try to find whisper in the usual build locations
        let possible_paths = [
            PathBuf::from("whisper/Release/whisper-cli"),
            PathBuf::from("whisper/Release/whisper-cli.exe"),
            PathBuf::from("whisper/build/bin/whisper-cli"),
            PathBuf::from("/usr/local/bin/whisper-cli"),
        ];

        possible_paths
            .iter()
            .find(|p| p.exists())
            .cloned()
            .ok_or_else(|| {
                anyhow::anyhow!("Whisper binary not found. Tried paths: {:?}", possible_paths)
            })
    }

    async fn run_whisper(&self, audio_path: &Path, language: &str) -> Result<Transcript> {
        if !audio_path.exists() {
            bail!("Audio file not found: {:?}", audio_path);
        }

        std::fs::create_dir_all(&self.output_dir)?;
        let stem = audio_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("transcript");
        let output_base = self.output_dir.join(stem);

        let output = Command::new(&self.whisper_path)
            .arg("--model").arg(&self.model_path)
            .arg("--file").arg(audio_path)
            .arg("--output-json")
            .arg("--output-file").arg(&output_base)
            .arg("--language").arg(language)
            .arg("--threads").arg(self.threads.to_string())
            .arg("--no-prints")
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to execute whisper")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("Whisper failed: {}", stderr.trim());
        }

        // The JSON stays in the transcripts directory as the archived transcript
        let json_path = output_base.with_extension("json");
        let json_content = std::fs::read_to_string(&json_path)
            .with_context(|| format!("Whisper produced no output at {:?}", json_path))?;

        parse_whisper_json(&json_content, language)
    }
}

#[async_trait]
impl Transcribe for Transcriber {
    async fn transcribe(&self, audio_path: &Path, language: &str) -> Transcript {
        info!("Transcribing audio file: {:?}", audio_path);

        match self.run_whisper(audio_path, language).await {
            Ok(transcript) => {
                info!("Transcription successful: {} characters", transcript.text.len());
                transcript
            }
            Err(e) => {
                error!("Transcription failed: {:#}", e);
                Transcript::failed(language, format!("{:#}", e))
            }
        }
    }
}

// whisper.cpp JSON output structures
#[derive(Debug, Deserialize)]
struct WhisperOutput {
    #[serde(default)]
    result: Option<WhisperResult>,
    transcription: Vec<WhisperSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperResult {
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    offsets: WhisperOffsets,
    text: String,
}

#[derive(Debug, Deserialize)]
struct WhisperOffsets {
    from: u64,
    to: u64,
}

fn parse_whisper_json(content: &str, default_language: &str) -> Result<Transcript> {
    let whisper_output: WhisperOutput =
        serde_json::from_str(content).context("Unreadable whisper JSON")?;

    let segments: Vec<TranscriptSegment> = whisper_output
        .transcription
        .into_iter()
        .map(|s| TranscriptSegment {
            start: s.offsets.from as f32 / 1000.0,
            end: s.offsets.to as f32 / 1000.0,
            text: s.text.trim().to_string(),
        })
        .collect();

    let text = segments
        .iter()
        .map(|s| s.text.as_str())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    let language = whisper_output
        .result
        .and_then(|r| r.language)
        .unwrap_or_else(|| default_language.to_string());

    Ok(Transcript::new(text, language).with_segments(segments))
}
