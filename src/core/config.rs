use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub audio: AudioConfig,
    pub spam: SpamConfig,
    pub storage: StorageConfig,
    pub whisper: WhisperConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub device: Option<String>,
    /// Fraction of gain removed from frames judged to be background noise
    pub noise_reduction: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpamConfig {
    pub threshold: f64,
    pub primary_boost: f64,
    pub secondary_boost: f64,
    /// Optional `{"keywords": [...]}` list merged into the boost phrases
    pub keywords_file: Option<PathBuf>,
    pub extra_keywords: Vec<String>,
    /// Logistic model weights; without them every call is stored unscored
    pub model_path: Option<PathBuf>,
    pub on_scoring_failure: ScoringFailurePolicy,
}

/// How to label a call whose transcript could not be scored
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoringFailurePolicy {
    #[default]
    Legitimate,
    Spam,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub audio_directory: PathBuf,
    pub transcripts_directory: PathBuf,
    pub quarantine_directory: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhisperConfig {
    pub binary: Option<PathBuf>,
    pub model: String,
    pub model_path: Option<PathBuf>,
    pub language: String,
    pub threads: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Extra time allowed on top of a recording's length, or for loading a file
    pub acquisition_timeout_secs: u64,
    pub transcription_timeout_secs: u64,
    pub persistence_timeout_secs: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            device: None,
            noise_reduction: 0.8,
        }
    }
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            primary_boost: 0.15,
            secondary_boost: 0.05,
            keywords_file: None,
            extra_keywords: Vec::new(),
            model_path: None,
            on_scoring_failure: ScoringFailurePolicy::Legitimate,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/callguard.db"),
            audio_directory: PathBuf::from("data/recordings"),
            transcripts_directory: PathBuf::from("data/transcripts"),
            quarantine_directory: PathBuf::from("data/spam"),
        }
    }
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            binary: None,
            model: "base.en".to_string(),
            model_path: None,
            language: "en".to_string(),
            threads: 4,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            acquisition_timeout_secs: 30,
            transcription_timeout_secs: 300,
            persistence_timeout_secs: 10,
        }
    }
}

impl PipelineConfig {
    pub fn acquisition_timeout(&self) -> Duration {
        Duration::from_secs(self.acquisition_timeout_secs)
    }

    pub fn transcription_timeout(&self) -> Duration {
        Duration::from_secs(self.transcription_timeout_secs)
    }

    pub fn persistence_timeout(&self) -> Duration {
        Duration::from_secs(self.persistence_timeout_secs)
    }
}

impl Config {
    /// Load from `path`, or from the platform config file when no path is given.
    ///
    /// A missing default file yields defaults; a missing explicit file is an error.
    /// Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(default) if default.exists() => Self::from_file(&default)?,
                _ => {
                    info!("No config file found, using defaults");
                    Self::default()
                }
            },
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("Invalid config {:?}", path))?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_context(|| format!("Failed to write {:?}", path))?;
        Ok(())
    }

    /// Default `tracing` filter directive for the configured log level
    pub fn log_directive(&self) -> String {
        format!("callguard={}", self.log_level.as_deref().unwrap_or("info"))
    }

    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "callguard").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Create the database parent and all storage directories
    pub fn ensure_directories(&self) -> Result<()> {
        let storage = &self.storage;
        if let Some(parent) = storage.database_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        for dir in [
            &storage.audio_directory,
            &storage.transcripts_directory,
            &storage.quarantine_directory,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory {:?}", dir))?;
        }
        Ok(())
    }

    fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("SPAM_THRESHOLD") {
            self.spam.threshold = value
                .parse()
                .with_context(|| format!("SPAM_THRESHOLD is not a number: {}", value))?;
        }
        if let Some(value) = lookup("SAMPLE_RATE") {
            self.audio.sample_rate = value
                .parse()
                .with_context(|| format!("SAMPLE_RATE is not an integer: {}", value))?;
        }
        if let Some(value) = lookup("DB_PATH") {
            self.storage.database_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("AUDIO_STORAGE_PATH") {
            self.storage.audio_directory = PathBuf::from(value);
        }
        if let Some(value) = lookup("TRANSCRIPTS_PATH") {
            self.storage.transcripts_directory = PathBuf::from(value);
        }
        if let Some(value) = lookup("SPAM_STORAGE_PATH") {
            self.storage.quarantine_directory = PathBuf::from(value);
        }
        if let Some(value) = lookup("LOG_LEVEL") {
            self.log_level = Some(value.to_lowercase());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let spam = &self.spam;
        if !(0.0..=1.0).contains(&spam.threshold) {
            bail!("spam.threshold must be within [0, 1], got {}", spam.threshold);
        }
        for (name, boost) in [
            ("primary_boost", spam.primary_boost),
            ("secondary_boost", spam.secondary_boost),
        ] {
            if !(boost.is_finite() && boost >= 0.0) {
                bail!("spam.{} must be a non-negative number, got {}", name, boost);
            }
        }
        if self.audio.sample_rate == 0 {
            bail!("audio.sample_rate must be positive");
        }
        if self.audio.channels == 0 {
            bail!("audio.channels must be positive");
        }
        if !(0.0..=1.0).contains(&self.audio.noise_reduction) {
            bail!("audio.noise_reduction must be within [0, 1]");
        }
        if spam.primary_boost + spam.secondary_boost > 0.2 + f64::EPSILON {
            warn!(
                "Boosts add up to {:.2}, more than the usual 0.20",
                spam.primary_boost + spam.secondary_boost
            );
        }
        Ok(())
    }
}
