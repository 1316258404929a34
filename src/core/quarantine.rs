use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::core::features::SpamFeatures;

/// Destination for spam call reports kept for manual audit
#[cfg_attr(test, mockall::automock)]
pub trait ReportSink: Send + Sync {
    fn write_report(&self, call_id: i64, content: &str) -> Result<PathBuf>;
}

/// Human-readable summary of a call that was blocked as spam
#[derive(Debug, Clone)]
pub struct SpamReport<'a> {
    pub call_id: i64,
    pub audio_path: &'a Path,
    pub confidence: f64,
    pub transcript: &'a str,
    pub features: &'a SpamFeatures,
    pub detected_at: DateTime<Local>,
}

impl SpamReport<'_> {
    pub fn to_text(&self) -> String {
        let mut content = String::new();

        content.push_str("SPAM CALL DETECTED\n");
        content.push_str(&"=".repeat(50));
        content.push('\n');
        content.push_str(&format!("Call ID: {}\n", self.call_id));
        content.push_str(&format!("Detected: {}\n", self.detected_at.to_rfc3339()));
        content.push_str(&format!("Audio: {}\n", self.audio_path.display()));
        content.push_str(&format!("Confidence: {:.2}%\n", self.confidence * 100.0));

        content.push_str(&format!("\nTranscript:\n{}\n", self.transcript));

        content.push_str("\nSpam Features:\n");
        for (category, found) in self.features {
            if found.detected {
                content.push_str(&format!(
                    "  {}: {} ({})\n",
                    category,
                    found.count,
                    found.keywords.join(", ")
                ));
            } else {
                content.push_str(&format!("  {}: none\n", category));
            }
        }

        content
    }
}

/// Writes reports as `spam_call_<id>.txt` into the quarantine directory
pub struct FileQuarantine {
    directory: PathBuf,
}

impl FileQuarantine {
    pub fn new(directory: &Path) -> Self {
        Self {
            directory: directory.to_path_buf(),
        }
    }

    pub fn report_path(&self, call_id: i64) -> PathBuf {
        self.directory.join(format!("spam_call_{}.txt", call_id))
    }
}

impl ReportSink for FileQuarantine {
    fn write_report(&self, call_id: i64, content: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.directory)
            .with_context(|| format!("Failed to create quarantine {:?}", self.directory))?;

        let path = self.report_path(call_id);
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write spam report {:?}", path))?;

        info!("Spam call report written: {}", path.display());
        Ok(path)
    }
}
