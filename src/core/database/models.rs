use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::core::features::SpamFeatures;
use crate::core::scoring::SpamScore;
use crate::core::transcription::{Transcript, TranscriptSegment};

pub type Metadata = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Processed,
    SpamBlocked,
}

impl CallStatus {
    pub fn from_spam(is_spam: bool) -> Self {
        if is_spam {
            CallStatus::SpamBlocked
        } else {
            CallStatus::Processed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Processed => "processed",
            CallStatus::SpamBlocked => "spam_blocked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "processed" => Some(CallStatus::Processed),
            "spam_blocked" => Some(CallStatus::SpamBlocked),
            _ => None,
        }
    }
}

/// A call ready to be stored; the store assigns its id and creation time
#[derive(Debug, Clone)]
pub struct NewCall {
    pub audio_path: PathBuf,
    pub transcript: Transcript,
    pub spam_score: SpamScore,
    pub duration_seconds: f64,
    pub metadata: Metadata,
}

impl NewCall {
    pub fn status(&self) -> CallStatus {
        CallStatus::from_spam(self.spam_score.is_spam)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallRecord {
    pub call_id: i64,
    pub audio_path: String,
    pub transcript: Transcript,
    pub spam_score: SpamScore,
    pub duration_seconds: f64,
    pub status: CallStatus,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpamSideRecord {
    pub call_id: i64,
    pub audio_path: String,
    pub transcript: String,
    pub spam_confidence: f64,
    pub spam_features: SpamFeatures,
    pub blocked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallStatistics {
    pub total_calls: i64,
    pub spam_calls: i64,
    pub legitimate_calls: i64,
    /// Percentage of calls blocked as spam
    pub spam_rate: f64,
    pub average_spam_confidence: f64,
}

/// `calls` joined with `transcripts`
#[derive(Debug, FromRow)]
pub(super) struct CallRow {
    pub call_id: i64,
    pub audio_path: String,
    pub transcript: String,
    pub language: String,
    pub segments: Json<Vec<TranscriptSegment>>,
    pub spam_probability: f64,
    pub boost: f64,
    pub spam_confidence: f64,
    pub is_spam: bool,
    pub scored: bool,
    pub spam_features: Json<SpamFeatures>,
    pub duration_seconds: f64,
    pub status: String,
    pub metadata: Json<Metadata>,
    pub created_at: DateTime<Utc>,
}

impl From<CallRow> for CallRecord {
    fn from(row: CallRow) -> Self {
        // The table CHECK keeps status and is_spam in step
        let status = CallStatus::parse(&row.status).unwrap_or(CallStatus::from_spam(row.is_spam));

        CallRecord {
            call_id: row.call_id,
            audio_path: row.audio_path,
            transcript: Transcript::new(row.transcript, row.language)
                .with_segments(row.segments.0),
            spam_score: SpamScore {
                spam_probability: row.spam_probability,
                boost: row.boost,
                confidence: row.spam_confidence,
                is_spam: row.is_spam,
                features: row.spam_features.0,
                scored: row.scored,
            },
            duration_seconds: row.duration_seconds,
            status,
            metadata: row.metadata.0,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub(super) struct SpamRow {
    pub call_id: i64,
    pub audio_path: String,
    pub transcript: String,
    pub spam_confidence: f64,
    pub spam_features: Json<SpamFeatures>,
    pub blocked_at: DateTime<Utc>,
}

impl From<SpamRow> for SpamSideRecord {
    fn from(row: SpamRow) -> Self {
        SpamSideRecord {
            call_id: row.call_id,
            audio_path: row.audio_path,
            transcript: row.transcript,
            spam_confidence: row.spam_confidence,
            spam_features: row.spam_features.0,
            blocked_at: row.blocked_at,
        }
    }
}
