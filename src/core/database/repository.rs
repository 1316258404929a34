use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use sqlx::{query, query_as, Row};
use std::path::Path;
use tracing::{info, warn};

use super::models::{CallRow, SpamRow};
use super::{CallRecord, CallStatistics, Database, NewCall, SpamSideRecord};

const CALL_COLUMNS: &str = r#"
    SELECT c.call_id, c.audio_path, c.transcript, t.language, t.segments,
           c.spam_probability, c.boost, c.spam_confidence, c.is_spam, c.scored,
           c.spam_features, c.duration_seconds, c.status, c.metadata, c.created_at
    FROM calls c
    JOIN transcripts t ON t.call_id = c.call_id
"#;

const CSV_HEADER: [&str; 9] = [
    "call_id",
    "created_at",
    "status",
    "is_spam",
    "spam_confidence",
    "scored",
    "duration_seconds",
    "audio_path",
    "transcript",
];

/// One flat line of the CSV call log, columns in `CSV_HEADER` order
#[derive(Serialize)]
struct CsvRow<'a> {
    call_id: i64,
    created_at: String,
    status: &'static str,
    is_spam: bool,
    spam_confidence: f64,
    scored: bool,
    duration_seconds: f64,
    audio_path: &'a str,
    transcript: &'a str,
}

impl Database {
    /// Store a call with its transcript, and its spam side record when it is spam.
    ///
    /// Everything is written in one transaction: on any error nothing is visible.
    pub async fn insert_call(&self, call: &NewCall) -> Result<i64> {
        let score = &call.spam_score;
        let features_json = serde_json::to_string(&score.features)?;
        let segments_json = serde_json::to_string(&call.transcript.segments)?;
        let metadata_json = serde_json::to_string(&call.metadata)?;
        let audio_path = call.audio_path.to_string_lossy().to_string();
        let created_at = Utc::now();

        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let call_id = query(
            r#"
            INSERT INTO calls (
                audio_path, transcript, spam_probability, boost, spam_confidence,
                is_spam, scored, spam_features, duration_seconds, status, metadata, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&audio_path)
        .bind(&call.transcript.text)
        .bind(score.spam_probability)
        .bind(score.boost)
        .bind(score.confidence)
        .bind(score.is_spam)
        .bind(score.scored)
        .bind(&features_json)
        .bind(call.duration_seconds)
        .bind(call.status().as_str())
        .bind(&metadata_json)
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .context("Failed to insert call")?
        .last_insert_rowid();

        query(
            r#"
            INSERT INTO transcripts (call_id, full_text, language, segments, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(call_id)
        .bind(&call.transcript.text)
        .bind(&call.transcript.language)
        .bind(&segments_json)
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .context("Failed to insert transcript")?;

        if score.is_spam {
            query(
                r#"
                INSERT INTO spam_calls (
                    call_id, audio_path, transcript, spam_confidence, spam_features, blocked_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(call_id)
            .bind(&audio_path)
            .bind(&call.transcript.text)
            .bind(score.confidence)
            .bind(&features_json)
            .bind(created_at)
            .execute(&mut *tx)
            .await
            .context("Failed to insert spam record")?;
        }

        tx.commit().await.context("Failed to commit call")?;

        info!("Call logged successfully: call_id={}, spam={}", call_id, score.is_spam);
        Ok(call_id)
    }

    pub async fn get_call(&self, call_id: i64) -> Result<Option<CallRecord>> {
        let sql = format!("{} WHERE c.call_id = ?1", CALL_COLUMNS);
        let row = query_as::<_, CallRow>(&sql)
            .bind(call_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(CallRecord::from))
    }

    /// Most recent calls first
    pub async fn list_calls(&self, limit: u32, spam_only: bool) -> Result<Vec<CallRecord>> {
        // Ids are handed out in insertion order, which is creation order
        let sql = if spam_only {
            format!("{} WHERE c.is_spam = 1 ORDER BY c.call_id DESC LIMIT ?1", CALL_COLUMNS)
        } else {
            format!("{} ORDER BY c.call_id DESC LIMIT ?1", CALL_COLUMNS)
        };

        let rows = query_as::<_, CallRow>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(CallRecord::from).collect())
    }

    pub async fn get_spam_record(&self, call_id: i64) -> Result<Option<SpamSideRecord>> {
        let row = query_as::<_, SpamRow>(
            r#"
            SELECT call_id, audio_path, transcript, spam_confidence, spam_features, blocked_at
            FROM spam_calls WHERE call_id = ?1
            "#,
        )
        .bind(call_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(SpamSideRecord::from))
    }

    pub async fn statistics(&self) -> Result<CallStatistics> {
        let row = query(
            r#"
            SELECT
                COUNT(*) AS total_calls,
                COALESCE(SUM(CASE WHEN is_spam = 1 THEN 1 ELSE 0 END), 0) AS spam_calls,
                AVG(CASE WHEN is_spam = 1 THEN spam_confidence END) AS average_spam_confidence
            FROM calls
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let total_calls: i64 = row.try_get("total_calls")?;
        let spam_calls: i64 = row.try_get("spam_calls")?;
        let average: Option<f64> = row.try_get("average_spam_confidence")?;

        let spam_rate = if total_calls > 0 {
            spam_calls as f64 / total_calls as f64 * 100.0
        } else {
            0.0
        };

        Ok(CallStatistics {
            total_calls,
            spam_calls,
            legitimate_calls: total_calls - spam_calls,
            spam_rate,
            average_spam_confidence: average.unwrap_or(0.0),
        })
    }

    /// Write stored calls to `output_path` as a JSON array, returning how many were written
    pub async fn export_json(&self, output_path: &Path, spam_only: bool) -> Result<usize> {
        let calls = self.list_calls(u32::MAX, spam_only).await?;

        if calls.is_empty() {
            warn!("No calls to export");
        }

        let content = serde_json::to_string_pretty(&calls)?;
        std::fs::write(output_path, content)
            .with_context(|| format!("Failed to write export {:?}", output_path))?;

        info!("Exported {} calls to {}", calls.len(), output_path.display());
        Ok(calls.len())
    }

    /// Write stored calls to `output_path` as CSV, one row per call, returning the row count
    pub async fn export_csv(&self, output_path: &Path, spam_only: bool) -> Result<usize> {
        let calls = self.list_calls(u32::MAX, spam_only).await?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(output_path)
            .with_context(|| format!("Failed to create export {:?}", output_path))?;
        writer.write_record(CSV_HEADER)?;

        for call in &calls {
            writer.serialize(CsvRow {
                call_id: call.call_id,
                created_at: call.created_at.to_rfc3339(),
                status: call.status.as_str(),
                is_spam: call.spam_score.is_spam,
                spam_confidence: call.spam_score.confidence,
                scored: call.spam_score.scored,
                duration_seconds: call.duration_seconds,
                audio_path: &call.audio_path,
                transcript: &call.transcript.text,
            })?;
        }
        writer.flush()?;

        info!("Exported {} calls to {}", calls.len(), output_path.display());
        Ok(calls.len())
    }
}
