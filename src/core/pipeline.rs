use chrono::Local;
use futures_util::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::core::audio::AudioSource;
use crate::core::config::{Config, ScoringFailurePolicy};
use crate::core::database::{CallStatus, Database, Metadata, NewCall};
use crate::core::error::PipelineError;
use crate::core::features::{detected_categories, SpamFeatures};
use crate::core::preprocess::Preprocess;
use crate::core::quarantine::{ReportSink, SpamReport};
use crate::core::scoring::{SpamScore, SpamScorer};
use crate::core::transcription::{Transcribe, Transcript};

/// Where a call's audio comes from
#[derive(Debug, Clone, PartialEq)]
pub enum CallSource {
    File(PathBuf),
    Record { seconds: u64 },
}

impl CallSource {
    fn source_type(&self) -> &'static str {
        match self {
            CallSource::File(_) => "file",
            CallSource::Record { .. } => "record",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub language: String,
    pub acquisition_timeout: Duration,
    pub transcription_timeout: Duration,
    pub persistence_timeout: Duration,
    pub on_scoring_failure: ScoringFailurePolicy,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            language: config.whisper.language.clone(),
            acquisition_timeout: config.pipeline.acquisition_timeout(),
            transcription_timeout: config.pipeline.transcription_timeout(),
            persistence_timeout: config.pipeline.persistence_timeout(),
            on_scoring_failure: config.spam.on_scoring_failure,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessedCall {
    pub call_id: i64,
    pub audio_path: PathBuf,
    pub transcript: String,
    pub is_spam: bool,
    pub confidence: f64,
    pub features: SpamFeatures,
    /// Seconds from pipeline start to result assembly
    pub processing_time: f64,
    pub status: CallStatus,
    pub scored: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedCall {
    pub error: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_path: Option<PathBuf>,
}

impl FailedCall {
    fn new(error: PipelineError, audio_path: Option<&Path>) -> Self {
        Self {
            kind: error.kind().to_string(),
            error: error.to_string(),
            audio_path: audio_path.map(Path::to_path_buf),
        }
    }
}

/// Outcome of one call. Serializes flat, with a `success` flag.
#[derive(Debug, Clone)]
pub enum CallResult {
    Processed(ProcessedCall),
    Failed(FailedCall),
}

impl CallResult {
    pub fn is_success(&self) -> bool {
        matches!(self, CallResult::Processed(_))
    }

    pub fn call_id(&self) -> Option<i64> {
        match self {
            CallResult::Processed(call) => Some(call.call_id),
            CallResult::Failed(_) => None,
        }
    }
}

#[derive(Serialize)]
struct Flagged<'a, T: Serialize> {
    success: bool,
    #[serde(flatten)]
    inner: &'a T,
}

impl Serialize for CallResult {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CallResult::Processed(call) => Flagged {
                success: true,
                inner: call,
            }
            .serialize(serializer),
            CallResult::Failed(call) => Flagged {
                success: false,
                inner: call,
            }
            .serialize(serializer),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("collaborator panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("collaborator panicked: {}", message)
    } else {
        "collaborator panicked".to_string()
    }
}

/// Runs a call through acquisition, cleanup, transcription, scoring and storage.
///
/// Calls are independent; one pipeline can serve many concurrent `process_call`s.
pub struct CallPipeline {
    audio: Arc<dyn AudioSource>,
    preprocessor: Arc<dyn Preprocess>,
    transcriber: Arc<dyn Transcribe>,
    scorer: Arc<SpamScorer>,
    store: Arc<Database>,
    quarantine: Arc<dyn ReportSink>,
    settings: PipelineSettings,
}

impl CallPipeline {
    pub fn new(
        audio: Arc<dyn AudioSource>,
        preprocessor: Arc<dyn Preprocess>,
        transcriber: Arc<dyn Transcribe>,
        scorer: Arc<SpamScorer>,
        store: Arc<Database>,
        quarantine: Arc<dyn ReportSink>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            audio,
            preprocessor,
            transcriber,
            scorer,
            store,
            quarantine,
            settings,
        }
    }

    /// Process one call end to end. Never returns an error or unwinds; failures,
    /// collaborator panics included, come back as [`CallResult::Failed`].
    pub async fn process_call(&self, source: CallSource) -> CallResult {
        let started = Instant::now();
        info!("Processing call from {:?}", source);

        let outcome = AssertUnwindSafe(self.run(&source, started))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let error = PipelineError::Internal(panic_message(panic.as_ref()));
                Err(FailedCall::new(error, None))
            });

        match outcome {
            Ok(call) => {
                info!(
                    "Call {} processed: {} ({:.2}%) in {:.2}s",
                    call.call_id,
                    call.status.as_str(),
                    call.confidence * 100.0,
                    call.processing_time
                );
                CallResult::Processed(call)
            }
            Err(failed) => {
                error!("Call processing failed [{}]: {}", failed.kind, failed.error);
                CallResult::Failed(failed)
            }
        }
    }

    async fn run(&self, source: &CallSource, started: Instant) -> Result<ProcessedCall, FailedCall> {
        let acquired = self
            .acquire(source)
            .await
            .map_err(|e| FailedCall::new(e, None))?;

        let (audio, warnings) = self.preprocess(&acquired).await;

        let transcript = self
            .transcribe(&audio)
            .await
            .map_err(|e| FailedCall::new(e, Some(audio.as_path())))?;

        let (score, scoring_error) = self.score(&transcript);

        let mut metadata = Metadata::new();
        metadata.insert("source_type".into(), source.source_type().into());
        metadata.insert(
            "original_audio".into(),
            acquired.to_string_lossy().to_string().into(),
        );
        if !warnings.is_empty() {
            metadata.insert("preprocessing_warnings".into(), warnings.into());
        }
        if let Some(reason) = &scoring_error {
            metadata.insert("unscored".into(), true.into());
            metadata.insert("scoring_error".into(), reason.clone().into());
        }
        let duration_seconds = started.elapsed().as_secs_f64();
        metadata.insert("processing_time".into(), duration_seconds.into());

        let call = NewCall {
            audio_path: audio.clone(),
            transcript,
            spam_score: score,
            duration_seconds,
            metadata,
        };
        let call_id = self
            .persist(&call)
            .await
            .map_err(|e| FailedCall::new(e, Some(audio.as_path())))?;

        if call.spam_score.is_spam {
            if let Err(e) = self.quarantine_report(call_id, &call).await {
                warn!("Call {} stored but not quarantined: {}", call_id, e);
            }
        }

        let NewCall {
            audio_path,
            transcript,
            spam_score,
            ..
        } = call;

        Ok(ProcessedCall {
            call_id,
            audio_path,
            transcript: transcript.text,
            is_spam: spam_score.is_spam,
            confidence: spam_score.confidence,
            status: CallStatus::from_spam(spam_score.is_spam),
            scored: spam_score.scored,
            features: spam_score.features,
            processing_time: started.elapsed().as_secs_f64(),
        })
    }

    async fn acquire(&self, source: &CallSource) -> Result<PathBuf, PipelineError> {
        let (limit, acquired) = match source {
            CallSource::File(path) => (
                self.settings.acquisition_timeout,
                timeout(self.settings.acquisition_timeout, self.audio.load_file(path)).await,
            ),
            CallSource::Record { seconds } => {
                // The recording itself does not count against the limit
                let limit = self.settings.acquisition_timeout + Duration::from_secs(*seconds);
                (limit, timeout(limit, self.audio.record(*seconds)).await)
            }
        };

        match acquired {
            Ok(Ok(path)) => Ok(path),
            Ok(Err(e)) => Err(PipelineError::AcquisitionFailed(format!("{:#}", e))),
            Err(_) => Err(PipelineError::AcquisitionFailed(format!(
                "timed out after {:?}",
                limit
            ))),
        }
    }

    /// Best effort: returns the audio to transcribe plus any degradation reasons
    async fn preprocess(&self, acquired: &Path) -> (PathBuf, Vec<String>) {
        let preprocessor = self.preprocessor.clone();
        let input = acquired.to_path_buf();

        let steps = tokio::task::spawn_blocking(move || {
            let reduced = preprocessor.reduce_noise(&input);
            let normalized = preprocessor.normalize(reduced.audio());
            (reduced, normalized)
        })
        .await;

        match steps {
            Ok((reduced, normalized)) => {
                let warnings: Vec<String> = [reduced.degradation(), normalized.degradation()]
                    .into_iter()
                    .flatten()
                    .map(str::to_string)
                    .collect();
                for warning in &warnings {
                    warn!("Preprocessing degraded: {}", warning);
                }
                (normalized.into_audio(), warnings)
            }
            Err(e) => {
                warn!("Preprocessing task failed, using acquired audio: {}", e);
                (
                    acquired.to_path_buf(),
                    vec![format!("preprocessing task failed: {}", e)],
                )
            }
        }
    }

    async fn transcribe(&self, audio: &Path) -> Result<Transcript, PipelineError> {
        let limit = self.settings.transcription_timeout;
        let transcript = timeout(limit, self.transcriber.transcribe(audio, &self.settings.language))
            .await
            .map_err(|_| PipelineError::TranscriptionFailed(format!("timed out after {:?}", limit)))?;

        if !transcript.succeeded {
            let reason = transcript
                .error
                .unwrap_or_else(|| "transcriber reported failure".to_string());
            return Err(PipelineError::TranscriptionFailed(reason));
        }

        info!("Transcription: {}", transcript.text);
        Ok(transcript)
    }

    /// Score the transcript, falling back to the configured policy when the model is down
    fn score(&self, transcript: &Transcript) -> (SpamScore, Option<String>) {
        match self.scorer.score(&transcript.text) {
            Ok(score) => (score, None),
            Err(e) => {
                warn!("{}; storing call as unscored", e);
                let mut score = SpamScore::unscored(&transcript.text);
                if self.settings.on_scoring_failure == ScoringFailurePolicy::Spam {
                    score.is_spam = true;
                }
                (score, Some(e.to_string()))
            }
        }
    }

    async fn persist(&self, call: &NewCall) -> Result<i64, PipelineError> {
        let limit = self.settings.persistence_timeout;
        match timeout(limit, self.store.insert_call(call)).await {
            Ok(Ok(call_id)) => Ok(call_id),
            Ok(Err(e)) => Err(PipelineError::PersistenceFailed(format!("{:#}", e))),
            Err(_) => Err(PipelineError::PersistenceFailed(format!(
                "timed out after {:?}",
                limit
            ))),
        }
    }

    async fn quarantine_report(
        &self,
        call_id: i64,
        call: &NewCall,
    ) -> Result<PathBuf, PipelineError> {
        let report = SpamReport {
            call_id,
            audio_path: &call.audio_path,
            confidence: call.spam_score.confidence,
            transcript: &call.transcript.text,
            features: &call.spam_score.features,
            detected_at: Local::now(),
        };

        info!(
            "Blocking spam call {} (indicators: {:?})",
            call_id,
            detected_categories(&call.spam_score.features)
        );

        let content = report.to_text();
        let quarantine = self.quarantine.clone();
        tokio::task::spawn_blocking(move || quarantine.write_report(call_id, &content))
            .await
            .map_err(|e| PipelineError::SideEffectFailed(format!("report task failed: {}", e)))?
            .map_err(|e| PipelineError::SideEffectFailed(format!("{:#}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audio::MockAudioSource;
    use crate::core::config::SpamConfig;
    use crate::core::model::MockProbabilityModel;
    use crate::core::preprocess::{MockPreprocess, Processed};
    use crate::core::quarantine::MockReportSink;
    use crate::core::transcription::MockTranscribe;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use tempfile::TempDir;

    const SPAM_TEXT: &str = "free offer just for you, act now!";
    const HAM_TEXT: &str = "I'd like to schedule a viewing of the apartment";

    fn settings() -> PipelineSettings {
        PipelineSettings {
            language: "en".to_string(),
            acquisition_timeout: Duration::from_secs(5),
            transcription_timeout: Duration::from_secs(5),
            persistence_timeout: Duration::from_secs(5),
            on_scoring_failure: ScoringFailurePolicy::Legitimate,
        }
    }

    fn file_source() -> MockAudioSource {
        let mut audio = MockAudioSource::new();
        audio
            .expect_load_file()
            .returning(|_| Ok(PathBuf::from("data/recordings/uploaded_1.wav")));
        audio
    }

    fn clean_preprocessor() -> MockPreprocess {
        let mut preprocessor = MockPreprocess::new();
        preprocessor
            .expect_reduce_noise()
            .returning(|p| Processed::Clean(p.with_file_name("uploaded_1_cleaned.wav")));
        preprocessor
            .expect_normalize()
            .returning(|p| Processed::Clean(p.to_path_buf()));
        preprocessor
    }

    fn saying(text: &'static str) -> MockTranscribe {
        let mut transcriber = MockTranscribe::new();
        transcriber
            .expect_transcribe()
            .returning(move |_, language| Transcript::new(text, language));
        transcriber
    }

    fn model(probability: f64) -> MockProbabilityModel {
        let mut model = MockProbabilityModel::new();
        model
            .expect_predict_probability()
            .returning(move |_| Ok(probability));
        model
    }

    fn broken_model() -> MockProbabilityModel {
        let mut model = MockProbabilityModel::new();
        model
            .expect_predict_probability()
            .returning(|_| Err(anyhow!("weights not loaded")));
        model
    }

    struct Harness {
        _dir: TempDir,
        db: Arc<Database>,
    }

    impl Harness {
        async fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let db = Database::open(&dir.path().join("calls.db")).await.unwrap();
            Self { _dir: dir, db }
        }

        fn pipeline(
            &self,
            audio: impl AudioSource + 'static,
            preprocessor: impl Preprocess + 'static,
            transcriber: impl Transcribe + 'static,
            model: impl crate::core::model::ProbabilityModel + 'static,
            quarantine: impl ReportSink + 'static,
            settings: PipelineSettings,
        ) -> CallPipeline {
            let scorer = SpamScorer::new(Arc::new(model), &SpamConfig::default());
            CallPipeline::new(
                Arc::new(audio),
                Arc::new(preprocessor),
                Arc::new(transcriber),
                Arc::new(scorer),
                self.db.clone(),
                Arc::new(quarantine),
                settings,
            )
        }
    }

    #[tokio::test]
    async fn test_spam_call_is_stored_and_quarantined() {
        let harness = Harness::new().await;

        let mut quarantine = MockReportSink::new();
        quarantine
            .expect_write_report()
            .withf(|_, content| {
                content.contains("SPAM CALL DETECTED") && content.contains("Confidence: 75.00%")
            })
            .times(1)
            .returning(|id, _| Ok(PathBuf::from(format!("spam_call_{}.txt", id))));

        let pipeline = harness.pipeline(
            file_source(),
            clean_preprocessor(),
            saying(SPAM_TEXT),
            model(0.55),
            quarantine,
            settings(),
        );

        let result = pipeline
            .process_call(CallSource::File(PathBuf::from("incoming.wav")))
            .await;

        let call = match result {
            CallResult::Processed(call) => call,
            CallResult::Failed(failed) => panic!("call failed: {:?}", failed),
        };
        assert!(call.is_spam);
        assert!(call.scored);
        assert!((call.confidence - 0.75).abs() < 1e-9);
        assert_eq!(call.status, CallStatus::SpamBlocked);
        assert_eq!(
            call.audio_path,
            PathBuf::from("data/recordings/uploaded_1_cleaned.wav")
        );
        assert!(call.features["urgency"].detected);

        let stored = harness.db.get_call(call.call_id).await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::SpamBlocked);
        assert_eq!(stored.transcript.text, SPAM_TEXT);
        assert_eq!(stored.metadata["source_type"], "file");
        assert_eq!(
            stored.metadata["original_audio"],
            "data/recordings/uploaded_1.wav"
        );
        assert!(stored.metadata.get("unscored").is_none());
        assert!(stored.duration_seconds <= call.processing_time);
        assert!(harness.db.get_spam_record(call.call_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_legitimate_call_skips_quarantine() {
        let harness = Harness::new().await;

        let mut quarantine = MockReportSink::new();
        quarantine.expect_write_report().never();

        let pipeline = harness.pipeline(
            file_source(),
            clean_preprocessor(),
            saying(HAM_TEXT),
            model(0.05),
            quarantine,
            settings(),
        );

        let result = pipeline
            .process_call(CallSource::File(PathBuf::from("incoming.wav")))
            .await;

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["is_spam"], false);
        assert_eq!(json["status"], "processed");
        assert!((json["confidence"].as_f64().unwrap() - 0.05).abs() < 1e-9);

        let stats = harness.db.statistics().await.unwrap();
        assert_eq!(stats.total_calls, 1);
        assert_eq!(stats.spam_calls, 0);
    }

    #[tokio::test]
    async fn test_recorded_call() {
        let harness = Harness::new().await;

        let mut audio = MockAudioSource::new();
        audio
            .expect_record()
            .withf(|seconds| *seconds == 3)
            .times(1)
            .returning(|_| Ok(PathBuf::from("data/recordings/call_1.wav")));

        let pipeline = harness.pipeline(
            audio,
            clean_preprocessor(),
            saying(HAM_TEXT),
            model(0.1),
            MockReportSink::new(),
            settings(),
        );

        let result = pipeline.process_call(CallSource::Record { seconds: 3 }).await;
        let call_id = result.call_id().unwrap();

        let stored = harness.db.get_call(call_id).await.unwrap().unwrap();
        assert_eq!(stored.metadata["source_type"], "record");
    }

    #[tokio::test]
    async fn test_acquisition_failure() {
        let harness = Harness::new().await;

        let mut audio = MockAudioSource::new();
        audio
            .expect_load_file()
            .returning(|_| Err(anyhow!("Failed to open WAV file")));

        let pipeline = harness.pipeline(
            audio,
            MockPreprocess::new(),
            MockTranscribe::new(),
            MockProbabilityModel::new(),
            MockReportSink::new(),
            settings(),
        );

        let result = pipeline
            .process_call(CallSource::File(PathBuf::from("missing.wav")))
            .await;

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["kind"], "acquisition_failed");
        assert!(json["error"].as_str().unwrap().contains("Failed to open WAV file"));
        assert!(json.get("audio_path").is_none());
    }

    #[tokio::test]
    async fn test_transcription_failure_stores_nothing() {
        let harness = Harness::new().await;

        let mut transcriber = MockTranscribe::new();
        transcriber
            .expect_transcribe()
            .returning(|_, language| Transcript::failed(language, "whisper exited with code 1"));

        let pipeline = harness.pipeline(
            file_source(),
            clean_preprocessor(),
            transcriber,
            MockProbabilityModel::new(),
            MockReportSink::new(),
            settings(),
        );

        let result = pipeline
            .process_call(CallSource::File(PathBuf::from("incoming.wav")))
            .await;

        match result {
            CallResult::Failed(failed) => {
                assert_eq!(failed.kind, "transcription_failed");
                assert!(failed.error.contains("whisper exited with code 1"));
                assert!(failed.audio_path.is_some());
            }
            CallResult::Processed(_) => panic!("expected failure"),
        }
        assert!(harness.db.list_calls(10, false).await.unwrap().is_empty());
    }

    struct SlowTranscriber;

    #[async_trait]
    impl Transcribe for SlowTranscriber {
        async fn transcribe(&self, _audio_path: &Path, language: &str) -> Transcript {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Transcript::new("too late", language)
        }
    }

    #[tokio::test]
    async fn test_transcription_timeout() {
        let harness = Harness::new().await;

        let pipeline = harness.pipeline(
            file_source(),
            clean_preprocessor(),
            SlowTranscriber,
            MockProbabilityModel::new(),
            MockReportSink::new(),
            PipelineSettings {
                transcription_timeout: Duration::from_millis(50),
                ..settings()
            },
        );

        let result = pipeline
            .process_call(CallSource::File(PathBuf::from("incoming.wav")))
            .await;

        match result {
            CallResult::Failed(failed) => {
                assert_eq!(failed.kind, "transcription_failed");
                assert!(failed.error.contains("timed out"));
            }
            CallResult::Processed(_) => panic!("expected timeout"),
        }
        assert_eq!(harness.db.statistics().await.unwrap().total_calls, 0);
    }

    #[tokio::test]
    async fn test_scoring_failure_stores_unscored_call() {
        let harness = Harness::new().await;

        let pipeline = harness.pipeline(
            file_source(),
            clean_preprocessor(),
            saying(SPAM_TEXT),
            broken_model(),
            MockReportSink::new(),
            settings(),
        );

        let result = pipeline
            .process_call(CallSource::File(PathBuf::from("incoming.wav")))
            .await;

        let call = match result {
            CallResult::Processed(call) => call,
            CallResult::Failed(failed) => panic!("call failed: {:?}", failed),
        };
        assert!(!call.scored);
        assert!(!call.is_spam);
        assert_eq!(call.confidence, 0.0);
        assert_eq!(call.status, CallStatus::Processed);
        // Features are still reported for an unscored call
        assert!(call.features["free_offers"].detected);

        let stored = harness.db.get_call(call.call_id).await.unwrap().unwrap();
        assert_eq!(stored.metadata["unscored"], true);
        assert!(stored.metadata["scoring_error"]
            .as_str()
            .unwrap()
            .contains("weights not loaded"));
    }

    #[tokio::test]
    async fn test_scoring_failure_blocks_under_spam_policy() {
        let harness = Harness::new().await;

        let mut quarantine = MockReportSink::new();
        quarantine
            .expect_write_report()
            .times(1)
            .returning(|id, _| Ok(PathBuf::from(format!("spam_call_{}.txt", id))));

        let pipeline = harness.pipeline(
            file_source(),
            clean_preprocessor(),
            saying(HAM_TEXT),
            broken_model(),
            quarantine,
            PipelineSettings {
                on_scoring_failure: ScoringFailurePolicy::Spam,
                ..settings()
            },
        );

        let result = pipeline
            .process_call(CallSource::File(PathBuf::from("incoming.wav")))
            .await;

        let call_id = result.call_id().unwrap();
        let stored = harness.db.get_call(call_id).await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::SpamBlocked);
        assert!(!stored.spam_score.scored);
        assert_eq!(stored.spam_score.confidence, 0.0);
        assert_eq!(stored.metadata["unscored"], true);
    }

    #[tokio::test]
    async fn test_degraded_preprocessing_continues() {
        let harness = Harness::new().await;

        let mut preprocessor = MockPreprocess::new();
        preprocessor.expect_reduce_noise().returning(|p| Processed::Degraded {
            audio: p.to_path_buf(),
            reason: "noise reduction: audio contains no samples".to_string(),
        });
        preprocessor
            .expect_normalize()
            .returning(|p| Processed::Clean(p.to_path_buf()));

        let pipeline = harness.pipeline(
            file_source(),
            preprocessor,
            saying(HAM_TEXT),
            model(0.05),
            MockReportSink::new(),
            settings(),
        );

        let result = pipeline
            .process_call(CallSource::File(PathBuf::from("incoming.wav")))
            .await;

        let call = match result {
            CallResult::Processed(call) => call,
            CallResult::Failed(failed) => panic!("call failed: {:?}", failed),
        };
        assert_eq!(call.audio_path, PathBuf::from("data/recordings/uploaded_1.wav"));

        let stored = harness.db.get_call(call.call_id).await.unwrap().unwrap();
        let warnings = stored.metadata["preprocessing_warnings"].as_array().unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].as_str().unwrap().starts_with("noise reduction"));
    }

    #[tokio::test]
    async fn test_quarantine_failure_is_not_fatal() {
        let harness = Harness::new().await;

        let mut quarantine = MockReportSink::new();
        quarantine
            .expect_write_report()
            .returning(|_, _| Err(anyhow!("disk full")));

        let pipeline = harness.pipeline(
            file_source(),
            clean_preprocessor(),
            saying(SPAM_TEXT),
            model(0.9),
            quarantine,
            settings(),
        );

        let result = pipeline
            .process_call(CallSource::File(PathBuf::from("incoming.wav")))
            .await;

        assert!(result.is_success());
        let stored = harness
            .db
            .get_call(result.call_id().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, CallStatus::SpamBlocked);
    }

    #[tokio::test]
    async fn test_persistence_failure() {
        let harness = Harness::new().await;
        harness.db.close().await;

        let pipeline = harness.pipeline(
            file_source(),
            clean_preprocessor(),
            saying(SPAM_TEXT),
            model(0.9),
            MockReportSink::new(),
            settings(),
        );

        let result = pipeline
            .process_call(CallSource::File(PathBuf::from("incoming.wav")))
            .await;

        match result {
            CallResult::Failed(failed) => assert_eq!(failed.kind, "persistence_failed"),
            CallResult::Processed(_) => panic!("expected persistence failure"),
        }
    }

    struct SlowAudioSource {
        delay: Duration,
    }

    #[async_trait]
    impl AudioSource for SlowAudioSource {
        async fn record(&self, _duration_secs: u64) -> anyhow::Result<PathBuf> {
            tokio::time::sleep(self.delay).await;
            Ok(PathBuf::from("data/recordings/call_1.wav"))
        }

        async fn load_file(&self, _path: &Path) -> anyhow::Result<PathBuf> {
            tokio::time::sleep(self.delay).await;
            Ok(PathBuf::from("data/recordings/uploaded_1.wav"))
        }
    }

    fn quick_acquisition() -> PipelineSettings {
        PipelineSettings {
            acquisition_timeout: Duration::from_millis(100),
            ..settings()
        }
    }

    #[tokio::test]
    async fn test_file_acquisition_timeout() {
        let harness = Harness::new().await;

        let pipeline = harness.pipeline(
            SlowAudioSource {
                delay: Duration::from_millis(400),
            },
            MockPreprocess::new(),
            MockTranscribe::new(),
            MockProbabilityModel::new(),
            MockReportSink::new(),
            quick_acquisition(),
        );

        let result = pipeline
            .process_call(CallSource::File(PathBuf::from("incoming.wav")))
            .await;

        match result {
            CallResult::Failed(failed) => {
                assert_eq!(failed.kind, "acquisition_failed");
                assert!(failed.error.contains("timed out"));
            }
            CallResult::Processed(_) => panic!("expected acquisition timeout"),
        }
    }

    #[tokio::test]
    async fn test_recording_length_extends_acquisition_limit() {
        let harness = Harness::new().await;

        let pipeline = harness.pipeline(
            SlowAudioSource {
                delay: Duration::from_millis(400),
            },
            clean_preprocessor(),
            saying(HAM_TEXT),
            model(0.05),
            MockReportSink::new(),
            quick_acquisition(),
        );

        // 100ms + 1s covers a 400ms recording
        let result = pipeline.process_call(CallSource::Record { seconds: 1 }).await;
        assert!(result.is_success());

        // 100ms + 0s does not
        let result = pipeline.process_call(CallSource::Record { seconds: 0 }).await;
        match result {
            CallResult::Failed(failed) => {
                assert_eq!(failed.kind, "acquisition_failed");
                assert!(failed.error.contains("timed out after 100ms"));
            }
            CallResult::Processed(_) => panic!("expected acquisition timeout"),
        }
    }

    #[tokio::test]
    async fn test_persistence_timeout() {
        let harness = Harness::new().await;

        // Another connection holds the write lock for the whole call
        let mut blocker = harness.db.pool().acquire().await.unwrap();
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *blocker)
            .await
            .unwrap();

        let pipeline = harness.pipeline(
            file_source(),
            clean_preprocessor(),
            saying(HAM_TEXT),
            model(0.05),
            MockReportSink::new(),
            PipelineSettings {
                persistence_timeout: Duration::from_millis(100),
                ..settings()
            },
        );

        let result = pipeline
            .process_call(CallSource::File(PathBuf::from("incoming.wav")))
            .await;

        sqlx::query("ROLLBACK")
            .execute(&mut *blocker)
            .await
            .unwrap();
        drop(blocker);

        match result {
            CallResult::Failed(failed) => {
                assert_eq!(failed.kind, "persistence_failed");
                assert!(failed.error.contains("timed out"));
            }
            CallResult::Processed(_) => panic!("expected persistence timeout"),
        }
        assert_eq!(harness.db.statistics().await.unwrap().total_calls, 0);
    }

    struct PanickingModel;

    impl crate::core::model::ProbabilityModel for PanickingModel {
        fn predict_probability(&self, _text: &str) -> anyhow::Result<f64> {
            panic!("model blew up")
        }
    }

    #[tokio::test]
    async fn test_collaborator_panic_becomes_failed_call() {
        let harness = Harness::new().await;

        let pipeline = harness.pipeline(
            file_source(),
            clean_preprocessor(),
            saying(SPAM_TEXT),
            PanickingModel,
            MockReportSink::new(),
            settings(),
        );

        let result = pipeline
            .process_call(CallSource::File(PathBuf::from("incoming.wav")))
            .await;

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["kind"], "internal_error");
        assert!(json["error"].as_str().unwrap().contains("model blew up"));
        assert!(harness.db.list_calls(10, false).await.unwrap().is_empty());
    }
}
