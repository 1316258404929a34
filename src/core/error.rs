use thiserror::Error;

/// Failures a call can hit on its way through the pipeline.
///
/// `ScoringUnavailable` and `SideEffectFailed` are reported and the call carries on;
/// every other variant ends the call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    #[error("audio acquisition failed: {0}")]
    AcquisitionFailed(String),

    #[error("transcription failed: {0}")]
    TranscriptionFailed(String),

    #[error("spam scoring unavailable: {0}")]
    ScoringUnavailable(String),

    #[error("failed to persist call: {0}")]
    PersistenceFailed(String),

    #[error("failed to write quarantine report: {0}")]
    SideEffectFailed(String),

    /// A collaborator panicked mid-call
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Short machine-readable name used in results and metadata
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::AcquisitionFailed(_) => "acquisition_failed",
            PipelineError::TranscriptionFailed(_) => "transcription_failed",
            PipelineError::ScoringUnavailable(_) => "scoring_unavailable",
            PipelineError::PersistenceFailed(_) => "persistence_failed",
            PipelineError::SideEffectFailed(_) => "side_effect_failed",
            PipelineError::Internal(_) => "internal_error",
        }
    }
}
