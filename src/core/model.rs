use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::config::SpamConfig;

const BUILTIN_WEIGHTS: &str = include_str!("../../models/default_spam_model.json");

/// Text classifier that estimates how likely a transcript is spam.
///
/// Implementations must be deterministic for fixed weights and input, and must not
/// mutate themselves while predicting; the scorer shares one instance across calls.
#[cfg_attr(test, mockall::automock)]
pub trait ProbabilityModel: Send + Sync {
    /// Probability in [0, 1] that `text` (already lower-cased) is spam
    fn predict_probability(&self, text: &str) -> Result<f64>;
}

/// Logistic model over unigram and bigram token features.
///
/// Weights are exported from whatever trained the classifier; this crate only reads them.
#[derive(Debug, Clone, Deserialize)]
pub struct LogisticModel {
    bias: f64,
    weights: HashMap<String, f64>,
}

impl LogisticModel {
    pub fn new(bias: f64, weights: HashMap<String, f64>) -> Self {
        Self { bias, weights }
    }

    /// Weights bundled with the binary, trained on a small set of sample call transcripts
    pub fn builtin() -> Result<Self> {
        let model: LogisticModel = serde_json::from_str(BUILTIN_WEIGHTS)
            .context("Bundled spam model weights are invalid")?;
        info!("Using bundled spam model with {} features", model.weights.len());
        Ok(model)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model weights {:?}", path))?;
        let model: LogisticModel = serde_json::from_str(&content)
            .with_context(|| format!("Invalid model weights in {:?}", path))?;

        if !model.bias.is_finite() || model.weights.values().any(|w| !w.is_finite()) {
            bail!("Model weights in {:?} contain non-finite values", path);
        }

        info!("Loaded spam model with {} features from {:?}", model.weights.len(), path);
        Ok(model)
    }

    fn tokens(text: &str) -> Vec<&str> {
        text.split(|c: char| !c.is_alphanumeric() && c != '\'')
            .filter(|t| !t.is_empty())
            .collect()
    }
}

impl ProbabilityModel for LogisticModel {
    fn predict_probability(&self, text: &str) -> Result<f64> {
        let tokens = Self::tokens(text);

        // Presence features, each counted once
        let mut seen = HashSet::new();
        let mut logit = self.bias;

        for token in &tokens {
            if seen.insert(token.to_string()) {
                logit += self.weights.get(*token).copied().unwrap_or(0.0);
            }
        }
        for pair in tokens.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            if let Some(weight) = self.weights.get(&bigram) {
                if seen.insert(bigram) {
                    logit += weight;
                }
            }
        }

        Ok(1.0 / (1.0 + (-logit).exp()))
    }
}

/// Stand-in used when configured model weights cannot be loaded; every prediction
/// fails, so calls are stored unscored instead of being guessed.
#[derive(Debug, Default)]
pub struct UnavailableModel;

impl ProbabilityModel for UnavailableModel {
    fn predict_probability(&self, _text: &str) -> Result<f64> {
        bail!("no spam model loaded")
    }
}

/// Model for the configured weights file, or the bundled weights when none is set.
///
/// A configured file that cannot be loaded yields [`UnavailableModel`], so calls are
/// stored unscored rather than judged by weights the operator did not choose.
pub fn load_model(config: &SpamConfig) -> Arc<dyn ProbabilityModel> {
    let loaded = match &config.model_path {
        Some(path) => LogisticModel::from_file(path),
        None => LogisticModel::builtin(),
    };

    match loaded {
        Ok(model) => Arc::new(model),
        Err(e) => {
            warn!("Spam model unavailable, calls will be stored unscored: {:#}", e);
            Arc::new(UnavailableModel)
        }
    }
}
