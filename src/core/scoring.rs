use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::config::SpamConfig;
use crate::core::error::PipelineError;
use crate::core::features::{analyze_features, SpamFeatures};
use crate::core::model::ProbabilityModel;

/// Phrases that always earn the primary boost
const BASE_BOOST_KEYWORDS: [&str; 5] = [
    "free offer",
    "free prize",
    "free gift",
    "win cash",
    "free vacation",
];

/// Words that earn the secondary boost when both appear anywhere in the text
const TRIGGER_WORDS: (&str, &str) = ("free", "offer");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpamScore {
    /// Raw model output before any keyword adjustment
    pub spam_probability: f64,
    pub boost: f64,
    /// Boosted probability, clamped to [0, 1]
    pub confidence: f64,
    pub is_spam: bool,
    pub features: SpamFeatures,
    /// False when the model could not be consulted
    pub scored: bool,
}

impl SpamScore {
    /// Fail-closed placeholder for a call the model could not score
    pub fn unscored(text: &str) -> Self {
        Self {
            spam_probability: 0.0,
            boost: 0.0,
            confidence: 0.0,
            is_spam: false,
            features: analyze_features(text),
            scored: false,
        }
    }
}

/// Combines the model probability with keyword boosts and the spam threshold.
///
/// Immutable once built, so one scorer can be shared across concurrent calls.
pub struct SpamScorer {
    model: Arc<dyn ProbabilityModel>,
    threshold: f64,
    primary_boost: f64,
    secondary_boost: f64,
    boost_keywords: BTreeSet<String>,
}

impl SpamScorer {
    pub fn new(model: Arc<dyn ProbabilityModel>, config: &SpamConfig) -> Self {
        let mut boost_keywords: BTreeSet<String> =
            BASE_BOOST_KEYWORDS.iter().map(|kw| kw.to_string()).collect();

        if let Some(path) = &config.keywords_file {
            match load_keyword_file(path) {
                Ok(loaded) => {
                    info!("Loaded {} boost keywords from {:?}", loaded.len(), path);
                    boost_keywords.extend(loaded);
                }
                Err(e) => warn!("Ignoring boost keyword list {:?}: {}", path, e),
            }
        }

        boost_keywords.extend(
            config
                .extra_keywords
                .iter()
                .map(|kw| kw.trim().to_lowercase())
                .filter(|kw| !kw.is_empty()),
        );

        Self {
            model,
            threshold: config.threshold,
            primary_boost: config.primary_boost,
            secondary_boost: config.secondary_boost,
            boost_keywords,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn boost_keywords(&self) -> &BTreeSet<String> {
        &self.boost_keywords
    }

    /// Score a transcript.
    ///
    /// Returns `ScoringUnavailable` when the model fails; callers that still need a score
    /// fall back to [`SpamScore::unscored`].
    pub fn score(&self, text: &str) -> Result<SpamScore, PipelineError> {
        let text_lower = text.to_lowercase();

        let spam_probability = if text_lower.trim().is_empty() {
            0.0
        } else {
            let p = self
                .model
                .predict_probability(&text_lower)
                .map_err(|e| PipelineError::ScoringUnavailable(e.to_string()))?;
            if !p.is_finite() {
                return Err(PipelineError::ScoringUnavailable(format!(
                    "model returned {}",
                    p
                )));
            }
            p.clamp(0.0, 1.0)
        };

        let boost = self.keyword_boost(&text_lower);
        let confidence = (spam_probability + boost).clamp(0.0, 1.0);
        let is_spam = confidence >= self.threshold;

        info!(
            "Spam detection: {} (base: {:.2}%, boost: {:.0}%, final: {:.2}%)",
            if is_spam { "SPAM" } else { "LEGITIMATE" },
            spam_probability * 100.0,
            boost * 100.0,
            confidence * 100.0
        );

        Ok(SpamScore {
            spam_probability,
            boost,
            confidence,
            is_spam,
            features: analyze_features(&text_lower),
            scored: true,
        })
    }

    /// Additive keyword boost for already lower-cased text
    fn keyword_boost(&self, text_lower: &str) -> f64 {
        let mut boost = 0.0;

        if let Some(kw) = self
            .boost_keywords
            .iter()
            .find(|kw| text_lower.contains(kw.as_str()))
        {
            debug!("Boost keyword matched: {}", kw);
            boost += self.primary_boost;
        }

        let (first, second) = TRIGGER_WORDS;
        if text_lower.contains(first) && text_lower.contains(second) {
            boost += self.secondary_boost;
        }

        boost
    }
}

#[derive(Debug, Deserialize)]
struct KeywordFile {
    #[serde(default)]
    keywords: Vec<serde_json::Value>,
}

/// Read `{"keywords": [...]}`; entries that are not non-blank strings are skipped
fn load_keyword_file(path: &Path) -> anyhow::Result<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    let parsed: KeywordFile = serde_json::from_str(&content)?;

    Ok(parsed
        .keywords
        .iter()
        .filter_map(|kw| kw.as_str())
        .map(|kw| kw.trim().to_lowercase())
        .filter(|kw| !kw.is_empty())
        .collect())
}
