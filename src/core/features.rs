use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Indicator categories and their marker phrases, in match order
const SPAM_INDICATORS: [(&str, &[&str]); 4] = [
    ("urgency", &["urgent", "limited time", "act now", "immediately", "hurry"]),
    ("free_offers", &["free", "win", "prize", "gift", "won"]),
    ("financial", &["money", "cash", "debt", "loan", "credit"]),
    ("suspicious", &["congratulations", "selected", "claim", "reward", "offer"]),
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryMatch {
    pub detected: bool,
    pub keywords: Vec<String>,
    pub count: usize,
}

pub type SpamFeatures = BTreeMap<String, CategoryMatch>;

/// Scan text for spam indicator phrases, independent of any model.
///
/// Every category is always present in the result. Matching is a case-insensitive
/// substring test, so "freedom" counts as "free".
pub fn analyze_features(text: &str) -> SpamFeatures {
    let text_lower = text.to_lowercase();

    SPAM_INDICATORS
        .iter()
        .map(|(category, markers)| {
            let keywords: Vec<String> = markers
                .iter()
                .filter(|marker| text_lower.contains(*marker))
                .map(|marker| marker.to_string())
                .collect();

            let count = keywords.len();
            (
                category.to_string(),
                CategoryMatch {
                    detected: count > 0,
                    keywords,
                    count,
                },
            )
        })
        .collect()
}

/// Names of the categories that matched at least once
pub fn detected_categories(features: &SpamFeatures) -> Vec<&str> {
    features
        .iter()
        .filter(|(_, m)| m.detected)
        .map(|(name, _)| name.as_str())
        .collect()
}
