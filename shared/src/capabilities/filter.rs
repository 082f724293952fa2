use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::emoji::EmojiTransform;

/// Confidence the on-device toxicity model needs before it reports a match.
pub const DEFAULT_THRESHOLD: f32 = 0.85;

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
pub enum FilterError {
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("classification failed: {0}")]
    Classification(String),

    #[error("threshold {0} is outside 0.0..=1.0")]
    InvalidThreshold(f32),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Handed to the model when it is loaded; matches below it are not reported.
    pub threshold: f32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<(), FilterError> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(FilterError::InvalidThreshold(self.threshold));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub probabilities: Vec<f32>,
    #[serde(rename = "match")]
    pub matched: bool,
}

/// One label of the model (insult, threat, ...) with its per-input results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub results: Vec<PredictionResult>,
}

impl Prediction {
    #[must_use]
    pub fn matched(&self) -> bool {
        self.results.iter().any(|r| r.matched)
    }
}

/// The text classification model. Lives in the shell; the core reaches it
/// through the moderation capability.
#[async_trait::async_trait]
pub trait Classifier: Send + Sync {
    /// Matches below `threshold` are not reported.
    async fn classify(&self, text: &str, threshold: f32) -> Result<Vec<Prediction>, FilterError>;
}

pub type ClassifyResult = Result<Vec<Prediction>, FilterError>;

/// Shortcodes become plain words so the model sees "rage" rather than a glyph.
pub fn prepare_for_classifier(emoji: &dyn EmojiTransform, text: &str) -> String {
    emoji.unemojify(text).replace(':', "")
}

/// Any label matching flags the message. A failed classification counts as
/// "not inappropriate".
pub fn is_flagged(result: &ClassifyResult) -> bool {
    match result {
        Ok(predictions) => {
            let flagged = predictions.iter().any(Prediction::matched);
            debug!(flagged, labels = predictions.len(), "classified message");
            flagged
        }
        Err(e) => {
            warn!(error = %e, "classification failed, letting message through");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::ShortcodeTable;

    fn prediction(label: &str, matches: &[bool]) -> Prediction {
        Prediction {
            label: label.into(),
            results: matches
                .iter()
                .map(|m| PredictionResult {
                    probabilities: vec![0.1, 0.9],
                    matched: *m,
                })
                .collect(),
        }
    }

    #[test]
    fn any_match_flags_message() {
        let result = Ok(vec![
            prediction("identity_attack", &[false]),
            prediction("insult", &[false, true]),
        ]);
        assert!(is_flagged(&result));
    }

    #[test]
    fn no_match_passes() {
        let result = Ok(vec![prediction("insult", &[false]), prediction("threat", &[])]);
        assert!(!is_flagged(&result));
    }

    #[test]
    fn classifier_failure_fails_open() {
        let result = Err(FilterError::ModelUnavailable("weights missing".into()));
        assert!(!is_flagged(&result));
    }

    #[test]
    fn emoji_are_spelled_out_before_classifying() {
        let table = ShortcodeTable::default();
        assert_eq!(
            prepare_for_classifier(&table, "so \u{1f621} right now"),
            "so rage right now"
        );
        assert_eq!(prepare_for_classifier(&table, "ratio 3:1"), "ratio 31");
    }

    #[test]
    fn threshold_is_validated() {
        assert!(FilterConfig::default().validate().is_ok());
        assert!(matches!(
            FilterConfig { threshold: 1.5 }.validate(),
            Err(FilterError::InvalidThreshold(_))
        ));
    }

    #[test]
    fn prediction_wire_format_uses_match() {
        let json = serde_json::to_string(&prediction("insult", &[true])).unwrap();
        assert!(json.contains("\"match\":true"));
    }
}
