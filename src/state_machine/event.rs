//! Signals that can drive an appearance transition

use serde::{Deserialize, Serialize};

/// Content classifier verdict on a generated artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Safe,
    Suggestive,
    Explicit,
}

impl Verdict {
    /// Map a classifier label to a verdict. Unknown labels are treated as safe,
    /// which can never advance the appearance state.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "sexy" | "suggestive" => Verdict::Suggestive,
            "porn" | "hentai" | "explicit" => Verdict::Explicit,
            _ => Verdict::Safe,
        }
    }
}

/// Where a transition attempt came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppearanceSignal {
    /// Reveal vocabulary detected in user text (early trigger)
    Keyword,
    /// Verdict on an artifact that was actually generated (confirming trigger)
    Classifier { verdict: Verdict },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifier_labels_map_to_verdicts() {
        assert_eq!(Verdict::from_label("normal"), Verdict::Safe);
        assert_eq!(Verdict::from_label(" Sexy "), Verdict::Suggestive);
        assert_eq!(Verdict::from_label("porn"), Verdict::Explicit);
        assert_eq!(Verdict::from_label("something-new"), Verdict::Safe);
    }
}
