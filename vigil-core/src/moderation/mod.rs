//! Moderation decision engine.
//!
//! A pure function of `(mode, text, classification)`:
//!
//! | Mode | no labels | labels |
//! |------|-----------|--------|
//! | `Reactive` | `Allow` | `Allow`, flagged (public alert; audio was already heard) |
//! | `Preventive` | `Allow` (release for delivery) | `Block` (audio discarded, public notice) |
//!
//! The engine only tags the utterance. Which delivery path a mode maps to
//! (live pass-through or gated relay) is wired in the relay stage. No
//! threshold logic lives here: the classifier already applied its own.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::classify::{ClassificationResult, Verdict};
use crate::error::VigilError;

/// Process-wide delivery semantics, fixed at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Deliver first, flag afterwards.
    #[default]
    Reactive,
    /// Classify first, deliver only what is allowed.
    Preventive,
}

impl Mode {
    /// `true` when raw audio bypasses the pipeline and reaches listeners live.
    pub fn delivers_live(self) -> bool {
        self == Mode::Reactive
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Reactive => f.write_str("REACTIVE"),
            Mode::Preventive => f.write_str("PREVENTIVE"),
        }
    }
}

impl FromStr for Mode {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reactive" => Ok(Mode::Reactive),
            "preventive" => Ok(Mode::Preventive),
            other => Err(VigilError::Config(format!(
                "unknown mode {other:?} (expected REACTIVE or PREVENTIVE)"
            ))),
        }
    }
}

/// The tag attached to one utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModerationOutcome {
    Allow { text: String },
    Block { text: String, labels: Vec<String> },
}

/// Outcome plus the labels that triggered an alert and a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub mode: Mode,
    pub outcome: ModerationOutcome,
    /// Non-empty whenever the classifier returned labels, in either mode.
    pub flagged_labels: Vec<String>,
    pub explanation: String,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self.outcome, ModerationOutcome::Allow { .. })
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self.outcome, ModerationOutcome::Block { .. })
    }

    /// Allowed but carrying labels: the reactive after-the-fact alert.
    pub fn is_flagged(&self) -> bool {
        self.is_allowed() && !self.flagged_labels.is_empty()
    }

    pub fn text(&self) -> &str {
        match &self.outcome {
            ModerationOutcome::Allow { text } | ModerationOutcome::Block { text, .. } => text,
        }
    }
}

/// Decide the fate of one transcribed utterance.
pub fn decide(mode: Mode, text: &str, classification: &ClassificationResult) -> Decision {
    let labels = classification.label_names();

    if labels.is_empty() {
        let explanation = match &classification.verdict {
            Verdict::Unavailable { reason } => {
                format!("classifier unavailable ({reason}); failing open")
            }
            Verdict::Labels(_) => "no toxicity labels".to_string(),
        };
        return Decision {
            mode,
            outcome: ModerationOutcome::Allow {
                text: text.to_string(),
            },
            flagged_labels: Vec::new(),
            explanation,
        };
    }

    let joined = labels.join(", ");
    match mode {
        Mode::Reactive => Decision {
            mode,
            outcome: ModerationOutcome::Allow {
                text: text.to_string(),
            },
            explanation: format!("already delivered; flagged for {joined}"),
            flagged_labels: labels,
        },
        Mode::Preventive => Decision {
            mode,
            outcome: ModerationOutcome::Block {
                text: text.to_string(),
                labels: labels.clone(),
            },
            explanation: format!("blocked for {joined}"),
            flagged_labels: labels,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ToxicLabel;
    use std::time::Duration;

    fn labelled(names: &[&str]) -> ClassificationResult {
        ClassificationResult {
            verdict: Verdict::Labels(names.iter().map(|n| ToxicLabel::new(*n)).collect()),
            duration: Duration::from_millis(5),
        }
    }

    fn unavailable() -> ClassificationResult {
        ClassificationResult {
            verdict: Verdict::Unavailable {
                reason: "timeout".into(),
            },
            duration: Duration::from_secs(2),
        }
    }

    #[test]
    fn empty_labels_allow_in_both_modes() {
        for mode in [Mode::Reactive, Mode::Preventive] {
            let d = decide(mode, "hello everyone", &labelled(&[]));
            assert!(d.is_allowed(), "{mode} should allow");
            assert!(!d.is_flagged());
            assert_eq!(d.text(), "hello everyone");
        }
    }

    #[test]
    fn preventive_blocks_on_any_label() {
        let d = decide(Mode::Preventive, "you idiot", &labelled(&["insult"]));
        assert_eq!(
            d.outcome,
            ModerationOutcome::Block {
                text: "you idiot".into(),
                labels: vec!["insult".into()],
            }
        );
        assert!(d.is_blocked());
        assert!(!d.is_flagged());
    }

    #[test]
    fn reactive_allows_but_flags() {
        let d = decide(Mode::Reactive, "you idiot", &labelled(&["insult", "toxic"]));
        assert!(d.is_allowed());
        assert!(d.is_flagged());
        assert_eq!(d.flagged_labels, vec!["insult", "toxic"]);
    }

    #[test]
    fn unavailable_classifier_matches_safe_decision() {
        for mode in [Mode::Reactive, Mode::Preventive] {
            let safe = decide(mode, "hi", &labelled(&[]));
            let failed = decide(mode, "hi", &unavailable());
            assert_eq!(safe.outcome, failed.outcome);
            assert_eq!(safe.flagged_labels, failed.flagged_labels);
            assert_ne!(safe.explanation, failed.explanation);
            assert!(failed.explanation.contains("failing open"));
        }
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("REACTIVE".parse::<Mode>().unwrap(), Mode::Reactive);
        assert_eq!(" preventive ".parse::<Mode>().unwrap(), Mode::Preventive);
        assert!("strict".parse::<Mode>().is_err());
        assert_eq!(Mode::Preventive.to_string(), "PREVENTIVE");
    }

    #[test]
    fn only_reactive_delivers_live() {
        assert!(Mode::Reactive.delivers_live());
        assert!(!Mode::Preventive.delivers_live());
    }
}
