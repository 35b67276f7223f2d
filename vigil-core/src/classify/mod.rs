//! Toxicity classification capability and its fail-open gateway.
//!
//! The classifier is a remote request/response service. The gateway wraps any
//! [`ToxicityClassifier`] with a hard timeout; a timeout, transport error or
//! non-200 status becomes [`Verdict::Unavailable`], which carries no labels.
//! This trades safety for availability: with the classifier down, Preventive
//! mode behaves like an unmoderated pass-through rather than stalling speech.
//! `Unavailable` stays distinct from a genuine empty verdict so logs and
//! telemetry can tell the two apart.

pub mod http;

pub use http::HttpClassifier;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Result, VigilError};

/// Summary written to telemetry when no labels were returned.
pub const SAFE_SUMMARY: &str = "SAFE";

fn default_label() -> String {
    "TOXIC".to_string()
}

/// One label from the classifier's `toxic_labels` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToxicLabel {
    #[serde(default = "default_label")]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl ToxicLabel {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            score: None,
        }
    }
}

/// What the classifier said, or why it said nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// A real answer. Empty means safe.
    Labels(Vec<ToxicLabel>),
    /// Timeout, transport failure or bad status. Treated as no labels.
    Unavailable { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationResult {
    pub verdict: Verdict,
    pub duration: Duration,
}

impl ClassificationResult {
    /// Effective labels: empty for `Unavailable`.
    pub fn labels(&self) -> &[ToxicLabel] {
        match &self.verdict {
            Verdict::Labels(labels) => labels,
            Verdict::Unavailable { .. } => &[],
        }
    }

    pub fn label_names(&self) -> Vec<String> {
        self.labels().iter().map(|l| l.label.clone()).collect()
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self.verdict, Verdict::Unavailable { .. })
    }

    /// `"SAFE"` or the label names joined with `;`.
    pub fn summary(&self) -> String {
        let names = self.label_names();
        if names.is_empty() {
            SAFE_SUMMARY.to_string()
        } else {
            names.join(";")
        }
    }

    /// `labels`, `safe` or `unavailable`.
    pub fn status(&self) -> &'static str {
        match &self.verdict {
            Verdict::Labels(labels) if labels.is_empty() => "safe",
            Verdict::Labels(_) => "labels",
            Verdict::Unavailable { .. } => "unavailable",
        }
    }
}

/// A remote toxicity classifier.
#[async_trait]
pub trait ToxicityClassifier: Send + Sync {
    /// Return the labels that exceed the classifier's threshold.
    ///
    /// # Errors
    /// Any failure to obtain a well-formed answer.
    async fn classify(&self, text: &str) -> Result<Vec<ToxicLabel>>;
}

#[async_trait]
impl<T: ToxicityClassifier + ?Sized> ToxicityClassifier for Arc<T> {
    async fn classify(&self, text: &str) -> Result<Vec<ToxicLabel>> {
        (**self).classify(text).await
    }
}

/// Stateless adapter applying the timeout and fail-open policy.
#[derive(Clone)]
pub struct ClassificationGateway {
    classifier: Arc<dyn ToxicityClassifier>,
    timeout: Duration,
}

impl ClassificationGateway {
    pub fn new(classifier: Arc<dyn ToxicityClassifier>, timeout: Duration) -> Self {
        Self {
            classifier,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Classify `text`. Never fails; see [`Verdict::Unavailable`].
    pub async fn classify(&self, text: &str) -> ClassificationResult {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.classifier.classify(text)).await;
        let duration = started.elapsed();

        let verdict = match outcome {
            Ok(Ok(labels)) => {
                debug!(labels = labels.len(), ms = duration.as_millis() as u64, "classifier answered");
                Verdict::Labels(labels)
            }
            Ok(Err(e)) => {
                warn!(verdict = "unavailable", error = %e, "classifier failed; failing open");
                Verdict::Unavailable {
                    reason: e.to_string(),
                }
            }
            Err(_) => {
                let e = VigilError::ClassifierTimeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                };
                warn!(verdict = "unavailable", error = %e, "classifier timed out; failing open");
                Verdict::Unavailable {
                    reason: e.to_string(),
                }
            }
        };

        ClassificationResult { verdict, duration }
    }
}
