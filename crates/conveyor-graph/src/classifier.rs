//! Mapping from producer-defined raw state tokens to [`CanonicalState`].
//!
//! The production service has used several synonym sets for its states over
//! time. This module is the only place that knows about them; everything else
//! reasons about the four canonical states.

use conveyor_types::{ArtifactNode, CanonicalState, Station};
use serde::{Deserialize, Serialize};

/// Governed or immutable completion.
const STABILIZED_TOKENS: &[&str] = &[
    "produced",
    "complete",
    "completed",
    "stabilized",
    "stable",
    "governed",
    "immutable",
    "locked",
    "published",
    "done",
    "accepted",
];

/// Inability to proceed.
const BLOCKED_TOKENS: &[&str] = &[
    "blocked",
    "missing_inputs",
    "requirements_not_met",
    "failed",
    "qa_failed",
    "failed_qa",
    "halted",
    "error",
    "errored",
    "stalled",
    "awaiting_operator",
];

/// Active or queued work.
const IN_PROGRESS_TOKENS: &[&str] = &[
    "in_progress",
    "in_production",
    "active",
    "running",
    "queued",
    "pending",
    "generating",
    "drafting",
    "producing",
    "reviewing",
    "started",
];

/// Passed gates awaiting acceptance.
const READY_TOKENS: &[&str] = &[
    "ready_for_production",
    "ready_for_review",
    "qa_passed",
    "passed",
    "approved",
    "awaiting_acceptance",
    "inputs_ready",
];

/// Where the bare `ready` token lands.
///
/// The producer has emitted `ready` both for "passed every gate, nothing left
/// to do" and for "may be started". Which meaning applies is a product decision,
/// so it is configured explicitly rather than inferred.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyTokenPolicy {
    /// `ready` means the artifact may be started.
    #[default]
    Ready,
    /// `ready` means the artifact is finished and governed.
    Stabilized,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub ready_token: ReadyTokenPolicy,
}

/// Total mapping from raw state tokens to canonical states.
#[derive(Debug, Clone, Default)]
pub struct StateClassifier {
    config: ClassifierConfig,
}

fn normalize(raw: &str) -> String {
    raw.trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c == '-' || c == ' ' { '_' } else { c })
        .collect()
}

impl StateClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Classify a raw state token. Never fails; unknown tokens are `Ready`.
    ///
    /// Precedence: stabilized, blocked, in progress, ready.
    pub fn classify(&self, raw: &str) -> CanonicalState {
        let token = normalize(raw);
        let token = token.as_str();

        if token == "ready" {
            return match self.config.ready_token {
                ReadyTokenPolicy::Ready => CanonicalState::Ready,
                ReadyTokenPolicy::Stabilized => CanonicalState::Stabilized,
            };
        }

        if STABILIZED_TOKENS.contains(&token) {
            CanonicalState::Stabilized
        } else if BLOCKED_TOKENS.contains(&token) {
            CanonicalState::Blocked
        } else if IN_PROGRESS_TOKENS.contains(&token) {
            CanonicalState::InProgress
        } else if READY_TOKENS.contains(&token) {
            CanonicalState::Ready
        } else {
            if !token.is_empty() {
                tracing::trace!(token, "Unknown state token, defaulting to ready");
            }
            CanonicalState::Ready
        }
    }

    pub fn classify_artifact(&self, artifact: &ArtifactNode) -> CanonicalState {
        self.classify(&artifact.raw_state)
    }

    pub fn classify_station(&self, station: &Station) -> CanonicalState {
        self.classify(&station.raw_state)
    }
}

/// Classify with the default configuration.
pub fn classify(raw: &str) -> CanonicalState {
    StateClassifier::default().classify(raw)
}
