//! Shared types and errors for the Conveyor pipeline view.
//!
//! This crate provides the foundational types used across all other Conveyor crates:
//! - `ConveyorError`: unified error taxonomy
//! - `PipelineSnapshot` / `ArtifactNode`: the live pipeline model delivered by the service
//! - `CanonicalState`: the four user-facing artifact states
//! - `ConnectionState`: lifecycle of the live status connection
//! - `Answers`: operator answers submitted to resolve an interrupt

use serde::{Deserialize, Serialize};

mod answer;
mod snapshot;

pub use answer::{validate_answers, AnswerType, AnswerValue, Answers};
pub use snapshot::{
    ArtifactNode, ArtifactPatch, Interrupt, PipelineSnapshot, Question, Station, StepRef,
    RESERVED_ID_PREFIXES,
};

/// Unified error type for all Conveyor subsystems.
#[derive(Debug, thiserror::Error)]
pub enum ConveyorError {
    // === Connectivity Errors ===
    #[error("Cannot reach production service at {url}: {message}")]
    Connection { url: String, message: String },

    #[error("Production service returned HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        retryable: bool,
    },

    #[error("Request to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("Status feed ended")]
    FeedClosed,

    // === Submission Errors ===
    #[error("{operation} failed: {message}")]
    Submission { operation: String, message: String },

    #[error("Invalid answer for question '{question}': {message}")]
    InvalidAnswer { question: String, message: String },

    #[error("Unknown artifact '{id}'")]
    UnknownArtifact { id: String },

    #[error("Artifact '{id}' is {state}, production can only start when ready")]
    NotReady { id: String, state: CanonicalState },

    // === Stale / Lifecycle ===
    #[error("Interrupt '{interrupt_id}' is no longer open")]
    StaleInterrupt { interrupt_id: String },

    #[error("Status channel for project '{project}' is closed")]
    ChannelClosed { project: String },

    // === Data Errors ===
    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl ConveyorError {
    /// Returns `true` for connectivity failures that a reconnect may cure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConveyorError::Connection { .. }
                | ConveyorError::Timeout { .. }
                | ConveyorError::FeedClosed
                | ConveyorError::Http {
                    retryable: true,
                    ..
                }
        )
    }

    /// Returns `true` when the error only says an interrupt was already resolved
    /// elsewhere. Such errors are discarded without surfacing to the operator.
    pub fn is_stale(&self) -> bool {
        matches!(self, ConveyorError::StaleInterrupt { .. })
    }

    /// Returns `true` for failures of an operator-initiated call
    /// (interrupt resolution or production start).
    pub fn is_submission(&self) -> bool {
        matches!(
            self,
            ConveyorError::Submission { .. }
                | ConveyorError::InvalidAnswer { .. }
                | ConveyorError::UnknownArtifact { .. }
                | ConveyorError::NotReady { .. }
        )
    }
}

/// A convenience alias for `Result<T, ConveyorError>`.
pub type Result<T> = std::result::Result<T, ConveyorError>;

// ---------------------------------------------------------------------------
// CanonicalState: the four user-facing artifact states
// ---------------------------------------------------------------------------

/// User-facing state of an artifact, derived on demand from its raw state token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalState {
    Blocked,
    InProgress,
    Ready,
    Stabilized,
}

impl CanonicalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalState::Blocked => "blocked",
            CanonicalState::InProgress => "in_progress",
            CanonicalState::Ready => "ready",
            CanonicalState::Stabilized => "stabilized",
        }
    }
}

impl std::fmt::Display for CanonicalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ConnectionState: lifecycle of the live status connection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_connection() {
        let err = ConveyorError::Connection {
            url: "http://localhost:8000".into(),
            message: "connection refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "Cannot reach production service at http://localhost:8000: connection refused"
        );
    }

    #[test]
    fn error_display_http() {
        let err = ConveyorError::Http {
            status: 503,
            message: "unavailable".into(),
            retryable: true,
        };
        assert_eq!(
            err.to_string(),
            "Production service returned HTTP 503: unavailable"
        );
    }

    #[test]
    fn error_display_submission() {
        let err = ConveyorError::Submission {
            operation: "resolve_interrupt".into(),
            message: "HTTP 500".into(),
        };
        assert_eq!(err.to_string(), "resolve_interrupt failed: HTTP 500");
    }

    #[test]
    fn error_display_not_ready() {
        let err = ConveyorError::NotReady {
            id: "doc-1".into(),
            state: CanonicalState::InProgress,
        };
        assert_eq!(
            err.to_string(),
            "Artifact 'doc-1' is in_progress, production can only start when ready"
        );
    }

    #[test]
    fn error_display_stale_interrupt() {
        let err = ConveyorError::StaleInterrupt {
            interrupt_id: "int-9".into(),
        };
        assert_eq!(err.to_string(), "Interrupt 'int-9' is no longer open");
    }

    // --- classification helpers ---

    #[test]
    fn connectivity_errors_are_retryable() {
        assert!(ConveyorError::FeedClosed.is_retryable());
        assert!(ConveyorError::Timeout {
            url: "x".into(),
            timeout_ms: 10
        }
        .is_retryable());
        assert!(ConveyorError::Http {
            status: 502,
            message: "bad gateway".into(),
            retryable: true
        }
        .is_retryable());
    }

    #[test]
    fn auth_failure_is_not_retryable() {
        let err = ConveyorError::Http {
            status: 401,
            message: "unauthorized".into(),
            retryable: false,
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn submission_errors_are_not_retryable() {
        let err = ConveyorError::Submission {
            operation: "start_production".into(),
            message: "rejected".into(),
        };
        assert!(!err.is_retryable());
        assert!(err.is_submission());
    }

    #[test]
    fn stale_interrupt_is_stale() {
        let err = ConveyorError::StaleInterrupt {
            interrupt_id: "i".into(),
        };
        assert!(err.is_stale());
        assert!(!err.is_submission());
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: ConveyorError = json_err.into();
        assert!(matches!(err, ConveyorError::Json(_)));
    }

    // --- CanonicalState / ConnectionState ---

    #[test]
    fn canonical_state_serializes_to_snake_case() {
        assert_eq!(
            serde_json::to_string(&CanonicalState::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert_eq!(
            serde_json::to_string(&CanonicalState::Stabilized).unwrap(),
            "\"stabilized\""
        );
        let state: CanonicalState = serde_json::from_str("\"blocked\"").unwrap();
        assert_eq!(state, CanonicalState::Blocked);
    }

    #[test]
    fn canonical_state_display_matches_serde() {
        for state in [
            CanonicalState::Blocked,
            CanonicalState::InProgress,
            CanonicalState::Ready,
            CanonicalState::Stabilized,
        ] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{state}\""));
        }
    }

    #[test]
    fn connection_state_display() {
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
        assert_eq!(
            serde_json::to_string(&ConnectionState::Connecting).unwrap(),
            "\"connecting\""
        );
    }
}
