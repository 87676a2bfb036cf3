//! Error taxonomy for the patching pipeline
//!
//! Every failure the engine can recover from has its own variant so the
//! orchestrator can fall back one tier (generator -> manual, durable ->
//! ephemeral) instead of aborting.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatchError {
    /// The callable has no recoverable source (native, or not a plain function/method).
    #[error("cannot inspect `{name}`: {reason}")]
    NotInspectable { name: String, reason: String },

    /// Candidate text is not exactly one function definition.
    #[error("malformed candidate: {0}")]
    MalformedCandidate(String),

    /// Candidate parameter count differs from the original.
    #[error("structural mismatch: original takes {original} parameter(s), candidate takes {candidate}")]
    StructuralMismatch { original: usize, candidate: usize },

    /// The source file changed since the descriptor was captured.
    #[error("stale location {path}:{start_line}-{end_line}: {reason}")]
    StaleLocation {
        path: String,
        start_line: usize,
        end_line: usize,
        reason: String,
    },

    /// Candidate has no non-blank content.
    #[error("candidate implementation is empty")]
    EmptyCandidate,

    /// Network, timeout or schema failure talking to the generator.
    #[error("generator unavailable: {0}")]
    GeneratorUnavailable(String),

    /// Explicit opt-out by the user.
    #[error("user declined to provide an implementation")]
    UserDeclined,

    /// Script source failed to parse.
    #[error("syntax error in {origin} line {line}: {message}")]
    Parse {
        origin: String,
        line: usize,
        message: String,
    },

    /// Uncaught exception escaping script code into the host.
    #[error("{kind}: {message}")]
    Script { kind: String, message: String },

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PatchError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PatchError::Io {
            path: path.into(),
            source,
        }
    }

    /// Errors the durable strategy can recover from by falling back to a hot-swap.
    pub fn is_durable_fallback(&self) -> bool {
        matches!(self, PatchError::StaleLocation { .. } | PatchError::Io { .. })
    }

    /// Errors that send the user back to editing instead of ending the workflow.
    pub fn is_candidate_problem(&self) -> bool {
        matches!(
            self,
            PatchError::MalformedCandidate(_)
                | PatchError::StructuralMismatch { .. }
                | PatchError::EmptyCandidate
        )
    }
}

pub type Result<T> = std::result::Result<T, PatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_classification() {
        let stale = PatchError::StaleLocation {
            path: "calc.py".into(),
            start_line: 4,
            end_line: 6,
            reason: "file has 3 lines".into(),
        };
        assert!(stale.is_durable_fallback());
        assert!(!stale.is_candidate_problem());

        let mismatch = PatchError::StructuralMismatch {
            original: 2,
            candidate: 3,
        };
        assert!(mismatch.is_candidate_problem());
        assert!(!PatchError::UserDeclined.is_candidate_problem());
    }

    #[test]
    fn test_messages_name_the_problem() {
        let err = PatchError::StructuralMismatch {
            original: 2,
            candidate: 3,
        };
        assert_eq!(
            err.to_string(),
            "structural mismatch: original takes 2 parameter(s), candidate takes 3"
        );
    }
}
