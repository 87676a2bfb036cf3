//! Applying accepted candidates to running functions and their source

pub mod hot_swap;
pub mod rewrite;
pub mod validate;

pub use validate::{check, compatible, parse_candidate, Candidate};

use crate::error::{PatchError, Result};
use crate::inspect::FunctionDescriptor;
use crate::script::Interpreter;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where an accepted candidate goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    /// Hot-swap the running function only.
    #[default]
    Ephemeral,
    /// Rewrite the source file only; the running body is untouched.
    Durable,
    /// Rewrite the file and hot-swap.
    Both,
}

impl Durability {
    pub fn hot_swaps(self) -> bool {
        matches!(self, Durability::Ephemeral | Durability::Both)
    }

    pub fn rewrites(self) -> bool {
        matches!(self, Durability::Durable | Durability::Both)
    }
}

impl fmt::Display for Durability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Durability::Ephemeral => write!(f, "ephemeral"),
            Durability::Durable => write!(f, "durable"),
            Durability::Both => write!(f, "both"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PatchOutcome {
    Applied { durability: Durability, replayed: bool },
    /// Parameter counts differed; nothing was changed.
    Rejected { original: usize, candidate: usize },
    Declined,
}

/// Validate `candidate_source` against the descriptor and apply it.
///
/// The durable half runs first so a stale file leaves the running
/// function untouched. Errors are returned unrecovered; falling back to
/// another durability is the caller's decision.
pub fn apply(
    interp: &mut Interpreter,
    original: &FunctionDescriptor,
    candidate_source: &str,
    durability: Durability,
) -> Result<PatchOutcome> {
    let candidate = parse_candidate(candidate_source)?;
    match check(original, &candidate) {
        Ok(()) => {}
        Err(PatchError::StructuralMismatch { original, candidate }) => {
            return Ok(PatchOutcome::Rejected { original, candidate });
        }
        Err(other) => return Err(other),
    }
    apply_candidate(interp, original, &candidate, durability)?;
    Ok(PatchOutcome::Applied {
        durability,
        replayed: false,
    })
}

/// Apply an already-validated candidate.
pub fn apply_candidate(
    interp: &mut Interpreter,
    original: &FunctionDescriptor,
    candidate: &Candidate,
    durability: Durability,
) -> Result<()> {
    if durability.rewrites() {
        rewrite::rewrite_source(&original.location, &candidate.text)?;
    }
    if durability.hot_swaps() {
        hot_swap::swap(interp, &original.function, candidate)?;
    }
    Ok(())
}
