//! In-memory patching: swap the body held by a function's identity cell

use super::validate::Candidate;
use crate::error::Result;
use crate::script::{FunctionCell, Interpreter};
use std::sync::Arc;

/// Replace the executable body of `cell` with the candidate's.
///
/// The cell keeps its identity, captured scope, docstring and annotations,
/// so every alias observes the new body on its next call. Returns the new
/// revision number.
pub fn swap(interp: &mut Interpreter, cell: &Arc<FunctionCell>, candidate: &Candidate) -> Result<u32> {
    let revision = interp.hot_swap(cell, candidate.def.clone())?;
    tracing::info!(function = %cell.qualname, revision, "hot-swapped function body");
    Ok(revision)
}
