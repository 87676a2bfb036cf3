//! Workflow state machine for implementing a placeholder on demand
//!
//! Tracks one failure through: detect -> capture -> request/confirm ->
//! validate -> apply -> resume or propagate

#[cfg(test)]
mod tests;

use crate::config::Config;
use crate::confirm::{ConfirmationSurface, Review};
use crate::error::{PatchError, Result};
use crate::generate::{build_request_with_limit, ImplementationGenerator};
use crate::inspect::{capture_chain, describe_function, CallStackFrame, FunctionDescriptor};
use crate::patch::{self, Candidate, Durability, PatchOutcome};
use crate::script::value::lock;
use crate::script::{FailureHandler, FunctionId, Interception, Interpreter, Resolution, Unwind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// States of a single workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    /// Placeholder failure caught at a boundary
    Detected,
    ChainCaptured,
    Requesting,
    /// Generator returned a suggestion
    Suggested,
    /// No suggestion; manual authoring
    Declined,
    Confirmed,
    Edited,
    RejectedByUser,
    Validating,
    Applied,
    ValidationFailed,
    /// The failed call returned normally
    Resumed,
    /// The failure continued to the caller
    Propagated,
}

impl WorkflowState {
    /// Human-readable status for display
    pub fn status_text(&self) -> &'static str {
        match self {
            WorkflowState::Detected => "Placeholder hit",
            WorkflowState::ChainCaptured => "Call chain captured",
            WorkflowState::Requesting => "Requesting implementation...",
            WorkflowState::Suggested => "Suggestion ready",
            WorkflowState::Declined => "Manual authoring",
            WorkflowState::Confirmed => "Accepted",
            WorkflowState::Edited => "Edited",
            WorkflowState::RejectedByUser => "Rejected",
            WorkflowState::Validating => "Validating...",
            WorkflowState::Applied => "Applied",
            WorkflowState::ValidationFailed => "Validation failed",
            WorkflowState::Resumed => "Resumed",
            WorkflowState::Propagated => "Propagated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowState::Resumed | WorkflowState::Propagated)
    }
}

/// Record of one finished workflow
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowReport {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub target: String,
    pub function: FunctionId,
    /// 1 for a failure hit by the program, 2+ for failures hit while replaying.
    pub depth: usize,
    pub transitions: Vec<WorkflowState>,
    /// Orchestrator-wide order of each transition, parallel to `transitions`.
    pub ticks: Vec<u64>,
    pub finished_tick: Option<u64>,
    pub outcome: PatchOutcome,
    pub error: Option<String>,
    #[serde(skip)]
    clock: Arc<AtomicU64>,
}

impl WorkflowReport {
    fn new(target: &str, function: FunctionId, depth: usize, clock: Arc<AtomicU64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            target: target.to_string(),
            function,
            depth,
            transitions: Vec::new(),
            ticks: Vec::new(),
            finished_tick: None,
            outcome: PatchOutcome::Declined,
            error: None,
            clock,
        }
    }

    fn enter(&mut self, state: WorkflowState) {
        tracing::debug!(
            workflow = %self.id,
            function = %self.target,
            depth = self.depth,
            "-> {}",
            state.status_text()
        );
        self.transitions.push(state);
        self.ticks.push(self.clock.fetch_add(1, Ordering::SeqCst));
    }

    fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
        self.finished_tick = Some(self.clock.fetch_add(1, Ordering::SeqCst));
    }

    /// Tick of the first entry into `state`.
    pub fn tick_of(&self, state: WorkflowState) -> Option<u64> {
        self.transitions
            .iter()
            .position(|s| *s == state)
            .and_then(|i| self.ticks.get(i).copied())
    }

    pub fn final_state(&self) -> Option<WorkflowState> {
        self.transitions.last().copied()
    }

    pub fn reached(&self, state: WorkflowState) -> bool {
        self.transitions.contains(&state)
    }
}

/// Orchestrator knobs, usually taken from [`Config`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub durability: Durability,
    pub max_attempts: u32,
    pub use_generator: bool,
    pub default_stub_on_empty: bool,
    pub max_chain_frames: usize,
}

impl Settings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            durability: config.durability,
            max_attempts: config.max_attempts,
            use_generator: config.use_generator,
            default_stub_on_empty: config.default_stub_on_empty,
            max_chain_frames: config.max_chain_frames,
        }
    }

    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Default body used when manual input is empty and stubs are enabled.
pub fn default_stub(target: &FunctionDescriptor) -> String {
    format!(
        "def {sig}:\n    \"\"\"Generated default implementation for {name}.\"\"\"\n    print(\"Default implementation: {name} called\")\n    return \"Default result from {name}\"\n",
        sig = target.signature,
        name = target.name
    )
}

// ═══════════════════════════════════════════════════════════════════════════
//  ORCHESTRATOR
// ═══════════════════════════════════════════════════════════════════════════

/// Drives intercepted placeholder failures through the patch pipeline.
///
/// Installed on an [`Interpreter`] as its [`FailureHandler`]. Workflows run
/// on the thread that hit the failure and may nest when a replayed body
/// reaches another placeholder.
pub struct Orchestrator {
    generator: Option<Arc<dyn ImplementationGenerator>>,
    surface: Arc<dyn ConfirmationSurface>,
    settings: Settings,
    history: Mutex<Vec<WorkflowReport>>,
    in_flight: Mutex<HashSet<FunctionId>>,
    identity_locks: Mutex<HashMap<FunctionId, Arc<Mutex<()>>>>,
    depth: AtomicUsize,
    clock: Arc<AtomicU64>,
}

enum Authored {
    Text(String),
    Declined,
}

impl Orchestrator {
    pub fn new(surface: Arc<dyn ConfirmationSurface>, settings: Settings) -> Self {
        Self {
            generator: None,
            surface,
            settings,
            history: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashSet::new()),
            identity_locks: Mutex::new(HashMap::new()),
            depth: AtomicUsize::new(0),
            clock: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn ImplementationGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Finished workflows, in completion order (nested ones first).
    pub fn history(&self) -> Vec<WorkflowReport> {
        lock(&self.history).clone()
    }

    fn identity_lock(&self, id: FunctionId) -> Arc<Mutex<()>> {
        lock(&self.identity_locks)
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn run(&self, interp: &mut Interpreter, interception: Interception, report: &mut WorkflowReport) -> Resolution {
        report.enter(WorkflowState::Detected);
        let cell = interception.function.clone();

        let target = match describe_function(&cell) {
            Ok(target) => target,
            Err(err) => {
                tracing::warn!(function = %cell.qualname, "cannot describe placeholder: {}", err);
                self.surface.notify(&format!("Cannot implement {}: {}", cell.qualname, err));
                return self.propagate(report, PatchOutcome::Declined, Some(err));
            }
        };

        let chain = self.chain_for(interp, &interception, &target);
        report.enter(WorkflowState::ChainCaptured);

        report.enter(WorkflowState::Requesting);
        let first = self.first_candidate(&target, &chain, report);

        let text = match first {
            Authored::Text(text) => text,
            Authored::Declined => {
                return self.propagate(report, PatchOutcome::Declined, Some(PatchError::UserDeclined));
            }
        };

        let durability = match self.validate_and_apply(interp, &target, text, report) {
            Ok(durability) => durability,
            Err(outcome) => {
                let err = match outcome {
                    PatchOutcome::Rejected { original, candidate } => {
                        PatchError::StructuralMismatch { original, candidate }
                    }
                    _ => PatchError::UserDeclined,
                };
                return self.propagate(report, outcome, Some(err));
            }
        };

        if !durability.hot_swaps() {
            tracing::info!(
                function = %target.qualname,
                "source rewritten; the running program keeps the old body until reloaded"
            );
            self.surface.notify(&format!(
                "Rewrote {} in {}; rerun the program to use it.",
                target.qualname, target.location.origin
            ));
            return self.propagate(
                report,
                PatchOutcome::Applied {
                    durability,
                    replayed: false,
                },
                None,
            );
        }

        report.outcome = PatchOutcome::Applied {
            durability,
            replayed: true,
        };
        tracing::debug!(function = %target.qualname, "replaying intercepted call");
        match interp.call_function(&cell, interception.args, interception.kwargs) {
            Ok(value) => {
                report.enter(WorkflowState::Resumed);
                tracing::info!(function = %target.qualname, %durability, "patched and resumed");
                Resolution::Resumed(value)
            }
            Err(Unwind::Raise(exc)) => {
                report.enter(WorkflowState::Propagated);
                report.error = Some(format!("{}: {}", exc.kind(), exc.message()));
                tracing::info!(function = %target.qualname, "patched; replay raised {}", exc.kind());
                Resolution::Raise(exc)
            }
            Err(other) => {
                report.enter(WorkflowState::Propagated);
                report.error = Some(other.into_error().to_string());
                Resolution::Propagate
            }
        }
    }

    /// Root-first chain; a single frame when the recorder finds nothing.
    fn chain_for(&self, interp: &Interpreter, interception: &Interception, target: &FunctionDescriptor) -> Vec<CallStackFrame> {
        let chain = capture_chain(&interception.signal);
        if !chain.is_empty() {
            return chain;
        }
        let caller = interp
            .frames()
            .last()
            .and_then(|frame| {
                describe_function(&frame.function)
                    .ok()
                    .map(|descriptor| CallStackFrame {
                        descriptor,
                        line: frame.line,
                    })
            });
        vec![caller.unwrap_or_else(|| CallStackFrame {
            descriptor: target.clone(),
            line: target.location.start_line,
        })]
    }

    /// Generator suggestion plus review, or manual authoring.
    fn first_candidate(&self, target: &FunctionDescriptor, chain: &[CallStackFrame], report: &mut WorkflowReport) -> Authored {
        let generator = self
            .generator
            .as_ref()
            .filter(|_| self.settings.use_generator);

        let suggestion = match generator {
            Some(generator) if self.surface.wants_generator(target) => {
                let request = build_request_with_limit(target, chain, self.settings.max_chain_frames);
                match generator.suggest(&request) {
                    Ok(suggestion) => Some(suggestion),
                    Err(err) => {
                        tracing::warn!(function = %target.qualname, "generator failed, falling back to manual authoring: {}", err);
                        self.surface
                            .notify(&format!("{}; falling back to manual implementation.", err));
                        None
                    }
                }
            }
            _ => None,
        };

        let Some(suggestion) = suggestion else {
            report.enter(WorkflowState::Declined);
            return self.author(target, None, None, report);
        };

        report.enter(WorkflowState::Suggested);
        match self.surface.review(target, &suggestion) {
            Review::Accept => {
                report.enter(WorkflowState::Confirmed);
                Authored::Text(suggestion.implementation)
            }
            Review::Edit(text) => {
                report.enter(WorkflowState::Edited);
                Authored::Text(text)
            }
            Review::Reject => {
                report.enter(WorkflowState::RejectedByUser);
                self.author(target, Some(&suggestion.implementation), None, report)
            }
        }
    }

    fn author(
        &self,
        target: &FunctionDescriptor,
        draft: Option<&str>,
        problem: Option<&str>,
        report: &mut WorkflowReport,
    ) -> Authored {
        match self.surface.author(target, draft, problem) {
            Some(text) if !text.trim().is_empty() => {
                report.enter(WorkflowState::Edited);
                Authored::Text(text)
            }
            _ if self.settings.default_stub_on_empty && problem.is_none() => {
                tracing::info!(function = %target.qualname, "using default stub");
                report.enter(WorkflowState::Edited);
                Authored::Text(default_stub(target))
            }
            _ => Authored::Declined,
        }
    }

    /// Validate, apply, and send the user back to editing on candidate
    /// problems. `Err` carries the outcome to report when giving up.
    fn validate_and_apply(
        &self,
        interp: &mut Interpreter,
        target: &FunctionDescriptor,
        mut text: String,
        report: &mut WorkflowReport,
    ) -> std::result::Result<Durability, PatchOutcome> {
        let mut failures = 0u32;
        loop {
            report.enter(WorkflowState::Validating);
            let err = {
                let guard = self.identity_lock(target.id);
                let _held = lock(&guard);
                match patch::parse_candidate(&text).and_then(|c| patch::check(target, &c).map(|_| c)) {
                    Ok(candidate) => match self.apply(interp, target, &candidate) {
                        Ok(durability) => {
                            report.enter(WorkflowState::Applied);
                            return Ok(durability);
                        }
                        Err(err) => err,
                    },
                    Err(err) => err,
                }
            };

            report.enter(WorkflowState::ValidationFailed);
            tracing::debug!(function = %target.qualname, "candidate rejected: {}", err);
            failures += 1;
            let exhausted = failures > self.settings.max_attempts;
            if exhausted {
                tracing::warn!(function = %target.qualname, attempts = failures, "giving up after repeated invalid candidates");
                self.surface.notify(&format!("Giving up on {} after {} invalid candidate(s).", target.qualname, failures));
                return Err(match err {
                    PatchError::StructuralMismatch { original, candidate } => {
                        PatchOutcome::Rejected { original, candidate }
                    }
                    _ => PatchOutcome::Declined,
                });
            }

            match self.author(target, Some(&text), Some(&err.to_string()), report) {
                Authored::Text(next) => text = next,
                Authored::Declined => return Err(PatchOutcome::Declined),
            }
        }
    }

    /// Apply with the configured durability, falling back to a hot-swap
    /// when the source file cannot be rewritten.
    fn apply(&self, interp: &mut Interpreter, target: &FunctionDescriptor, candidate: &Candidate) -> Result<Durability> {
        let durability = self.settings.durability;
        match patch::apply_candidate(interp, target, candidate, durability) {
            Ok(()) => Ok(durability),
            Err(err) if durability.rewrites() && err.is_durable_fallback() => {
                tracing::warn!(
                    function = %target.qualname,
                    "durable rewrite failed, patching in memory only: {}",
                    err
                );
                self.surface.notify(&format!(
                    "Could not rewrite {} ({}); patching the running program only.",
                    target.location, err
                ));
                patch::apply_candidate(interp, target, candidate, Durability::Ephemeral)?;
                Ok(Durability::Ephemeral)
            }
            Err(err) => Err(err),
        }
    }

    fn propagate(&self, report: &mut WorkflowReport, outcome: PatchOutcome, err: Option<PatchError>) -> Resolution {
        report.enter(WorkflowState::Propagated);
        tracing::info!(function = %report.target, outcome = ?outcome, "placeholder failure propagates");
        report.outcome = outcome;
        report.error = err.map(|e| e.to_string());
        Resolution::Propagate
    }
}

impl FailureHandler for Orchestrator {
    fn handle(&self, interp: &mut Interpreter, interception: Interception) -> Resolution {
        let id = interception.function.id;
        if !lock(&self.in_flight).insert(id) {
            tracing::debug!(
                function = %interception.function.qualname,
                "already being implemented; letting the failure propagate"
            );
            return Resolution::Propagate;
        }

        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        let mut report = WorkflowReport::new(&interception.function.qualname, id, depth, self.clock.clone());
        let resolution = self.run(interp, interception, &mut report);
        report.finish();

        self.depth.fetch_sub(1, Ordering::SeqCst);
        lock(&self.in_flight).remove(&id);
        lock(&self.history).push(report);
        resolution
    }
}
