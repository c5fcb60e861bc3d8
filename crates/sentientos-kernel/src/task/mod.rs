//! Task, step and repair-action data model.
//!
//! A [`Task`] is an immutable unit of work: an ordered list of [`Step`]s
//! plus the repair actions ([`EprAction`]) the closure loop may invoke
//! when a step's prerequisites fail. Tasks are built by the caller,
//! admitted once, and re-supplied verbatim at execution time; any
//! divergence fails the request fingerprint match.
//!
//! Step payloads are a tagged union with one variant per step kind. The
//! safe constructor [`Step::new`] derives the kind from the payload so a
//! mismatch cannot be built that way; hand-assembled steps are re-checked
//! at dispatch and fail with a step execution error.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Artifact map produced by a step or handler.
pub type Artifacts = BTreeMap<String, Value>;

/// Deterministic callable payload for python steps.
pub type PythonCallable = Arc<dyn Fn() -> Artifacts + Send + Sync>;

/// Handler invoked by the closure loop for a passing repair action.
pub type EprHandler = Arc<dyn Fn() -> ClosureOutcome + Send + Sync>;

// =============================================================================
// Step kinds and payloads
// =============================================================================

/// The closed set of step kinds the engine can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// No-op step; succeeds (or fails on request) without side effects.
    Noop,
    /// Shell command declaration. The kernel records the command, it
    /// never spawns a process.
    Shell,
    /// Deterministic in-process callable.
    Python,
    /// Mesh job declaration for the compute mesh collaborator.
    Mesh,
    /// Adapter invocation declaration for an external adapter context.
    Adapter,
}

impl StepKind {
    /// Wire name used in canonical forms and audit entries.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::Shell => "shell",
            Self::Python => "python",
            Self::Mesh => "mesh",
            Self::Adapter => "adapter",
        }
    }

    /// Parses a wire name back into a kind.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "noop" => Some(Self::Noop),
            "shell" => Some(Self::Shell),
            "python" => Some(Self::Python),
            "mesh" => Some(Self::Mesh),
            "adapter" => Some(Self::Adapter),
            _ => None,
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a noop step.
#[derive(Debug, Clone, Default)]
pub struct NoopPayload {
    /// Optional note surfaced as an artifact.
    pub note: Option<String>,
    /// Deterministic failure switch for exercising failure paths.
    pub should_fail: bool,
}

/// Payload of a shell step. The command is declared, surfaced under
/// admission redactions, and echoed as an artifact; it is never executed
/// by the kernel.
#[derive(Debug, Clone)]
pub struct ShellPayload {
    /// Command line as declared by the caller.
    pub command: String,
    /// Optional working directory.
    pub cwd: Option<String>,
    /// Deterministic failure switch.
    pub should_fail: bool,
}

/// Payload of a python step: a named deterministic callable.
#[derive(Clone)]
pub struct PythonPayload {
    /// Stable name bound into the canonical form.
    pub name: String,
    /// The callable itself; excluded from canonicalization.
    pub callable: Option<PythonCallable>,
}

impl fmt::Debug for PythonPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PythonPayload")
            .field("name", &self.name)
            .field("callable", &self.callable.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Payload of a mesh step.
#[derive(Debug, Clone)]
pub struct MeshPayload {
    /// Mesh job identifier.
    pub job: String,
    /// Job parameters, canonicalized with sorted keys.
    pub parameters: Artifacts,
    /// Deterministic failure switch.
    pub should_fail: bool,
}

/// Payload of an adapter step.
#[derive(Debug, Clone)]
pub struct AdapterPayload {
    /// Adapter identifier.
    pub adapter: String,
    /// Operation name within the adapter.
    pub operation: String,
    /// Operation parameters, canonicalized with sorted keys.
    pub parameters: Artifacts,
    /// Deterministic failure switch.
    pub should_fail: bool,
}

/// Tagged union of step payloads; one runner exists per variant.
#[derive(Debug, Clone)]
pub enum StepPayload {
    /// See [`NoopPayload`].
    Noop(NoopPayload),
    /// See [`ShellPayload`].
    Shell(ShellPayload),
    /// See [`PythonPayload`].
    Python(PythonPayload),
    /// See [`MeshPayload`].
    Mesh(MeshPayload),
    /// See [`AdapterPayload`].
    Adapter(AdapterPayload),
}

impl StepPayload {
    /// The step kind this payload belongs to.
    #[must_use]
    pub const fn kind(&self) -> StepKind {
        match self {
            Self::Noop(_) => StepKind::Noop,
            Self::Shell(_) => StepKind::Shell,
            Self::Python(_) => StepKind::Python,
            Self::Mesh(_) => StepKind::Mesh,
            Self::Adapter(_) => StepKind::Adapter,
        }
    }
}

// =============================================================================
// Steps
// =============================================================================

/// One unit of execution within a task.
///
/// Steps run once per task run, in task-declared order; the engine never
/// re-sorts by `step_id`.
#[derive(Debug, Clone)]
pub struct Step {
    /// Caller-assigned identifier, unique within the task.
    pub step_id: u64,
    /// Declared kind; must match the payload variant at dispatch.
    pub kind: StepKind,
    /// Kind-specific payload.
    pub payload: StepPayload,
    /// Artifact keys the step is expected to produce. Missing keys are
    /// materialized as null in the trace so absence is visible.
    pub expects: Vec<String>,
}

impl Step {
    /// Builds a step whose kind is derived from the payload, making a
    /// kind/payload mismatch unrepresentable through this constructor.
    #[must_use]
    pub fn new(step_id: u64, payload: StepPayload) -> Self {
        Self {
            step_id,
            kind: payload.kind(),
            payload,
            expects: Vec::new(),
        }
    }

    /// Adds expected artifact keys.
    #[must_use]
    pub fn with_expects(mut self, expects: Vec<String>) -> Self {
        self.expects = expects;
        self
    }
}

// =============================================================================
// EPR actions
// =============================================================================

/// How much authority a repair action would exercise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorityImpact {
    /// No authority beyond the admitted task.
    None,
    /// Authority scoped to the task's own resources.
    Local,
    /// Authority visible outside the task.
    Global,
}

impl AuthorityImpact {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Local => "local",
            Self::Global => "global",
        }
    }
}

/// Whether a repair action can be undone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reversibility {
    /// Undo always possible without evidence.
    Guaranteed,
    /// Undo possible only with a rollback proof.
    Bounded,
    /// Not reversible.
    None,
}

impl Reversibility {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Guaranteed => "guaranteed",
            Self::Bounded => "bounded",
            Self::None => "none",
        }
    }
}

/// Evidence form backing a bounded-reversibility claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackProof {
    /// Full state snapshot taken before the action.
    Snapshot,
    /// Reversible diff of the touched state.
    Diff,
    /// Version-control commit reference.
    Commit,
    /// No proof available.
    None,
}

impl RollbackProof {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::Diff => "diff",
            Self::Commit => "commit",
            Self::None => "none",
        }
    }
}

/// Whether a repair action touches anything outside the process.
/// External effects are unconditionally forbidden inside closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalEffects {
    /// The action reaches outside the process.
    Yes,
    /// The action is internal only.
    No,
}

impl ExternalEffects {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Yes => "yes",
            Self::No => "no",
        }
    }
}

/// Assessment status of a failing step's prerequisite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrerequisiteStatus {
    /// Prerequisite already holds; retry the step.
    #[serde(rename = "satisfied")]
    Satisfied,
    /// Repairable within closure guardrails.
    #[serde(rename = "epr-fixable")]
    EprFixable,
    /// Repairable only with explicit authority beyond the task's own.
    #[serde(rename = "authority-required")]
    AuthorityRequired,
    /// Not repairable; surfaced to the caller, never skipped.
    #[serde(rename = "impossible")]
    Impossible,
    /// Cannot be assessed without guessing; the engine refuses to guess.
    #[serde(rename = "unknown")]
    Unknown,
}

impl PrerequisiteStatus {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Satisfied => "satisfied",
            Self::EprFixable => "epr-fixable",
            Self::AuthorityRequired => "authority-required",
            Self::Impossible => "impossible",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PrerequisiteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A prerequisite the kernel cannot assess on its own.
///
/// Created unresolved; an operator supplies `response` and
/// `resolved_status` out-of-band, and the caller resubmits a new task
/// generation that resumes from assessment with that status treated as
/// ground truth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPrerequisite {
    /// The condition that could not be assessed.
    pub condition: String,
    /// Why the kernel cannot assess it.
    pub reason: String,
    /// Question an operator must answer to unblock.
    pub unblock_query: Option<String>,
    /// Operator-supplied answer.
    pub response: Option<String>,
    /// Ground-truth status supplied with the answer. Resolving *to*
    /// `Unknown` is rejected.
    pub resolved_status: Option<PrerequisiteStatus>,
}

impl UnknownPrerequisite {
    /// True once an operator has supplied a ground-truth resolution.
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        self.resolved_status.is_some()
    }
}

/// Result reported by an EPR handler.
#[derive(Debug, Clone, Default)]
pub struct ClosureOutcome {
    /// Whether the repair changed anything. A cycle that changes nothing
    /// and has no further distinct repair available is non-convergent.
    pub closure_changed: bool,
    /// Artifacts describing the repair; recorded in the trace, never
    /// persisted beyond the run.
    pub artifacts: Artifacts,
}

impl ClosureOutcome {
    /// Outcome of a productive repair.
    #[must_use]
    pub fn changed() -> Self {
        Self {
            closure_changed: true,
            artifacts: Artifacts::new(),
        }
    }

    /// Outcome of a repair that changed nothing.
    #[must_use]
    pub fn unchanged() -> Self {
        Self {
            closure_changed: false,
            artifacts: Artifacts::new(),
        }
    }
}

/// A repair action declared with the task and invoked only from inside
/// the closure loop, under non-escalating authority rules.
#[derive(Clone)]
pub struct EprAction {
    /// Caller-assigned identifier, unique within the task.
    pub action_id: String,
    /// Task this action belongs to.
    pub parent_task_id: String,
    /// Step whose prerequisite failure triggers this action.
    pub trigger_step_id: u64,
    /// Authority the action would exercise.
    pub authority_impact: AuthorityImpact,
    /// Reversibility claim.
    pub reversibility: Reversibility,
    /// Evidence backing a bounded reversibility claim.
    pub rollback_proof: RollbackProof,
    /// Whether the action reaches outside the process.
    pub external_effects: ExternalEffects,
    /// Escalation flag; unconditionally forbidden inside closure.
    pub privilege_escalation: bool,
    /// Human-readable description used in approval prompts.
    pub description: String,
    /// Repair handler; excluded from canonicalization.
    pub handler: Option<EprHandler>,
    /// Prerequisite the kernel cannot assess, if any.
    pub unknown_prerequisite: Option<UnknownPrerequisite>,
}

impl fmt::Debug for EprAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EprAction")
            .field("action_id", &self.action_id)
            .field("parent_task_id", &self.parent_task_id)
            .field("trigger_step_id", &self.trigger_step_id)
            .field("authority_impact", &self.authority_impact)
            .field("reversibility", &self.reversibility)
            .field("rollback_proof", &self.rollback_proof)
            .field("external_effects", &self.external_effects)
            .field("privilege_escalation", &self.privilege_escalation)
            .field("handler", &self.handler.as_ref().map(|_| "<fn>"))
            .field("unknown_prerequisite", &self.unknown_prerequisite)
            .finish_non_exhaustive()
    }
}

impl EprAction {
    /// Approval key used when callers grant authority-requiring actions:
    /// `parent_task_id:action_id`.
    #[must_use]
    pub fn approval_key(&self) -> String {
        format!("{}:{}", self.parent_task_id, self.action_id)
    }
}

// =============================================================================
// Tasks
// =============================================================================

/// An immutable unit of work.
#[derive(Debug, Clone)]
pub struct Task {
    /// Caller-assigned identifier.
    pub task_id: String,
    /// What the task is for; bound into the fingerprint.
    pub objective: String,
    /// Order-insensitive constraint set. Reordering does not change the
    /// fingerprint or the execution result.
    pub constraints: Vec<String>,
    /// Ordered step sequence; executed exactly in this order.
    pub steps: Vec<Step>,
    /// Whether the closure loop may run for this task at all.
    pub allow_epr: bool,
    /// Repair actions declared with the task.
    pub epr_actions: Vec<EprAction>,
}

impl Task {
    /// Builds a task with no constraints and no repair actions.
    #[must_use]
    pub fn new(task_id: impl Into<String>, objective: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            task_id: task_id.into(),
            objective: objective.into(),
            constraints: Vec::new(),
            steps,
            allow_epr: false,
            epr_actions: Vec::new(),
        }
    }

    /// Repair actions declared for a specific step.
    pub fn actions_for_step(&self, step_id: u64) -> impl Iterator<Item = &EprAction> {
        self.epr_actions
            .iter()
            .filter(move |action| action.trigger_step_id == step_id)
    }
}
