//! EPR closure loop: bounded, non-escalating self-repair.
//!
//! When a step fails and the task permits repair, the engine hands the
//! failing step to [`run_closure`]. The loop assesses every repair
//! action declared for that step, invokes at most one handler per
//! iteration under hard guardrails, and either clears the way for a
//! retry or surfaces exactly why it cannot.
//!
//! The loop never guesses: an unresolved unknown prerequisite blocks
//! with a question instead of a default. It never escalates: actions
//! needing authority beyond the task's own aggregate into a single
//! approval request rather than running. It provably terminates: three
//! counters bound iterations, invoked actions and consumed unknown
//! resolutions, and crossing any of them is positive non-convergence
//! detection reported as exhaustion, exactly once.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::config::ClosureLimits;
use crate::task::{
    AuthorityImpact, EprAction, ExternalEffects, PrerequisiteStatus, Reversibility, RollbackProof,
    Task,
};

// =============================================================================
// Assessment
// =============================================================================

/// Assessment of one repair action's prerequisite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrerequisiteAssessment {
    /// The assessed action.
    pub action_id: String,
    /// Its status.
    pub status: PrerequisiteStatus,
}

/// Derives the prerequisite status of a single action from its declared
/// surface. Operator resolutions on unknown prerequisites are taken as
/// ground truth.
///
/// # Errors
///
/// Returns [`TaskClosureError`] when an unknown prerequisite claims to
/// be resolved *to* unknown, which is not a resolution.
pub fn assess_action(action: &EprAction) -> Result<PrerequisiteStatus, TaskClosureError> {
    if let Some(unknown) = &action.unknown_prerequisite {
        return match unknown.resolved_status {
            None => Ok(PrerequisiteStatus::Unknown),
            Some(PrerequisiteStatus::Unknown) => Err(TaskClosureError {
                action_id: action.action_id.clone(),
                reason: "unknown prerequisite resolved to unknown".to_string(),
            }),
            Some(status) => Ok(status),
        };
    }
    match action.authority_impact {
        AuthorityImpact::None => match action.reversibility {
            Reversibility::Guaranteed | Reversibility::Bounded => {
                Ok(PrerequisiteStatus::EprFixable)
            },
            // Irreversible repair is never closure-local.
            Reversibility::None => Ok(PrerequisiteStatus::AuthorityRequired),
        },
        AuthorityImpact::Local | AuthorityImpact::Global => {
            Ok(PrerequisiteStatus::AuthorityRequired)
        },
    }
}

/// Assesses every repair action declared on a task, in declared order.
///
/// # Errors
///
/// Returns [`TaskClosureError`] when any action carries an invalid
/// resolution.
pub fn assess_task_prerequisites(
    task: &Task,
) -> Result<Vec<PrerequisiteAssessment>, TaskClosureError> {
    task.epr_actions
        .iter()
        .map(|action| {
            Ok(PrerequisiteAssessment {
                action_id: action.action_id.clone(),
                status: assess_action(action)?,
            })
        })
        .collect()
}

// =============================================================================
// Errors
// =============================================================================

/// A closure guardrail was violated. The offending handler never ran.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("closure guardrail violated for action {action_id}: {reason}")]
pub struct TaskClosureError {
    /// Action that tripped the guardrail.
    pub action_id: String,
    /// Which guardrail and how.
    pub reason: String,
}

/// One authority-requiring action awaiting an explicit grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingApproval {
    /// The action needing approval.
    pub action_id: String,
    /// Grant key the caller must supply: `parent_task_id:action_id`.
    pub approval_key: String,
    /// What the action would do.
    pub description: String,
    /// Authority it would exercise.
    pub authority_impact: AuthorityImpact,
}

/// Repair requires authority the task does not hold. All pending
/// actions for the step are aggregated into one request; nothing ran.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("approval required for {} repair action(s) of task {task_id}", pending.len())]
pub struct EprApprovalRequired {
    /// Task whose repair is blocked.
    pub task_id: String,
    /// Every action awaiting a grant, in declared order.
    pub pending: Vec<PendingApproval>,
}

/// A prerequisite cannot be assessed and no resolution was supplied.
/// The engine refuses to guess; execution blocks on the query.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown prerequisite blocks task {task_id} at step {step_id}")]
pub struct UnknownPrerequisiteError {
    /// Blocked task.
    pub task_id: String,
    /// Step whose repair is blocked.
    pub step_id: u64,
    /// Question an operator must answer to unblock.
    pub unblock_query: Option<String>,
    /// Assessment of every action on the step at the time of blocking.
    pub assessments: Vec<PrerequisiteAssessment>,
}

/// Which bound the loop crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionType {
    /// Iteration or unknown-resolution bound crossed, or a
    /// non-productive cycle with no distinct repair left.
    ClosureExhausted,
    /// Repair-action bound crossed.
    EprExhausted,
}

impl ExhaustionType {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClosureExhausted => "closure_exhausted",
            Self::EprExhausted => "epr_exhausted",
        }
    }
}

/// The loop detected non-convergence. Raised exactly once per run, with
/// evidence of the cycle and no fabricated artifacts.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("task {task_id} exhausted ({}): {reason}", exhaustion_type.as_str())]
pub struct TaskExhausted {
    /// Exhausted task.
    pub task_id: String,
    /// Which bound was crossed.
    pub exhaustion_type: ExhaustionType,
    /// Human-readable account of the non-convergence.
    pub reason: String,
    /// Action ids invoked during the cycle, in invocation order.
    pub cycle_evidence: Vec<String>,
}

/// Failure modes of one closure run.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ClosureError {
    /// See [`TaskClosureError`].
    #[error(transparent)]
    Violation(#[from] TaskClosureError),

    /// See [`EprApprovalRequired`].
    #[error(transparent)]
    ApprovalRequired(#[from] EprApprovalRequired),

    /// See [`UnknownPrerequisiteError`].
    #[error(transparent)]
    Unknown(#[from] UnknownPrerequisiteError),

    /// See [`TaskExhausted`].
    #[error(transparent)]
    Exhausted(#[from] TaskExhausted),
}

// =============================================================================
// Reports and counters
// =============================================================================

/// Record of one repair action considered by the loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EprActionRecord {
    /// The action.
    pub action_id: String,
    /// Status it was assessed at.
    pub status: PrerequisiteStatus,
    /// Whether its handler reported a change.
    pub closure_changed: bool,
    /// Whether it ran under an explicit grant.
    pub approved: bool,
}

/// Summary of all repair activity in one task run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EprReport {
    /// Every action considered, in invocation order.
    pub actions: Vec<EprActionRecord>,
    /// Authority acquired minus authority released. Grants are scoped to
    /// the invocation and released on return, so repair leaves this 0.
    pub net_authority_delta: i64,
    /// Whether closure persisted any artifacts. Closure never does.
    pub artifacts_persisted: bool,
}

impl EprReport {
    /// Audit payload form.
    #[must_use]
    pub fn to_value(&self) -> Value {
        json!({
            "actions": self
                .actions
                .iter()
                .map(|record| {
                    json!({
                        "action_id": record.action_id,
                        "status": record.status.as_str(),
                        "closure_changed": record.closure_changed,
                        "approved": record.approved,
                    })
                })
                .collect::<Vec<_>>(),
            "net_authority_delta": self.net_authority_delta,
            "artifacts_persisted": self.artifacts_persisted,
        })
    }
}

/// Mutable loop state carried across every closure entry of one task
/// run. The once-only flags make blocked-unknown and exhaustion events
/// appear exactly once in the audit chain no matter how often the
/// engine re-enters the loop.
#[derive(Debug, Clone, Default)]
pub struct ClosureCounters {
    /// Iterations consumed across the run.
    pub closure_iterations: u32,
    /// Handlers invoked across the run.
    pub epr_actions_invoked: u32,
    /// Resolved unknowns consumed across the run.
    pub unknown_cycles: u32,
    consumed_unknowns: BTreeSet<String>,
    unknown_logged: bool,
    exhaustion_logged: bool,
}

/// Outcome of one closure entry for one failing step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosureRun {
    /// Whether the engine should retry the step.
    pub repaired: bool,
    /// Actions considered during this entry, in order.
    pub records: Vec<EprActionRecord>,
}

// =============================================================================
// The loop
// =============================================================================

/// Runs the closure loop for one failing step.
///
/// `approvals` holds grant keys (`parent_task_id:action_id`) for
/// authority-requiring actions. `counters` persists across entries of
/// the same task run. Audit payloads for everything that happened are
/// pushed onto `events` whether the run succeeds or fails; the engine
/// appends them to the chain.
///
/// # Errors
///
/// Returns [`ClosureError`] when a guardrail is violated, approval or an
/// unknown resolution is needed, or a termination bound is crossed.
pub fn run_closure(
    task: &Task,
    step_id: u64,
    approvals: &BTreeSet<String>,
    limits: &ClosureLimits,
    counters: &mut ClosureCounters,
    events: &mut Vec<Map<String, Value>>,
) -> Result<ClosureRun, ClosureError> {
    let actions: Vec<&EprAction> = task.actions_for_step(step_id).collect();
    if actions.is_empty() {
        return Ok(ClosureRun {
            repaired: false,
            records: Vec::new(),
        });
    }

    let mut records: Vec<EprActionRecord> = Vec::new();
    let mut invoked: BTreeSet<String> = BTreeSet::new();

    loop {
        counters.closure_iterations += 1;
        if counters.closure_iterations > limits.max_closure_iterations {
            return Err(exhaust(
                task,
                ExhaustionType::ClosureExhausted,
                format!(
                    "closure iteration bound {} crossed",
                    limits.max_closure_iterations
                ),
                &invoked,
                counters,
                events,
            )
            .into());
        }

        let mut assessments = Vec::with_capacity(actions.len());
        for action in &actions {
            assessments.push(PrerequisiteAssessment {
                action_id: action.action_id.clone(),
                status: assess_action(action)?,
            });
        }

        // Consumed operator resolutions count against the unknown bound.
        for (action, assessment) in actions.iter().zip(&assessments) {
            let resolved = action
                .unknown_prerequisite
                .as_ref()
                .is_some_and(super::task::UnknownPrerequisite::is_resolved);
            if resolved && counters.consumed_unknowns.insert(action.action_id.clone()) {
                counters.unknown_cycles += 1;
                if counters.unknown_cycles > limits.max_unknown_resolution_cycles {
                    return Err(exhaust(
                        task,
                        ExhaustionType::ClosureExhausted,
                        format!(
                            "unknown resolution bound {} crossed",
                            limits.max_unknown_resolution_cycles
                        ),
                        &invoked,
                        counters,
                        events,
                    )
                    .into());
                }
                events.push(event_payload(task, step_id, "EPR_UNKNOWN_RESOLVED", |p| {
                    p.insert("action_id".to_string(), json!(assessment.action_id));
                    p.insert(
                        "resolved_status".to_string(),
                        json!(assessment.status.as_str()),
                    );
                }));
            }
        }

        // Impossible prerequisites are surfaced, never skipped.
        if let Some(assessment) = assessments
            .iter()
            .find(|a| a.status == PrerequisiteStatus::Impossible)
        {
            return Err(TaskClosureError {
                action_id: assessment.action_id.clone(),
                reason: "prerequisite assessed impossible".to_string(),
            }
            .into());
        }

        // Unresolved unknowns block with a question, never a guess.
        if assessments
            .iter()
            .any(|a| a.status == PrerequisiteStatus::Unknown)
        {
            let unblock_query = actions
                .iter()
                .filter_map(|action| action.unknown_prerequisite.as_ref())
                .filter(|unknown| !unknown.is_resolved())
                .find_map(|unknown| unknown.unblock_query.clone());
            if !counters.unknown_logged {
                counters.unknown_logged = true;
                events.push(event_payload(
                    task,
                    step_id,
                    "EPR_UNKNOWN_PREREQUISITE",
                    |p| {
                        p.insert("unblock_query".to_string(), json!(unblock_query));
                        p.insert(
                            "assessments".to_string(),
                            json!(assessments
                                .iter()
                                .map(|a| json!({
                                    "action_id": a.action_id,
                                    "status": a.status.as_str(),
                                }))
                                .collect::<Vec<_>>()),
                        );
                    },
                ));
            }
            return Err(UnknownPrerequisiteError {
                task_id: task.task_id.clone(),
                step_id,
                unblock_query,
                assessments,
            }
            .into());
        }

        // Every satisfied prerequisite means the step can simply retry.
        if assessments
            .iter()
            .all(|a| a.status == PrerequisiteStatus::Satisfied)
        {
            return Ok(ClosureRun {
                repaired: true,
                records,
            });
        }

        // Ungranted authority requirements aggregate into one request.
        let pending: Vec<PendingApproval> = actions
            .iter()
            .zip(&assessments)
            .filter(|(action, assessment)| {
                assessment.status == PrerequisiteStatus::AuthorityRequired
                    && !approvals.contains(&action.approval_key())
            })
            .map(|(action, _)| PendingApproval {
                action_id: action.action_id.clone(),
                approval_key: action.approval_key(),
                description: action.description.clone(),
                authority_impact: action.authority_impact,
            })
            .collect();
        if !pending.is_empty() {
            return Err(EprApprovalRequired {
                task_id: task.task_id.clone(),
                pending,
            }
            .into());
        }

        // One invocation per iteration, declared order, distinct first.
        let next = actions.iter().zip(&assessments).find(|(action, a)| {
            matches!(
                a.status,
                PrerequisiteStatus::EprFixable | PrerequisiteStatus::AuthorityRequired
            ) && !invoked.contains(&action.action_id)
        });
        let Some((action, assessment)) = next else {
            return Err(exhaust(
                task,
                ExhaustionType::ClosureExhausted,
                "non-productive cycle with no distinct repair remaining".to_string(),
                &invoked,
                counters,
                events,
            )
            .into());
        };

        check_guardrails(action)?;

        counters.epr_actions_invoked += 1;
        if counters.epr_actions_invoked > limits.max_epr_actions_per_task {
            return Err(exhaust(
                task,
                ExhaustionType::EprExhausted,
                format!(
                    "repair action bound {} crossed",
                    limits.max_epr_actions_per_task
                ),
                &invoked,
                counters,
                events,
            )
            .into());
        }

        let Some(handler) = &action.handler else {
            return Err(TaskClosureError {
                action_id: action.action_id.clone(),
                reason: "repair action has no handler".to_string(),
            }
            .into());
        };
        let approved = assessment.status == PrerequisiteStatus::AuthorityRequired;
        let outcome = handler();
        invoked.insert(action.action_id.clone());

        let record = EprActionRecord {
            action_id: action.action_id.clone(),
            status: assessment.status,
            closure_changed: outcome.closure_changed,
            approved,
        };
        events.push(event_payload(task, step_id, "EPR_ACTION_INVOKED", |p| {
            p.insert("action_id".to_string(), json!(record.action_id));
            p.insert("status".to_string(), json!(record.status.as_str()));
            p.insert("closure_changed".to_string(), json!(record.closure_changed));
            p.insert("approved".to_string(), json!(record.approved));
            p.insert(
                "artifacts".to_string(),
                Value::Object(outcome.artifacts.clone().into_iter().collect()),
            );
        }));
        records.push(record);

        if outcome.closure_changed {
            return Ok(ClosureRun {
                repaired: true,
                records,
            });
        }
        // Unproductive; loop to try a distinct repair if one remains.
    }
}

fn check_guardrails(action: &EprAction) -> Result<(), TaskClosureError> {
    if action.external_effects == ExternalEffects::Yes {
        return Err(TaskClosureError {
            action_id: action.action_id.clone(),
            reason: "external effects are forbidden inside closure".to_string(),
        });
    }
    if action.privilege_escalation {
        return Err(TaskClosureError {
            action_id: action.action_id.clone(),
            reason: "privilege escalation is forbidden inside closure".to_string(),
        });
    }
    if action.reversibility == Reversibility::Bounded
        && action.rollback_proof == RollbackProof::None
    {
        return Err(TaskClosureError {
            action_id: action.action_id.clone(),
            reason: "bounded reversibility requires a rollback proof".to_string(),
        });
    }
    Ok(())
}

fn exhaust(
    task: &Task,
    exhaustion_type: ExhaustionType,
    reason: String,
    invoked: &BTreeSet<String>,
    counters: &mut ClosureCounters,
    events: &mut Vec<Map<String, Value>>,
) -> TaskExhausted {
    let cycle_evidence: Vec<String> = invoked.iter().cloned().collect();
    if !counters.exhaustion_logged {
        counters.exhaustion_logged = true;
        events.push(event_payload(task, 0, "TASK_EXHAUSTED", |p| {
            p.remove("step_id");
            p.insert(
                "exhaustion_type".to_string(),
                json!(exhaustion_type.as_str()),
            );
            p.insert("reason".to_string(), json!(reason));
            p.insert("cycle_evidence".to_string(), json!(cycle_evidence));
        }));
    }
    TaskExhausted {
        task_id: task.task_id.clone(),
        exhaustion_type,
        reason,
        cycle_evidence,
    }
}

fn event_payload(
    task: &Task,
    step_id: u64,
    event: &str,
    fill: impl FnOnce(&mut Map<String, Value>),
) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("event".to_string(), json!(event));
    payload.insert("task_id".to_string(), json!(task.task_id));
    payload.insert("step_id".to_string(), json!(step_id));
    fill(&mut payload);
    payload
}
