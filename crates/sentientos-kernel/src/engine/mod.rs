//! Task execution engine.
//!
//! [`Kernel`] owns the audit chain and executes admitted tasks. The
//! contract is replayable determinism: given equal canonical inputs the
//! engine produces bitwise-equal results and equivalent traces, with
//! every step attempt and the terminal outcome durably audited before
//! control returns to the caller.
//!
//! Execution refuses to start until the authorization record, the
//! admission token and the recomputed request fingerprint all check
//! out. Steps then run strictly in declared order; the first failure
//! fails the task and skips the rest unless the closure loop repairs
//! the failing step's prerequisites.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::admission::{
    AdmissionContext, AdmissionDecision, AdmissionPolicy, AdmissionToken, admission_event_payload,
    admit, mint_admission_token,
};
use crate::audit::{AuditChain, AuditError};
use crate::canonical::{
    CanonicalRequest, RequestFingerprint, canonicalise_task_request, normalise_value,
    request_fingerprint_from_canonical,
};
use crate::closure::{ClosureCounters, EprActionRecord, EprReport, run_closure};
use crate::config::KernelConfig;
use crate::control_plane::{AuthorizationRecord, ControlPlanePolicy, RequestType};
use crate::error::KernelError;
use crate::identity::{compute_system_identity_digest, enforce_identity_drift};
use crate::task::{Artifacts, Step, StepKind, StepPayload, Task};

/// File name of the kernel's audit log under the configured log root.
pub const AUDIT_LOG_NAME: &str = "task_executor.jsonl";

// =============================================================================
// Results and traces
// =============================================================================

/// Terminal status of a returned task result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Every step completed.
    Completed,
    /// A step failed and no repair was available or permitted.
    Failed,
}

impl TaskStatus {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Status of one step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// The attempt produced its artifacts.
    Completed,
    /// The attempt failed.
    Failed,
}

impl StepStatus {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Record of one step attempt. Expected artifact keys the attempt did
/// not produce are materialized as null so absence is visible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTrace {
    /// The step.
    pub step_id: u64,
    /// Its kind.
    pub kind: StepKind,
    /// Attempt number, starting at 1; retries after repair increment it.
    pub attempt: u32,
    /// Outcome of the attempt.
    pub status: StepStatus,
    /// Artifacts produced, with expected-but-missing keys as null.
    pub artifacts: Artifacts,
    /// Failure message, when the attempt failed.
    pub error: Option<String>,
}

/// Result of one completed or failed task run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    /// The executed task.
    pub task_id: String,
    /// Terminal status.
    pub status: TaskStatus,
    /// Merged artifacts of all completed steps, in step order with
    /// later steps overwriting equal keys.
    pub artifacts: Artifacts,
    /// Every step attempt, in execution order.
    pub trace: Vec<StepTrace>,
    /// The token the run was admitted under.
    pub admission_token: AdmissionToken,
    /// Fingerprint the run was verified against.
    pub request_fingerprint: RequestFingerprint,
    /// Repair activity, empty when closure never ran.
    pub epr_report: EprReport,
    /// The canonical request the fingerprint was computed over.
    pub canonical_request: CanonicalRequest,
}

/// A step could not be dispatched at all. Distinct from a step
/// *failing*: dispatch errors abort the task without entering closure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("step {step_id} dispatch failed: {reason}")]
pub struct StepExecutionError {
    /// The undispatchable step.
    pub step_id: u64,
    /// What made it undispatchable.
    pub reason: String,
}

// =============================================================================
// Runners
// =============================================================================

/// Outcome of one runner invocation: artifacts on success, a failure
/// message on declared failure.
type RunOutcome = Result<Artifacts, String>;

fn run_step(step: &Step) -> Result<RunOutcome, StepExecutionError> {
    if step.kind != step.payload.kind() {
        return Err(StepExecutionError {
            step_id: step.step_id,
            reason: format!(
                "declared kind {} does not match payload kind {}",
                step.kind,
                step.payload.kind()
            ),
        });
    }
    Ok(match &step.payload {
        StepPayload::Noop(noop) => {
            if noop.should_fail {
                Err("noop step failed on request".to_string())
            } else {
                let mut artifacts = Artifacts::new();
                if let Some(note) = &noop.note {
                    artifacts.insert("note".to_string(), json!(note));
                }
                Ok(artifacts)
            }
        },
        StepPayload::Shell(shell) => {
            if shell.should_fail {
                Err("shell step failed on request".to_string())
            } else {
                // Declared only. The kernel records the command, it
                // never spawns a process.
                let mut artifacts = Artifacts::new();
                artifacts.insert("command".to_string(), json!(shell.command));
                artifacts.insert("executed".to_string(), json!(false));
                if let Some(cwd) = &shell.cwd {
                    artifacts.insert("cwd".to_string(), json!(cwd));
                }
                Ok(artifacts)
            }
        },
        StepPayload::Python(python) => match &python.callable {
            Some(callable) => {
                let mut artifacts = callable();
                artifacts.insert("callable".to_string(), json!(python.name));
                Ok(artifacts)
            },
            None => Err(format!("python callable {} is not bound", python.name)),
        },
        StepPayload::Mesh(mesh) => {
            if mesh.should_fail {
                Err("mesh step failed on request".to_string())
            } else {
                let mut artifacts = Artifacts::new();
                artifacts.insert("job".to_string(), json!(mesh.job));
                artifacts.insert(
                    "parameters".to_string(),
                    Value::Object(mesh.parameters.clone().into_iter().collect()),
                );
                artifacts.insert("dispatched".to_string(), json!(true));
                Ok(artifacts)
            }
        },
        StepPayload::Adapter(adapter) => {
            if adapter.should_fail {
                Err("adapter step failed on request".to_string())
            } else {
                let mut artifacts = Artifacts::new();
                artifacts.insert("adapter".to_string(), json!(adapter.adapter));
                artifacts.insert("operation".to_string(), json!(adapter.operation));
                artifacts.insert(
                    "parameters".to_string(),
                    Value::Object(adapter.parameters.clone().into_iter().collect()),
                );
                Ok(artifacts)
            }
        },
    })
}

fn materialize_expects(step: &Step, artifacts: &mut Artifacts) {
    for key in &step.expects {
        artifacts.entry(key.clone()).or_insert(Value::Null);
    }
}

// Artifacts feed the audit chain and persisted records, so they are held
// to the same integer-only canonical profile as request inputs. A
// callable returning a float is an undispatchable step, not a failed one.
fn check_artifacts(step_id: u64, artifacts: &Artifacts) -> Result<(), StepExecutionError> {
    for (key, value) in artifacts {
        if let Err(err) = normalise_value(value, false, &format!("artifacts.{key}")) {
            return Err(StepExecutionError {
                step_id,
                reason: err.to_string(),
            });
        }
    }
    Ok(())
}

// =============================================================================
// Kernel
// =============================================================================

/// The execution kernel: audit chain plus fixed configuration.
#[derive(Debug)]
pub struct Kernel {
    config: KernelConfig,
    audit: AuditChain,
}

impl Kernel {
    /// Opens (or resumes) the audit chain and builds a kernel.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] when the audit log cannot be opened.
    pub fn new(config: KernelConfig) -> Result<Self, AuditError> {
        let audit = AuditChain::open(config.audit_log_path(AUDIT_LOG_NAME))?;
        Ok(Self { config, audit })
    }

    /// The kernel's configuration.
    #[must_use]
    pub const fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Read access to the audit chain, for verification.
    #[must_use]
    pub const fn audit(&self) -> &AuditChain {
        &self.audit
    }

    /// Executes an admitted task.
    ///
    /// `approval_grants` holds keys (`task_id:action_id`) of repair
    /// actions the caller has explicitly approved.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError`] on any pre-flight check failure, step
    /// dispatch failure, or closure-loop outcome that blocks the run.
    /// A step merely failing is not an error: the task completes with
    /// status `failed`.
    pub fn execute_task(
        &mut self,
        task: &Task,
        authorization: &AuthorizationRecord,
        token: &AdmissionToken,
        declared_inputs: Option<&Artifacts>,
        approval_grants: &BTreeSet<String>,
    ) -> Result<TaskResult, KernelError> {
        if let Err(err) = authorization.require(RequestType::TaskExecution) {
            self.reject(task, "authorization", &err.to_string())?;
            return Err(err.into());
        }
        if let Err(err) = token.validate_for(task) {
            self.reject(task, "admission_token", &err.to_string())?;
            return Err(err.into());
        }
        let canonical =
            match canonicalise_task_request(task, authorization, &token.provenance, declared_inputs)
            {
                Ok(canonical) => canonical,
                Err(err) => {
                    self.reject(task, "canonicalization", &err.to_string())?;
                    return Err(err.into());
                },
            };
        let fingerprint = request_fingerprint_from_canonical(&canonical);
        if fingerprint != token.request_fingerprint {
            warn!(
                task_id = %task.task_id,
                "request fingerprint diverged from admission token"
            );
            self.reject(task, "request_fingerprint", "live request diverged")?;
            return Err(KernelError::FingerprintMismatch {
                token: token.request_fingerprint.as_str().to_string(),
                computed: fingerprint.as_str().to_string(),
            });
        }

        info!(task_id = %task.task_id, steps = task.steps.len(), "task started");
        self.audit.append(event(task, "TASK_STARTED", |p| {
            p.insert(
                "request_fingerprint".to_string(),
                json!(fingerprint.as_str()),
            );
            p.insert("step_count".to_string(), json!(task.steps.len()));
        }))?;

        let mut counters = ClosureCounters::default();
        let mut closure_events: Vec<Map<String, Value>> = Vec::new();
        let mut records: Vec<EprActionRecord> = Vec::new();
        let mut trace: Vec<StepTrace> = Vec::new();
        let mut artifacts = Artifacts::new();
        let mut status = TaskStatus::Completed;

        'steps: for step in &task.steps {
            let mut attempt = 1u32;
            loop {
                let outcome = match run_step(step) {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        self.append_trace(task, &failed_trace(step, attempt, &err.to_string()))?;
                        self.terminal(task, "aborted", &fingerprint, &records)?;
                        return Err(err.into());
                    },
                };
                match outcome {
                    Ok(mut produced) => {
                        if let Err(err) = check_artifacts(step.step_id, &produced) {
                            self.append_trace(
                                task,
                                &failed_trace(step, attempt, &err.to_string()),
                            )?;
                            self.terminal(task, "aborted", &fingerprint, &records)?;
                            return Err(err.into());
                        }
                        materialize_expects(step, &mut produced);
                        let entry = StepTrace {
                            step_id: step.step_id,
                            kind: step.kind,
                            attempt,
                            status: StepStatus::Completed,
                            artifacts: produced.clone(),
                            error: None,
                        };
                        self.append_trace(task, &entry)?;
                        trace.push(entry);
                        artifacts.append(&mut produced);
                        continue 'steps;
                    },
                    Err(message) => {
                        debug!(
                            task_id = %task.task_id,
                            step_id = step.step_id,
                            attempt,
                            "step failed"
                        );
                        let mut entry = failed_trace(step, attempt, &message);
                        materialize_expects(step, &mut entry.artifacts);
                        self.append_trace(task, &entry)?;
                        trace.push(entry);

                        if !task.allow_epr {
                            status = TaskStatus::Failed;
                            break 'steps;
                        }
                        let run = run_closure(
                            task,
                            step.step_id,
                            approval_grants,
                            &self.config.closure_limits,
                            &mut counters,
                            &mut closure_events,
                        );
                        self.flush(&mut closure_events)?;
                        match run {
                            Ok(run) => {
                                records.extend(run.records);
                                if run.repaired {
                                    attempt += 1;
                                    continue;
                                }
                                status = TaskStatus::Failed;
                                break 'steps;
                            },
                            Err(err) => {
                                self.terminal(task, "blocked", &fingerprint, &records)?;
                                return Err(err.into());
                            },
                        }
                    },
                }
            }
        }

        self.terminal(task, status.as_str(), &fingerprint, &records)?;
        info!(task_id = %task.task_id, status = status.as_str(), "task finished");

        Ok(TaskResult {
            task_id: task.task_id.clone(),
            status,
            artifacts,
            trace,
            admission_token: token.clone(),
            request_fingerprint: fingerprint,
            epr_report: EprReport {
                actions: records,
                net_authority_delta: 0,
                artifacts_persisted: false,
            },
            canonical_request: canonical,
        })
    }

    /// Admits, then executes, then verifies identity continuity.
    ///
    /// The admission decision is audited on every path. A denial
    /// returns `(decision, None)` without touching execution. Identity
    /// is digested before and after the run; any drift is audited and
    /// critical drift fails the call.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError`] for any execution or enforcement failure
    /// after an allowed admission.
    #[allow(clippy::too_many_arguments)]
    pub fn run_task_with_admission(
        &mut self,
        task: &Task,
        ctx: &AdmissionContext,
        admission_policy: &AdmissionPolicy,
        control_policy: &ControlPlanePolicy,
        authorization: &AuthorizationRecord,
        declared_inputs: Option<&Artifacts>,
        approval_grants: &BTreeSet<String>,
    ) -> Result<(AdmissionDecision, Option<TaskResult>), KernelError> {
        let decision = admit(task, ctx, admission_policy);
        self.audit
            .append(admission_event_payload(&decision, task, ctx))?;
        if !decision.allowed {
            info!(
                task_id = %task.task_id,
                reason = decision.reason.as_str(),
                "task admission denied"
            );
            return Ok((decision, None));
        }
        let token = mint_admission_token(
            task,
            ctx,
            admission_policy,
            authorization,
            declared_inputs,
            decision.reason,
        )?;

        let mut metadata = BTreeMap::new();
        metadata.insert("actor".to_string(), json!(ctx.actor));
        metadata.insert("node_id".to_string(), json!(ctx.node_id));
        let before = compute_system_identity_digest(
            admission_policy,
            control_policy,
            self.config.closure_limits,
            &metadata,
        )?;

        let result =
            self.execute_task(task, authorization, &token, declared_inputs, approval_grants)?;

        let after = compute_system_identity_digest(
            admission_policy,
            control_policy,
            self.config.closure_limits,
            &metadata,
        )?;
        enforce_identity_drift(&mut self.audit, &before, &after)?;

        Ok((decision, Some(result)))
    }

    fn append_trace(&mut self, task: &Task, entry: &StepTrace) -> Result<(), AuditError> {
        self.audit.append(event(task, "STEP_TRACE", |p| {
            p.insert("step_id".to_string(), json!(entry.step_id));
            p.insert("kind".to_string(), json!(entry.kind.as_str()));
            p.insert("attempt".to_string(), json!(entry.attempt));
            p.insert("status".to_string(), json!(entry.status.as_str()));
            p.insert(
                "artifacts".to_string(),
                Value::Object(entry.artifacts.clone().into_iter().collect()),
            );
            p.insert("error".to_string(), json!(entry.error));
        }))?;
        Ok(())
    }

    fn terminal(
        &mut self,
        task: &Task,
        outcome: &str,
        fingerprint: &RequestFingerprint,
        records: &[EprActionRecord],
    ) -> Result<(), AuditError> {
        self.audit.append(event(task, "TASK_OUTCOME", |p| {
            p.insert("outcome".to_string(), json!(outcome));
            p.insert(
                "request_fingerprint".to_string(),
                json!(fingerprint.as_str()),
            );
            p.insert("epr_actions_invoked".to_string(), json!(records.len()));
        }))?;
        Ok(())
    }

    fn reject(&mut self, task: &Task, gate: &str, detail: &str) -> Result<(), AuditError> {
        warn!(task_id = %task.task_id, gate, "task rejected before execution");
        self.audit.append(event(task, "TASK_REJECTED", |p| {
            p.insert("gate".to_string(), json!(gate));
            p.insert("detail".to_string(), json!(detail));
        }))?;
        Ok(())
    }

    fn flush(&mut self, events: &mut Vec<Map<String, Value>>) -> Result<(), AuditError> {
        for payload in events.drain(..) {
            self.audit.append(payload)?;
        }
        Ok(())
    }
}

fn failed_trace(step: &Step, attempt: u32, message: &str) -> StepTrace {
    StepTrace {
        step_id: step.step_id,
        kind: step.kind,
        attempt,
        status: StepStatus::Failed,
        artifacts: Artifacts::new(),
        error: Some(message.to_string()),
    }
}

fn event(task: &Task, name: &str, fill: impl FnOnce(&mut Map<String, Value>)) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("event".to_string(), json!(name));
    payload.insert("task_id".to_string(), json!(task.task_id));
    fill(&mut payload);
    payload
}
