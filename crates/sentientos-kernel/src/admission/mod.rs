//! Admission control: the pre-execution gate.
//!
//! [`admit`] deterministically evaluates a static policy against a task
//! and returns an allow/deny decision before anything runs. It performs
//! no execution, no retries, and has no side effects; the caller logs
//! the decision. Rules are checked in fixed precedence order and the
//! first failing rule supplies the reason code, while constraint counts
//! are always reported regardless of outcome.
//!
//! On allow, an [`AdmissionToken`] is minted, binding authority
//! provenance and the exact request fingerprint. Execution later
//! recomputes the fingerprint from the live inputs and refuses to run on
//! any divergence, which is what makes admission unbypassable: there is
//! no execution path that does not present a token.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::canonical::{
    RequestCanonicalizationError, RequestFingerprint, canonicalise_task_request,
    request_fingerprint_from_canonical,
};
use crate::control_plane::{AuthorizationError, AuthorizationRecord};
use crate::crypto::is_hex_digest;
use crate::task::{Artifacts, StepKind, StepPayload, Task};

/// Issuer stamped into every admission token.
pub const TOKEN_ISSUER: &str = "task_admission";

// =============================================================================
// Provenance and tokens
// =============================================================================

/// Why an admission token may be used: the recorded source, scope,
/// context and reason of the authority that admitted the task. Minted
/// once per admission and bound into the request fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityProvenance {
    /// Actor whose authority admitted the task.
    pub authority_source: String,
    /// Scope of that authority, e.g. `policy:<version>`.
    pub authority_scope: String,
    /// Context (node) the authority applies to.
    pub authority_context_id: String,
    /// Reason the authority was exercised.
    pub authority_reason: String,
}

impl AuthorityProvenance {
    /// Checks that every field is non-blank.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorizationError::InvalidProvenance`] naming the
    /// first blank field.
    pub fn validate(&self) -> Result<(), AuthorizationError> {
        let fields = [
            ("authority_source", &self.authority_source),
            ("authority_scope", &self.authority_scope),
            ("authority_context_id", &self.authority_context_id),
            ("authority_reason", &self.authority_reason),
        ];
        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(AuthorizationError::InvalidProvenance {
                    field: name.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Proof that admission ran for exactly one request.
///
/// Conceptually single-use: execution recomputes the fingerprint from
/// the live inputs and compares it bit-for-bit against this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionToken {
    /// Task the token admits.
    pub task_id: String,
    /// Authority provenance minted at admission.
    pub provenance: AuthorityProvenance,
    /// Fingerprint of the admitted request.
    pub request_fingerprint: RequestFingerprint,
    /// Issuer; always [`TOKEN_ISSUER`] for kernel-minted tokens.
    pub issued_by: String,
}

impl AdmissionToken {
    /// Validates the token against the task it claims to admit.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorizationError`] on task-id mismatch, foreign
    /// issuer, blank provenance, or a malformed fingerprint.
    pub fn validate_for(&self, task: &Task) -> Result<(), AuthorizationError> {
        if self.task_id != task.task_id {
            return Err(AuthorizationError::TokenTaskMismatch);
        }
        if self.issued_by != TOKEN_ISSUER {
            return Err(AuthorizationError::TokenIssuerInvalid);
        }
        self.provenance.validate()?;
        if !is_hex_digest(self.request_fingerprint.as_str()) {
            return Err(AuthorizationError::TokenFingerprintInvalid);
        }
        Ok(())
    }
}

// =============================================================================
// Policy and context
// =============================================================================

/// Static admission policy. Part of the governance surface hashed by the
/// identity digest; changing any field here is critical drift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionPolicy {
    /// Version string reported with every decision.
    pub policy_version: String,
    /// Ceiling on total steps.
    pub max_steps: u32,
    /// Ceiling on shell steps.
    pub max_shell_steps: u32,
    /// Ceiling on python steps.
    pub max_python_steps: u32,
    /// Whether mesh steps are admitted at all.
    pub allow_mesh: bool,
    /// Step kinds the policy admits.
    pub allowed_step_kinds: BTreeSet<StepKind>,
    /// Whether shell steps are banned in autonomous mode.
    pub deny_shell_in_autonomous: bool,
    /// Whether the vow digest gate is enforced.
    pub require_vow_digest_match: bool,
    /// Expected vow digest when the gate is enforced.
    pub expected_vow_digest: Option<String>,
    /// Whether the doctrine digest gate is enforced.
    pub require_doctrine_digest_match: bool,
    /// Expected doctrine digest when the gate is enforced.
    pub expected_doctrine_digest: Option<String>,
}

impl AdmissionPolicy {
    /// Builds the default policy for a version: noop, shell, python and
    /// adapter steps admitted, mesh gated off, shell banned in
    /// autonomous mode, digest gates off.
    #[must_use]
    pub fn new(policy_version: impl Into<String>) -> Self {
        let mut allowed_step_kinds = BTreeSet::new();
        allowed_step_kinds.insert(StepKind::Noop);
        allowed_step_kinds.insert(StepKind::Shell);
        allowed_step_kinds.insert(StepKind::Python);
        allowed_step_kinds.insert(StepKind::Adapter);
        Self {
            policy_version: policy_version.into(),
            max_steps: 64,
            max_shell_steps: 8,
            max_python_steps: 16,
            allow_mesh: false,
            allowed_step_kinds,
            deny_shell_in_autonomous: true,
            require_vow_digest_match: false,
            expected_vow_digest: None,
            require_doctrine_digest_match: false,
            expected_doctrine_digest: None,
        }
    }

    /// Enables mesh steps, adding mesh to the allowlist.
    #[must_use]
    pub fn with_mesh(mut self) -> Self {
        self.allow_mesh = true;
        self.allowed_step_kinds.insert(StepKind::Mesh);
        self
    }
}

/// Caller-supplied context admission evaluates against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionContext {
    /// Acting identity.
    pub actor: String,
    /// Operating mode, e.g. `manual` or `autonomous`.
    pub mode: String,
    /// Node the task would run on.
    pub node_id: String,
    /// Current vow digest, if known.
    pub vow_digest: Option<String>,
    /// Current doctrine digest, if known.
    pub doctrine_digest: Option<String>,
    /// Wall-clock at evaluation, informational only.
    pub now_utc_iso: Option<String>,
    /// Explicitly owner-controlled local mode. Skips the vow/doctrine
    /// digest gates; every other rule still applies.
    pub local_owner: bool,
}

// =============================================================================
// Decisions
// =============================================================================

/// Reason codes for admission decisions, in the fixed precedence order
/// they are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdmissionReason {
    /// Admitted.
    Ok,
    /// Vow digest required but absent from the context.
    MissingVowDigest,
    /// Vow gate enforced but the policy has no expected digest.
    ExpectedVowDigestUnset,
    /// Context vow digest differs from the expected one.
    VowDigestMismatch,
    /// Doctrine digest required but absent from the context.
    MissingDoctrineDigest,
    /// Doctrine gate enforced but the policy has no expected digest.
    ExpectedDoctrineDigestUnset,
    /// Context doctrine digest differs from the expected one.
    DoctrineDigestMismatch,
    /// Mesh steps present while mesh is disabled.
    MeshDisabled,
    /// A step kind is outside the allowlist.
    DeniedStepKind,
    /// Shell steps present in autonomous mode.
    ShellDeniedInAutonomous,
    /// Total step ceiling exceeded.
    TooManySteps,
    /// Shell step ceiling exceeded.
    TooManyShellSteps,
    /// Python step ceiling exceeded.
    TooManyPythonSteps,
}

impl AdmissionReason {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::MissingVowDigest => "MISSING_VOW_DIGEST",
            Self::ExpectedVowDigestUnset => "EXPECTED_VOW_DIGEST_UNSET",
            Self::VowDigestMismatch => "VOW_DIGEST_MISMATCH",
            Self::MissingDoctrineDigest => "MISSING_DOCTRINE_DIGEST",
            Self::ExpectedDoctrineDigestUnset => "EXPECTED_DOCTRINE_DIGEST_UNSET",
            Self::DoctrineDigestMismatch => "DOCTRINE_DIGEST_MISMATCH",
            Self::MeshDisabled => "MESH_DISABLED",
            Self::DeniedStepKind => "DENIED_STEP_KIND",
            Self::ShellDeniedInAutonomous => "SHELL_DENIED_IN_AUTONOMOUS",
            Self::TooManySteps => "TOO_MANY_STEPS",
            Self::TooManyShellSteps => "TOO_MANY_SHELL_STEPS",
            Self::TooManyPythonSteps => "TOO_MANY_PYTHON_STEPS",
        }
    }
}

/// Observed task shape, reported with every decision regardless of
/// outcome.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskConstraints {
    /// Total steps.
    pub step_count: u32,
    /// Shell steps.
    pub shell_count: u32,
    /// Python steps.
    pub python_count: u32,
    /// Mesh steps.
    pub mesh_count: u32,
    /// Adapter steps.
    pub adapter_count: u32,
    /// Kinds present but outside the allowlist, in first-seen order.
    pub denied_kinds: Vec<StepKind>,
}

impl TaskConstraints {
    /// Audit payload form.
    #[must_use]
    pub fn to_value(&self) -> Value {
        json!({
            "step_count": self.step_count,
            "shell_count": self.shell_count,
            "python_count": self.python_count,
            "mesh_count": self.mesh_count,
            "adapter_count": self.adapter_count,
            "denied_kinds": self.denied_kinds.iter().map(|k| k.as_str()).collect::<Vec<_>>(),
        })
    }
}

/// Shell commands surfaced for masking in logs, never executed here.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Redactions {
    /// Shell command lines found in the task.
    pub shell_commands: Vec<String>,
}

/// The admission decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionDecision {
    /// Whether the task may run.
    pub allowed: bool,
    /// First failing rule, or OK.
    pub reason: AdmissionReason,
    /// Policy version the decision was made under.
    pub policy_version: String,
    /// Observed task shape.
    pub constraints: TaskConstraints,
    /// Material to mask in downstream logs, when any exists.
    pub redactions: Option<Redactions>,
}

impl AdmissionDecision {
    fn deny(
        reason: AdmissionReason,
        policy: &AdmissionPolicy,
        constraints: TaskConstraints,
        redactions: Option<Redactions>,
    ) -> Self {
        Self {
            allowed: false,
            reason,
            policy_version: policy.policy_version.clone(),
            constraints,
            redactions,
        }
    }
}

/// Deterministically gates a task without side effects beyond returning
/// a decision.
#[must_use]
pub fn admit(task: &Task, ctx: &AdmissionContext, policy: &AdmissionPolicy) -> AdmissionDecision {
    let mut constraints = TaskConstraints::default();
    let mut shell_commands = Vec::new();

    for step in &task.steps {
        constraints.step_count += 1;
        match &step.payload {
            StepPayload::Shell(shell) => {
                constraints.shell_count += 1;
                shell_commands.push(shell.command.clone());
            },
            StepPayload::Python(_) => constraints.python_count += 1,
            StepPayload::Mesh(_) => constraints.mesh_count += 1,
            StepPayload::Adapter(_) => constraints.adapter_count += 1,
            StepPayload::Noop(_) => {},
        }
        if !policy.allowed_step_kinds.contains(&step.kind)
            && !constraints.denied_kinds.contains(&step.kind)
        {
            constraints.denied_kinds.push(step.kind);
        }
    }

    let redactions = if shell_commands.is_empty() {
        None
    } else {
        Some(Redactions { shell_commands })
    };

    // Owner-controlled local mode skips the semantic digest gates only.
    let enforce_vow = policy.require_vow_digest_match && !ctx.local_owner;
    let enforce_doctrine = policy.require_doctrine_digest_match && !ctx.local_owner;

    if enforce_vow {
        match (&ctx.vow_digest, &policy.expected_vow_digest) {
            (None, _) => {
                return AdmissionDecision::deny(
                    AdmissionReason::MissingVowDigest,
                    policy,
                    constraints,
                    redactions,
                );
            },
            (Some(_), None) => {
                return AdmissionDecision::deny(
                    AdmissionReason::ExpectedVowDigestUnset,
                    policy,
                    constraints,
                    redactions,
                );
            },
            (Some(actual), Some(expected)) if actual != expected => {
                return AdmissionDecision::deny(
                    AdmissionReason::VowDigestMismatch,
                    policy,
                    constraints,
                    redactions,
                );
            },
            _ => {},
        }
    }

    if enforce_doctrine {
        match (&ctx.doctrine_digest, &policy.expected_doctrine_digest) {
            (None, _) => {
                return AdmissionDecision::deny(
                    AdmissionReason::MissingDoctrineDigest,
                    policy,
                    constraints,
                    redactions,
                );
            },
            (Some(_), None) => {
                return AdmissionDecision::deny(
                    AdmissionReason::ExpectedDoctrineDigestUnset,
                    policy,
                    constraints,
                    redactions,
                );
            },
            (Some(actual), Some(expected)) if actual != expected => {
                return AdmissionDecision::deny(
                    AdmissionReason::DoctrineDigestMismatch,
                    policy,
                    constraints,
                    redactions,
                );
            },
            _ => {},
        }
    }

    if constraints.mesh_count > 0 && !policy.allow_mesh {
        return AdmissionDecision::deny(
            AdmissionReason::MeshDisabled,
            policy,
            constraints,
            redactions,
        );
    }

    if !constraints.denied_kinds.is_empty() {
        return AdmissionDecision::deny(
            AdmissionReason::DeniedStepKind,
            policy,
            constraints,
            redactions,
        );
    }

    if policy.deny_shell_in_autonomous && ctx.mode == "autonomous" && constraints.shell_count > 0 {
        return AdmissionDecision::deny(
            AdmissionReason::ShellDeniedInAutonomous,
            policy,
            constraints,
            redactions,
        );
    }

    if constraints.step_count > policy.max_steps {
        return AdmissionDecision::deny(
            AdmissionReason::TooManySteps,
            policy,
            constraints,
            redactions,
        );
    }

    if constraints.shell_count > policy.max_shell_steps {
        return AdmissionDecision::deny(
            AdmissionReason::TooManyShellSteps,
            policy,
            constraints,
            redactions,
        );
    }

    if constraints.python_count > policy.max_python_steps {
        return AdmissionDecision::deny(
            AdmissionReason::TooManyPythonSteps,
            policy,
            constraints,
            redactions,
        );
    }

    AdmissionDecision {
        allowed: true,
        reason: AdmissionReason::Ok,
        policy_version: policy.policy_version.clone(),
        constraints,
        redactions,
    }
}

/// Mints the admission token for an allowed request: provenance built
/// from the admitting context and policy, fingerprint computed over the
/// exact live request.
///
/// # Errors
///
/// Returns [`RequestCanonicalizationError`] when the request cannot be
/// canonicalized.
pub fn mint_admission_token(
    task: &Task,
    ctx: &AdmissionContext,
    policy: &AdmissionPolicy,
    authorization: &AuthorizationRecord,
    declared_inputs: Option<&Artifacts>,
    reason: AdmissionReason,
) -> Result<AdmissionToken, RequestCanonicalizationError> {
    let provenance = AuthorityProvenance {
        authority_source: ctx.actor.clone(),
        authority_scope: format!("policy:{}", policy.policy_version),
        authority_context_id: ctx.node_id.clone(),
        authority_reason: reason.as_str().to_string(),
    };
    let canonical = canonicalise_task_request(task, authorization, &provenance, declared_inputs)?;
    let fingerprint = request_fingerprint_from_canonical(&canonical);
    Ok(AdmissionToken {
        task_id: task.task_id.clone(),
        provenance,
        request_fingerprint: fingerprint,
        issued_by: TOKEN_ISSUER.to_string(),
    })
}

/// Audit payload describing an admission decision.
#[must_use]
pub fn admission_event_payload(
    decision: &AdmissionDecision,
    task: &Task,
    ctx: &AdmissionContext,
) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert(
        "event".to_string(),
        json!(if decision.allowed {
            "TASK_ADMITTED"
        } else {
            "TASK_ADMISSION_DENIED"
        }),
    );
    payload.insert("task_id".to_string(), json!(task.task_id));
    payload.insert(
        "policy_version".to_string(),
        json!(decision.policy_version),
    );
    payload.insert("allowed".to_string(), json!(decision.allowed));
    payload.insert("reason".to_string(), json!(decision.reason.as_str()));
    payload.insert(
        "constraints".to_string(),
        decision.constraints.to_value(),
    );
    payload.insert("actor".to_string(), json!(ctx.actor));
    payload.insert("mode".to_string(), json!(ctx.mode));
    payload.insert("node_id".to_string(), json!(ctx.node_id));
    payload.insert(
        "has_vow_digest".to_string(),
        json!(ctx.vow_digest.is_some()),
    );
    payload.insert(
        "has_doctrine_digest".to_string(),
        json!(ctx.doctrine_digest.is_some()),
    );
    if let Some(now) = &ctx.now_utc_iso {
        payload.insert("now_utc_iso".to_string(), json!(now));
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{MeshPayload, NoopPayload, ShellPayload, Step};

    fn ctx() -> AdmissionContext {
        AdmissionContext {
            actor: "operator".to_string(),
            mode: "manual".to_string(),
            node_id: "node-1".to_string(),
            vow_digest: None,
            doctrine_digest: None,
            now_utc_iso: None,
            local_owner: false,
        }
    }

    fn noop_steps(count: u64) -> Vec<Step> {
        (1..=count)
            .map(|id| Step::new(id, StepPayload::Noop(NoopPayload::default())))
            .collect()
    }

    fn shell_step(id: u64, command: &str) -> Step {
        Step::new(id, StepPayload::Shell(ShellPayload {
            command: command.to_string(),
            cwd: None,
            should_fail: false,
        }))
    }

    #[test]
    fn noop_task_is_admitted() {
        let task = Task::new("t", "obj", noop_steps(3));
        let decision = admit(&task, &ctx(), &AdmissionPolicy::new("v1"));
        assert!(decision.allowed);
        assert_eq!(decision.reason, AdmissionReason::Ok);
        assert_eq!(decision.constraints.step_count, 3);
        assert!(decision.redactions.is_none());
    }

    #[test]
    fn mesh_denied_when_disabled() {
        let task = Task::new(
            "t",
            "obj",
            vec![Step::new(1, StepPayload::Mesh(MeshPayload {
                job: "index".to_string(),
                parameters: Artifacts::new(),
                should_fail: false,
            }))],
        );
        let decision = admit(&task, &ctx(), &AdmissionPolicy::new("v1"));
        assert!(!decision.allowed);
        assert_eq!(decision.reason, AdmissionReason::MeshDisabled);
        assert_eq!(decision.constraints.mesh_count, 1);
    }

    #[test]
    fn mesh_admitted_when_enabled() {
        let task = Task::new(
            "t",
            "obj",
            vec![Step::new(1, StepPayload::Mesh(MeshPayload {
                job: "index".to_string(),
                parameters: Artifacts::new(),
                should_fail: false,
            }))],
        );
        let decision = admit(&task, &ctx(), &AdmissionPolicy::new("v1").with_mesh());
        assert!(decision.allowed);
    }

    #[test]
    fn shell_banned_in_autonomous_mode() {
        let task = Task::new("t", "obj", vec![shell_step(1, "echo hi")]);
        let mut context = ctx();
        context.mode = "autonomous".to_string();
        let decision = admit(&task, &context, &AdmissionPolicy::new("v1"));
        assert!(!decision.allowed);
        assert_eq!(decision.reason, AdmissionReason::ShellDeniedInAutonomous);
    }

    #[test]
    fn shell_commands_surface_as_redactions() {
        let task = Task::new("t", "obj", vec![shell_step(1, "cat /etc/hostname")]);
        let decision = admit(&task, &ctx(), &AdmissionPolicy::new("v1"));
        assert!(decision.allowed);
        let redactions = decision.redactions.unwrap();
        assert_eq!(redactions.shell_commands, ["cat /etc/hostname"]);
    }

    #[test]
    fn step_ceiling_enforced() {
        let mut policy = AdmissionPolicy::new("v1");
        policy.max_steps = 2;
        let task = Task::new("t", "obj", noop_steps(3));
        let decision = admit(&task, &ctx(), &policy);
        assert_eq!(decision.reason, AdmissionReason::TooManySteps);
    }

    #[test]
    fn vow_gate_precedes_other_rules() {
        let mut policy = AdmissionPolicy::new("v1");
        policy.require_vow_digest_match = true;
        policy.max_steps = 0;
        let task = Task::new("t", "obj", noop_steps(1));
        let decision = admit(&task, &ctx(), &policy);
        assert_eq!(decision.reason, AdmissionReason::MissingVowDigest);
    }

    #[test]
    fn local_owner_skips_digest_gates_only() {
        let mut policy = AdmissionPolicy::new("v1");
        policy.require_vow_digest_match = true;
        let mut context = ctx();
        context.local_owner = true;
        let task = Task::new("t", "obj", noop_steps(1));
        assert!(admit(&task, &context, &policy).allowed);

        // Non-digest rules still apply in owner mode.
        context.mode = "autonomous".to_string();
        let shell_task = Task::new("t", "obj", vec![shell_step(1, "echo hi")]);
        let decision = admit(&shell_task, &context, &policy);
        assert_eq!(decision.reason, AdmissionReason::ShellDeniedInAutonomous);
    }

    #[test]
    fn vow_digest_mismatch_detected() {
        let mut policy = AdmissionPolicy::new("v1");
        policy.require_vow_digest_match = true;
        policy.expected_vow_digest = Some("abc".to_string());
        let mut context = ctx();
        context.vow_digest = Some("def".to_string());
        let task = Task::new("t", "obj", noop_steps(1));
        let decision = admit(&task, &context, &policy);
        assert_eq!(decision.reason, AdmissionReason::VowDigestMismatch);
    }

    #[test]
    fn token_validation_rejects_blank_provenance() {
        let token = AdmissionToken {
            task_id: "t".to_string(),
            provenance: AuthorityProvenance {
                authority_source: String::new(),
                authority_scope: "policy:v1".to_string(),
                authority_context_id: "node".to_string(),
                authority_reason: "OK".to_string(),
            },
            request_fingerprint: RequestFingerprint::from_hex("a".repeat(64)),
            issued_by: TOKEN_ISSUER.to_string(),
        };
        let task = Task::new("t", "obj", vec![]);
        assert!(matches!(
            token.validate_for(&task),
            Err(AuthorizationError::InvalidProvenance { .. })
        ));
    }

    #[test]
    fn token_validation_rejects_short_fingerprint() {
        let token = AdmissionToken {
            task_id: "t".to_string(),
            provenance: AuthorityProvenance {
                authority_source: "operator".to_string(),
                authority_scope: "policy:v1".to_string(),
                authority_context_id: "node".to_string(),
                authority_reason: "OK".to_string(),
            },
            request_fingerprint: RequestFingerprint::from_hex("abc".to_string()),
            issued_by: TOKEN_ISSUER.to_string(),
        };
        let task = Task::new("t", "obj", vec![]);
        assert!(matches!(
            token.validate_for(&task),
            Err(AuthorizationError::TokenFingerprintInvalid)
        ));
    }
}
