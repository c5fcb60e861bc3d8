//! End-to-end kernel scenarios: admission through execution, repair,
//! audit verification and snapshot round-trips.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use sentientos_kernel::closure::PendingApproval;
use sentientos_kernel::control_plane::{Decision, ReasonCode};
use sentientos_kernel::task::{
    AuthorityImpact, ClosureOutcome, EprAction, ExternalEffects, NoopPayload, PrerequisiteStatus,
    Reversibility, RollbackProof, ShellPayload, UnknownPrerequisite,
};
use sentientos_kernel::{
    AdmissionContext, AdmissionPolicy, AuthorizationRecord, ClosureLimits, ControlPlanePolicy,
    Kernel, KernelConfig, KernelError, RequestType, Step, StepPayload, Task, TaskStatus,
    build_task_execution_record, load_task_execution_record, mint_admission_token,
};

fn authorization() -> AuthorizationRecord {
    AuthorizationRecord {
        request_type: RequestType::TaskExecution,
        requester_id: "operator".to_string(),
        intent_hash: "intent-digest".to_string(),
        context_hash: "context-digest".to_string(),
        policy_version: "v1".to_string(),
        decision: Decision::Allow,
        reason: ReasonCode::Ok,
        timestamp: "2026-01-01T00:00:00Z".to_string(),
        metadata: BTreeMap::new(),
    }
}

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

fn kernel_in(dir: &TempDir) -> Kernel {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Kernel::new(KernelConfig::new(dir.path(), ClosureLimits::default())).unwrap()
}

fn control_policy() -> ControlPlanePolicy {
    ControlPlanePolicy {
        policy_version: "v1".to_string(),
        request_rules: BTreeMap::new(),
    }
}

fn failing_step_task(id: &str) -> Task {
    let mut task = Task::new(
        id,
        "exercise repair",
        vec![Step::new(1, StepPayload::Noop(NoopPayload {
            note: None,
            should_fail: true,
        }))],
    );
    task.allow_epr = true;
    task
}

fn repair_action(task_id: &str, action_id: &str) -> EprAction {
    EprAction {
        action_id: action_id.to_string(),
        parent_task_id: task_id.to_string(),
        trigger_step_id: 1,
        authority_impact: AuthorityImpact::None,
        reversibility: Reversibility::Guaranteed,
        rollback_proof: RollbackProof::None,
        external_effects: ExternalEffects::No,
        privilege_escalation: false,
        description: "repair".to_string(),
        handler: Some(Arc::new(ClosureOutcome::unchanged)),
        unknown_prerequisite: None,
    }
}

#[test]
fn admitted_run_round_trips_through_a_persisted_record() {
    let dir = TempDir::new().unwrap();
    let mut kernel = kernel_in(&dir);
    let task = Task::new(
        "record-1",
        "persist me",
        vec![
            Step::new(1, StepPayload::Shell(ShellPayload {
                command: "du -sh .".to_string(),
                cwd: Some("/tmp".to_string()),
                should_fail: false,
            })),
            Step::new(2, StepPayload::Noop(NoopPayload {
                note: Some("done".to_string()),
                should_fail: false,
            })),
        ],
    );
    let auth = authorization();
    let (decision, result) = kernel
        .run_task_with_admission(
            &task,
            &ctx(),
            &AdmissionPolicy::new("v1"),
            &control_policy(),
            &auth,
            None,
            &BTreeSet::new(),
        )
        .unwrap();
    assert!(decision.allowed);
    let result = result.unwrap();
    assert_eq!(result.status, TaskStatus::Completed);

    let record = build_task_execution_record(&task, &result, &auth).unwrap();
    let reloaded = load_task_execution_record(&record.to_value()).unwrap();
    assert_eq!(reloaded.digest, record.digest);

    // The whole chain verifies after everything the run appended.
    assert!(kernel.audit().verify().unwrap() > 0);
}

#[test]
fn exhaustion_replays_identically() {
    let run_once = || {
        let dir = TempDir::new().unwrap();
        let mut kernel = kernel_in(&dir);
        let mut task = failing_step_task("exhaust-1");
        task.epr_actions = vec![repair_action("exhaust-1", "futile")];
        let token = mint_admission_token(
            &task,
            &ctx(),
            &AdmissionPolicy::new("v1"),
            &authorization(),
            None,
            sentientos_kernel::AdmissionReason::Ok,
        )
        .unwrap();
        let err = kernel
            .execute_task(&task, &authorization(), &token, None, &BTreeSet::new())
            .unwrap_err();
        let KernelError::Exhausted(exhausted) = err else {
            panic!("expected exhaustion");
        };
        let exhaustion_events = kernel
            .audit()
            .read_entries()
            .unwrap()
            .iter()
            .filter(|e| e.payload.get("event") == Some(&json!("TASK_EXHAUSTED")))
            .count();
        (exhausted, exhaustion_events)
    };

    let (first, first_events) = run_once();
    let (second, second_events) = run_once();
    assert_eq!(first, second);
    assert_eq!(first_events, 1);
    assert_eq!(second_events, 1);
}

#[test]
fn unknown_resolution_resumes_then_exhausts() {
    let dir = TempDir::new().unwrap();
    let mut kernel = kernel_in(&dir);
    let mut task = failing_step_task("unknown-1");
    let mut action = repair_action("unknown-1", "probe");
    action.unknown_prerequisite = Some(UnknownPrerequisite {
        condition: "index volume mounted".to_string(),
        reason: "mount table not visible to the kernel".to_string(),
        unblock_query: Some("is /srv/index mounted read-write?".to_string()),
        response: None,
        resolved_status: None,
    });
    task.epr_actions = vec![action];
    let token = mint_admission_token(
        &task,
        &ctx(),
        &AdmissionPolicy::new("v1"),
        &authorization(),
        None,
        sentientos_kernel::AdmissionReason::Ok,
    )
    .unwrap();

    // First generation blocks on the question instead of guessing.
    let err = kernel
        .execute_task(&task, &authorization(), &token, None, &BTreeSet::new())
        .unwrap_err();
    let KernelError::UnknownPrerequisite(blocked) = err else {
        panic!("expected an unknown prerequisite block");
    };
    assert_eq!(
        blocked.unblock_query.as_deref(),
        Some("is /srv/index mounted read-write?")
    );
    assert_eq!(blocked.assessments[0].status, PrerequisiteStatus::Unknown);

    // The operator answers; a new generation resumes from assessment.
    let mut resolved = task.clone();
    let unknown = resolved.epr_actions[0].unknown_prerequisite.as_mut().unwrap();
    unknown.response = Some("yes, mounted read-write".to_string());
    unknown.resolved_status = Some(PrerequisiteStatus::EprFixable);
    let resolved_token = mint_admission_token(
        &resolved,
        &ctx(),
        &AdmissionPolicy::new("v1"),
        &authorization(),
        None,
        sentientos_kernel::AdmissionReason::Ok,
    )
    .unwrap();
    // The handler never repairs anything, so the resumed run converges
    // on exhaustion rather than silently spinning.
    let err = kernel
        .execute_task(
            &resolved,
            &authorization(),
            &resolved_token,
            None,
            &BTreeSet::new(),
        )
        .unwrap_err();
    assert!(matches!(err, KernelError::Exhausted(_)));
    kernel.audit().verify().unwrap();
}

#[test]
fn approval_abort_then_resume_keeps_identity_stable() {
    let dir = TempDir::new().unwrap();
    let mut kernel = kernel_in(&dir);
    let mut task = failing_step_task("approve-1");
    let mut action = repair_action("approve-1", "widen");
    action.authority_impact = AuthorityImpact::Local;
    action.handler = Some(Arc::new(ClosureOutcome::changed));
    task.epr_actions = vec![action];

    let admission_policy = AdmissionPolicy::new("v1");
    let control = control_policy();
    let auth = authorization();

    let err = kernel
        .run_task_with_admission(
            &task,
            &ctx(),
            &admission_policy,
            &control,
            &auth,
            None,
            &BTreeSet::new(),
        )
        .unwrap_err();
    let KernelError::ApprovalRequired(required) = err else {
        panic!("expected approval request");
    };
    let keys: Vec<&PendingApproval> = required.pending.iter().collect();
    assert_eq!(keys[0].approval_key, "approve-1:widen");

    // Grant and resume. The repair keeps "fixing" a step that fails by
    // declaration, so the resumed run terminates in exhaustion; the
    // identity digest must stay drift-free across both runs.
    let mut grants = BTreeSet::new();
    grants.insert("approve-1:widen".to_string());
    let err = kernel
        .run_task_with_admission(
            &task,
            &ctx(),
            &admission_policy,
            &control,
            &auth,
            None,
            &grants,
        )
        .unwrap_err();
    assert!(matches!(err, KernelError::Exhausted(_)));

    let entries = kernel.audit().read_entries().unwrap();
    assert!(entries
        .iter()
        .all(|e| e.payload.get("event") != Some(&json!("IDENTITY_DRIFT"))));
    kernel.audit().verify().unwrap();
}

#[test]
fn federation_environment_does_not_perturb_results() {
    let run = || {
        let dir = TempDir::new().unwrap();
        let mut kernel = kernel_in(&dir);
        let task = Task::new(
            "fed-1",
            "stay local",
            vec![Step::new(1, StepPayload::Noop(NoopPayload {
                note: Some("local".to_string()),
                should_fail: false,
            }))],
        );
        let token = mint_admission_token(
            &task,
            &ctx(),
            &AdmissionPolicy::new("v1"),
            &authorization(),
            None,
            sentientos_kernel::AdmissionReason::Ok,
        )
        .unwrap();
        kernel
            .execute_task(&task, &authorization(), &token, None, &BTreeSet::new())
            .unwrap()
    };

    let baseline = run();
    std::env::set_var("SENTIENTOS_FEDERATION_PEERS", "peer-a,peer-b");
    std::env::set_var("SENTIENTOS_FEDERATION_ENABLED", "1");
    let with_federation_env = run();
    std::env::remove_var("SENTIENTOS_FEDERATION_PEERS");
    std::env::remove_var("SENTIENTOS_FEDERATION_ENABLED");

    assert_eq!(baseline, with_federation_env);
    assert_eq!(
        baseline.request_fingerprint,
        with_federation_env.request_fingerprint
    );
}

#[test]
fn allow_epr_false_fails_without_entering_closure() {
    let dir = TempDir::new().unwrap();
    let mut kernel = kernel_in(&dir);
    let mut task = failing_step_task("no-epr-1");
    task.allow_epr = false;
    task.epr_actions = vec![repair_action("no-epr-1", "never-runs")];
    let token = mint_admission_token(
        &task,
        &ctx(),
        &AdmissionPolicy::new("v1"),
        &authorization(),
        None,
        sentientos_kernel::AdmissionReason::Ok,
    )
    .unwrap();
    let result = kernel
        .execute_task(&task, &authorization(), &token, None, &BTreeSet::new())
        .unwrap();
    assert_eq!(result.status, TaskStatus::Failed);
    assert!(result.epr_report.actions.is_empty());
    let entries = kernel.audit().read_entries().unwrap();
    assert!(entries
        .iter()
        .all(|e| e.payload.get("event") != Some(&json!("EPR_ACTION_INVOKED"))));
}
