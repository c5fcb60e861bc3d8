//! System identity digest and drift classification.
//!
//! The identity digest is a hex SHA-256 over a normalized description of
//! everything that governs behaviour: admission policy, control-plane
//! allowlists, closure rules and limits, the privilege surface and the
//! task lifecycle tables. The engine computes it before and after every
//! admitted run; an unexplained change between the two is drift.
//!
//! Metadata rides inside the digest but is stripped before the semantic
//! comparison. Two snapshots with different digests whose stripped
//! components are equal therefore classify as benign (metadata-only),
//! while any difference in the stripped components is critical and
//! aborts the run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::admission::AdmissionPolicy;
use crate::audit::{AuditChain, AuditError};
use crate::canonical::{RequestCanonicalizationError, canonical_json_bytes, normalise_value};
use crate::config::ClosureLimits;
use crate::control_plane::ControlPlanePolicy;
use crate::crypto::sha256_hex;

/// Closure rules hashed into the execution component. Fixed at compile
/// time; any change is a different kernel.
const EPR_RULES: &[&str] = &[
    "external_effects:forbidden",
    "privilege_escalation:forbidden",
    "bounded_reversibility:rollback_proof_required",
    "irreversible_repair:authority_required",
    "unknown_prerequisite:no_guessing",
    "authority_required:explicit_grant",
    "artifact_persistence:forbidden",
];

/// Task lifecycle statuses hashed into the lifecycle component.
const LIFECYCLE_STATUSES: &[&str] = &[
    "admitted",
    "running",
    "completed",
    "failed",
    "approval_required",
    "blocked_unknown",
    "exhausted",
];

/// Allowed lifecycle transitions, `from:to`.
const LIFECYCLE_TRANSITIONS: &[&str] = &[
    "admitted:running",
    "running:completed",
    "running:failed",
    "running:approval_required",
    "running:blocked_unknown",
    "running:exhausted",
];

/// One identity observation: the digest plus the component tree it was
/// computed over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySnapshot {
    /// Hex SHA-256 of the compact sorted component tree.
    pub digest: String,
    /// The component tree itself.
    pub components: Value,
}

/// How an observed identity change classifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftClassification {
    /// Digests are equal.
    None,
    /// Digests differ but only metadata changed.
    Benign,
    /// The governed surface itself changed.
    Critical,
}

impl DriftClassification {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Benign => "benign",
            Self::Critical => "critical",
        }
    }
}

/// Outcome of comparing two identity snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityDriftReport {
    /// Severity of the change.
    pub classification: DriftClassification,
    /// Dotted paths of differing components, sorted.
    pub changes: Vec<String>,
    /// Digest before.
    pub pre_digest: String,
    /// Digest after.
    pub post_digest: String,
}

/// The governed surface changed during a run.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("critical identity drift: {}", report.changes.join(", "))]
pub struct IdentityDriftError {
    /// The critical report.
    pub report: IdentityDriftReport,
}

/// Failure modes of drift enforcement.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IdentityError {
    /// The drift report could not be audited.
    #[error(transparent)]
    Audit(#[from] AuditError),

    /// See [`IdentityDriftError`].
    #[error(transparent)]
    Critical(#[from] IdentityDriftError),
}

/// Computes the identity snapshot for the given governed surface.
///
/// # Errors
///
/// Returns [`RequestCanonicalizationError`] when metadata contains a
/// non-integer number.
pub fn compute_system_identity_digest(
    admission_policy: &AdmissionPolicy,
    control_policy: &ControlPlanePolicy,
    closure_limits: ClosureLimits,
    metadata: &BTreeMap<String, Value>,
) -> Result<IdentitySnapshot, RequestCanonicalizationError> {
    let mut normalized_metadata = Map::new();
    for (key, value) in metadata {
        normalized_metadata.insert(
            key.clone(),
            normalise_value(value, true, &format!("metadata.{key}"))?,
        );
    }

    let allowed_kinds: Vec<&str> = admission_policy
        .allowed_step_kinds
        .iter()
        .map(|kind| kind.as_str())
        .collect();

    let components = json!({
        "governance": {
            "admission": serde_json::to_value(admission_policy).unwrap_or(Value::Null),
            "authorization": control_policy.describe(),
            "closure_rules": EPR_RULES,
        },
        "execution": {
            "epr_rules": EPR_RULES,
            "limits": {
                "max_closure_iterations": closure_limits.max_closure_iterations,
                "max_epr_actions_per_task": closure_limits.max_epr_actions_per_task,
                "max_unknown_resolution_cycles": closure_limits.max_unknown_resolution_cycles,
            },
        },
        "privilege_surface": {
            "allowed_step_kinds": allowed_kinds,
            "control_plane": control_policy.describe(),
        },
        "task_lifecycle": {
            "statuses": LIFECYCLE_STATUSES,
            "transitions": LIFECYCLE_TRANSITIONS,
        },
        "metadata": Value::Object(normalized_metadata),
    });

    let digest = sha256_hex(&canonical_json_bytes(&components));
    Ok(IdentitySnapshot { digest, components })
}

/// Compares two snapshots and classifies the difference.
#[must_use]
pub fn classify_identity_drift(
    before: &IdentitySnapshot,
    after: &IdentitySnapshot,
) -> IdentityDriftReport {
    if before.digest == after.digest {
        return IdentityDriftReport {
            classification: DriftClassification::None,
            changes: Vec::new(),
            pre_digest: before.digest.clone(),
            post_digest: after.digest.clone(),
        };
    }

    let mut changes = Vec::new();
    diff_paths(&before.components, &after.components, "", &mut changes);
    changes.sort();

    let semantic_changes: Vec<String> = changes
        .iter()
        .filter(|path| *path != "metadata" && !path.starts_with("metadata."))
        .cloned()
        .collect();

    let classification = if semantic_changes.is_empty() {
        DriftClassification::Benign
    } else {
        DriftClassification::Critical
    };
    IdentityDriftReport {
        classification,
        changes,
        pre_digest: before.digest.clone(),
        post_digest: after.digest.clone(),
    }
}

/// Classifies drift, audits any non-none report, and aborts on critical.
///
/// # Errors
///
/// Returns [`IdentityError`] when the report cannot be appended or the
/// drift is critical.
pub fn enforce_identity_drift(
    chain: &mut AuditChain,
    before: &IdentitySnapshot,
    after: &IdentitySnapshot,
) -> Result<IdentityDriftReport, IdentityError> {
    let report = classify_identity_drift(before, after);
    if report.classification != DriftClassification::None {
        let mut payload = Map::new();
        payload.insert("event".to_string(), json!("IDENTITY_DRIFT"));
        payload.insert(
            "classification".to_string(),
            json!(report.classification.as_str()),
        );
        payload.insert("changes".to_string(), json!(report.changes));
        payload.insert("pre_digest".to_string(), json!(report.pre_digest));
        payload.insert("post_digest".to_string(), json!(report.post_digest));
        chain.append(payload)?;
    }
    if report.classification == DriftClassification::Critical {
        return Err(IdentityDriftError { report }.into());
    }
    Ok(report)
}

fn diff_paths(before: &Value, after: &Value, path: &str, out: &mut Vec<String>) {
    match (before, after) {
        (Value::Object(a), Value::Object(b)) => {
            let keys: std::collections::BTreeSet<&String> = a.keys().chain(b.keys()).collect();
            for key in keys {
                let child = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                match (a.get(key), b.get(key)) {
                    (Some(left), Some(right)) => diff_paths(left, right, &child, out),
                    _ => out.push(child),
                }
            }
        },
        _ => {
            if before != after {
                out.push(path.to_string());
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::control_plane::{RequestRule, RequestType};

    fn control_policy() -> ControlPlanePolicy {
        let mut rules = BTreeMap::new();
        rules.insert(RequestType::TaskExecution, RequestRule {
            allowed_requesters: vec!["operator".to_string()],
            allowed_contexts: vec!["node-1".to_string()],
        });
        ControlPlanePolicy {
            policy_version: "v1".to_string(),
            request_rules: rules,
        }
    }

    fn snapshot(metadata: &BTreeMap<String, Value>) -> IdentitySnapshot {
        compute_system_identity_digest(
            &AdmissionPolicy::new("v1"),
            &control_policy(),
            ClosureLimits::default(),
            metadata,
        )
        .unwrap()
    }

    #[test]
    fn digest_is_stable_across_recomputation() {
        let metadata = BTreeMap::new();
        assert_eq!(snapshot(&metadata).digest, snapshot(&metadata).digest);
    }

    #[test]
    fn equal_snapshots_classify_as_none() {
        let metadata = BTreeMap::new();
        let before = snapshot(&metadata);
        let after = snapshot(&metadata);
        let report = classify_identity_drift(&before, &after);
        assert_eq!(report.classification, DriftClassification::None);
        assert!(report.changes.is_empty());
    }

    #[test]
    fn metadata_only_change_is_benign() {
        let before = snapshot(&BTreeMap::new());
        let mut metadata = BTreeMap::new();
        metadata.insert("host".to_string(), json!("node-2"));
        let after = snapshot(&metadata);
        assert_ne!(before.digest, after.digest);
        let report = classify_identity_drift(&before, &after);
        assert_eq!(report.classification, DriftClassification::Benign);
        assert!(report.changes.iter().all(|c| c.starts_with("metadata")));
    }

    #[test]
    fn policy_change_is_critical() {
        let before = snapshot(&BTreeMap::new());
        let mut policy = AdmissionPolicy::new("v1");
        policy.max_steps = 1;
        let after = compute_system_identity_digest(
            &policy,
            &control_policy(),
            ClosureLimits::default(),
            &BTreeMap::new(),
        )
        .unwrap();
        let report = classify_identity_drift(&before, &after);
        assert_eq!(report.classification, DriftClassification::Critical);
        assert!(report
            .changes
            .iter()
            .any(|c| c.starts_with("governance.admission")));
    }

    #[test]
    fn closure_limit_change_is_critical() {
        let before = snapshot(&BTreeMap::new());
        let after = compute_system_identity_digest(
            &AdmissionPolicy::new("v1"),
            &control_policy(),
            ClosureLimits {
                max_closure_iterations: 1,
                ..ClosureLimits::default()
            },
            &BTreeMap::new(),
        )
        .unwrap();
        let report = classify_identity_drift(&before, &after);
        assert_eq!(report.classification, DriftClassification::Critical);
    }

    #[test]
    fn metadata_floats_are_rejected() {
        let mut metadata = BTreeMap::new();
        metadata.insert("load".to_string(), json!(0.5));
        let result = compute_system_identity_digest(
            &AdmissionPolicy::new("v1"),
            &control_policy(),
            ClosureLimits::default(),
            &metadata,
        );
        assert!(result.is_err());
    }

    #[test]
    fn enforce_audits_benign_and_aborts_critical() {
        let dir = TempDir::new().unwrap();
        let mut chain = AuditChain::open(dir.path().join("audit.jsonl")).unwrap();

        let before = snapshot(&BTreeMap::new());
        let mut metadata = BTreeMap::new();
        metadata.insert("host".to_string(), json!("elsewhere"));
        let benign = snapshot(&metadata);
        let report = enforce_identity_drift(&mut chain, &before, &benign).unwrap();
        assert_eq!(report.classification, DriftClassification::Benign);

        let mut policy = AdmissionPolicy::new("v2");
        policy.allow_mesh = true;
        let critical = compute_system_identity_digest(
            &policy,
            &control_policy(),
            ClosureLimits::default(),
            &BTreeMap::new(),
        )
        .unwrap();
        let err = enforce_identity_drift(&mut chain, &before, &critical).unwrap_err();
        assert!(matches!(err, IdentityError::Critical(_)));

        let entries = chain.read_entries().unwrap();
        let drift_events = entries
            .iter()
            .filter(|e| e.payload.get("event") == Some(&json!("IDENTITY_DRIFT")))
            .count();
        assert_eq!(drift_events, 2);
    }
}
