//! Request canonicalization and fingerprinting.
//!
//! A task request, meaning the `(task, authorization, provenance,
//! declared_inputs)` tuple, is serialized into a canonical JSON tree:
//! object keys sorted, set-like fields normalized to sorted sequences,
//! trailing whitespace stripped from free text, authorization timestamp
//! and metadata excluded. The request fingerprint is the hex SHA-256 of
//! the compact serialization of that tree.
//!
//! Canonicalization is a hard correctness property, not an optimization:
//! identical semantic inputs must produce bit-identical canonical bytes,
//! so that admission and execution can compare fingerprints and so that
//! replays are provably equivalent. Two consequences follow:
//!
//! - Reordering `task.constraints` or declared-input keys cannot change
//!   the fingerprint.
//! - A request cannot smuggle outcome-reframing fields: keys that look
//!   like optimization feedback (`reward`, `score`, ...) are rejected
//!   outright, and authorization metadata never enters the canonical
//!   form at all.
//!
//! Numbers are integer-only, matching the strict canonical-JSON profile;
//! floats are rejected rather than trusted to round-trip.

use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::admission::AuthorityProvenance;
use crate::control_plane::{AuthorizationError, AuthorizationRecord};
use crate::crypto::{DIGEST_HEX_LEN, sha256_hex};
use crate::task::{Artifacts, EprAction, Step, StepPayload, Task, UnknownPrerequisite};

/// Key tokens that could let an outcome be retroactively reframed as a
/// training signal. Any map key containing one of these (case-insensitive)
/// is rejected during canonicalization.
pub const FORBIDDEN_KEY_TOKENS: &[&str] = &[
    "reward", "utility", "score", "bias", "emotion", "trust", "gradient",
];

/// Errors raised when a task request cannot be normalized into canonical
/// form. All of them abort before any execution.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RequestCanonicalizationError {
    /// A map key matched a forbidden token.
    #[error("request contains forbidden field '{key}' at {path}")]
    ForbiddenField {
        /// The offending key.
        key: String,
        /// Path of the containing object.
        path: String,
    },

    /// A number was not representable as an integer.
    #[error("request contains non-integer number at {path}")]
    FloatNotAllowed {
        /// Path of the offending value.
        path: String,
    },

    /// Provenance failed validation while being canonicalized.
    #[error(transparent)]
    Provenance(#[from] AuthorizationError),
}

/// Content hash over the canonical form of a request.
///
/// Execution recomputes this from the live inputs and refuses to run on
/// any bit-level divergence from the fingerprint the admission token
/// carries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RequestFingerprint(String);

impl RequestFingerprint {
    /// Wraps an existing hex digest. Callers normally obtain
    /// fingerprints from [`request_fingerprint_from_canonical`].
    #[must_use]
    pub fn from_hex(value: String) -> Self {
        Self(value)
    }

    /// The hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the digest is a well-formed 64-char hex string.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == DIGEST_HEX_LEN && self.0.bytes().all(|b| b.is_ascii_hexdigit())
    }
}

impl std::fmt::Display for RequestFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A canonicalized task request, ready for fingerprinting.
///
/// The inner tree uses sorted maps throughout; serializing it compactly
/// yields the canonical bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRequest(Value);

impl CanonicalRequest {
    /// Borrow the canonical tree.
    #[must_use]
    pub const fn value(&self) -> &Value {
        &self.0
    }

    /// Consume self, returning the canonical tree.
    #[must_use]
    pub fn into_value(self) -> Value {
        self.0
    }

    /// Compact canonical serialization.
    #[must_use]
    pub fn canonical_bytes(&self) -> Vec<u8> {
        canonical_json_bytes(&self.0)
    }
}

/// Serializes a canonical tree compactly. `serde_json`'s default map is
/// ordered by key, so sorted construction carries through to the bytes.
///
/// # Panics
///
/// Panics if the in-memory tree fails to serialize, which `serde_json`
/// guarantees cannot happen for `Value`. Hashing inputs must never
/// silently degenerate to empty bytes.
#[must_use]
pub fn canonical_json_bytes(value: &Value) -> Vec<u8> {
    serde_json::to_vec(value).expect("in-memory JSON tree serializes")
}

/// Canonicalizes the full request tuple.
///
/// # Errors
///
/// Returns [`RequestCanonicalizationError`] when a forbidden field is
/// present, a float sneaks into declared inputs, or provenance is
/// incomplete.
pub fn canonicalise_task_request(
    task: &Task,
    authorization: &AuthorizationRecord,
    provenance: &AuthorityProvenance,
    declared_inputs: Option<&Artifacts>,
) -> Result<CanonicalRequest, RequestCanonicalizationError> {
    let mut request = Map::new();
    request.insert("task".to_string(), canonicalise_task(task)?);
    request.insert(
        "authorization".to_string(),
        canonicalise_authorization(authorization),
    );
    request.insert(
        "provenance".to_string(),
        canonicalise_provenance(provenance)?,
    );
    request.insert(
        "declared_inputs".to_string(),
        canonicalise_declared_inputs(declared_inputs)?,
    );
    let request = Value::Object(request);
    enforce_no_forbidden_fields(&request, "request")?;
    Ok(CanonicalRequest(request))
}

/// Fingerprint of a canonical request: hex SHA-256 of its bytes.
#[must_use]
pub fn request_fingerprint_from_canonical(request: &CanonicalRequest) -> RequestFingerprint {
    RequestFingerprint(sha256_hex(&request.canonical_bytes()))
}

/// Canonical form of a task: trimmed identifiers, sorted constraint set,
/// steps in declared order, repair declarations without their handlers.
///
/// # Errors
///
/// Returns [`RequestCanonicalizationError::FloatNotAllowed`] on any
/// non-integer number in a step parameter map.
pub fn canonicalise_task(task: &Task) -> Result<Value, RequestCanonicalizationError> {
    let mut constraints: Vec<String> = task
        .constraints
        .iter()
        .map(|c| normalise_text(c))
        .collect();
    constraints.sort();

    let steps: Vec<Value> = task
        .steps
        .iter()
        .map(canonicalise_step)
        .collect::<Result<_, _>>()?;

    let mut actions: Vec<Value> = task.epr_actions.iter().map(canonicalise_epr_action).collect();
    actions.sort_by(|a, b| {
        let key = |v: &Value| v["action_id"].as_str().unwrap_or_default().to_string();
        key(a).cmp(&key(b))
    });

    Ok(json!({
        "task_id": task.task_id.trim(),
        "objective": normalise_text(&task.objective),
        "constraints": constraints,
        "steps": steps,
        "allow_epr": task.allow_epr,
        "epr_actions": actions,
    }))
}

fn canonicalise_step(step: &Step) -> Result<Value, RequestCanonicalizationError> {
    let mut expects: Vec<String> = step.expects.iter().map(|e| normalise_text(e)).collect();
    expects.sort();
    let path = format!("steps[{}].payload", step.step_id);
    Ok(json!({
        "step_id": step.step_id,
        "kind": step.kind.as_str(),
        "expects": expects,
        "payload": canonicalise_step_payload(&step.payload, &path)?,
    }))
}

fn canonicalise_step_payload(
    payload: &StepPayload,
    path: &str,
) -> Result<Value, RequestCanonicalizationError> {
    Ok(match payload {
        StepPayload::Noop(noop) => json!({
            "note": noop.note.as_deref().map(normalise_text),
            "should_fail": noop.should_fail,
        }),
        StepPayload::Shell(shell) => json!({
            "command": shell.command,
            "cwd": shell.cwd,
            "should_fail": shell.should_fail,
        }),
        StepPayload::Python(python) => json!({
            "callable": normalise_text(&python.name),
            "has_callable": python.callable.is_some(),
        }),
        StepPayload::Mesh(mesh) => json!({
            "job": normalise_text(&mesh.job),
            "parameters": sorted_map(&mesh.parameters, &format!("{path}.parameters"))?,
            "should_fail": mesh.should_fail,
        }),
        StepPayload::Adapter(adapter) => json!({
            "adapter": normalise_text(&adapter.adapter),
            "operation": normalise_text(&adapter.operation),
            "parameters": sorted_map(&adapter.parameters, &format!("{path}.parameters"))?,
            "should_fail": adapter.should_fail,
        }),
    })
}

fn canonicalise_epr_action(action: &EprAction) -> Value {
    json!({
        "action_id": action.action_id.trim(),
        "parent_task_id": action.parent_task_id.trim(),
        "trigger_step_id": action.trigger_step_id,
        "authority_impact": action.authority_impact.as_str(),
        "reversibility": action.reversibility.as_str(),
        "rollback_proof": action.rollback_proof.as_str(),
        "external_effects": action.external_effects.as_str(),
        "privilege_escalation": action.privilege_escalation,
        "description": normalise_text(&action.description),
        "has_handler": action.handler.is_some(),
        "unknown_prerequisite": action
            .unknown_prerequisite
            .as_ref()
            .map(canonicalise_unknown_prerequisite),
    })
}

fn canonicalise_unknown_prerequisite(unknown: &UnknownPrerequisite) -> Value {
    json!({
        "condition": normalise_text(&unknown.condition),
        "reason": normalise_text(&unknown.reason),
        "unblock_query": unknown.unblock_query.as_deref().map(normalise_text),
        "response": unknown.response.as_deref().map(normalise_text),
        "resolved_status": unknown.resolved_status.map(|s| s.as_str()),
    })
}

/// Canonical form of an authorization record.
///
/// Timestamp and metadata are non-authoritative and excluded for digest
/// stability: log timing noise and smuggled metadata keys cannot perturb
/// the fingerprint.
#[must_use]
pub fn canonicalise_authorization(authorization: &AuthorizationRecord) -> Value {
    json!({
        "request_type": authorization.request_type.as_str(),
        "requester_id": authorization.requester_id,
        "intent_hash": authorization.intent_hash,
        "context_hash": authorization.context_hash,
        "policy_version": authorization.policy_version,
        "decision": authorization.decision.as_str(),
        "reason": authorization.reason.as_str(),
    })
}

/// Canonical form of authority provenance. All four fields must be
/// non-blank; admission never mints blank provenance and execution never
/// accepts it.
///
/// # Errors
///
/// Returns [`AuthorizationError::InvalidProvenance`] naming the first
/// blank field.
pub fn canonicalise_provenance(
    provenance: &AuthorityProvenance,
) -> Result<Value, AuthorizationError> {
    provenance.validate()?;
    Ok(json!({
        "authority_source": provenance.authority_source,
        "authority_scope": provenance.authority_scope,
        "authority_context_id": provenance.authority_context_id,
        "authority_reason": provenance.authority_reason,
    }))
}

/// Canonical form of declared inputs: keys sorted recursively, strings
/// right-trimmed, integer-only numbers.
///
/// # Errors
///
/// Returns [`RequestCanonicalizationError::FloatNotAllowed`] on any
/// non-integer number.
pub fn canonicalise_declared_inputs(
    declared_inputs: Option<&Artifacts>,
) -> Result<Value, RequestCanonicalizationError> {
    let mut out = Map::new();
    if let Some(inputs) = declared_inputs {
        for (key, value) in inputs {
            out.insert(
                key.clone(),
                normalise_value(value, true, &format!("declared_inputs.{key}"))?,
            );
        }
    }
    Ok(Value::Object(out))
}

/// Recursively normalizes an arbitrary JSON value into canonical form.
///
/// # Errors
///
/// Returns [`RequestCanonicalizationError::FloatNotAllowed`] on any
/// non-integer number.
pub fn normalise_value(
    value: &Value,
    strip_strings: bool,
    path: &str,
) -> Result<Value, RequestCanonicalizationError> {
    match value {
        Value::Null | Value::Bool(_) => Ok(value.clone()),
        Value::Number(number) => {
            if number.is_i64() || number.is_u64() {
                Ok(value.clone())
            } else {
                Err(RequestCanonicalizationError::FloatNotAllowed {
                    path: path.to_string(),
                })
            }
        },
        Value::String(text) => Ok(Value::String(if strip_strings {
            normalise_text(text)
        } else {
            text.clone()
        })),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                out.push(normalise_value(
                    item,
                    strip_strings,
                    &format!("{path}[{index}]"),
                )?);
            }
            Ok(Value::Array(out))
        },
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, item) in map {
                out.insert(
                    key.clone(),
                    normalise_value(item, strip_strings, &format!("{path}.{key}"))?,
                );
            }
            Ok(Value::Object(out))
        },
    }
}

/// Walks a canonical tree and rejects any map key containing a forbidden
/// token.
///
/// # Errors
///
/// Returns [`RequestCanonicalizationError::ForbiddenField`] naming the
/// first offending key.
pub fn enforce_no_forbidden_fields(
    value: &Value,
    path: &str,
) -> Result<(), RequestCanonicalizationError> {
    match value {
        Value::Object(map) => {
            for (key, item) in map {
                let lowered = key.to_lowercase();
                if FORBIDDEN_KEY_TOKENS
                    .iter()
                    .any(|token| lowered.contains(token))
                {
                    return Err(RequestCanonicalizationError::ForbiddenField {
                        key: key.clone(),
                        path: path.to_string(),
                    });
                }
                enforce_no_forbidden_fields(item, &format!("{path}.{key}"))?;
            }
            Ok(())
        },
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                enforce_no_forbidden_fields(item, &format!("{path}[{index}]"))?;
            }
            Ok(())
        },
        _ => Ok(()),
    }
}

/// Right-trims free text, mirroring the canonical treatment of strings
/// everywhere in the kernel.
#[must_use]
pub fn normalise_text(value: &str) -> String {
    value.trim_end().to_string()
}

fn sorted_map(map: &Artifacts, path: &str) -> Result<Value, RequestCanonicalizationError> {
    // BTreeMap iteration is already sorted; rebuilding keeps nested maps
    // canonical too.
    let mut out = Map::new();
    for (key, value) in map {
        out.insert(
            key.clone(),
            normalise_value(value, false, &format!("{path}.{key}"))?,
        );
    }
    Ok(Value::Object(out))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::control_plane::{Decision, ReasonCode, RequestType};
    use crate::task::{NoopPayload, StepPayload};

    fn provenance() -> AuthorityProvenance {
        AuthorityProvenance {
            authority_source: "operator".to_string(),
            authority_scope: "policy:test".to_string(),
            authority_context_id: "node-1".to_string(),
            authority_reason: "OK".to_string(),
        }
    }

    fn authorization() -> AuthorizationRecord {
        AuthorizationRecord {
            request_type: RequestType::TaskExecution,
            requester_id: "operator".to_string(),
            intent_hash: "intent".to_string(),
            context_hash: "context".to_string(),
            policy_version: "v1-static".to_string(),
            decision: Decision::Allow,
            reason: ReasonCode::Ok,
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            metadata: BTreeMap::new(),
        }
    }

    fn noop_task(constraints: &[&str]) -> Task {
        let mut task = Task::new(
            "task-1",
            "canonical test",
            vec![Step::new(1, StepPayload::Noop(NoopPayload::default()))],
        );
        task.constraints = constraints.iter().map(ToString::to_string).collect();
        task
    }

    #[test]
    fn fingerprint_is_stable_across_calls() {
        let task = noop_task(&["a", "b"]);
        let auth = authorization();
        let prov = provenance();
        let first = request_fingerprint_from_canonical(
            &canonicalise_task_request(&task, &auth, &prov, None).unwrap(),
        );
        let second = request_fingerprint_from_canonical(
            &canonicalise_task_request(&task, &auth, &prov, None).unwrap(),
        );
        assert_eq!(first, second);
        assert!(first.is_well_formed());
    }

    #[test]
    fn constraint_reordering_does_not_change_fingerprint() {
        let auth = authorization();
        let prov = provenance();
        let forward = canonicalise_task_request(&noop_task(&["a", "b"]), &auth, &prov, None)
            .unwrap();
        let reversed = canonicalise_task_request(&noop_task(&["b", "a"]), &auth, &prov, None)
            .unwrap();
        assert_eq!(forward, reversed);
        assert_eq!(
            request_fingerprint_from_canonical(&forward),
            request_fingerprint_from_canonical(&reversed)
        );
    }

    #[test]
    fn declared_input_key_order_does_not_matter() {
        let task = noop_task(&[]);
        let auth = authorization();
        let prov = provenance();
        let mut first = Artifacts::new();
        first.insert("alpha".to_string(), json!("one"));
        first.insert("beta".to_string(), json!(2));
        let mut second = Artifacts::new();
        second.insert("beta".to_string(), json!(2));
        second.insert("alpha".to_string(), json!("one"));
        let a = canonicalise_task_request(&task, &auth, &prov, Some(&first)).unwrap();
        let b = canonicalise_task_request(&task, &auth, &prov, Some(&second)).unwrap();
        assert_eq!(
            request_fingerprint_from_canonical(&a),
            request_fingerprint_from_canonical(&b)
        );
    }

    #[test]
    fn authorization_metadata_is_excluded() {
        let task = noop_task(&[]);
        let prov = provenance();
        let clean = authorization();
        let mut smuggled = authorization();
        smuggled
            .metadata
            .insert("smuggled_note".to_string(), json!("extra"));
        let a = canonicalise_task_request(&task, &clean, &prov, None).unwrap();
        let b = canonicalise_task_request(&task, &smuggled, &prov, None).unwrap();
        assert_eq!(
            request_fingerprint_from_canonical(&a),
            request_fingerprint_from_canonical(&b)
        );
    }

    #[test]
    fn forbidden_declared_input_key_is_rejected() {
        let task = noop_task(&[]);
        let auth = authorization();
        let prov = provenance();
        let mut inputs = Artifacts::new();
        inputs.insert("expected_reward".to_string(), json!(1));
        let err = canonicalise_task_request(&task, &auth, &prov, Some(&inputs)).unwrap_err();
        assert!(matches!(
            err,
            RequestCanonicalizationError::ForbiddenField { .. }
        ));
    }

    #[test]
    fn float_inputs_are_rejected() {
        let task = noop_task(&[]);
        let auth = authorization();
        let prov = provenance();
        let mut inputs = Artifacts::new();
        inputs.insert("ratio".to_string(), json!(0.5));
        let err = canonicalise_task_request(&task, &auth, &prov, Some(&inputs)).unwrap_err();
        assert!(matches!(
            err,
            RequestCanonicalizationError::FloatNotAllowed { .. }
        ));
    }

    #[test]
    fn float_step_parameters_are_rejected() {
        use crate::task::{AdapterPayload, MeshPayload};

        let auth = authorization();
        let prov = provenance();
        for ratio in [0.5, 0.9] {
            let mut parameters = Artifacts::new();
            parameters.insert("ratio".to_string(), json!(ratio));
            let task = Task::new(
                "task-1",
                "canonical test",
                vec![Step::new(1, StepPayload::Mesh(MeshPayload {
                    job: "reindex".to_string(),
                    parameters,
                    should_fail: false,
                }))],
            );
            // Two tasks differing only in a float parameter must never
            // canonicalize to one shared fingerprint; both are refused.
            let err = canonicalise_task_request(&task, &auth, &prov, None).unwrap_err();
            assert!(matches!(
                err,
                RequestCanonicalizationError::FloatNotAllowed { .. }
            ));
        }

        let mut parameters = Artifacts::new();
        parameters.insert("threshold".to_string(), json!(2.5));
        let task = Task::new(
            "task-1",
            "canonical test",
            vec![Step::new(1, StepPayload::Adapter(AdapterPayload {
                adapter: "indexer".to_string(),
                operation: "tune".to_string(),
                parameters,
                should_fail: false,
            }))],
        );
        let err = canonicalise_task_request(&task, &auth, &prov, None).unwrap_err();
        assert!(matches!(
            err,
            RequestCanonicalizationError::FloatNotAllowed { .. }
        ));
    }

    #[test]
    fn integer_step_parameters_are_fingerprint_distinct() {
        let auth = authorization();
        let prov = provenance();
        let with_ratio = |ratio: i64| {
            let mut parameters = Artifacts::new();
            parameters.insert("ratio_percent".to_string(), json!(ratio));
            Task::new(
                "task-1",
                "canonical test",
                vec![Step::new(1, StepPayload::Mesh(crate::task::MeshPayload {
                    job: "reindex".to_string(),
                    parameters,
                    should_fail: false,
                }))],
            )
        };
        let a = canonicalise_task_request(&with_ratio(50), &auth, &prov, None).unwrap();
        let b = canonicalise_task_request(&with_ratio(90), &auth, &prov, None).unwrap();
        assert_ne!(
            request_fingerprint_from_canonical(&a),
            request_fingerprint_from_canonical(&b)
        );
    }

    #[test]
    fn blank_provenance_is_rejected() {
        let task = noop_task(&[]);
        let auth = authorization();
        let mut prov = provenance();
        prov.authority_reason = "   ".to_string();
        let err = canonicalise_task_request(&task, &auth, &prov, None).unwrap_err();
        assert!(matches!(err, RequestCanonicalizationError::Provenance(_)));
    }

    #[test]
    fn objective_change_changes_fingerprint() {
        let auth = authorization();
        let prov = provenance();
        let a = canonicalise_task_request(&noop_task(&[]), &auth, &prov, None).unwrap();
        let mut tampered = noop_task(&[]);
        tampered.objective = "something else".to_string();
        let b = canonicalise_task_request(&tampered, &auth, &prov, None).unwrap();
        assert_ne!(
            request_fingerprint_from_canonical(&a),
            request_fingerprint_from_canonical(&b)
        );
    }

    proptest! {
        #[test]
        fn constraint_permutations_share_one_fingerprint(
            mut constraints in proptest::collection::vec("[a-z]{1,8}", 1..6),
        ) {
            let auth = authorization();
            let prov = provenance();
            let refs: Vec<&str> = constraints.iter().map(String::as_str).collect();
            let base = canonicalise_task_request(&noop_task(&refs), &auth, &prov, None).unwrap();
            constraints.reverse();
            let refs: Vec<&str> = constraints.iter().map(String::as_str).collect();
            let flipped = canonicalise_task_request(&noop_task(&refs), &auth, &prov, None).unwrap();
            prop_assert_eq!(
                request_fingerprint_from_canonical(&base),
                request_fingerprint_from_canonical(&flipped)
            );
        }
    }
}
