//! Consumed control-plane surface: authorization records and policy.
//!
//! The control plane evaluates who may request what; the kernel only
//! consumes its outputs. An [`AuthorizationRecord`] is produced by the
//! external policy evaluator and checked (never minted) by the kernel
//! before execution. [`ControlPlanePolicy`] is included here so the
//! identity digest can hash the allowlist surface, not so the kernel can
//! evaluate it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

/// Request types the control plane can authorize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum RequestType {
    /// Execution of an admitted task by the kernel engine.
    TaskExecution,
    /// Dispatch of a declared job to the compute mesh.
    MeshDispatch,
    /// Invocation of an external adapter context.
    AdapterInvocation,
}

impl RequestType {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TaskExecution => "task_execution",
            Self::MeshDispatch => "mesh_dispatch",
            Self::AdapterInvocation => "adapter_invocation",
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Control-plane decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// The request may proceed.
    Allow,
    /// The request is refused.
    Deny,
}

impl Decision {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

/// Reason codes attached to control-plane decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ReasonCode {
    /// Decision succeeded.
    Ok,
    /// No authorization was supplied at all.
    MissingAuthorization,
    /// The requester is not on the allowlist for this request type.
    RequesterDenied,
    /// The context is not on the allowlist for this request type.
    ContextDenied,
}

impl ReasonCode {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::MissingAuthorization => "MISSING_AUTHORIZATION",
            Self::RequesterDenied => "REQUESTER_DENIED",
            Self::ContextDenied => "CONTEXT_DENIED",
        }
    }
}

/// Errors raised when an authorization or admission token fails its
/// pre-execution checks. All variants abort before any step runs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AuthorizationError {
    /// No authorization record was supplied.
    #[error("MISSING_AUTHORIZATION")]
    Missing,

    /// The record's decision is not ALLOW.
    #[error("authorization denied: {reason}")]
    Denied {
        /// Reason code carried by the record.
        reason: String,
    },

    /// The record authorizes a different request type.
    #[error("authorization request type mismatch: expected {expected}, got {actual}")]
    RequestTypeMismatch {
        /// The request type the kernel requires.
        expected: RequestType,
        /// The request type actually authorized.
        actual: RequestType,
    },

    /// The admission token names a different task.
    #[error("admission token task mismatch")]
    TokenTaskMismatch,

    /// The admission token was issued by something other than admission.
    #[error("admission token issuer invalid")]
    TokenIssuerInvalid,

    /// A provenance field is missing or blank.
    #[error("invalid authority provenance: {field}")]
    InvalidProvenance {
        /// Name of the offending field.
        field: String,
    },

    /// The token fingerprint is absent or not a well-formed hex digest.
    #[error("admission token fingerprint missing")]
    TokenFingerprintInvalid,
}

/// Authorization produced by the external control-plane evaluator.
///
/// The timestamp and metadata are non-authoritative: both are excluded
/// from the canonical request form so log timing noise and metadata
/// smuggling cannot perturb the request fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationRecord {
    /// The request type this record authorizes.
    pub request_type: RequestType,
    /// Who asked.
    pub requester_id: String,
    /// Digest of the stated intent.
    pub intent_hash: String,
    /// Digest of the evaluation context.
    pub context_hash: String,
    /// Version of the policy that produced the decision.
    pub policy_version: String,
    /// The decision itself.
    pub decision: Decision,
    /// Reason code for the decision.
    pub reason: ReasonCode,
    /// Issue time, ISO-8601. Excluded from canonical forms.
    pub timestamp: String,
    /// Free-form metadata. Excluded from canonical forms.
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl AuthorizationRecord {
    /// Checks that this record is an ALLOW for `expected` before any
    /// execution is attempted.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorizationError`] when the decision is not ALLOW or
    /// the request type differs.
    pub fn require(&self, expected: RequestType) -> Result<(), AuthorizationError> {
        if self.decision != Decision::Allow {
            return Err(AuthorizationError::Denied {
                reason: self.reason.as_str().to_string(),
            });
        }
        if self.request_type != expected {
            return Err(AuthorizationError::RequestTypeMismatch {
                expected,
                actual: self.request_type,
            });
        }
        Ok(())
    }
}

/// Per-request-type allowlist rule.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RequestRule {
    /// Requester ids permitted to make this request.
    pub allowed_requesters: Vec<String>,
    /// Context ids in which the request is permitted.
    pub allowed_contexts: Vec<String>,
}

/// Static control-plane policy: the allowlist surface the identity
/// digest hashes. Evaluation happens in the external control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPlanePolicy {
    /// Policy version string.
    pub policy_version: String,
    /// Allowlist rules keyed by request type.
    pub request_rules: BTreeMap<RequestType, RequestRule>,
}

impl ControlPlanePolicy {
    /// Looks up the rule for a request type, if one is declared.
    #[must_use]
    pub fn rule_for(&self, request_type: RequestType) -> Option<&RequestRule> {
        self.request_rules.get(&request_type)
    }

    /// Normalized description tree consumed by the identity digest.
    /// Sorted keys, sorted allowlists, no free-form content.
    #[must_use]
    pub fn describe(&self) -> Value {
        let mut rules = serde_json::Map::new();
        for (request_type, rule) in &self.request_rules {
            let mut requesters: Vec<&String> = rule.allowed_requesters.iter().collect();
            requesters.sort();
            let mut contexts: Vec<&String> = rule.allowed_contexts.iter().collect();
            contexts.sort();
            rules.insert(
                request_type.as_str().to_string(),
                json!({
                    "allowed_requesters": requesters,
                    "allowed_contexts": contexts,
                }),
            );
        }
        json!({
            "policy_version": self.policy_version,
            "request_rules": Value::Object(rules),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow_record() -> AuthorizationRecord {
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

    #[test]
    fn require_accepts_matching_allow() {
        assert!(allow_record().require(RequestType::TaskExecution).is_ok());
    }

    #[test]
    fn require_rejects_deny() {
        let mut record = allow_record();
        record.decision = Decision::Deny;
        record.reason = ReasonCode::RequesterDenied;
        assert!(matches!(
            record.require(RequestType::TaskExecution),
            Err(AuthorizationError::Denied { .. })
        ));
    }

    #[test]
    fn require_rejects_type_mismatch() {
        let mut record = allow_record();
        record.request_type = RequestType::MeshDispatch;
        assert!(matches!(
            record.require(RequestType::TaskExecution),
            Err(AuthorizationError::RequestTypeMismatch { .. })
        ));
    }

    #[test]
    fn rule_lookup_finds_declared_types_only() {
        let mut rules = BTreeMap::new();
        rules.insert(RequestType::TaskExecution, RequestRule {
            allowed_requesters: vec!["operator".to_string()],
            allowed_contexts: vec!["node-1".to_string()],
        });
        let policy = ControlPlanePolicy {
            policy_version: "v1".to_string(),
            request_rules: rules,
        };
        assert!(policy.rule_for(RequestType::TaskExecution).is_some());
        assert!(policy.rule_for(RequestType::MeshDispatch).is_none());
    }

    #[test]
    fn describe_sorts_allowlists() {
        let mut rules = BTreeMap::new();
        rules.insert(RequestType::TaskExecution, RequestRule {
            allowed_requesters: vec!["zeta".to_string(), "alpha".to_string()],
            allowed_contexts: vec!["node-2".to_string(), "node-1".to_string()],
        });
        let policy = ControlPlanePolicy {
            policy_version: "v1".to_string(),
            request_rules: rules,
        };
        let described = policy.describe();
        let rule = &described["request_rules"]["task_execution"];
        assert_eq!(rule["allowed_requesters"], json!(["alpha", "zeta"]));
        assert_eq!(rule["allowed_contexts"], json!(["node-1", "node-2"]));
    }
}
