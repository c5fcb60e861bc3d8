//! Persisted execution records and their divergence checks.
//!
//! A completed run can be persisted as a [`TaskExecutionRecord`]: the
//! canonical request, the admission token, the result surface and a
//! digest over the whole snapshot. Loading re-canonicalizes every
//! component from the raw payload and re-verifies the digest, the
//! request fingerprint and provenance completeness, so any tampering
//! between persist and reload is detected rather than replayed.

use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::canonical::{
    RequestCanonicalizationError, canonical_json_bytes, enforce_no_forbidden_fields,
    normalise_value,
};
use crate::control_plane::AuthorizationRecord;
use crate::crypto::sha256_hex;
use crate::engine::{TaskResult, TaskStatus};
use crate::task::Task;

/// Version tag written into every record.
pub const RECORD_VERSION: u64 = 1;

const PROVENANCE_FIELDS: [&str; 4] = [
    "authority_source",
    "authority_scope",
    "authority_context_id",
    "authority_reason",
];

/// A reload does not reproduce what was persisted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SnapshotDivergenceError {
    /// Only completed results may be persisted.
    #[error("refusing to persist a record for status {status}")]
    NotCompleted {
        /// The offending status.
        status: String,
    },

    /// A required field is absent or of the wrong shape.
    #[error("snapshot field missing or malformed: {field}")]
    MissingField {
        /// Dotted path of the field.
        field: String,
    },

    /// The snapshot digest does not match its content.
    #[error("snapshot digest mismatch: recorded {recorded}, computed {computed}")]
    DigestMismatch {
        /// Digest carried by the payload.
        recorded: String,
        /// Digest recomputed from the snapshot tree.
        computed: String,
    },

    /// Components disagree on which task this record describes.
    #[error("task id mismatch across snapshot components: {detail}")]
    TaskIdMismatch {
        /// Which components disagree.
        detail: String,
    },

    /// A provenance field is blank in the reloaded record.
    #[error("blank provenance field in snapshot: {field}")]
    BlankProvenance {
        /// The blank field.
        field: String,
    },

    /// Token provenance and request provenance diverged.
    #[error("token provenance does not match request provenance")]
    ProvenanceMismatch,

    /// Fingerprints across request, token and result disagree.
    #[error("fingerprint mismatch in snapshot: {detail}")]
    FingerprintMismatch {
        /// Which fingerprints disagree and how.
        detail: String,
    },

    /// The request payload cannot be re-canonicalized.
    #[error(transparent)]
    Canonicalization(#[from] RequestCanonicalizationError),
}

/// A persisted record of one completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskExecutionRecord {
    /// The snapshot tree the digest covers.
    pub snapshot: Value,
    /// Hex SHA-256 of the compact snapshot serialization.
    pub digest: String,
}

impl TaskExecutionRecord {
    /// Payload form suitable for writing out.
    #[must_use]
    pub fn to_value(&self) -> Value {
        json!({
            "snapshot": self.snapshot,
            "digest": self.digest,
        })
    }
}

/// Builds the execution record for a completed run.
///
/// # Errors
///
/// Returns [`SnapshotDivergenceError::NotCompleted`] for any result that
/// did not complete; partial runs are never persisted as records.
pub fn build_task_execution_record(
    task: &Task,
    result: &TaskResult,
    authorization: &AuthorizationRecord,
) -> Result<TaskExecutionRecord, SnapshotDivergenceError> {
    if result.status != TaskStatus::Completed {
        return Err(SnapshotDivergenceError::NotCompleted {
            status: result.status.as_str().to_string(),
        });
    }

    let token = &result.admission_token;
    let mut snapshot = Map::new();
    snapshot.insert("record_version".to_string(), json!(RECORD_VERSION));
    snapshot.insert("task_id".to_string(), json!(task.task_id));
    snapshot.insert(
        "request".to_string(),
        result.canonical_request.value().clone(),
    );
    snapshot.insert(
        "request_fingerprint".to_string(),
        json!(result.request_fingerprint.as_str()),
    );
    snapshot.insert(
        "token".to_string(),
        json!({
            "task_id": token.task_id,
            "issued_by": token.issued_by,
            "request_fingerprint": token.request_fingerprint.as_str(),
            "provenance": {
                "authority_source": token.provenance.authority_source,
                "authority_scope": token.provenance.authority_scope,
                "authority_context_id": token.provenance.authority_context_id,
                "authority_reason": token.provenance.authority_reason,
            },
        }),
    );
    snapshot.insert(
        "result".to_string(),
        json!({
            "status": result.status.as_str(),
            "artifacts": Value::Object(result.artifacts.clone().into_iter().collect()),
            "trace": result
                .trace
                .iter()
                .map(|entry| {
                    json!({
                        "step_id": entry.step_id,
                        "kind": entry.kind.as_str(),
                        "attempt": entry.attempt,
                        "status": entry.status.as_str(),
                        "artifacts": Value::Object(
                            entry.artifacts.clone().into_iter().collect()
                        ),
                        "error": entry.error,
                    })
                })
                .collect::<Vec<_>>(),
            "epr_report": result.epr_report.to_value(),
        }),
    );
    snapshot.insert(
        "authorization_policy_version".to_string(),
        json!(authorization.policy_version),
    );

    let snapshot = Value::Object(snapshot);
    let digest = sha256_hex(&canonical_json_bytes(&snapshot));
    Ok(TaskExecutionRecord { snapshot, digest })
}

/// Reloads and re-verifies a persisted record.
///
/// # Errors
///
/// Returns [`SnapshotDivergenceError`] on any divergence between the
/// payload and what the digest, fingerprints and provenance claim.
pub fn load_task_execution_record(
    payload: &Value,
) -> Result<TaskExecutionRecord, SnapshotDivergenceError> {
    let snapshot = field(payload, "snapshot")?;
    let recorded_digest = str_field(payload, "digest")?;

    // Re-normalize from raw bytes; a float or forbidden key smuggled
    // into the persisted form is caught here, not replayed.
    let snapshot = normalise_value(snapshot, false, "snapshot")?;
    let computed_digest = sha256_hex(&canonical_json_bytes(&snapshot));
    if computed_digest != recorded_digest {
        return Err(SnapshotDivergenceError::DigestMismatch {
            recorded: recorded_digest.to_string(),
            computed: computed_digest,
        });
    }

    let task_id = str_field(&snapshot, "task_id")?;
    let request = field(&snapshot, "request")?;
    enforce_no_forbidden_fields(request, "snapshot.request")?;
    let request_task_id = str_field(field(request, "task")?, "task_id")?;
    let token = field(&snapshot, "token")?;
    let token_task_id = str_field(token, "task_id")?;
    if request_task_id != task_id || token_task_id != task_id {
        return Err(SnapshotDivergenceError::TaskIdMismatch {
            detail: format!(
                "record {task_id}, request {request_task_id}, token {token_task_id}"
            ),
        });
    }

    let token_provenance = field(token, "provenance")?;
    let request_provenance = field(request, "provenance")?;
    for name in PROVENANCE_FIELDS {
        for (component, provenance) in
            [("token", token_provenance), ("request", request_provenance)]
        {
            let value = str_field(provenance, name).map_err(|_| {
                SnapshotDivergenceError::MissingField {
                    field: format!("{component}.provenance.{name}"),
                }
            })?;
            if value.trim().is_empty() {
                return Err(SnapshotDivergenceError::BlankProvenance {
                    field: format!("{component}.provenance.{name}"),
                });
            }
        }
    }
    if token_provenance != request_provenance {
        return Err(SnapshotDivergenceError::ProvenanceMismatch);
    }

    let recorded_fingerprint = str_field(&snapshot, "request_fingerprint")?;
    let token_fingerprint = str_field(token, "request_fingerprint")?;
    let computed_fingerprint = sha256_hex(&canonical_json_bytes(request));
    if computed_fingerprint != recorded_fingerprint || recorded_fingerprint != token_fingerprint {
        return Err(SnapshotDivergenceError::FingerprintMismatch {
            detail: format!(
                "recorded {recorded_fingerprint}, token {token_fingerprint}, \
                 computed {computed_fingerprint}"
            ),
        });
    }

    Ok(TaskExecutionRecord {
        snapshot,
        digest: recorded_digest.to_string(),
    })
}

fn field<'a>(value: &'a Value, name: &str) -> Result<&'a Value, SnapshotDivergenceError> {
    value
        .get(name)
        .ok_or_else(|| SnapshotDivergenceError::MissingField {
            field: name.to_string(),
        })
}

fn str_field<'a>(value: &'a Value, name: &str) -> Result<&'a str, SnapshotDivergenceError> {
    field(value, name)?
        .as_str()
        .ok_or_else(|| SnapshotDivergenceError::MissingField {
            field: name.to_string(),
        })
}
