//! Deterministic task-execution kernel.
//!
//! The kernel gates, runs, self-repairs and audits tasks with one
//! governing contract: equal canonical inputs produce bitwise-equal
//! outputs, and every consequential event is durably recorded in a
//! hash-chained audit log before control returns to the caller.
//!
//! A task passes through four stages:
//!
//! 1. **Admission** ([`admission`]): a pure, side-effect-free policy
//!    gate evaluated in fixed precedence order. An allowed task gets an
//!    [`admission::AdmissionToken`] bound to the request fingerprint.
//! 2. **Execution** ([`engine`]): the fingerprint is recomputed from
//!    the live inputs and compared bit-for-bit before any step runs.
//!    Steps execute strictly in declared order, each attempt audited.
//! 3. **Closure** ([`closure`]): failing steps may be repaired by
//!    declared actions under hard guardrails, with provable
//!    termination bounds and no authority escalation.
//! 4. **Audit and identity** ([`audit`], [`identity`]): the run's
//!    record is chained and synced, and the system identity digest is
//!    compared before and after to detect governance drift.
//!
//! Canonicalization ([`canonical`]) underpins all of it: sorted keys,
//! compact serialization, integer-only numbers, normalized sets, and a
//! rejection of outcome-reframing vocabulary in request fields.

pub mod admission;
pub mod audit;
pub mod canonical;
pub mod closure;
pub mod config;
pub mod control_plane;
pub mod crypto;
pub mod engine;
mod error;
pub mod identity;
pub mod snapshot;
pub mod task;

pub use admission::{
    AdmissionContext, AdmissionDecision, AdmissionPolicy, AdmissionReason, AdmissionToken,
    AuthorityProvenance, admit, mint_admission_token,
};
pub use audit::{AuditChain, AuditEntry, AuditError};
pub use canonical::{
    CanonicalRequest, RequestCanonicalizationError, RequestFingerprint, canonicalise_task_request,
    request_fingerprint_from_canonical,
};
pub use closure::{
    ClosureError, EprApprovalRequired, EprReport, ExhaustionType, PrerequisiteAssessment,
    TaskClosureError, TaskExhausted, UnknownPrerequisiteError, assess_task_prerequisites,
};
pub use config::{ClosureLimits, KernelConfig};
pub use control_plane::{AuthorizationError, AuthorizationRecord, ControlPlanePolicy, RequestType};
pub use engine::{Kernel, StepTrace, TaskResult, TaskStatus};
pub use error::KernelError;
pub use identity::{
    DriftClassification, IdentityDriftReport, IdentitySnapshot, classify_identity_drift,
    compute_system_identity_digest, enforce_identity_drift,
};
pub use snapshot::{
    SnapshotDivergenceError, TaskExecutionRecord, build_task_execution_record,
    load_task_execution_record,
};
pub use task::{PrerequisiteStatus, Step, StepKind, StepPayload, Task};
