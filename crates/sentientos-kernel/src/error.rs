//! Closed kernel error surface.
//!
//! Every fallible kernel operation returns [`KernelError`]. The set of
//! variants is deliberately closed: callers can match exhaustively on
//! the failure mode, and a new failure class is an API change rather
//! than a silent addition.

use thiserror::Error;

use crate::audit::AuditError;
use crate::canonical::RequestCanonicalizationError;
use crate::closure::{
    ClosureError, EprApprovalRequired, TaskClosureError, TaskExhausted, UnknownPrerequisiteError,
};
use crate::control_plane::AuthorizationError;
use crate::engine::StepExecutionError;
use crate::identity::IdentityError;
use crate::snapshot::SnapshotDivergenceError;

/// Any failure the kernel can report.
#[derive(Debug, Error)]
pub enum KernelError {
    /// Authorization or admission-token checks failed before execution.
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    /// The request could not be canonicalized.
    #[error(transparent)]
    Canonicalization(#[from] RequestCanonicalizationError),

    /// The live request does not match the admitted one. Raised before
    /// any step runs.
    #[error("request fingerprint mismatch: token {token}, computed {computed}")]
    FingerprintMismatch {
        /// Fingerprint carried by the admission token.
        token: String,
        /// Fingerprint recomputed from the live inputs.
        computed: String,
    },

    /// A step could not be dispatched.
    #[error(transparent)]
    StepExecution(#[from] StepExecutionError),

    /// Repair needs explicit authority grants.
    #[error(transparent)]
    ApprovalRequired(#[from] EprApprovalRequired),

    /// A closure guardrail was violated.
    #[error(transparent)]
    Closure(#[from] TaskClosureError),

    /// An unknown prerequisite blocks execution.
    #[error(transparent)]
    UnknownPrerequisite(#[from] UnknownPrerequisiteError),

    /// The closure loop detected non-convergence.
    #[error(transparent)]
    Exhausted(#[from] TaskExhausted),

    /// A persisted execution record diverged on reload.
    #[error(transparent)]
    Snapshot(#[from] SnapshotDivergenceError),

    /// Identity drift was detected or could not be enforced.
    #[error(transparent)]
    Drift(#[from] IdentityError),

    /// The audit chain could not be written or read.
    #[error(transparent)]
    Audit(#[from] AuditError),
}

impl From<ClosureError> for KernelError {
    fn from(err: ClosureError) -> Self {
        match err {
            ClosureError::Violation(inner) => Self::Closure(inner),
            ClosureError::ApprovalRequired(inner) => Self::ApprovalRequired(inner),
            ClosureError::Unknown(inner) => Self::UnknownPrerequisite(inner),
            ClosureError::Exhausted(inner) => Self::Exhausted(inner),
        }
    }
}
