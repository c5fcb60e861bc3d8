//! Kernel configuration.
//!
//! All ambient inputs are resolved once, up front, into a [`KernelConfig`]
//! that the kernel constructor takes by value. Nothing reads the
//! environment after construction, so two kernels built from equal
//! configs behave identically regardless of what the environment does
//! mid-run.

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Environment variable naming the audit log directory root.
pub const LOG_DIR_ENV: &str = "SENTIENTOS_LOG_DIR";
/// Environment variable bounding closure loop iterations.
pub const MAX_CLOSURE_ITERATIONS_ENV: &str = "SENTIENTOS_MAX_CLOSURE_ITERATIONS";
/// Environment variable bounding repair actions per task.
pub const MAX_EPR_ACTIONS_ENV: &str = "SENTIENTOS_MAX_EPR_ACTIONS_PER_TASK";
/// Environment variable bounding unknown-resolution cycles.
pub const MAX_UNKNOWN_CYCLES_ENV: &str = "SENTIENTOS_MAX_UNKNOWN_RESOLUTION_CYCLES";

/// Bounds that make the closure loop provably terminating.
///
/// Exceeding any bound is positive non-convergence detection, reported
/// as exhaustion; the loop never spins and never silently gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosureLimits {
    /// Maximum assessment/repair iterations per failing step.
    pub max_closure_iterations: u32,
    /// Maximum repair actions invoked across one task run.
    pub max_epr_actions_per_task: u32,
    /// Maximum resolved-unknown cycles consumed per task run.
    pub max_unknown_resolution_cycles: u32,
}

impl Default for ClosureLimits {
    fn default() -> Self {
        Self {
            max_closure_iterations: 8,
            max_epr_actions_per_task: 8,
            max_unknown_resolution_cycles: 2,
        }
    }
}

impl ClosureLimits {
    /// Reads limits from the environment, falling back to defaults for
    /// unset or unparsable values.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_closure_iterations: env_u32(
                MAX_CLOSURE_ITERATIONS_ENV,
                defaults.max_closure_iterations,
            ),
            max_epr_actions_per_task: env_u32(
                MAX_EPR_ACTIONS_ENV,
                defaults.max_epr_actions_per_task,
            ),
            max_unknown_resolution_cycles: env_u32(
                MAX_UNKNOWN_CYCLES_ENV,
                defaults.max_unknown_resolution_cycles,
            ),
        }
    }
}

/// Configuration for one kernel instance.
///
/// Created once per process or run and never mutated afterwards; the
/// audit log destination is fixed for the kernel's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Directory under which audit logs are written.
    pub log_dir: PathBuf,
    /// Closure loop bounds.
    pub closure_limits: ClosureLimits,
}

impl KernelConfig {
    /// Builds a config with explicit values.
    #[must_use]
    pub fn new(log_dir: impl Into<PathBuf>, closure_limits: ClosureLimits) -> Self {
        Self {
            log_dir: log_dir.into(),
            closure_limits,
        }
    }

    /// Builds a config from the environment. The log directory defaults
    /// to `logs/` under the working directory when unset.
    #[must_use]
    pub fn from_env() -> Self {
        let log_dir = env::var(LOG_DIR_ENV)
            .map_or_else(|_| PathBuf::from("logs"), PathBuf::from);
        Self {
            log_dir,
            closure_limits: ClosureLimits::from_env(),
        }
    }

    /// Path of a named audit log under the configured root.
    #[must_use]
    pub fn audit_log_path(&self, name: impl AsRef<Path>) -> PathBuf {
        self.log_dir.join(name)
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}
