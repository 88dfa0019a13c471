//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Error taxonomy for experiment execution and fault control."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use r_chaos_common::ExperimentType;
use thiserror::Error;

use crate::experiment::{ExperimentId, ExperimentRecord, PhaseName};

/// Outcome of a single `run_experiment` call.
pub type ExperimentResult = std::result::Result<ExperimentRecord, ChaosError>;

/// Why an experiment was refused before any fault was applied.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RejectReason {
    #[error("emergency stop active ({reason}); reset required before new experiments")]
    EmergencyStopActive { reason: String },
    #[error("concurrency limit reached: {running} of {limit} experiments running")]
    ConcurrencyLimit { running: usize, limit: usize },
    #[error("target '{target}' is cooling down for another {}ms", .remaining.as_millis())]
    Cooldown { target: String, remaining: Duration },
    #[error("requested duration {}ms exceeds the {}ms maximum", .requested.as_millis(), .max.as_millis())]
    DurationExceeded { requested: Duration, max: Duration },
    #[error("essential service '{service}' is unhealthy")]
    UnhealthyService { service: String },
    #[error("{resource} usage {usage:.1}% exceeds pre-flight ceiling {ceiling:.1}%")]
    ResourceCeiling {
        resource: &'static str,
        usage: f64,
        ceiling: f64,
    },
    #[error("pre-flight health sample failed: {0}")]
    ProbeUnavailable(String),
    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

impl RejectReason {
    /// Low-cardinality label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            RejectReason::EmergencyStopActive { .. } => "emergency_stop",
            RejectReason::ConcurrencyLimit { .. } => "concurrency_limit",
            RejectReason::Cooldown { .. } => "cooldown",
            RejectReason::DurationExceeded { .. } => "duration",
            RejectReason::UnhealthyService { .. } => "unhealthy_service",
            RejectReason::ResourceCeiling { .. } => "resource_ceiling",
            RejectReason::ProbeUnavailable(_) => "probe_unavailable",
            RejectReason::ShuttingDown => "shutting_down",
        }
    }
}

/// Failure reported by a health probe or resource sampler.
#[derive(Debug, Clone, Error)]
pub enum ProbeError {
    #[error("resource sampling failed: {0}")]
    Resources(String),
    #[error("probe unavailable: {0}")]
    Unavailable(String),
}

/// Failure reported by a fault controller.
#[derive(Debug, Error)]
pub enum FaultError {
    /// The fault (or the rule backing it) no longer exists.
    #[error("fault already reverted: {0}")]
    NotFound(String),
    #[error("`{command}` exited with status {status:?}: {stderr}")]
    Command {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("invalid fault configuration: {0}")]
    InvalidConfig(String),
    #[error("handle for {actual} passed to the {expected} controller")]
    WrongHandle {
        expected: ExperimentType,
        actual: ExperimentType,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FaultError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FaultError::NotFound(_))
    }
}

/// Errors surfaced by the orchestrator API.
///
/// Every variant raised after admission carries the finished record, so
/// callers always see what was attempted and what was cleaned up.
#[derive(Debug, Error)]
pub enum ChaosError {
    #[error("{experiment_type} experiment rejected: {reason}")]
    RejectedStart {
        experiment_type: ExperimentType,
        reason: RejectReason,
    },
    #[error("experiment {id} failed during {phase}: {message}")]
    PhaseFailure {
        id: ExperimentId,
        phase: PhaseName,
        message: String,
        record: Box<ExperimentRecord>,
    },
    #[error("experiment {id} could not inject its fault: {message}")]
    InjectionFailure {
        id: ExperimentId,
        message: String,
        record: Box<ExperimentRecord>,
    },
    #[error("experiment {id} could not be recovered, manual intervention required: {message}")]
    RecoveryFailure {
        id: ExperimentId,
        message: String,
        record: Box<ExperimentRecord>,
    },
    #[error("experiment {id} task aborted: {message}")]
    Aborted { id: ExperimentId, message: String },
    #[error("baseline capture failed: {0}")]
    Baseline(#[source] ProbeError),
}

impl ChaosError {
    /// The finished record, when the experiment got past admission.
    pub fn record(&self) -> Option<&ExperimentRecord> {
        match self {
            ChaosError::PhaseFailure { record, .. }
            | ChaosError::InjectionFailure { record, .. }
            | ChaosError::RecoveryFailure { record, .. } => Some(record.as_ref()),
            _ => None,
        }
    }

    pub fn reject_reason(&self) -> Option<&RejectReason> {
        match self {
            ChaosError::RejectedStart { reason, .. } => Some(reason),
            _ => None,
        }
    }
}
