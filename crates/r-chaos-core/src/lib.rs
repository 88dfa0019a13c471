//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Chaos experiment orchestrator core."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Runs controlled fault-injection experiments through a fixed phase
//! sequence (preparation, fault injection, observation, recovery,
//! validation) under a safety guard with an emergency stop latch.

pub mod analyzer;
pub mod cooldown;
pub mod error;
pub mod events;
pub mod experiment;
pub mod faults;
pub mod metrics;
pub mod orchestrator;
pub mod probe;
pub mod recovery;
pub mod safety;

pub use analyzer::{
    BehaviorAnalysis, RecoveryValidation, RegressionAnalyzer, RegressionReport, ResilienceLevel,
};
pub use error::{ChaosError, ExperimentResult, FaultError, ProbeError, RejectReason};
pub use events::ExperimentEvent;
pub use experiment::{
    ExperimentId, ExperimentRecord, ExperimentStatus, HealthStatus, MetricsSnapshot, PhaseName,
    PhaseRecord, PhaseStatus, ServiceHealth,
};
pub use faults::{
    CommandRunner, FaultController, FaultEffect, FaultHandle, FaultRegistry, FaultSummary,
    SystemCommandRunner,
};
pub use metrics::ExperimentMetrics;
pub use orchestrator::{ActiveExperiment, ChaosOrchestrator, OrchestratorHandle, OrchestratorStatus};
pub use probe::{HttpMetricsProbe, ResourceSampler, ResourceUsage, SysinfoSampler, SystemProbe};
pub use recovery::{RecoveryActions, RecoveryActionsReport};
pub use safety::{EmergencyReason, SafetyGuard};

/// Crate prelude collecting the types needed to drive experiments.
pub mod prelude {
    pub use super::error::{ChaosError, ExperimentResult, RejectReason};
    pub use super::experiment::{ExperimentRecord, ExperimentStatus, MetricsSnapshot, PhaseName};
    pub use super::faults::{FaultRegistry, SystemCommandRunner};
    pub use super::orchestrator::{ChaosOrchestrator, OrchestratorHandle};
    pub use super::probe::{HttpMetricsProbe, SystemProbe};
    pub use super::safety::EmergencyReason;
}
