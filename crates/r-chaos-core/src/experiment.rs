//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Experiment records, phases, and health snapshots."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use r_chaos_common::{ExperimentConfig, ExperimentType};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::analyzer::{BehaviorAnalysis, RecoveryValidation, RegressionReport};
use crate::faults::{FaultHandle, FaultSummary};
use crate::recovery::RecoveryActionsReport;

/// Unique experiment identifier of the form `<type>-<epoch millis>-<suffix>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExperimentId(String);

impl ExperimentId {
    pub fn generate(experiment_type: ExperimentType, at: DateTime<Utc>) -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(|b| char::from(b).to_ascii_lowercase())
            .collect();
        Self(format!(
            "{}-{}-{}",
            experiment_type.as_str(),
            at.timestamp_millis(),
            suffix
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of an experiment. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Pending => "pending",
            ExperimentStatus::Running => "running",
            ExperimentStatus::Completed => "completed",
            ExperimentStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExperimentStatus::Completed | ExperimentStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            ExperimentStatus::Pending => 0,
            ExperimentStatus::Running => 1,
            ExperimentStatus::Completed | ExperimentStatus::Failed => 2,
        }
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The five phases every experiment passes through, in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseName {
    Preparation,
    FaultInjection,
    Observation,
    Recovery,
    Validation,
}

impl PhaseName {
    pub const ORDER: [PhaseName; 5] = [
        PhaseName::Preparation,
        PhaseName::FaultInjection,
        PhaseName::Observation,
        PhaseName::Recovery,
        PhaseName::Validation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseName::Preparation => "preparation",
            PhaseName::FaultInjection => "fault-injection",
            PhaseName::Observation => "observation",
            PhaseName::Recovery => "recovery",
            PhaseName::Validation => "validation",
        }
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseRecord {
    pub name: PhaseName,
    pub status: PhaseStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Health verdict for a single probed endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    /// No probe was possible (endpoint has no URL configured).
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub name: String,
    pub essential: bool,
    pub status: HealthStatus,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub latency_ms: Option<f64>,
}

impl ServiceHealth {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            essential: true,
            status: HealthStatus::Healthy,
            status_code: Some(200),
            latency_ms: None,
        }
    }

    pub fn unhealthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            essential: true,
            status: HealthStatus::Unhealthy,
            status_code: None,
            latency_ms: None,
        }
    }
}

/// Point-in-time view of system health.
///
/// `response_time_ms` is `None` when no probe succeeded; consumers must treat
/// that as "undetermined" rather than zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub response_time_ms: Option<f64>,
    /// Successful probe responses per second of sampling.
    pub throughput: f64,
    /// Percentage of failed probes, 0..=100.
    pub error_rate: f64,
    /// Host memory usage percentage, 0..=100.
    pub memory_usage: f64,
    /// Host CPU usage percentage, 0..=100.
    pub cpu_usage: f64,
    #[serde(default)]
    pub services: Vec<ServiceHealth>,
}

impl MetricsSnapshot {
    /// Snapshot with no load, no errors, and no services.
    pub fn idle(captured_at: DateTime<Utc>) -> Self {
        Self {
            captured_at,
            response_time_ms: None,
            throughput: 0.0,
            error_rate: 0.0,
            memory_usage: 0.0,
            cpu_usage: 0.0,
            services: Vec::new(),
        }
    }

    /// Essential services reported as unhealthy.
    pub fn unhealthy_essential(&self) -> impl Iterator<Item = &ServiceHealth> {
        self.services
            .iter()
            .filter(|s| s.essential && s.status == HealthStatus::Unhealthy)
    }

    /// Every service reported as unhealthy, essential or not.
    pub fn unhealthy_count(&self) -> usize {
        self.services
            .iter()
            .filter(|s| s.status == HealthStatus::Unhealthy)
            .count()
    }
}

/// Serializable outcome of one experiment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentRecord {
    pub id: ExperimentId,
    pub experiment_type: ExperimentType,
    pub config: ExperimentConfig,
    pub status: ExperimentStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub phases: Vec<PhaseRecord>,
    #[serde(default)]
    pub pre_snapshot: Option<MetricsSnapshot>,
    #[serde(default)]
    pub post_snapshot: Option<MetricsSnapshot>,
    #[serde(default)]
    pub observations: Vec<MetricsSnapshot>,
    #[serde(default)]
    pub fault: Option<FaultSummary>,
    /// The fault was simulated rather than applied to the host.
    #[serde(default)]
    pub simulated: bool,
    #[serde(default)]
    pub recovery_actions: Option<RecoveryActionsReport>,
    #[serde(default)]
    pub behavior_analysis: Option<BehaviorAnalysis>,
    #[serde(default)]
    pub recovery_validation: Option<RecoveryValidation>,
    #[serde(default)]
    pub regression: Option<RegressionReport>,
    #[serde(default)]
    pub emergency_stop: Option<String>,
    #[serde(default)]
    pub manual_intervention_required: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExperimentRecord {
    pub fn phase(&self, name: PhaseName) -> Option<&PhaseRecord> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn phase_names(&self) -> Vec<PhaseName> {
        self.phases.iter().map(|p| p.name).collect()
    }
}

/// Mutable run state owned by the task executing one experiment.
#[derive(Debug)]
pub(crate) struct Experiment {
    pub(crate) record: ExperimentRecord,
    pub(crate) handle: Option<FaultHandle>,
    phase_started: Option<Instant>,
}

impl Experiment {
    pub(crate) fn new(
        id: ExperimentId,
        experiment_type: ExperimentType,
        config: ExperimentConfig,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            record: ExperimentRecord {
                id,
                experiment_type,
                config,
                status: ExperimentStatus::Pending,
                started_at,
                finished_at: None,
                phases: Vec::with_capacity(PhaseName::ORDER.len()),
                pre_snapshot: None,
                post_snapshot: None,
                observations: Vec::new(),
                fault: None,
                simulated: false,
                recovery_actions: None,
                behavior_analysis: None,
                recovery_validation: None,
                regression: None,
                emergency_stop: None,
                manual_intervention_required: false,
                error: None,
            },
            handle: None,
            phase_started: None,
        }
    }

    pub(crate) fn id(&self) -> &ExperimentId {
        &self.record.id
    }

    /// Move the status forward; backwards transitions are ignored.
    pub(crate) fn advance_status(&mut self, status: ExperimentStatus) {
        if status.rank() > self.record.status.rank() {
            self.record.status = status;
        }
    }

    pub(crate) fn begin_phase(&mut self, name: PhaseName, at: DateTime<Utc>, now: Instant) {
        debug_assert!(
            self.record
                .phases
                .last()
                .map(|last| last.name < name && last.status != PhaseStatus::Running)
                .unwrap_or(true),
            "phase {name} started out of order"
        );
        self.record.phases.push(PhaseRecord {
            name,
            status: PhaseStatus::Running,
            started_at: at,
            ended_at: None,
            error: None,
        });
        self.phase_started = Some(now);
    }

    /// Close the running phase, returning its name and elapsed time.
    pub(crate) fn end_phase(
        &mut self,
        at: DateTime<Utc>,
        now: Instant,
        error: Option<String>,
    ) -> Option<(PhaseName, std::time::Duration)> {
        let elapsed = self
            .phase_started
            .take()
            .map(|started| now.saturating_duration_since(started))
            .unwrap_or_default();
        let phase = self
            .record
            .phases
            .last_mut()
            .filter(|p| p.status == PhaseStatus::Running)?;
        phase.ended_at = Some(at);
        phase.status = if error.is_some() {
            PhaseStatus::Failed
        } else {
            PhaseStatus::Completed
        };
        phase.error = error;
        Some((phase.name, elapsed))
    }

    /// Record the injected fault. An experiment carries at most one handle.
    pub(crate) fn attach_fault(&mut self, handle: FaultHandle) {
        debug_assert!(self.handle.is_none(), "experiment already holds a fault");
        self.record.simulated = handle.is_simulated();
        self.record.fault = Some(handle.summary());
        self.handle = Some(handle);
    }

    /// Drop the handle once its fault has been reverted.
    pub(crate) fn release_fault(&mut self) {
        if self.handle.take().is_some() {
            if let Some(summary) = self.record.fault.as_mut() {
                summary.released = true;
            }
        }
    }

    pub(crate) fn into_record(self) -> ExperimentRecord {
        self.record
    }
}
