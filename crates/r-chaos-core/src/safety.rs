//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Pre-flight admission checks and emergency-stop conditions."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::time::Duration;

use r_chaos_common::{ExperimentConfig, SafetyConfig};
use serde::{Deserialize, Serialize};

use crate::error::RejectReason;
use crate::experiment::MetricsSnapshot;

/// Why the emergency stop latch was set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EmergencyReason {
    ErrorRate { observed: f64, threshold: f64 },
    MemoryUsage { observed: f64, threshold: f64 },
    UnhealthyServices { services: Vec<String>, threshold: usize },
    RecoveryFailure { experiment: String },
    Operator { reason: String },
    TaskAborted { experiment: String },
}

impl EmergencyReason {
    pub fn label(&self) -> &'static str {
        match self {
            EmergencyReason::ErrorRate { .. } => "error_rate",
            EmergencyReason::MemoryUsage { .. } => "memory",
            EmergencyReason::UnhealthyServices { .. } => "unhealthy_services",
            EmergencyReason::RecoveryFailure { .. } => "recovery_failure",
            EmergencyReason::Operator { .. } => "operator",
            EmergencyReason::TaskAborted { .. } => "task_aborted",
        }
    }
}

impl fmt::Display for EmergencyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmergencyReason::ErrorRate { observed, threshold } => {
                write!(f, "error rate {observed:.1}% above {threshold:.1}%")
            }
            EmergencyReason::MemoryUsage { observed, threshold } => {
                write!(f, "memory usage {observed:.1}% above {threshold:.1}%")
            }
            EmergencyReason::UnhealthyServices { services, threshold } => write!(
                f,
                "{} essential services unhealthy ({}), limit {threshold}",
                services.len(),
                services.join(", ")
            ),
            EmergencyReason::RecoveryFailure { experiment } => {
                write!(f, "recovery of {experiment} failed")
            }
            EmergencyReason::Operator { reason } => write!(f, "operator request: {reason}"),
            EmergencyReason::TaskAborted { experiment } => {
                write!(f, "experiment task {experiment} aborted")
            }
        }
    }
}

/// Stateless policy checks over health snapshots.
#[derive(Debug, Clone)]
pub struct SafetyGuard {
    config: SafetyConfig,
    max_duration: Duration,
}

impl SafetyGuard {
    pub fn new(config: SafetyConfig, max_duration: Duration) -> Self {
        Self {
            config,
            max_duration,
        }
    }

    /// Admission policy for a new experiment against the latest snapshot.
    pub fn preflight_check(
        &self,
        config: &ExperimentConfig,
        snapshot: &MetricsSnapshot,
    ) -> Result<(), RejectReason> {
        if config.duration > self.max_duration {
            return Err(RejectReason::DurationExceeded {
                requested: config.duration,
                max: self.max_duration,
            });
        }
        if let Some(service) = snapshot.unhealthy_essential().next() {
            return Err(RejectReason::UnhealthyService {
                service: service.name.clone(),
            });
        }
        if snapshot.memory_usage > self.config.preflight_memory_ceiling {
            return Err(RejectReason::ResourceCeiling {
                resource: "memory",
                usage: snapshot.memory_usage,
                ceiling: self.config.preflight_memory_ceiling,
            });
        }
        if snapshot.cpu_usage > self.config.preflight_cpu_ceiling {
            return Err(RejectReason::ResourceCeiling {
                resource: "cpu",
                usage: snapshot.cpu_usage,
                ceiling: self.config.preflight_cpu_ceiling,
            });
        }
        Ok(())
    }

    /// Returns the first tripped emergency condition, if any.
    pub fn poll_emergency_conditions(&self, snapshot: &MetricsSnapshot) -> Option<EmergencyReason> {
        if snapshot.error_rate > self.config.emergency_error_rate {
            return Some(EmergencyReason::ErrorRate {
                observed: snapshot.error_rate,
                threshold: self.config.emergency_error_rate,
            });
        }
        if snapshot.memory_usage > self.config.emergency_memory {
            return Some(EmergencyReason::MemoryUsage {
                observed: snapshot.memory_usage,
                threshold: self.config.emergency_memory,
            });
        }
        let unhealthy: Vec<String> = snapshot
            .unhealthy_essential()
            .map(|s| s.name.clone())
            .collect();
        if unhealthy.len() >= self.config.emergency_unhealthy_services {
            return Some(EmergencyReason::UnhealthyServices {
                services: unhealthy,
                threshold: self.config.emergency_unhealthy_services,
            });
        }
        None
    }
}
