//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Lifecycle events broadcast to orchestrator subscribers."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use r_chaos_common::ExperimentType;
use serde::Serialize;

use crate::experiment::{ExperimentId, ExperimentStatus, PhaseName};
use crate::safety::EmergencyReason;

/// Broadcast channel capacity; slow subscribers observe `Lagged`.
pub const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ExperimentEvent {
    Started {
        id: ExperimentId,
        experiment_type: ExperimentType,
    },
    PhaseStarted {
        id: ExperimentId,
        phase: PhaseName,
    },
    PhaseCompleted {
        id: ExperimentId,
        phase: PhaseName,
    },
    PhaseFailed {
        id: ExperimentId,
        phase: PhaseName,
        error: String,
    },
    Observation {
        id: ExperimentId,
        index: usize,
        error_rate: f64,
        response_time_ms: Option<f64>,
    },
    Finished {
        id: ExperimentId,
        status: ExperimentStatus,
    },
    EmergencyStop {
        reason: EmergencyReason,
        active: Vec<ExperimentId>,
    },
    EmergencyReset,
}

impl ExperimentEvent {
    pub fn experiment_id(&self) -> Option<&ExperimentId> {
        match self {
            ExperimentEvent::Started { id, .. }
            | ExperimentEvent::PhaseStarted { id, .. }
            | ExperimentEvent::PhaseCompleted { id, .. }
            | ExperimentEvent::PhaseFailed { id, .. }
            | ExperimentEvent::Observation { id, .. }
            | ExperimentEvent::Finished { id, .. } => Some(id),
            ExperimentEvent::EmergencyStop { .. } | ExperimentEvent::EmergencyReset => None,
        }
    }
}
