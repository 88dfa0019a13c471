//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Fault controller contract, handles, and the per-type registry."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Fault controllers apply and revert one category of fault each.
//!
//! Host-level controllers shell out through a [`CommandRunner`]; when the
//! platform or tool is unavailable they hand back a *simulated* handle so the
//! experiment still runs end to end without touching the host.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use r_chaos_common::{AppConfig, ExperimentConfig, ExperimentType};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::FaultError;

pub mod command;
pub mod database;
pub mod filesystem;
pub mod network;
pub mod resource;
#[cfg(any(test, feature = "test-support"))]
pub mod scripted;
pub mod service;

pub use command::{CommandOutput, CommandRunner, SystemCommandRunner};
pub use database::DatabaseFailureController;
pub use filesystem::FileSystemChaosController;
pub use network::{NetworkLatencyController, NetworkPartitionController};
pub use resource::ResourceExhaustionController;
#[cfg(any(test, feature = "test-support"))]
pub use scripted::{ScriptedCommandRunner, ScriptedResponse};
pub use service::ServiceFailureController;

/// What a controller changed, with enough detail to undo it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FaultEffect {
    NetworkDelay {
        interfaces: Vec<String>,
        delay_ms: u64,
        jitter_ms: u64,
    },
    PacketFilter {
        ports: Vec<u16>,
    },
    ResourceLoad {
        load_id: u64,
        cpu_workers: usize,
        memory_mb: u64,
    },
    ServicesStopped {
        stopped: Vec<String>,
        simulated: Vec<String>,
    },
    FileSystem {
        changes: Vec<FileSystemChange>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum FileSystemChange {
    ReadOnly {
        path: PathBuf,
        original_mode: Option<u32>,
        was_readonly: bool,
    },
    Fill {
        path: PathBuf,
        bytes: u64,
    },
}

/// Opaque token returned by `inject` and consumed by `recover`.
///
/// Deliberately not `Clone`: exactly one owner is responsible for reverting it.
#[derive(Debug)]
pub struct FaultHandle {
    experiment_type: ExperimentType,
    injected_at: DateTime<Utc>,
    simulated: Option<String>,
    effect: FaultEffect,
}

impl FaultHandle {
    pub fn applied(experiment_type: ExperimentType, effect: FaultEffect) -> Self {
        Self {
            experiment_type,
            injected_at: Utc::now(),
            simulated: None,
            effect,
        }
    }

    /// A handle for a fault that was described but not applied to the host.
    pub fn simulated(
        experiment_type: ExperimentType,
        effect: FaultEffect,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            experiment_type,
            injected_at: Utc::now(),
            simulated: Some(reason.into()),
            effect,
        }
    }

    pub fn experiment_type(&self) -> ExperimentType {
        self.experiment_type
    }

    pub fn effect(&self) -> &FaultEffect {
        &self.effect
    }

    pub fn is_simulated(&self) -> bool {
        self.simulated.is_some()
    }

    pub fn summary(&self) -> FaultSummary {
        FaultSummary {
            experiment_type: self.experiment_type,
            injected_at: self.injected_at,
            simulated: self.is_simulated(),
            simulation_reason: self.simulated.clone(),
            effect: self.effect.clone(),
            released: false,
        }
    }

    /// Reject handles minted by a different controller.
    pub(crate) fn expect_type(&self, expected: ExperimentType) -> Result<(), FaultError> {
        if self.experiment_type == expected {
            Ok(())
        } else {
            Err(FaultError::WrongHandle {
                expected,
                actual: self.experiment_type,
            })
        }
    }
}

/// Serializable description of a fault for experiment records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultSummary {
    pub experiment_type: ExperimentType,
    pub injected_at: DateTime<Utc>,
    pub simulated: bool,
    #[serde(default)]
    pub simulation_reason: Option<String>,
    pub effect: FaultEffect,
    /// Set once the fault has been reverted.
    pub released: bool,
}

/// Applies and reverts one category of fault.
///
/// `recover` must be idempotent: reverting a fault that is already gone
/// (rule removed by hand, process already restarted) succeeds.
#[async_trait]
pub trait FaultController: Send + Sync + fmt::Debug {
    fn experiment_type(&self) -> ExperimentType;

    async fn inject(&self, config: &ExperimentConfig) -> Result<FaultHandle, FaultError>;

    async fn recover(&self, handle: &FaultHandle) -> Result<(), FaultError>;

    /// Best-effort revert used during an emergency stop. Never fails.
    async fn emergency_recover(&self, handle: &FaultHandle) {
        if let Err(err) = self.recover(handle).await {
            error!(
                target: "r_chaos::faults",
                experiment_type = %handle.experiment_type(),
                error = %err,
                "emergency recovery could not revert fault; continuing"
            );
        }
    }
}

/// Controllers keyed by the fault category they handle.
#[derive(Clone, Default)]
pub struct FaultRegistry {
    controllers: IndexMap<ExperimentType, Arc<dyn FaultController>>,
}

impl fmt::Debug for FaultRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultRegistry")
            .field("types", &self.controllers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FaultRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a controller, replacing any previous one for the same type.
    pub fn register(&mut self, controller: Arc<dyn FaultController>) -> &mut Self {
        let ty = controller.experiment_type();
        if self.controllers.insert(ty, controller).is_some() {
            warn!(target: "r_chaos::faults", experiment_type = %ty, "replaced fault controller");
        }
        self
    }

    pub fn with(mut self, controller: Arc<dyn FaultController>) -> Self {
        self.register(controller);
        self
    }

    pub fn get(&self, experiment_type: ExperimentType) -> Option<Arc<dyn FaultController>> {
        self.controllers.get(&experiment_type).cloned()
    }

    pub fn types(&self) -> impl Iterator<Item = ExperimentType> + '_ {
        self.controllers.keys().copied()
    }

    /// Controllers for every fault category, acting on this host through `runner`.
    pub fn platform(config: &AppConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self::new()
            .with(Arc::new(NetworkLatencyController::new(runner.clone())))
            .with(Arc::new(NetworkPartitionController::new(runner.clone())))
            .with(Arc::new(ResourceExhaustionController::new()))
            .with(Arc::new(ServiceFailureController::new(
                runner.clone(),
                config.services.clone(),
            )))
            .with(Arc::new(DatabaseFailureController::new(runner)))
            .with(Arc::new(FileSystemChaosController::new()))
    }
}

/// Whether host-level network and service faults can be applied here.
pub(crate) fn host_faults_supported() -> bool {
    cfg!(target_os = "linux")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_registry_covers_every_type() {
        let registry = FaultRegistry::platform(
            &AppConfig::default(),
            Arc::new(ScriptedCommandRunner::new()),
        );
        for ty in ExperimentType::all() {
            let controller = registry.get(ty).expect("controller registered");
            assert_eq!(controller.experiment_type(), ty);
        }
    }

    #[test]
    fn summary_starts_unreleased() {
        let handle = FaultHandle::simulated(
            ExperimentType::NetworkPartition,
            FaultEffect::PacketFilter { ports: vec![3000] },
            "iptables not installed",
        );
        let summary = handle.summary();
        assert!(summary.simulated);
        assert!(!summary.released);
        assert_eq!(summary.simulation_reason.as_deref(), Some("iptables not installed"));
        assert!(handle.expect_type(ExperimentType::NetworkLatency).is_err());
    }
}
