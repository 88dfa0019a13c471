//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "In-process CPU and memory pressure for resource exhaustion experiments."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::hint::black_box;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use async_trait::async_trait;
use parking_lot::Mutex;
use r_chaos_common::{ExperimentConfig, ExperimentType};
use tracing::{debug, info};

use super::{FaultController, FaultEffect, FaultHandle};
use crate::error::FaultError;

const MAX_MEMORY_MB: u64 = 8 * 1024;
const BALLAST_FILL: u8 = 0xA5;

struct ResourceLoad {
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    ballast: Vec<u8>,
}

/// Burns CPU on dedicated OS threads and pins a memory ballast.
///
/// Targets select the pressure: `cpu` spins `ceil(cores * magnitude / 100)`
/// threads (or `cpu_workers`), `memory` allocates `memory_mb` megabytes.
#[derive(Debug, Default)]
pub struct ResourceExhaustionController {
    loads: Mutex<HashMap<u64, ResourceLoad>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for ResourceLoad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLoad")
            .field("workers", &self.workers.len())
            .field("ballast_bytes", &self.ballast.len())
            .finish()
    }
}

impl ResourceExhaustionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of loads currently applied.
    pub fn active_loads(&self) -> usize {
        self.loads.lock().len()
    }

    fn worker_count(config: &ExperimentConfig) -> Result<usize, FaultError> {
        let cores = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        if let Some(raw) = config.param("cpu_workers") {
            let workers = raw.trim().parse::<usize>().map_err(|_| {
                FaultError::InvalidConfig(format!("cpu_workers '{raw}' is not a count"))
            })?;
            return Ok(workers.min(cores * 4));
        }
        let share = config.magnitude.clamp(0.0, 100.0) / 100.0;
        let workers = (cores as f64 * share).ceil() as usize;
        Ok(workers.clamp(usize::from(share > 0.0), cores))
    }

    fn spawn_workers(count: usize, stop: &Arc<AtomicBool>) -> Result<Vec<JoinHandle<()>>, FaultError> {
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let worker_stop = Arc::clone(stop);
            let spawned = thread::Builder::new()
                .name(format!("chaos-cpu-{index}"))
                .spawn(move || {
                    let mut acc: u64 = 0;
                    while !worker_stop.load(Ordering::Relaxed) {
                        for i in 0..10_000u64 {
                            acc = black_box(acc.wrapping_mul(31).wrapping_add(i));
                        }
                    }
                    black_box(acc);
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    stop.store(true, Ordering::Relaxed);
                    for worker in workers {
                        let _ = worker.join();
                    }
                    return Err(FaultError::Io(err));
                }
            }
        }
        Ok(workers)
    }

    async fn release(load: ResourceLoad) -> Result<(), FaultError> {
        load.stop.store(true, Ordering::Relaxed);
        let ResourceLoad {
            workers, ballast, ..
        } = load;
        drop(ballast);
        tokio::task::spawn_blocking(move || {
            for worker in workers {
                let _ = worker.join();
            }
        })
        .await
        .map_err(|err| FaultError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))
    }
}

#[async_trait]
impl FaultController for ResourceExhaustionController {
    fn experiment_type(&self) -> ExperimentType {
        ExperimentType::ResourceExhaustion
    }

    async fn inject(&self, config: &ExperimentConfig) -> Result<FaultHandle, FaultError> {
        let wants = |name: &str| config.targets.iter().any(|t| t.eq_ignore_ascii_case(name));
        if !wants("cpu") && !wants("memory") {
            return Err(FaultError::InvalidConfig(
                "resource exhaustion targets must include 'cpu' or 'memory'".into(),
            ));
        }

        let cpu_workers = if wants("cpu") {
            Self::worker_count(config)?
        } else {
            0
        };
        let memory_mb = if wants("memory") {
            let requested = config
                .param_u64("memory_mb", 128)
                .map_err(|err| FaultError::InvalidConfig(err.to_string()))?;
            if requested > MAX_MEMORY_MB {
                return Err(FaultError::InvalidConfig(format!(
                    "memory_mb {requested} exceeds the {MAX_MEMORY_MB}MB cap"
                )));
            }
            requested
        } else {
            0
        };

        let stop = Arc::new(AtomicBool::new(false));
        let workers = Self::spawn_workers(cpu_workers, &stop)?;
        let ballast = vec![BALLAST_FILL; (memory_mb as usize) * 1024 * 1024];

        let load_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.loads.lock().insert(
            load_id,
            ResourceLoad {
                stop,
                workers,
                ballast,
            },
        );
        info!(
            target: "r_chaos::faults::resource",
            load_id,
            cpu_workers,
            memory_mb,
            "resource pressure applied"
        );
        Ok(FaultHandle::applied(
            self.experiment_type(),
            FaultEffect::ResourceLoad {
                load_id,
                cpu_workers,
                memory_mb,
            },
        ))
    }

    async fn recover(&self, handle: &FaultHandle) -> Result<(), FaultError> {
        handle.expect_type(self.experiment_type())?;
        let FaultEffect::ResourceLoad { load_id, .. } = handle.effect() else {
            return Err(FaultError::InvalidConfig("resource handle without load".into()));
        };
        let load = self.loads.lock().remove(load_id);
        match load {
            Some(load) => {
                Self::release(load).await?;
                info!(target: "r_chaos::faults::resource", load_id, "resource pressure released");
            }
            None => {
                debug!(target: "r_chaos::faults::resource", load_id, "resource load already released");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use r_chaos_common::ExperimentOverrides;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cpu_and_memory_load_is_released_once() {
        let controller = ResourceExhaustionController::new();
        let config = ExperimentConfig::defaults_for(ExperimentType::ResourceExhaustion).merged(
            &ExperimentOverrides::default()
                .with_parameter("cpu_workers", "1")
                .with_parameter("memory_mb", "4"),
        );
        let handle = controller.inject(&config).await.unwrap();
        assert_eq!(controller.active_loads(), 1);
        match handle.effect() {
            FaultEffect::ResourceLoad {
                cpu_workers,
                memory_mb,
                ..
            } => {
                assert_eq!(*cpu_workers, 1);
                assert_eq!(*memory_mb, 4);
            }
            other => panic!("unexpected effect {other:?}"),
        }
        controller.recover(&handle).await.unwrap();
        controller.recover(&handle).await.unwrap();
        assert_eq!(controller.active_loads(), 0);
    }

    #[test]
    fn workers_share_the_caller_stop_flag() {
        let stop = Arc::new(AtomicBool::new(false));
        let workers = ResourceExhaustionController::spawn_workers(2, &stop).unwrap();
        assert_eq!(workers.len(), 2);
        assert_eq!(Arc::strong_count(&stop), 3);
        stop.store(true, Ordering::Relaxed);
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(Arc::strong_count(&stop), 1);
    }

    #[tokio::test]
    async fn memory_only_load_spawns_no_workers() {
        let controller = ResourceExhaustionController::new();
        let config = ExperimentConfig::defaults_for(ExperimentType::ResourceExhaustion).merged(
            &ExperimentOverrides::default()
                .with_targets(["memory"])
                .with_parameter("memory_mb", "1"),
        );
        let handle = controller.inject(&config).await.unwrap();
        assert!(matches!(
            handle.effect(),
            FaultEffect::ResourceLoad { cpu_workers: 0, .. }
        ));
        controller.recover(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_unknown_targets_and_oversized_ballast() {
        let controller = ResourceExhaustionController::new();
        let base = ExperimentConfig::defaults_for(ExperimentType::ResourceExhaustion);
        let disk = base.merged(&ExperimentOverrides::default().with_targets(["disk"]));
        assert!(matches!(
            controller.inject(&disk).await.unwrap_err(),
            FaultError::InvalidConfig(_)
        ));
        let huge = base.merged(
            &ExperimentOverrides::default()
                .with_targets(["memory"])
                .with_parameter("memory_mb", "999999"),
        );
        assert!(controller.inject(&huge).await.is_err());
        assert_eq!(controller.active_loads(), 0);
    }

    #[test]
    fn worker_count_follows_magnitude() {
        let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let mut config = ExperimentConfig::defaults_for(ExperimentType::ResourceExhaustion);
        config.magnitude = 100.0;
        assert_eq!(ResourceExhaustionController::worker_count(&config).unwrap(), cores);
        config.magnitude = 0.0;
        assert_eq!(ResourceExhaustionController::worker_count(&config).unwrap(), 0);
        config.magnitude = 1.0;
        assert_eq!(ResourceExhaustionController::worker_count(&config).unwrap(), 1);
    }
}
