//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "support"
//! ems_type: "test"
//! ems_scope: "code"
//! ems_description: "Test doubles for orchestrator integration tests."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use r_chaos_common::{AppConfig, ExperimentConfig, ExperimentType};
use r_chaos_core::{
    FaultController, FaultEffect, FaultError, FaultHandle, MetricsSnapshot, ProbeError,
    ServiceHealth, SystemProbe,
};

/// Shared flag flipped by the fault double and read by the probe double.
#[derive(Debug, Default)]
pub struct FaultSwitch {
    active: AtomicBool,
    tripped: AtomicBool,
}

impl FaultSwitch {
    pub fn set(&self, on: bool) {
        self.active.store(on, Ordering::SeqCst);
        if on {
            self.tripped.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn was_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }
}

pub fn healthy_snapshot(response_time_ms: Option<f64>) -> MetricsSnapshot {
    let mut snapshot = MetricsSnapshot::idle(Utc::now());
    snapshot.response_time_ms = response_time_ms;
    snapshot.throughput = 20.0;
    snapshot.memory_usage = 40.0;
    snapshot.cpu_usage = 10.0;
    snapshot.services = vec![ServiceHealth::healthy("api"), ServiceHealth::healthy("db")];
    snapshot
}

/// Probe returning `healthy` normally, `faulted` while the switch is on, and
/// `after_recovery` (when set) once a fault has come and gone.
#[derive(Debug)]
pub struct ScriptedProbe {
    switch: Arc<FaultSwitch>,
    healthy: Mutex<MetricsSnapshot>,
    faulted: Mutex<MetricsSnapshot>,
    after_recovery: Mutex<Option<MetricsSnapshot>>,
    fail_while_faulted: AtomicBool,
    samples: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new(switch: Arc<FaultSwitch>) -> Self {
        Self {
            switch,
            healthy: Mutex::new(healthy_snapshot(Some(100.0))),
            faulted: Mutex::new(healthy_snapshot(Some(120.0))),
            after_recovery: Mutex::new(None),
            fail_while_faulted: AtomicBool::new(false),
            samples: AtomicUsize::new(0),
        }
    }

    pub fn set_healthy(&self, snapshot: MetricsSnapshot) {
        *self.healthy.lock() = snapshot;
    }

    pub fn set_faulted(&self, snapshot: MetricsSnapshot) {
        *self.faulted.lock() = snapshot;
    }

    pub fn set_after_recovery(&self, snapshot: MetricsSnapshot) {
        *self.after_recovery.lock() = Some(snapshot);
    }

    pub fn fail_while_faulted(&self) {
        self.fail_while_faulted.store(true, Ordering::SeqCst);
    }

    pub fn samples(&self) -> usize {
        self.samples.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SystemProbe for ScriptedProbe {
    async fn sample(&self) -> Result<MetricsSnapshot, ProbeError> {
        self.samples.fetch_add(1, Ordering::SeqCst);
        let mut snapshot = if self.switch.is_active() {
            if self.fail_while_faulted.load(Ordering::SeqCst) {
                return Err(ProbeError::Unavailable("probe host unreachable".into()));
            }
            self.faulted.lock().clone()
        } else if self.switch.was_tripped() {
            self.after_recovery
                .lock()
                .clone()
                .unwrap_or_else(|| self.healthy.lock().clone())
        } else {
            self.healthy.lock().clone()
        };
        snapshot.captured_at = Utc::now();
        Ok(snapshot)
    }
}

/// Fault controller double that records every call.
#[derive(Debug)]
pub struct RecordingController {
    experiment_type: ExperimentType,
    switch: Arc<FaultSwitch>,
    simulated: bool,
    fail_inject: AtomicBool,
    recover_failures: AtomicUsize,
    next_id: AtomicU64,
    live: Mutex<HashSet<u64>>,
    peak: AtomicUsize,
    injections: AtomicUsize,
    recover_calls: AtomicUsize,
    emergency_calls: AtomicUsize,
}

impl RecordingController {
    pub fn new(experiment_type: ExperimentType, switch: Arc<FaultSwitch>) -> Self {
        Self {
            experiment_type,
            switch,
            simulated: false,
            fail_inject: AtomicBool::new(false),
            recover_failures: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            live: Mutex::new(HashSet::new()),
            peak: AtomicUsize::new(0),
            injections: AtomicUsize::new(0),
            recover_calls: AtomicUsize::new(0),
            emergency_calls: AtomicUsize::new(0),
        }
    }

    pub fn simulated(mut self) -> Self {
        self.simulated = true;
        self
    }

    pub fn fail_inject(&self) {
        self.fail_inject.store(true, Ordering::SeqCst);
    }

    /// Make the next `count` recover calls fail.
    pub fn fail_recover(&self, count: usize) {
        self.recover_failures.store(count, Ordering::SeqCst);
    }

    pub fn injections(&self) -> usize {
        self.injections.load(Ordering::SeqCst)
    }

    pub fn recover_calls(&self) -> usize {
        self.recover_calls.load(Ordering::SeqCst)
    }

    pub fn emergency_calls(&self) -> usize {
        self.emergency_calls.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.lock().len()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn release(&self, handle: &FaultHandle) {
        if let FaultEffect::ResourceLoad { load_id, .. } = handle.effect() {
            let mut live = self.live.lock();
            live.remove(load_id);
            self.switch.set(!live.is_empty());
        }
    }
}

#[async_trait]
impl FaultController for RecordingController {
    fn experiment_type(&self) -> ExperimentType {
        self.experiment_type
    }

    async fn inject(&self, _config: &ExperimentConfig) -> Result<FaultHandle, FaultError> {
        if self.fail_inject.load(Ordering::SeqCst) {
            return Err(FaultError::Command {
                command: "tc qdisc add dev lo root netem delay 200ms".into(),
                status: Some(2),
                stderr: "RTNETLINK answers: Operation not permitted".into(),
            });
        }
        self.injections.fetch_add(1, Ordering::SeqCst);
        let load_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut live = self.live.lock();
            live.insert(load_id);
            self.peak.fetch_max(live.len(), Ordering::SeqCst);
        }
        self.switch.set(true);
        let effect = FaultEffect::ResourceLoad {
            load_id,
            cpu_workers: 0,
            memory_mb: 0,
        };
        Ok(if self.simulated {
            FaultHandle::simulated(self.experiment_type, effect, "test double")
        } else {
            FaultHandle::applied(self.experiment_type, effect)
        })
    }

    async fn recover(&self, handle: &FaultHandle) -> Result<(), FaultError> {
        self.recover_calls.fetch_add(1, Ordering::SeqCst);
        let pending = self.recover_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.recover_failures.store(pending - 1, Ordering::SeqCst);
            return Err(FaultError::Command {
                command: "tc qdisc del dev lo root netem".into(),
                status: Some(2),
                stderr: "RTNETLINK answers: Device or resource busy".into(),
            });
        }
        self.release(handle);
        Ok(())
    }

    async fn emergency_recover(&self, handle: &FaultHandle) {
        self.emergency_calls.fetch_add(1, Ordering::SeqCst);
        self.release(handle);
    }
}

/// Defaults tuned for paused-clock tests.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.orchestrator.max_concurrent_experiments = 1;
    config.orchestrator.observation_interval = Duration::from_secs(5);
    config.orchestrator.settle_time = Duration::from_secs(1);
    config.orchestrator.cooldown = Duration::from_secs(60);
    config
}
