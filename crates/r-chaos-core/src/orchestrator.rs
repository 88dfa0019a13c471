//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Experiment orchestration: admission, phase state machine, emergency stop, bookkeeping."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use r_chaos_common::{AppConfig, Clock, ExperimentConfig, ExperimentOverrides, ExperimentType, SystemClock};
use r_chaos_metrics::SharedRegistry;
use r_chaos_persistence::ExperimentStore;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::analyzer::RegressionAnalyzer;
use crate::cooldown::{cooldown_keys, CooldownTracker};
use crate::error::{ChaosError, ExperimentResult, RejectReason};
use crate::events::{ExperimentEvent, EVENT_CAPACITY};
use crate::experiment::{
    Experiment, ExperimentId, ExperimentRecord, ExperimentStatus, MetricsSnapshot, PhaseName,
};
use crate::faults::FaultRegistry;
use crate::metrics::ExperimentMetrics;
use crate::probe::SystemProbe;
use crate::recovery::RecoveryActions;
use crate::safety::{EmergencyReason, SafetyGuard};

/// Finished records kept in memory for status and regression comparisons.
const HISTORY_LIMIT: usize = 1_000;

/// Builder for the orchestrator runtime.
#[derive(Debug)]
pub struct ChaosOrchestrator {
    config: Arc<AppConfig>,
    probe: Arc<dyn SystemProbe>,
    faults: FaultRegistry,
    store: Option<Arc<dyn ExperimentStore>>,
    recovery: RecoveryActions,
    clock: Arc<dyn Clock>,
    metrics_registry: Option<SharedRegistry>,
    safety_monitor: bool,
}

impl ChaosOrchestrator {
    pub fn new(config: AppConfig, probe: Arc<dyn SystemProbe>, faults: FaultRegistry) -> Self {
        Self {
            config: Arc::new(config),
            probe,
            faults,
            store: None,
            recovery: RecoveryActions::none(),
            clock: Arc::new(SystemClock),
            metrics_registry: None,
            safety_monitor: true,
        }
    }

    /// Persist every finished record.
    pub fn with_store(mut self, store: Arc<dyn ExperimentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_recovery_actions(mut self, actions: RecoveryActions) -> Self {
        self.recovery = actions;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, registry: SharedRegistry) -> Self {
        self.metrics_registry = Some(registry);
        self
    }

    /// Skip the background safety monitor; observation-time checks still run.
    pub fn without_safety_monitor(mut self) -> Self {
        self.safety_monitor = false;
        self
    }

    /// Capture the baseline and start the safety monitor.
    pub async fn start(self) -> Result<OrchestratorHandle> {
        let metrics = match &self.metrics_registry {
            Some(registry) => Some(ExperimentMetrics::new(registry.clone())?),
            None => None,
        };
        let baseline = self
            .probe
            .capture_baseline()
            .await
            .map_err(ChaosError::Baseline)?;
        info!(
            target: "r_chaos::orchestrator",
            response_time_ms = ?baseline.response_time_ms,
            error_rate = baseline.error_rate,
            memory_usage = baseline.memory_usage,
            cpu_usage = baseline.cpu_usage,
            "baseline captured"
        );

        let orchestrator = &self.config.orchestrator;
        let guard = SafetyGuard::new(self.config.safety.clone(), orchestrator.max_experiment_duration);
        let analyzer = RegressionAnalyzer::new(orchestrator.regression_tolerance);
        let monitor_interval = orchestrator.monitor_interval;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (emergency, _) = watch::channel(None);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(Inner {
            config: self.config.clone(),
            probe: self.probe,
            faults: self.faults,
            store: self.store,
            recovery: self.recovery,
            clock: self.clock,
            metrics,
            guard,
            analyzer,
            state: Mutex::new(RegistryState::default()),
            baseline: RwLock::new(baseline),
            emergency,
            events,
            shutdown,
            monitor: Mutex::new(None),
        });

        if self.safety_monitor {
            let task = tokio::spawn(monitor_loop(
                Arc::downgrade(&inner),
                monitor_interval,
                shutdown_rx,
            ));
            *inner.monitor.lock() = Some(task);
        }

        info!(
            target: "r_chaos::orchestrator",
            controllers = ?inner.faults.types().collect::<Vec<_>>(),
            max_concurrent = inner.config.orchestrator.max_concurrent_experiments,
            "orchestrator started"
        );
        Ok(OrchestratorHandle { inner })
    }
}

/// An experiment admitted and not yet finished.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveExperiment {
    pub id: ExperimentId,
    pub experiment_type: ExperimentType,
    pub phase: Option<PhaseName>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStatus {
    pub active_count: usize,
    /// Experiments that reached a terminal status since startup.
    pub total_count: usize,
    pub emergency_stop_active: bool,
    pub emergency_reason: Option<EmergencyReason>,
    pub active: Vec<ActiveExperiment>,
}

#[derive(Debug, Default)]
struct RegistryState {
    active: IndexMap<ExperimentId, ActiveExperiment>,
    history: Vec<ExperimentRecord>,
    finished_total: usize,
    cooldowns: CooldownTracker,
}

struct Inner {
    config: Arc<AppConfig>,
    probe: Arc<dyn SystemProbe>,
    faults: FaultRegistry,
    store: Option<Arc<dyn ExperimentStore>>,
    recovery: RecoveryActions,
    clock: Arc<dyn Clock>,
    metrics: Option<ExperimentMetrics>,
    guard: SafetyGuard,
    analyzer: RegressionAnalyzer,
    state: Mutex<RegistryState>,
    baseline: RwLock<MetricsSnapshot>,
    emergency: watch::Sender<Option<EmergencyReason>>,
    events: broadcast::Sender<ExperimentEvent>,
    shutdown: watch::Sender<bool>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

/// Failure inside one of the fault-facing phases.
struct PhaseError {
    phase: PhaseName,
    message: String,
}

/// Cloneable handle to the running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for OrchestratorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorHandle")
            .field("status", &self.get_status())
            .finish_non_exhaustive()
    }
}

impl OrchestratorHandle {
    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    /// Run one experiment through all phases.
    ///
    /// The fault-facing work happens on a spawned task, so dropping the
    /// returned future does not abandon an injected fault.
    pub async fn run_experiment(
        &self,
        experiment_type: ExperimentType,
        overrides: ExperimentOverrides,
    ) -> ExperimentResult {
        let inner = &self.inner;
        let config = inner.config.experiment(experiment_type).merged(&overrides);

        {
            let state = inner.state.lock();
            if let Err(reason) = inner.admission_gate(&state, experiment_type, &config) {
                drop(state);
                return Err(inner.reject(experiment_type, reason));
            }
        }

        let snapshot = match inner.probe.sample().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                return Err(inner.reject(experiment_type, RejectReason::ProbeUnavailable(err.to_string())))
            }
        };

        let started_at = inner.clock.wall_clock();
        let id = ExperimentId::generate(experiment_type, started_at);
        {
            let mut state = inner.state.lock();
            let admitted = inner
                .admission_gate(&state, experiment_type, &config)
                .and_then(|()| inner.guard.preflight_check(&config, &snapshot));
            if let Err(reason) = admitted {
                drop(state);
                return Err(inner.reject(experiment_type, reason));
            }
            state.active.insert(
                id.clone(),
                ActiveExperiment {
                    id: id.clone(),
                    experiment_type,
                    phase: None,
                    started_at,
                },
            );
            inner.set_active_gauge(state.active.len());
        }

        info!(
            target: "r_chaos::orchestrator",
            experiment = %id,
            experiment_type = %experiment_type,
            duration_ms = config.duration.as_millis() as u64,
            magnitude = config.magnitude,
            targets = ?config.targets,
            "experiment admitted"
        );
        inner.emit(ExperimentEvent::Started {
            id: id.clone(),
            experiment_type,
        });

        let task_inner = inner.clone();
        let task_id = id.clone();
        let task = tokio::spawn(async move {
            task_inner
                .execute(task_id, experiment_type, config, snapshot, started_at)
                .await
        });

        match task.await {
            Ok(result) => result,
            Err(err) => {
                error!(
                    target: "r_chaos::orchestrator",
                    experiment = %id,
                    error = %err,
                    "experiment task aborted; fault state unknown"
                );
                {
                    let mut state = inner.state.lock();
                    state.active.shift_remove(&id);
                    inner.set_active_gauge(state.active.len());
                }
                inner.trigger_emergency_stop(EmergencyReason::TaskAborted {
                    experiment: id.to_string(),
                });
                Err(ChaosError::Aborted {
                    id,
                    message: err.to_string(),
                })
            }
        }
    }

    /// Run every enabled experiment type in sequence.
    pub async fn run_all_enabled(&self) -> Vec<ExperimentResult> {
        let enabled = self.inner.config.enabled_experiments();
        info!(target: "r_chaos::orchestrator", experiments = ?enabled, "running enabled experiments");
        let mut results = Vec::with_capacity(enabled.len());
        for experiment_type in enabled {
            results.push(
                self.run_experiment(experiment_type, ExperimentOverrides::default())
                    .await,
            );
        }
        results
    }

    pub fn get_status(&self) -> OrchestratorStatus {
        let state = self.inner.state.lock();
        let emergency = self.inner.active_emergency();
        OrchestratorStatus {
            active_count: state.active.len(),
            total_count: state.finished_total,
            emergency_stop_active: emergency.is_some(),
            emergency_reason: emergency,
            active: state.active.values().cloned().collect(),
        }
    }

    /// Latch the emergency stop. Returns `false` if it was already active.
    pub fn trigger_emergency_stop(&self, reason: EmergencyReason) -> bool {
        self.inner.trigger_emergency_stop(reason)
    }

    /// Clear the emergency stop latch. Returns `false` if it was not active.
    pub fn reset_emergency_stop(&self) -> bool {
        self.inner.reset_emergency_stop()
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.inner.active_emergency().is_some()
    }

    pub fn baseline(&self) -> MetricsSnapshot {
        self.inner.baseline.read().clone()
    }

    /// Re-sample the baseline used for behaviour analysis.
    pub async fn refresh_baseline(&self) -> std::result::Result<MetricsSnapshot, ChaosError> {
        let snapshot = self
            .inner
            .probe
            .capture_baseline()
            .await
            .map_err(ChaosError::Baseline)?;
        *self.inner.baseline.write() = snapshot.clone();
        info!(target: "r_chaos::orchestrator", "baseline refreshed");
        Ok(snapshot)
    }

    /// Finished records, oldest first.
    pub fn history(&self) -> Vec<ExperimentRecord> {
        self.inner.state.lock().history.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExperimentEvent> {
        self.inner.events.subscribe()
    }

    /// Refuse new experiments and stop the safety monitor.
    ///
    /// Experiments already running finish on their own tasks.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown.send_replace(true);
        let monitor = self.inner.monitor.lock().take();
        if let Some(task) = monitor {
            if let Err(err) = task.await {
                warn!(target: "r_chaos::orchestrator", error = %err, "safety monitor ended abnormally");
            }
        }
        info!(target: "r_chaos::orchestrator", "orchestrator shutdown complete");
        Ok(())
    }
}

impl Inner {
    fn emit(&self, event: ExperimentEvent) {
        let _ = self.events.send(event);
    }

    fn active_emergency(&self) -> Option<EmergencyReason> {
        self.emergency.borrow().clone()
    }

    fn set_active_gauge(&self, count: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.set_active(count);
        }
    }

    /// Registry-level admission: shutdown, emergency latch, concurrency, cooldown.
    fn admission_gate(
        &self,
        state: &RegistryState,
        experiment_type: ExperimentType,
        config: &ExperimentConfig,
    ) -> std::result::Result<(), RejectReason> {
        if *self.shutdown.borrow() {
            return Err(RejectReason::ShuttingDown);
        }
        if let Some(reason) = self.active_emergency() {
            return Err(RejectReason::EmergencyStopActive {
                reason: reason.to_string(),
            });
        }
        let limit = self.config.orchestrator.max_concurrent_experiments;
        if state.active.len() >= limit {
            return Err(RejectReason::ConcurrencyLimit {
                running: state.active.len(),
                limit,
            });
        }
        let keys = cooldown_keys(experiment_type, config);
        if let Some((target, remaining)) = state.cooldowns.first_blocked(&keys, self.clock.now()) {
            return Err(RejectReason::Cooldown { target, remaining });
        }
        Ok(())
    }

    fn reject(&self, experiment_type: ExperimentType, reason: RejectReason) -> ChaosError {
        warn!(
            target: "r_chaos::orchestrator",
            experiment_type = %experiment_type,
            reason = %reason,
            "experiment rejected"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_rejection(reason.label());
        }
        ChaosError::RejectedStart {
            experiment_type,
            reason,
        }
    }

    fn trigger_emergency_stop(&self, reason: EmergencyReason) -> bool {
        let active: Vec<ExperimentId> = {
            let state = self.state.lock();
            if self.emergency.borrow().is_some() {
                return false;
            }
            self.emergency.send_replace(Some(reason.clone()));
            state.active.keys().cloned().collect()
        };
        error!(
            target: "r_chaos::orchestrator",
            reason = %reason,
            active = ?active,
            "EMERGENCY STOP activated; forcing recovery of running experiments"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_emergency_stop(reason.label());
        }
        self.emit(ExperimentEvent::EmergencyStop { reason, active });
        true
    }

    fn reset_emergency_stop(&self) -> bool {
        let previous = {
            let _state = self.state.lock();
            self.emergency.send_replace(None)
        };
        match previous {
            Some(reason) => {
                info!(target: "r_chaos::orchestrator", previous = %reason, "emergency stop reset");
                self.emit(ExperimentEvent::EmergencyReset);
                true
            }
            None => false,
        }
    }

    fn begin_phase(&self, exp: &mut Experiment, phase: PhaseName) {
        exp.begin_phase(phase, self.clock.wall_clock(), self.clock.now());
        if let Some(entry) = self.state.lock().active.get_mut(exp.id()) {
            entry.phase = Some(phase);
        }
        debug!(target: "r_chaos::orchestrator", experiment = %exp.id(), phase = %phase, "phase started");
        self.emit(ExperimentEvent::PhaseStarted {
            id: exp.id().clone(),
            phase,
        });
    }

    fn end_phase(&self, exp: &mut Experiment, error: Option<String>) {
        let failure = error.clone();
        let Some((phase, elapsed)) = exp.end_phase(self.clock.wall_clock(), self.clock.now(), error) else {
            return;
        };
        if let Some(metrics) = &self.metrics {
            metrics.observe_phase(phase, elapsed);
        }
        let id = exp.id().clone();
        match failure {
            Some(error) => {
                warn!(target: "r_chaos::orchestrator", experiment = %id, phase = %phase, error = %error, "phase failed");
                self.emit(ExperimentEvent::PhaseFailed { id, phase, error });
            }
            None => {
                debug!(
                    target: "r_chaos::orchestrator",
                    experiment = %id,
                    phase = %phase,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "phase completed"
                );
                self.emit(ExperimentEvent::PhaseCompleted { id, phase });
            }
        }
    }

    fn note_emergency(&self, exp: &mut Experiment) -> bool {
        match self.active_emergency() {
            Some(reason) => {
                if exp.record.emergency_stop.is_none() {
                    warn!(
                        target: "r_chaos::orchestrator",
                        experiment = %exp.id(),
                        reason = %reason,
                        "emergency stop observed; moving to recovery"
                    );
                    exp.record.emergency_stop = Some(reason.to_string());
                }
                true
            }
            None => false,
        }
    }

    async fn execute(
        &self,
        id: ExperimentId,
        experiment_type: ExperimentType,
        config: ExperimentConfig,
        pre_snapshot: MetricsSnapshot,
        started_at: DateTime<Utc>,
    ) -> ExperimentResult {
        let mut emergency_rx = self.emergency.subscribe();
        let mut exp = Experiment::new(id, experiment_type, config, started_at);
        exp.advance_status(ExperimentStatus::Running);
        exp.record.pre_snapshot = Some(pre_snapshot);

        let outcome = self.run_fault_phases(&mut exp, &mut emergency_rx).await;
        let recovery = self.run_recovery_phase(&mut exp).await;
        let validation = match (&outcome, &recovery) {
            (Ok(()), Ok(())) => self.run_validation_phase(&mut exp).await,
            _ => Ok(()),
        };
        self.finish(exp, outcome, recovery, validation).await
    }

    /// Preparation, fault injection, and observation.
    async fn run_fault_phases(
        &self,
        exp: &mut Experiment,
        emergency_rx: &mut watch::Receiver<Option<EmergencyReason>>,
    ) -> std::result::Result<(), PhaseError> {
        self.begin_phase(exp, PhaseName::Preparation);
        let experiment_type = exp.record.experiment_type;
        let Some(controller) = self.faults.get(experiment_type) else {
            let message = format!("no fault controller registered for {experiment_type}");
            self.end_phase(exp, Some(message.clone()));
            return Err(PhaseError {
                phase: PhaseName::Preparation,
                message,
            });
        };
        self.end_phase(exp, None);

        if self.note_emergency(exp) {
            return Ok(());
        }
        self.begin_phase(exp, PhaseName::FaultInjection);
        match controller.inject(&exp.record.config).await {
            Ok(handle) => {
                if handle.is_simulated() {
                    info!(
                        target: "r_chaos::orchestrator",
                        experiment = %exp.id(),
                        "fault simulated on this host; run is a dry run"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_simulated();
                    }
                }
                exp.attach_fault(handle);
                self.end_phase(exp, None);
            }
            Err(err) => {
                let message = err.to_string();
                self.end_phase(exp, Some(message.clone()));
                return Err(PhaseError {
                    phase: PhaseName::FaultInjection,
                    message,
                });
            }
        }

        if self.note_emergency(exp) {
            return Ok(());
        }
        self.begin_phase(exp, PhaseName::Observation);
        match self.observe(exp, emergency_rx).await {
            Ok(()) => {
                self.end_phase(exp, None);
                Ok(())
            }
            Err(message) => {
                self.end_phase(exp, Some(message.clone()));
                Err(PhaseError {
                    phase: PhaseName::Observation,
                    message,
                })
            }
        }
    }

    /// Sample health every observation interval until the duration elapses
    /// or the emergency stop is raised.
    async fn observe(
        &self,
        exp: &mut Experiment,
        emergency_rx: &mut watch::Receiver<Option<EmergencyReason>>,
    ) -> std::result::Result<(), String> {
        let interval = self
            .config
            .orchestrator
            .observation_interval
            .max(Duration::from_millis(1));
        let duration = exp.record.config.duration;
        let mut elapsed = Duration::ZERO;

        while elapsed < duration {
            let wait = interval.min(duration - elapsed);
            let sleep = tokio::time::sleep(wait);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    changed = emergency_rx.changed() => {
                        if changed.is_err() {
                            (&mut sleep).await;
                            break;
                        }
                        let raised = emergency_rx.borrow_and_update().is_some();
                        if raised && self.note_emergency(exp) {
                            return Ok(());
                        }
                    }
                }
            }
            elapsed += wait;

            let sample = self
                .probe
                .sample()
                .await
                .map_err(|err| format!("observation sample failed: {err}"))?;
            self.emit(ExperimentEvent::Observation {
                id: exp.id().clone(),
                index: exp.record.observations.len(),
                error_rate: sample.error_rate,
                response_time_ms: sample.response_time_ms,
            });
            let tripped = self.guard.poll_emergency_conditions(&sample);
            exp.record.observations.push(sample);
            if let Some(reason) = tripped {
                self.trigger_emergency_stop(reason);
                self.note_emergency(exp);
                return Ok(());
            }
            if self.note_emergency(exp) {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Revert the fault. Runs on every path once an experiment is admitted.
    async fn run_recovery_phase(&self, exp: &mut Experiment) -> std::result::Result<(), String> {
        self.begin_phase(exp, PhaseName::Recovery);
        let Some(handle) = exp.handle.take() else {
            self.end_phase(exp, None);
            return Ok(());
        };

        let emergency = exp.record.emergency_stop.is_some();
        let reverted = match self.faults.get(handle.experiment_type()) {
            None => Err(format!(
                "no fault controller registered for {}",
                handle.experiment_type()
            )),
            Some(controller) if emergency => {
                controller.emergency_recover(&handle).await;
                Ok(())
            }
            Some(controller) => match controller.recover(&handle).await {
                Ok(()) => Ok(()),
                Err(first) => {
                    warn!(
                        target: "r_chaos::orchestrator",
                        experiment = %exp.id(),
                        error = %first,
                        "fault recovery failed; retrying once"
                    );
                    controller
                        .recover(&handle)
                        .await
                        .map_err(|second| format!("recovery failed twice: {first}; {second}"))
                }
            },
        };

        let simulated = handle.is_simulated();
        exp.handle = Some(handle);
        match reverted {
            Ok(()) => {
                exp.release_fault();
                if !simulated && !self.recovery.is_empty() {
                    exp.record.recovery_actions = Some(self.recovery.run().await);
                }
                self.end_phase(exp, None);
                Ok(())
            }
            Err(message) => {
                exp.record.manual_intervention_required = true;
                error!(
                    target: "r_chaos::orchestrator",
                    experiment = %exp.id(),
                    error = %message,
                    "MANUAL INTERVENTION REQUIRED: fault is still applied"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_recovery_failure(exp.record.experiment_type);
                }
                self.end_phase(exp, Some(message.clone()));
                self.trigger_emergency_stop(EmergencyReason::RecoveryFailure {
                    experiment: exp.id().to_string(),
                });
                Err(message)
            }
        }
    }

    async fn run_validation_phase(&self, exp: &mut Experiment) -> std::result::Result<(), PhaseError> {
        self.begin_phase(exp, PhaseName::Validation);
        tokio::time::sleep(self.config.orchestrator.settle_time).await;
        let post = match self.probe.sample().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                let message = format!("post-recovery sample failed: {err}");
                self.end_phase(exp, Some(message.clone()));
                return Err(PhaseError {
                    phase: PhaseName::Validation,
                    message,
                });
            }
        };
        let pre = exp
            .record
            .pre_snapshot
            .clone()
            .unwrap_or_else(|| self.baseline.read().clone());
        let validation = self.analyzer.validate_recovery(&pre, &post);
        if !validation.recovered {
            warn!(
                target: "r_chaos::orchestrator",
                experiment = %exp.id(),
                issues = ?validation.issues,
                "system did not return to its pre-experiment state"
            );
        }
        exp.record.post_snapshot = Some(post);
        exp.record.recovery_validation = Some(validation);
        self.end_phase(exp, None);
        Ok(())
    }

    /// Analysis, terminal status, bookkeeping, and persistence.
    async fn finish(
        &self,
        mut exp: Experiment,
        outcome: std::result::Result<(), PhaseError>,
        recovery: std::result::Result<(), String>,
        validation: std::result::Result<(), PhaseError>,
    ) -> ExperimentResult {
        if exp.record.fault.is_some() {
            let baseline = self.baseline.read().clone();
            exp.record.behavior_analysis = Some(self.analyzer.analyze_behavior(
                &exp.record.observations,
                &baseline,
                exp.record.simulated,
            ));
        }

        let not_recovered = exp
            .record
            .recovery_validation
            .as_ref()
            .filter(|v| !v.recovered)
            .map(|v| format!("system did not recover: {}", v.issues.join("; ")));
        let error = recovery
            .as_ref()
            .err()
            .cloned()
            .or_else(|| outcome.as_ref().err().map(|e| e.message.clone()))
            .or_else(|| validation.as_ref().err().map(|e| e.message.clone()))
            .or_else(|| {
                exp.record
                    .emergency_stop
                    .as_ref()
                    .map(|reason| format!("emergency stop: {reason}"))
            })
            .or(not_recovered);
        let status = if error.is_some() {
            ExperimentStatus::Failed
        } else {
            ExperimentStatus::Completed
        };
        exp.advance_status(status);
        exp.record.error = error;
        exp.record.finished_at = Some(self.clock.wall_clock());

        let record = {
            let mut state = self.state.lock();
            exp.record.regression = self.analyzer.detect_regression(&exp.record, &state.history);
            let record = exp.into_record();
            state.active.shift_remove(&record.id);
            state.history.push(record.clone());
            if state.history.len() > HISTORY_LIMIT {
                let excess = state.history.len() - HISTORY_LIMIT;
                state.history.drain(..excess);
            }
            state.finished_total += 1;
            let now = self.clock.now();
            let until = now + self.config.orchestrator.cooldown;
            for key in cooldown_keys(record.experiment_type, &record.config) {
                state.cooldowns.schedule(key, until);
            }
            state.cooldowns.prune(now);
            self.set_active_gauge(state.active.len());
            record
        };

        if let Some(report) = record.regression.as_ref().filter(|r| r.regressed) {
            warn!(
                target: "r_chaos::orchestrator",
                experiment = %record.id,
                findings = ?report.findings,
                "resilience regression detected"
            );
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_finished(record.experiment_type, record.status);
        }
        info!(
            target: "r_chaos::orchestrator",
            experiment = %record.id,
            status = %record.status,
            simulated = record.simulated,
            resilience = ?record.behavior_analysis.as_ref().map(|a| a.resilience_level),
            "experiment finished"
        );
        self.emit(ExperimentEvent::Finished {
            id: record.id.clone(),
            status: record.status,
        });
        self.persist(&record).await;

        let id = record.id.clone();
        if let Err(message) = recovery {
            return Err(ChaosError::RecoveryFailure {
                id,
                message,
                record: Box::new(record),
            });
        }
        if let Err(failure) = outcome.and(validation) {
            return Err(if failure.phase == PhaseName::FaultInjection {
                ChaosError::InjectionFailure {
                    id,
                    message: failure.message,
                    record: Box::new(record),
                }
            } else {
                ChaosError::PhaseFailure {
                    id,
                    phase: failure.phase,
                    message: failure.message,
                    record: Box::new(record),
                }
            });
        }
        Ok(record)
    }

    /// Save the record; failures are logged and never fail the experiment.
    async fn persist(&self, record: &ExperimentRecord) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let value = match serde_json::to_value(record) {
            Ok(value) => value,
            Err(err) => {
                warn!(target: "r_chaos::orchestrator", experiment = %record.id, error = %err, "failed to serialize record");
                return;
            }
        };
        let id = record.id.to_string();
        let saved = tokio::task::spawn_blocking(move || store.save(&id, &value)).await;
        match saved {
            Ok(Ok(())) => {
                debug!(target: "r_chaos::orchestrator", experiment = %record.id, "record persisted")
            }
            Ok(Err(err)) => {
                warn!(target: "r_chaos::orchestrator", experiment = %record.id, error = %err, "failed to persist record")
            }
            Err(err) => {
                warn!(target: "r_chaos::orchestrator", experiment = %record.id, error = %err, "persistence task failed")
            }
        }
    }

    async fn monitor_tick(&self) {
        let idle = self.state.lock().active.is_empty();
        if idle || self.active_emergency().is_some() {
            return;
        }
        match self.probe.sample().await {
            Ok(snapshot) => {
                if let Some(reason) = self.guard.poll_emergency_conditions(&snapshot) {
                    self.trigger_emergency_stop(reason);
                }
            }
            Err(err) => {
                warn!(target: "r_chaos::orchestrator", error = %err, "safety monitor sample failed")
            }
        }
    }
}

/// Poll health while experiments run; holds only a weak reference so the
/// orchestrator can be dropped without an explicit shutdown.
async fn monitor_loop(inner: Weak<Inner>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.monitor_tick().await;
            }
        }
    }
    debug!(target: "r_chaos::orchestrator", "safety monitor stopped");
}
