//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Prometheus metric family for experiment execution."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::Result;
use prometheus::{self, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts};
use r_chaos_common::ExperimentType;
use r_chaos_metrics::SharedRegistry;

use crate::experiment::{ExperimentStatus, PhaseName};

/// Metrics published by the orchestrator.
#[derive(Clone)]
pub struct ExperimentMetrics {
    registry: SharedRegistry,
    experiments_total: IntCounterVec,
    rejected_starts_total: IntCounterVec,
    emergency_stops_total: IntCounterVec,
    recovery_failures_total: IntCounterVec,
    simulated_faults_total: IntCounter,
    active_experiments: IntGauge,
    phase_duration_seconds: HistogramVec,
}

impl ExperimentMetrics {
    /// Register the experiment metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let experiments_total = IntCounterVec::new(
            Opts::new(
                "r_chaos_experiments_total",
                "Experiments that reached a terminal status",
            ),
            &["experiment_type", "status"],
        )?;
        registry.register(Box::new(experiments_total.clone()))?;

        let rejected_starts_total = IntCounterVec::new(
            Opts::new(
                "r_chaos_rejected_starts_total",
                "Experiment starts refused by admission control",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(rejected_starts_total.clone()))?;

        let emergency_stops_total = IntCounterVec::new(
            Opts::new(
                "r_chaos_emergency_stops_total",
                "Emergency stop activations by trigger",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(emergency_stops_total.clone()))?;

        let recovery_failures_total = IntCounterVec::new(
            Opts::new(
                "r_chaos_recovery_failures_total",
                "Faults that could not be reverted and need manual intervention",
            ),
            &["experiment_type"],
        )?;
        registry.register(Box::new(recovery_failures_total.clone()))?;

        let simulated_faults_total = IntCounter::new(
            "r_chaos_simulated_faults_total",
            "Faults simulated because the host could not apply them",
        )?;
        registry.register(Box::new(simulated_faults_total.clone()))?;

        let active_experiments = IntGauge::new(
            "r_chaos_active_experiments",
            "Experiments currently admitted and not yet finished",
        )?;
        registry.register(Box::new(active_experiments.clone()))?;

        let histogram_opts = HistogramOpts::new(
            "r_chaos_phase_duration_seconds",
            "Wall time spent in each experiment phase",
        )
        .buckets(prometheus::exponential_buckets(0.01, 2.0, 16)?);
        let phase_duration_seconds = HistogramVec::new(histogram_opts, &["phase"])?;
        registry.register(Box::new(phase_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            experiments_total,
            rejected_starts_total,
            emergency_stops_total,
            recovery_failures_total,
            simulated_faults_total,
            active_experiments,
            phase_duration_seconds,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_finished(&self, experiment_type: ExperimentType, status: ExperimentStatus) {
        self.experiments_total
            .with_label_values(&[experiment_type.as_str(), status.as_str()])
            .inc();
    }

    pub fn record_rejection(&self, reason: &str) {
        self.rejected_starts_total.with_label_values(&[reason]).inc();
    }

    pub fn record_emergency_stop(&self, reason: &str) {
        self.emergency_stops_total.with_label_values(&[reason]).inc();
    }

    pub fn record_recovery_failure(&self, experiment_type: ExperimentType) {
        self.recovery_failures_total
            .with_label_values(&[experiment_type.as_str()])
            .inc();
    }

    pub fn record_simulated(&self) {
        self.simulated_faults_total.inc();
    }

    pub fn set_active(&self, count: usize) {
        self.active_experiments.set(count as i64);
    }

    pub fn observe_phase(&self, phase: PhaseName, elapsed: Duration) {
        self.phase_duration_seconds
            .with_label_values(&[phase.as_str()])
            .observe(elapsed.as_secs_f64());
    }
}

impl std::fmt::Debug for ExperimentMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentMetrics").finish_non_exhaustive()
    }
}
