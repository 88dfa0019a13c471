//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Health probing: HTTP endpoint checks plus host resource sampling."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use r_chaos_common::{EndpointConfig, ProbeConfig};
use sysinfo::{CpuExt, System, SystemExt};
use tracing::{debug, warn};

use crate::error::ProbeError;
use crate::experiment::{HealthStatus, MetricsSnapshot, ServiceHealth};

/// Source of health snapshots for the orchestrator.
#[async_trait]
pub trait SystemProbe: Send + Sync + fmt::Debug {
    async fn sample(&self) -> Result<MetricsSnapshot, ProbeError>;

    /// Snapshot taken at startup and used as the comparison point for analysis.
    async fn capture_baseline(&self) -> Result<MetricsSnapshot, ProbeError> {
        self.sample().await
    }
}

/// Host memory and CPU usage, as percentages.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResourceUsage {
    pub memory_percent: f64,
    pub cpu_percent: f64,
}

pub trait ResourceSampler: Send + Sync + fmt::Debug {
    fn sample(&self) -> Result<ResourceUsage, ProbeError>;
}

/// Reads memory and global CPU usage through `sysinfo`.
///
/// CPU usage is computed between consecutive refreshes, so the first sample
/// after construction may read low.
pub struct SysinfoSampler {
    system: Mutex<System>,
}

impl fmt::Debug for SysinfoSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SysinfoSampler").finish_non_exhaustive()
    }
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SysinfoSampler {
    fn sample(&self) -> Result<ResourceUsage, ProbeError> {
        let mut system = self.system.lock();
        system.refresh_memory();
        system.refresh_cpu();
        let total = system.total_memory();
        if total == 0 {
            return Err(ProbeError::Resources("total memory reported as zero".into()));
        }
        let memory_percent = system.used_memory() as f64 / total as f64 * 100.0;
        let cpu_percent = f64::from(system.global_cpu_info().cpu_usage());
        Ok(ResourceUsage {
            memory_percent: memory_percent.clamp(0.0, 100.0),
            cpu_percent: cpu_percent.clamp(0.0, 100.0),
        })
    }
}

/// Fixed resource readings; useful when host sampling is not wanted.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticResourceSampler(pub ResourceUsage);

impl ResourceSampler for StaticResourceSampler {
    fn sample(&self) -> Result<ResourceUsage, ProbeError> {
        Ok(self.0)
    }
}

/// Result of probing one endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeResult {
    /// Endpoint has no URL configured.
    Skipped,
    Responded { status: u16, latency: Duration },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub name: String,
    pub essential: bool,
    pub result: ProbeResult,
}

impl ProbeOutcome {
    fn succeeded(&self) -> bool {
        matches!(self.result, ProbeResult::Responded { status, .. } if (200..300).contains(&status))
    }
}

/// Fold endpoint outcomes and resource readings into a snapshot.
///
/// Mean response time covers successful responses only and is `None` when
/// nothing succeeded. Skipped endpoints count toward neither the error rate
/// nor throughput.
pub fn aggregate(
    captured_at: DateTime<Utc>,
    outcomes: &[ProbeOutcome],
    resources: ResourceUsage,
    elapsed: Duration,
) -> MetricsSnapshot {
    let probed: Vec<&ProbeOutcome> = outcomes
        .iter()
        .filter(|o| o.result != ProbeResult::Skipped)
        .collect();
    let latencies: Vec<f64> = probed
        .iter()
        .filter(|o| o.succeeded())
        .filter_map(|o| match o.result {
            ProbeResult::Responded { latency, .. } => Some(latency.as_secs_f64() * 1_000.0),
            _ => None,
        })
        .collect();
    let successes = latencies.len();
    let failures = probed.len() - successes;

    let response_time_ms = if latencies.is_empty() {
        None
    } else {
        Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
    };
    let error_rate = if probed.is_empty() {
        0.0
    } else {
        failures as f64 / probed.len() as f64 * 100.0
    };
    let seconds = elapsed.as_secs_f64();
    let throughput = if seconds > 0.0 {
        successes as f64 / seconds
    } else {
        0.0
    };

    let services = outcomes
        .iter()
        .map(|outcome| {
            let (status, status_code, latency_ms) = match &outcome.result {
                ProbeResult::Skipped => (HealthStatus::Unknown, None, None),
                ProbeResult::Responded { status, latency } => (
                    if outcome.succeeded() {
                        HealthStatus::Healthy
                    } else {
                        HealthStatus::Unhealthy
                    },
                    Some(*status),
                    Some(latency.as_secs_f64() * 1_000.0),
                ),
                ProbeResult::Failed { .. } => (HealthStatus::Unhealthy, None, None),
            };
            ServiceHealth {
                name: outcome.name.clone(),
                essential: outcome.essential,
                status,
                status_code,
                latency_ms,
            }
        })
        .collect();

    MetricsSnapshot {
        captured_at,
        response_time_ms,
        throughput,
        error_rate,
        memory_usage: resources.memory_percent,
        cpu_usage: resources.cpu_percent,
        services,
    }
}

/// Probes configured HTTP health endpoints concurrently.
#[derive(Debug, Clone)]
pub struct HttpMetricsProbe {
    client: reqwest::Client,
    endpoints: Vec<EndpointConfig>,
    resources: Arc<dyn ResourceSampler>,
}

impl HttpMetricsProbe {
    pub fn new(config: &ProbeConfig, resources: Arc<dyn ResourceSampler>) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| ProbeError::Unavailable(format!("http client: {err}")))?;
        Ok(Self {
            client,
            endpoints: config.endpoints.clone(),
            resources,
        })
    }

    /// Probe with `sysinfo`-backed resource sampling.
    pub fn with_system_resources(config: &ProbeConfig) -> Result<Self, ProbeError> {
        Self::new(config, Arc::new(SysinfoSampler::new()))
    }

    async fn probe(&self, endpoint: &EndpointConfig) -> ProbeOutcome {
        let result = match &endpoint.url {
            None => ProbeResult::Skipped,
            Some(url) => {
                let started = Instant::now();
                match self.client.get(url.clone()).send().await {
                    Ok(response) => ProbeResult::Responded {
                        status: response.status().as_u16(),
                        latency: started.elapsed(),
                    },
                    Err(err) => {
                        debug!(
                            target: "r_chaos::probe",
                            endpoint = %endpoint.name,
                            error = %err,
                            "health probe failed"
                        );
                        ProbeResult::Failed {
                            error: err.to_string(),
                        }
                    }
                }
            }
        };
        ProbeOutcome {
            name: endpoint.name.clone(),
            essential: endpoint.essential,
            result,
        }
    }
}

#[async_trait]
impl SystemProbe for HttpMetricsProbe {
    async fn sample(&self) -> Result<MetricsSnapshot, ProbeError> {
        let started = Instant::now();
        let outcomes = join_all(self.endpoints.iter().map(|endpoint| self.probe(endpoint))).await;
        let elapsed = started.elapsed();
        let resources = self.resources.sample()?;
        let snapshot = aggregate(Utc::now(), &outcomes, resources, elapsed);
        if snapshot.response_time_ms.is_none() && !self.endpoints.is_empty() {
            warn!(
                target: "r_chaos::probe",
                error_rate = snapshot.error_rate,
                "no endpoint responded successfully"
            );
        }
        Ok(snapshot)
    }
}
