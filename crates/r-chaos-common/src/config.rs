//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the chaos orchestrator."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};
use tracing::debug;
use url::Url;

use crate::logging::LogFormat;

fn default_true() -> bool {
    true
}

fn default_max_concurrent() -> usize {
    2
}

fn default_cooldown() -> Duration {
    Duration::from_secs(60)
}

fn default_settle_time() -> Duration {
    Duration::from_secs(10)
}

fn default_observation_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_max_experiment_duration() -> Duration {
    Duration::from_secs(300)
}

fn default_monitor_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_regression_tolerance() -> f64 {
    25.0
}

fn default_preflight_ceiling() -> f64 {
    80.0
}

fn default_emergency_error_rate() -> f64 {
    80.0
}

fn default_emergency_memory() -> f64 {
    95.0
}

fn default_emergency_unhealthy_services() -> usize {
    2
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_recovery_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_endpoints() -> Vec<EndpointConfig> {
    vec![EndpointConfig {
        name: "api".to_owned(),
        url: Url::parse("http://127.0.0.1:3000/health").ok(),
        essential: true,
    }]
}

fn default_persistence_directory() -> PathBuf {
    PathBuf::from("target/experiments")
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9899))
}

/// Fault categories the orchestrator knows how to inject.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ExperimentType {
    NetworkLatency,
    NetworkPartition,
    ResourceExhaustion,
    ServiceFailure,
    DatabaseFailure,
    FileSystemChaos,
}

impl ExperimentType {
    /// Stable label used in identifiers, metrics, and log fields.
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }

    /// Every experiment type in declaration order.
    pub fn all() -> impl Iterator<Item = ExperimentType> {
        ExperimentType::iter()
    }
}

/// Primary configuration object for the chaos orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// Stop/start command templates keyed by service name.
    #[serde(default)]
    pub services: IndexMap<String, ServiceControlConfig>,
    /// Per-type overrides keyed by experiment type label (`networkLatency`, ...),
    /// applied on top of the built-in experiment defaults.
    #[serde(default)]
    pub experiments: IndexMap<String, ExperimentOverrides>,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "R_CHAOS_CONFIG";

    /// Load configuration from disk, respecting the `R_CHAOS_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the effective configuration for one experiment type: built-in
    /// defaults with the `[experiments.<type>]` table layered on top.
    pub fn experiment(&self, experiment_type: ExperimentType) -> ExperimentConfig {
        let defaults = ExperimentConfig::defaults_for(experiment_type);
        match self.experiments.get(experiment_type.as_str()) {
            Some(overrides) => defaults.merged(overrides),
            None => defaults,
        }
    }

    /// Experiment types whose effective configuration is enabled.
    pub fn enabled_experiments(&self) -> Vec<ExperimentType> {
        ExperimentType::all()
            .filter(|ty| self.experiment(*ty).enabled)
            .collect()
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.orchestrator.validate()?;
        self.safety.validate()?;
        self.probe.validate()?;
        for label in self.experiments.keys() {
            label
                .parse::<ExperimentType>()
                .map_err(|_| anyhow!("unknown experiment type '{}' in [experiments]", label))?;
        }
        for experiment_type in ExperimentType::all() {
            let experiment = self.experiment(experiment_type);
            if experiment.duration > self.orchestrator.max_experiment_duration {
                return Err(anyhow!(
                    "experiment '{}' duration {:?} exceeds max_experiment_duration {:?}",
                    experiment_type,
                    experiment.duration,
                    self.orchestrator.max_experiment_duration
                ));
            }
        }
        for (service, control) in &self.services {
            if control.stop.is_empty() || control.start.is_empty() {
                return Err(anyhow!(
                    "service '{}' must declare both stop and start commands",
                    service
                ));
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Scheduling and policy knobs for the experiment state machine.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_experiments: usize,
    #[serde(default = "default_cooldown", rename = "cooldown_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub cooldown: Duration,
    #[serde(default = "default_settle_time", rename = "settle_time_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub settle_time: Duration,
    #[serde(
        default = "default_observation_interval",
        rename = "observation_interval_ms"
    )]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub observation_interval: Duration,
    #[serde(
        default = "default_max_experiment_duration",
        rename = "max_experiment_duration_ms"
    )]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_experiment_duration: Duration,
    #[serde(default = "default_monitor_interval", rename = "monitor_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub monitor_interval: Duration,
    /// Percentage-point worsening against history that counts as a regression.
    #[serde(default = "default_regression_tolerance")]
    pub regression_tolerance: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_experiments: default_max_concurrent(),
            cooldown: default_cooldown(),
            settle_time: default_settle_time(),
            observation_interval: default_observation_interval(),
            max_experiment_duration: default_max_experiment_duration(),
            monitor_interval: default_monitor_interval(),
            regression_tolerance: default_regression_tolerance(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_experiments == 0 {
            return Err(anyhow!("max_concurrent_experiments must be at least 1"));
        }
        if self.observation_interval.is_zero() {
            return Err(anyhow!("observation_interval_ms must be greater than zero"));
        }
        if self.monitor_interval.is_zero() {
            return Err(anyhow!("monitor_interval_ms must be greater than zero"));
        }
        Ok(())
    }
}

/// Pre-flight ceilings and emergency trigger thresholds. Percentages are 0-100.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_preflight_ceiling")]
    pub preflight_memory_ceiling: f64,
    #[serde(default = "default_preflight_ceiling")]
    pub preflight_cpu_ceiling: f64,
    #[serde(default = "default_emergency_error_rate")]
    pub emergency_error_rate: f64,
    #[serde(default = "default_emergency_memory")]
    pub emergency_memory: f64,
    #[serde(default = "default_emergency_unhealthy_services")]
    pub emergency_unhealthy_services: usize,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            preflight_memory_ceiling: default_preflight_ceiling(),
            preflight_cpu_ceiling: default_preflight_ceiling(),
            emergency_error_rate: default_emergency_error_rate(),
            emergency_memory: default_emergency_memory(),
            emergency_unhealthy_services: default_emergency_unhealthy_services(),
        }
    }
}

impl SafetyConfig {
    pub fn validate(&self) -> Result<()> {
        let percentages = [
            ("preflight_memory_ceiling", self.preflight_memory_ceiling),
            ("preflight_cpu_ceiling", self.preflight_cpu_ceiling),
            ("emergency_error_rate", self.emergency_error_rate),
            ("emergency_memory", self.emergency_memory),
        ];
        for (name, value) in percentages {
            if !(0.0..=100.0).contains(&value) {
                return Err(anyhow!("safety.{} must be within 0-100, got {}", name, value));
            }
        }
        if self.emergency_unhealthy_services == 0 {
            return Err(anyhow!("safety.emergency_unhealthy_services must be at least 1"));
        }
        Ok(())
    }
}

/// Health endpoints sampled by the metrics probe.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_timeout", rename = "timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub timeout: Duration,
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<EndpointConfig>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: default_probe_timeout(),
            endpoints: default_endpoints(),
        }
    }
}

impl ProbeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(anyhow!("probe.timeout_ms must be greater than zero"));
        }
        let mut seen = std::collections::HashSet::new();
        for endpoint in &self.endpoints {
            if !seen.insert(endpoint.name.as_str()) {
                return Err(anyhow!("duplicate probe endpoint '{}'", endpoint.name));
            }
        }
        Ok(())
    }
}

/// One service reachable over HTTP. A missing `url` leaves its health unknown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    #[serde(default)]
    pub url: Option<Url>,
    #[serde(default = "default_true")]
    pub essential: bool,
}

/// Extra actions run during the recovery phase.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Base URL exposing `POST /admin/circuit-breakers/reset`.
    #[serde(default)]
    pub circuit_breaker_url: Option<Url>,
    /// Commands (program followed by arguments) restarting dependent services.
    #[serde(default)]
    pub restart_commands: Vec<Vec<String>>,
    #[serde(default = "default_recovery_timeout", rename = "timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub timeout: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            circuit_breaker_url: None,
            restart_commands: Vec::new(),
            timeout: default_recovery_timeout(),
        }
    }
}

/// Stop/start command templates; `{service}` is replaced with the target name.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceControlConfig {
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub start: Vec<String>,
}

/// Fully resolved parameters for one experiment run.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub enabled: bool,
    #[serde(rename = "duration_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub duration: Duration,
    pub magnitude: f64,
    pub targets: Vec<String>,
    pub parameters: IndexMap<String, String>,
}

impl ExperimentConfig {
    /// Built-in defaults for each fault category.
    ///
    /// `magnitude` is interpreted per type: added delay in milliseconds for
    /// latency, dropped-traffic percentage for partitions, CPU load percentage
    /// for resource exhaustion, and a unitless severity elsewhere.
    pub fn defaults_for(experiment_type: ExperimentType) -> Self {
        let (enabled, duration_secs, magnitude, targets, parameters): (
            bool,
            u64,
            f64,
            &[&str],
            &[(&str, &str)],
        ) = match experiment_type {
            ExperimentType::NetworkLatency => (true, 30, 200.0, &["lo"], &[("jitter_ms", "20")]),
            ExperimentType::NetworkPartition => (false, 20, 100.0, &["3000"], &[]),
            ExperimentType::ResourceExhaustion => (
                true,
                30,
                50.0,
                &["cpu", "memory"],
                &[("memory_mb", "128")],
            ),
            ExperimentType::ServiceFailure => (false, 30, 1.0, &["api"], &[]),
            ExperimentType::DatabaseFailure => (false, 20, 1.0, &["database"], &[("port", "5432")]),
            ExperimentType::FileSystemChaos => (
                true,
                20,
                1.0,
                &["target/chaos-scratch"],
                &[("mode", "fill"), ("fill_mb", "16")],
            ),
        };
        Self {
            enabled,
            duration: Duration::from_secs(duration_secs),
            magnitude,
            targets: targets.iter().map(|t| (*t).to_owned()).collect(),
            parameters: parameters
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
        }
    }

    /// Layer caller-supplied overrides on top of this configuration.
    pub fn merged(&self, overrides: &ExperimentOverrides) -> Self {
        let mut merged = self.clone();
        if let Some(enabled) = overrides.enabled {
            merged.enabled = enabled;
        }
        if let Some(duration) = overrides.duration {
            merged.duration = duration;
        }
        if let Some(magnitude) = overrides.magnitude {
            merged.magnitude = magnitude;
        }
        if let Some(targets) = &overrides.targets {
            merged.targets = targets.clone();
        }
        for (key, value) in &overrides.parameters {
            merged.parameters.insert(key.clone(), value.clone());
        }
        merged
    }

    /// Fetch a string parameter.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    /// Fetch and parse a numeric parameter, falling back to `default` when absent.
    pub fn param_u64(&self, key: &str, default: u64) -> Result<u64> {
        match self.parameters.get(key) {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .with_context(|| format!("parameter '{}' is not an unsigned integer: {}", key, raw)),
            None => Ok(default),
        }
    }
}

/// Partial experiment configuration, used both for `[experiments.<type>]`
/// tables and for per-run caller overrides.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentOverrides {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default, rename = "duration_ms")]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub duration: Option<Duration>,
    #[serde(default)]
    pub magnitude: Option<f64>,
    #[serde(default)]
    pub targets: Option<Vec<String>>,
    #[serde(default)]
    pub parameters: IndexMap<String, String>,
}

impl ExperimentOverrides {
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_magnitude(mut self, magnitude: f64) -> Self {
        self.magnitude = Some(magnitude);
        self
    }

    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets = Some(targets.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_persistence_directory")]
    pub directory: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: default_persistence_directory(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}
