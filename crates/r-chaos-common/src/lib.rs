//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the chaos orchestrator."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the R-Chaos workspace: configuration loading,
//! tracing initialisation, and the injectable clock.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AppConfig, EndpointConfig, ExperimentConfig, ExperimentOverrides, ExperimentType,
    LoadedAppConfig, LoggingConfig, MetricsConfig, OrchestratorConfig, PersistenceConfig,
    ProbeConfig, RecoveryConfig, SafetyConfig, ServiceControlConfig,
};
pub use logging::{init_test_tracing, init_tracing, LogFormat};
pub use time::{Clock, ManualClock, SystemClock};
