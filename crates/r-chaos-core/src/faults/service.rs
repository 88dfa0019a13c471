//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Service stop/start fault controller driven by configured command templates."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use r_chaos_common::{ExperimentConfig, ExperimentType, ServiceControlConfig};
use tracing::{debug, info, warn};

use super::command::{check_output, is_missing_tool, CommandRunner};
use super::{host_faults_supported, FaultController, FaultEffect, FaultHandle};
use crate::error::FaultError;

const START_NOT_FOUND: &[&str] = &["already running", "already active", "already started"];

/// Stops each target service with its configured `stop` command and starts it
/// again on recovery.
///
/// Targets without a `[services.<name>]` entry are simulated.
#[derive(Debug)]
pub struct ServiceFailureController {
    runner: Arc<dyn CommandRunner>,
    services: IndexMap<String, ServiceControlConfig>,
    supported: bool,
}

impl ServiceFailureController {
    pub fn new(runner: Arc<dyn CommandRunner>, services: IndexMap<String, ServiceControlConfig>) -> Self {
        Self {
            runner,
            services,
            supported: host_faults_supported(),
        }
    }

    pub fn with_platform_support(mut self, supported: bool) -> Self {
        self.supported = supported;
        self
    }

    fn render(template: &[String], service: &str) -> Option<(String, Vec<String>)> {
        let mut parts = template.iter().map(|part| part.replace("{service}", service));
        let program = parts.next()?;
        Some((program, parts.collect()))
    }

    async fn start(&self, service: &str) -> Result<(), FaultError> {
        let Some((program, args)) = self
            .services
            .get(service)
            .and_then(|control| Self::render(&control.start, service))
        else {
            return Ok(());
        };
        let output = self.runner.run(&program, &args).await?;
        match check_output(&program, &args, output, START_NOT_FOUND) {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => {
                debug!(target: "r_chaos::faults::service", service, "service already running");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl FaultController for ServiceFailureController {
    fn experiment_type(&self) -> ExperimentType {
        ExperimentType::ServiceFailure
    }

    async fn inject(&self, config: &ExperimentConfig) -> Result<FaultHandle, FaultError> {
        if config.targets.is_empty() {
            return Err(FaultError::InvalidConfig(
                "service failure needs at least one service target".into(),
            ));
        }

        let mut stopped: Vec<String> = Vec::new();
        let mut simulated: Vec<String> = Vec::new();
        for service in &config.targets {
            let stop = if self.supported {
                self.services
                    .get(service)
                    .and_then(|control| Self::render(&control.stop, service))
            } else {
                None
            };
            let Some((program, args)) = stop else {
                simulated.push(service.clone());
                continue;
            };

            let outcome = match self.runner.run(&program, &args).await {
                Ok(output) => check_output(&program, &args, output, &[]).map(|_| ()),
                Err(err) if is_missing_tool(&err) => {
                    warn!(
                        target: "r_chaos::faults::service",
                        service = %service,
                        program = %program,
                        "service manager not installed; simulating stop"
                    );
                    simulated.push(service.clone());
                    continue;
                }
                Err(err) => Err(FaultError::Io(err)),
            };
            if let Err(err) = outcome {
                for done in stopped.iter().rev() {
                    if let Err(rollback) = self.start(done).await {
                        warn!(
                            target: "r_chaos::faults::service",
                            service = %done,
                            error = %rollback,
                            "failed to restart service during rollback"
                        );
                    }
                }
                return Err(err);
            }
            stopped.push(service.clone());
        }

        let effect = FaultEffect::ServicesStopped {
            stopped: stopped.clone(),
            simulated,
        };
        if stopped.is_empty() {
            return Ok(FaultHandle::simulated(
                self.experiment_type(),
                effect,
                "no service control commands available for the targets",
            ));
        }
        info!(target: "r_chaos::faults::service", services = ?stopped, "services stopped");
        Ok(FaultHandle::applied(self.experiment_type(), effect))
    }

    async fn recover(&self, handle: &FaultHandle) -> Result<(), FaultError> {
        handle.expect_type(self.experiment_type())?;
        let FaultEffect::ServicesStopped { stopped, .. } = handle.effect() else {
            return Err(FaultError::InvalidConfig("service handle without stopped services".into()));
        };
        let mut first_error = None;
        for service in stopped.iter().rev() {
            if let Err(err) = self.start(service).await {
                warn!(
                    target: "r_chaos::faults::service",
                    service = %service,
                    error = %err,
                    "failed to start service"
                );
                first_error.get_or_insert(err);
            }
        }
        if first_error.is_none() && !stopped.is_empty() {
            info!(target: "r_chaos::faults::service", services = ?stopped, "services restarted");
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faults::command::CommandOutput;
    use crate::faults::scripted::{ScriptedCommandRunner, ScriptedResponse};
    use r_chaos_common::ExperimentOverrides;

    fn services() -> IndexMap<String, ServiceControlConfig> {
        let mut services = IndexMap::new();
        services.insert(
            "api".to_owned(),
            ServiceControlConfig {
                stop: vec!["systemctl".into(), "stop".into(), "{service}.service".into()],
                start: vec!["systemctl".into(), "start".into(), "{service}.service".into()],
            },
        );
        services
    }

    fn config(targets: &[&str]) -> ExperimentConfig {
        ExperimentConfig::defaults_for(ExperimentType::ServiceFailure)
            .merged(&ExperimentOverrides::default().with_targets(targets.iter().copied()))
    }

    #[tokio::test]
    async fn stops_configured_services_and_simulates_the_rest() {
        let runner = Arc::new(ScriptedCommandRunner::new());
        let controller =
            ServiceFailureController::new(runner.clone(), services()).with_platform_support(true);
        let handle = controller.inject(&config(&["api", "worker"])).await.unwrap();
        assert!(!handle.is_simulated());
        assert_eq!(
            handle.effect(),
            &FaultEffect::ServicesStopped {
                stopped: vec!["api".into()],
                simulated: vec!["worker".into()],
            }
        );
        controller.recover(&handle).await.unwrap();
        assert_eq!(
            runner.calls(),
            vec!["systemctl stop api.service", "systemctl start api.service"]
        );
    }

    #[tokio::test]
    async fn unconfigured_services_yield_simulated_handle() {
        let runner = Arc::new(ScriptedCommandRunner::new());
        let controller =
            ServiceFailureController::new(runner.clone(), IndexMap::new()).with_platform_support(true);
        let handle = controller.inject(&config(&["api"])).await.unwrap();
        assert!(handle.is_simulated());
        controller.recover(&handle).await.unwrap();
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn start_failure_is_surfaced() {
        let runner = Arc::new(ScriptedCommandRunner::new());
        runner.respond(
            "systemctl start",
            ScriptedResponse::Output(CommandOutput::failure(1, "Job for api.service failed")),
        );
        let controller =
            ServiceFailureController::new(runner.clone(), services()).with_platform_support(true);
        let handle = controller.inject(&config(&["api"])).await.unwrap();
        let err = controller.recover(&handle).await.unwrap_err();
        assert!(matches!(err, FaultError::Command { .. }));
    }
}
