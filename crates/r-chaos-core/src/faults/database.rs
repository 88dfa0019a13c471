//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Database connectivity fault controller."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use r_chaos_common::{ExperimentConfig, ExperimentType};
use tracing::{info, warn};

use super::command::CommandRunner;
use super::network::{parse_ports, BlockOutcome, PacketFilter};
use super::{host_faults_supported, FaultController, FaultEffect, FaultHandle};
use crate::error::FaultError;

const DEFAULT_PORT: &str = "5432";

/// Cuts connectivity to the database by dropping traffic to its port.
///
/// Ports come from the `ports` parameter (comma separated) or `port`.
/// Targets only name the databases for the record.
#[derive(Debug)]
pub struct DatabaseFailureController {
    filter: PacketFilter,
    supported: bool,
}

impl DatabaseFailureController {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            filter: PacketFilter::new(runner),
            supported: host_faults_supported(),
        }
    }

    pub fn with_platform_support(mut self, supported: bool) -> Self {
        self.supported = supported;
        self
    }

    fn ports(config: &ExperimentConfig) -> Result<Vec<u16>, FaultError> {
        match config.param("ports") {
            Some(list) => parse_ports(list.split(',').filter(|p| !p.trim().is_empty())),
            None => parse_ports([config.param("port").unwrap_or(DEFAULT_PORT)]),
        }
    }
}

#[async_trait]
impl FaultController for DatabaseFailureController {
    fn experiment_type(&self) -> ExperimentType {
        ExperimentType::DatabaseFailure
    }

    async fn inject(&self, config: &ExperimentConfig) -> Result<FaultHandle, FaultError> {
        let ports = Self::ports(config)?;
        if ports.is_empty() {
            return Err(FaultError::InvalidConfig("database failure needs a port".into()));
        }
        let effect = FaultEffect::PacketFilter {
            ports: ports.clone(),
        };
        if !self.supported {
            return Ok(FaultHandle::simulated(
                self.experiment_type(),
                effect,
                "database isolation requires Linux iptables",
            ));
        }
        match self.filter.block(&ports).await? {
            BlockOutcome::Applied => {
                info!(
                    target: "r_chaos::faults::database",
                    databases = ?config.targets,
                    ports = ?ports,
                    "database traffic blocked"
                );
                Ok(FaultHandle::applied(self.experiment_type(), effect))
            }
            BlockOutcome::ToolMissing => {
                warn!(target: "r_chaos::faults::database", "iptables not installed; simulating database failure");
                Ok(FaultHandle::simulated(
                    self.experiment_type(),
                    effect,
                    "iptables not installed",
                ))
            }
        }
    }

    async fn recover(&self, handle: &FaultHandle) -> Result<(), FaultError> {
        handle.expect_type(self.experiment_type())?;
        if handle.is_simulated() {
            return Ok(());
        }
        let FaultEffect::PacketFilter { ports } = handle.effect() else {
            return Err(FaultError::InvalidConfig("database handle without packet filter".into()));
        };
        self.filter.unblock(ports).await?;
        info!(target: "r_chaos::faults::database", ports = ?ports, "database traffic restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faults::command::CommandOutput;
    use crate::faults::scripted::{ScriptedCommandRunner, ScriptedResponse};
    use r_chaos_common::ExperimentOverrides;

    #[tokio::test]
    async fn blocks_each_configured_port() {
        let runner = Arc::new(ScriptedCommandRunner::new());
        let controller = DatabaseFailureController::new(runner.clone()).with_platform_support(true);
        let config = ExperimentConfig::defaults_for(ExperimentType::DatabaseFailure)
            .merged(&ExperimentOverrides::default().with_parameter("ports", "5432, 6379"));
        let handle = controller.inject(&config).await.unwrap();
        assert_eq!(handle.effect(), &FaultEffect::PacketFilter { ports: vec![5432, 6379] });
        assert_eq!(runner.calls_matching("iptables -I INPUT"), 2);
    }

    #[tokio::test]
    async fn recover_skips_rules_removed_by_hand() {
        let runner = Arc::new(ScriptedCommandRunner::new());
        runner.respond(
            "iptables -D",
            ScriptedResponse::Output(CommandOutput::failure(
                1,
                "iptables: Bad rule (does a matching rule exist in that chain?).",
            )),
        );
        let controller = DatabaseFailureController::new(runner.clone()).with_platform_support(true);
        let config = ExperimentConfig::defaults_for(ExperimentType::DatabaseFailure);
        let handle = controller.inject(&config).await.unwrap();
        controller.recover(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn partial_block_is_rolled_back() {
        let runner = Arc::new(ScriptedCommandRunner::new());
        runner.respond(
            "iptables -I INPUT -p tcp --dport 6379",
            ScriptedResponse::Output(CommandOutput::failure(4, "Permission denied")),
        );
        let controller = DatabaseFailureController::new(runner.clone()).with_platform_support(true);
        let config = ExperimentConfig::defaults_for(ExperimentType::DatabaseFailure)
            .merged(&ExperimentOverrides::default().with_parameter("ports", "5432,6379"));
        assert!(controller.inject(&config).await.is_err());
        assert_eq!(runner.calls_matching("iptables -D INPUT -p tcp --dport 5432"), 1);
    }
}
