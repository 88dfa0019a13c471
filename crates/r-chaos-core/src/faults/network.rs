//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Network latency (tc netem) and partition (iptables) fault controllers."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use r_chaos_common::{ExperimentConfig, ExperimentType};
use tracing::{debug, info, warn};

use super::command::{args, check_output, is_missing_tool, CommandRunner};
use super::{host_faults_supported, FaultController, FaultEffect, FaultHandle};
use crate::error::FaultError;

const TC: &str = "tc";
const IPTABLES: &str = "iptables";

const TC_NOT_FOUND: &[&str] = &[
    "cannot delete qdisc with handle of zero",
    "no such file or directory",
    "cannot find device",
];
const IPTABLES_NOT_FOUND: &[&str] = &["bad rule", "no chain/target/match by that name"];

/// Adds delay to outbound traffic on each target interface with `tc netem`.
///
/// `magnitude` is the delay in milliseconds; the optional `jitter_ms`
/// parameter adds variation.
#[derive(Debug)]
pub struct NetworkLatencyController {
    runner: Arc<dyn CommandRunner>,
    supported: bool,
}

impl NetworkLatencyController {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            supported: host_faults_supported(),
        }
    }

    /// Override platform detection.
    pub fn with_platform_support(mut self, supported: bool) -> Self {
        self.supported = supported;
        self
    }

    fn add_args(interface: &str, delay_ms: u64, jitter_ms: u64) -> Vec<String> {
        let mut cmd = args(["qdisc", "add", "dev", interface, "root", "netem", "delay"]);
        cmd.push(format!("{delay_ms}ms"));
        if jitter_ms > 0 {
            cmd.push(format!("{jitter_ms}ms"));
        }
        cmd
    }

    fn del_args(interface: &str) -> Vec<String> {
        args(["qdisc", "del", "dev", interface, "root", "netem"])
    }

    async fn remove(&self, interface: &str) -> Result<(), FaultError> {
        let cmd = Self::del_args(interface);
        let output = self.runner.run(TC, &cmd).await?;
        match check_output(TC, &cmd, output, TC_NOT_FOUND) {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => {
                debug!(
                    target: "r_chaos::faults::network",
                    interface,
                    "netem qdisc already removed"
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl FaultController for NetworkLatencyController {
    fn experiment_type(&self) -> ExperimentType {
        ExperimentType::NetworkLatency
    }

    async fn inject(&self, config: &ExperimentConfig) -> Result<FaultHandle, FaultError> {
        if config.targets.is_empty() {
            return Err(FaultError::InvalidConfig(
                "network latency needs at least one interface target".into(),
            ));
        }
        if !config.magnitude.is_finite() || config.magnitude < 1.0 {
            return Err(FaultError::InvalidConfig(format!(
                "latency magnitude must be at least 1ms, got {}",
                config.magnitude
            )));
        }
        let delay_ms = config.magnitude.round() as u64;
        let jitter_ms = config
            .param_u64("jitter_ms", 0)
            .map_err(|err| FaultError::InvalidConfig(err.to_string()))?;
        let planned = |interfaces: Vec<String>| FaultEffect::NetworkDelay {
            interfaces,
            delay_ms,
            jitter_ms,
        };

        if !self.supported {
            return Ok(FaultHandle::simulated(
                self.experiment_type(),
                planned(config.targets.clone()),
                "traffic shaping requires Linux tc",
            ));
        }

        let mut applied: Vec<String> = Vec::with_capacity(config.targets.len());
        for interface in &config.targets {
            let cmd = Self::add_args(interface, delay_ms, jitter_ms);
            let result = match self.runner.run(TC, &cmd).await {
                Ok(output) => check_output(TC, &cmd, output, &[]).map(|_| ()),
                Err(err) if is_missing_tool(&err) && applied.is_empty() => {
                    warn!(
                        target: "r_chaos::faults::network",
                        "tc not installed; simulating latency fault"
                    );
                    return Ok(FaultHandle::simulated(
                        self.experiment_type(),
                        planned(config.targets.clone()),
                        "tc not installed",
                    ));
                }
                Err(err) => Err(FaultError::Io(err)),
            };
            if let Err(err) = result {
                for done in applied.iter().rev() {
                    if let Err(rollback) = self.remove(done).await {
                        warn!(
                            target: "r_chaos::faults::network",
                            interface = %done,
                            error = %rollback,
                            "rollback of partial latency fault failed"
                        );
                    }
                }
                return Err(err);
            }
            applied.push(interface.clone());
        }

        info!(
            target: "r_chaos::faults::network",
            interfaces = ?applied,
            delay_ms,
            jitter_ms,
            "latency fault injected"
        );
        Ok(FaultHandle::applied(self.experiment_type(), planned(applied)))
    }

    async fn recover(&self, handle: &FaultHandle) -> Result<(), FaultError> {
        handle.expect_type(self.experiment_type())?;
        if handle.is_simulated() {
            return Ok(());
        }
        let FaultEffect::NetworkDelay { interfaces, .. } = handle.effect() else {
            return Err(FaultError::InvalidConfig("latency handle without delay effect".into()));
        };
        let mut first_error = None;
        for interface in interfaces {
            if let Err(err) = self.remove(interface).await {
                warn!(
                    target: "r_chaos::faults::network",
                    interface = %interface,
                    error = %err,
                    "failed to remove netem qdisc"
                );
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => {
                info!(target: "r_chaos::faults::network", interfaces = ?interfaces, "latency fault reverted");
                Ok(())
            }
        }
    }
}

/// Inserts and deletes `iptables` DROP rules for TCP ports.
///
/// Shared by the partition and database controllers.
#[derive(Debug)]
pub(crate) struct PacketFilter {
    runner: Arc<dyn CommandRunner>,
}

/// Result of trying to block a set of ports.
pub(crate) enum BlockOutcome {
    Applied,
    ToolMissing,
}

impl PacketFilter {
    pub(crate) fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn rule(action: &str, port: u16) -> Vec<String> {
        let port = port.to_string();
        args([action, "INPUT", "-p", "tcp", "--dport", port.as_str(), "-j", "DROP"])
    }

    /// Block every port; on failure, already-inserted rules are removed again.
    pub(crate) async fn block(&self, ports: &[u16]) -> Result<BlockOutcome, FaultError> {
        let mut inserted: Vec<u16> = Vec::with_capacity(ports.len());
        for &port in ports {
            let cmd = Self::rule("-I", port);
            let result = match self.runner.run(IPTABLES, &cmd).await {
                Ok(output) => check_output(IPTABLES, &cmd, output, &[]).map(|_| ()),
                Err(err) if is_missing_tool(&err) && inserted.is_empty() => {
                    return Ok(BlockOutcome::ToolMissing)
                }
                Err(err) => Err(FaultError::Io(err)),
            };
            if let Err(err) = result {
                if let Err(rollback) = self.unblock(&inserted).await {
                    warn!(
                        target: "r_chaos::faults::network",
                        error = %rollback,
                        "rollback of partial packet filter failed"
                    );
                }
                return Err(err);
            }
            inserted.push(port);
        }
        Ok(BlockOutcome::Applied)
    }

    /// Delete the DROP rule for every port. Rules already gone are skipped.
    pub(crate) async fn unblock(&self, ports: &[u16]) -> Result<(), FaultError> {
        let mut first_error = None;
        for &port in ports {
            let cmd = Self::rule("-D", port);
            let outcome = match self.runner.run(IPTABLES, &cmd).await {
                Ok(output) => check_output(IPTABLES, &cmd, output, IPTABLES_NOT_FOUND).map(|_| ()),
                Err(err) => Err(FaultError::Io(err)),
            };
            match outcome {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {
                    debug!(target: "r_chaos::faults::network", port, "drop rule already removed");
                }
                Err(err) => {
                    warn!(target: "r_chaos::faults::network", port, error = %err, "failed to delete drop rule");
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

pub(crate) fn parse_ports<'a>(
    values: impl IntoIterator<Item = &'a str>,
) -> Result<Vec<u16>, FaultError> {
    values
        .into_iter()
        .map(|raw| {
            raw.trim()
                .parse::<u16>()
                .ok()
                .filter(|port| *port != 0)
                .ok_or_else(|| FaultError::InvalidConfig(format!("'{raw}' is not a TCP port")))
        })
        .collect()
}

/// Drops inbound TCP traffic to each target port.
#[derive(Debug)]
pub struct NetworkPartitionController {
    filter: PacketFilter,
    supported: bool,
}

impl NetworkPartitionController {
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
}

#[async_trait]
impl FaultController for NetworkPartitionController {
    fn experiment_type(&self) -> ExperimentType {
        ExperimentType::NetworkPartition
    }

    async fn inject(&self, config: &ExperimentConfig) -> Result<FaultHandle, FaultError> {
        let ports = parse_ports(config.targets.iter().map(String::as_str))?;
        if ports.is_empty() {
            return Err(FaultError::InvalidConfig(
                "network partition needs at least one port target".into(),
            ));
        }
        let effect = FaultEffect::PacketFilter {
            ports: ports.clone(),
        };
        if !self.supported {
            return Ok(FaultHandle::simulated(
                self.experiment_type(),
                effect,
                "packet filtering requires Linux iptables",
            ));
        }
        match self.filter.block(&ports).await? {
            BlockOutcome::Applied => {
                info!(target: "r_chaos::faults::network", ports = ?ports, "partition injected");
                Ok(FaultHandle::applied(self.experiment_type(), effect))
            }
            BlockOutcome::ToolMissing => {
                warn!(target: "r_chaos::faults::network", "iptables not installed; simulating partition");
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
            return Err(FaultError::InvalidConfig("partition handle without packet filter".into()));
        };
        self.filter.unblock(ports).await?;
        info!(target: "r_chaos::faults::network", ports = ?ports, "partition reverted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faults::command::CommandOutput;
    use crate::faults::scripted::{ScriptedCommandRunner, ScriptedResponse};
    use r_chaos_common::ExperimentOverrides;

    fn latency_config() -> ExperimentConfig {
        ExperimentConfig::defaults_for(ExperimentType::NetworkLatency).merged(
            &ExperimentOverrides::default()
                .with_magnitude(150.0)
                .with_targets(["eth0", "eth1"]),
        )
    }

    #[tokio::test]
    async fn latency_applies_netem_per_interface() {
        let runner = Arc::new(ScriptedCommandRunner::new());
        let controller = NetworkLatencyController::new(runner.clone()).with_platform_support(true);
        let handle = controller.inject(&latency_config()).await.unwrap();
        assert!(!handle.is_simulated());
        assert_eq!(
            runner.calls(),
            vec![
                "tc qdisc add dev eth0 root netem delay 150ms 20ms",
                "tc qdisc add dev eth1 root netem delay 150ms 20ms",
            ]
        );
        controller.recover(&handle).await.unwrap();
        assert_eq!(runner.calls_matching("tc qdisc del"), 2);
    }

    #[tokio::test]
    async fn latency_recover_tolerates_manually_removed_qdisc() {
        let runner = Arc::new(ScriptedCommandRunner::new());
        runner.respond(
            "tc qdisc del",
            ScriptedResponse::Output(CommandOutput::failure(
                2,
                "Error: Cannot delete qdisc with handle of zero.",
            )),
        );
        let controller = NetworkLatencyController::new(runner.clone()).with_platform_support(true);
        let handle = controller.inject(&latency_config()).await.unwrap();
        controller.recover(&handle).await.unwrap();
        controller.recover(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn latency_rolls_back_when_second_interface_fails() {
        let runner = Arc::new(ScriptedCommandRunner::new());
        runner.respond(
            "tc qdisc add dev eth1",
            ScriptedResponse::Output(CommandOutput::failure(2, "Cannot find device \"eth1\"")),
        );
        let controller = NetworkLatencyController::new(runner.clone()).with_platform_support(true);
        let err = controller.inject(&latency_config()).await.unwrap_err();
        assert!(matches!(err, FaultError::Command { .. }));
        assert_eq!(runner.calls_matching("tc qdisc del dev eth0"), 1);
    }

    #[tokio::test]
    async fn latency_is_simulated_without_tc() {
        let runner = Arc::new(ScriptedCommandRunner::new());
        runner.respond("tc", ScriptedResponse::Missing);
        let controller = NetworkLatencyController::new(runner.clone()).with_platform_support(true);
        let handle = controller.inject(&latency_config()).await.unwrap();
        assert!(handle.is_simulated());
        controller.recover(&handle).await.unwrap();
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn partition_inserts_and_deletes_drop_rules() {
        let runner = Arc::new(ScriptedCommandRunner::new());
        let controller = NetworkPartitionController::new(runner.clone()).with_platform_support(true);
        let config = ExperimentConfig::defaults_for(ExperimentType::NetworkPartition);
        let handle = controller.inject(&config).await.unwrap();
        controller.recover(&handle).await.unwrap();
        assert_eq!(
            runner.calls(),
            vec![
                "iptables -I INPUT -p tcp --dport 3000 -j DROP",
                "iptables -D INPUT -p tcp --dport 3000 -j DROP",
            ]
        );
    }

    #[tokio::test]
    async fn partition_rejects_non_numeric_targets() {
        let controller = NetworkPartitionController::new(Arc::new(ScriptedCommandRunner::new()))
            .with_platform_support(true);
        let config = ExperimentConfig::defaults_for(ExperimentType::NetworkPartition)
            .merged(&ExperimentOverrides::default().with_targets(["api"]));
        let err = controller.inject(&config).await.unwrap_err();
        assert!(matches!(err, FaultError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn unsupported_platform_simulates_without_commands() {
        let runner = Arc::new(ScriptedCommandRunner::new());
        let controller = NetworkPartitionController::new(runner.clone()).with_platform_support(false);
        let config = ExperimentConfig::defaults_for(ExperimentType::NetworkPartition);
        let handle = controller.inject(&config).await.unwrap();
        assert!(handle.is_simulated());
        assert!(runner.calls().is_empty());
    }
}
