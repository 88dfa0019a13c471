//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Best-effort recovery side actions: restart hooks and circuit-breaker reset."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use r_chaos_common::RecoveryConfig;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use crate::error::ProbeError;
use crate::faults::command::{command_line, CommandRunner};

const CIRCUIT_BREAKER_RESET_PATH: &str = "admin/circuit-breakers/reset";

/// What the side actions did after a fault was reverted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryActionsReport {
    pub restarted: Vec<String>,
    #[serde(default)]
    pub circuit_breakers_reset: Option<bool>,
    pub warnings: Vec<String>,
}

/// Runs configured restart commands and resets circuit breakers.
///
/// Failures are reported but never fail the experiment.
#[derive(Debug, Clone)]
pub struct RecoveryActions {
    runner: Option<Arc<dyn CommandRunner>>,
    restart_commands: Vec<Vec<String>>,
    circuit_breaker: Option<(reqwest::Client, Url)>,
}

impl RecoveryActions {
    /// No side actions.
    pub fn none() -> Self {
        Self {
            runner: None,
            restart_commands: Vec::new(),
            circuit_breaker: None,
        }
    }

    pub fn from_config(
        config: &RecoveryConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, ProbeError> {
        let circuit_breaker = match &config.circuit_breaker_url {
            Some(base) => {
                let client = reqwest::Client::builder()
                    .timeout(config.timeout)
                    .build()
                    .map_err(|err| ProbeError::Unavailable(format!("http client: {err}")))?;
                Some((client, reset_url(base)?))
            }
            None => None,
        };
        Ok(Self {
            runner: Some(runner),
            restart_commands: config
                .restart_commands
                .iter()
                .filter(|cmd| !cmd.is_empty())
                .cloned()
                .collect(),
            circuit_breaker,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.restart_commands.is_empty() && self.circuit_breaker.is_none()
    }

    pub async fn run(&self) -> RecoveryActionsReport {
        let mut report = RecoveryActionsReport::default();

        if let Some(runner) = &self.runner {
            for command in &self.restart_commands {
                let Some((program, args)) = command.split_first() else {
                    continue;
                };
                let line = command_line(program, args);
                match runner.run(program, args).await {
                    Ok(output) if output.succeeded() => {
                        info!(target: "r_chaos::recovery", command = %line, "restart hook completed");
                        report.restarted.push(line);
                    }
                    Ok(output) => {
                        warn!(
                            target: "r_chaos::recovery",
                            command = %line,
                            status = ?output.status,
                            "restart hook failed"
                        );
                        report.warnings.push(format!(
                            "`{line}` exited with {:?}: {}",
                            output.status,
                            output.stderr.trim()
                        ));
                    }
                    Err(err) => {
                        warn!(target: "r_chaos::recovery", command = %line, error = %err, "restart hook could not run");
                        report.warnings.push(format!("`{line}` could not run: {err}"));
                    }
                }
            }
        }

        if let Some((client, url)) = &self.circuit_breaker {
            let outcome = client
                .post(url.clone())
                .send()
                .await
                .and_then(|response| response.error_for_status());
            match outcome {
                Ok(_) => {
                    info!(target: "r_chaos::recovery", url = %url, "circuit breakers reset");
                    report.circuit_breakers_reset = Some(true);
                }
                Err(err) => {
                    warn!(target: "r_chaos::recovery", url = %url, error = %err, "circuit breaker reset failed");
                    report.circuit_breakers_reset = Some(false);
                    report.warnings.push(format!("circuit breaker reset failed: {err}"));
                }
            }
        }

        report
    }
}

impl Default for RecoveryActions {
    fn default() -> Self {
        Self::none()
    }
}

fn reset_url(base: &Url) -> Result<Url, ProbeError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(CIRCUIT_BREAKER_RESET_PATH)
        .map_err(|err| ProbeError::Unavailable(format!("circuit breaker url: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faults::command::CommandOutput;
    use crate::faults::scripted::{ScriptedCommandRunner, ScriptedResponse};

    #[test]
    fn reset_url_keeps_base_path() {
        let base = Url::parse("http://gateway:8080/api").unwrap();
        assert_eq!(
            reset_url(&base).unwrap().as_str(),
            "http://gateway:8080/api/admin/circuit-breakers/reset"
        );
        let root = Url::parse("http://gateway:8080").unwrap();
        assert_eq!(
            reset_url(&root).unwrap().as_str(),
            "http://gateway:8080/admin/circuit-breakers/reset"
        );
    }

    #[tokio::test]
    async fn restart_failures_become_warnings() {
        let runner = Arc::new(ScriptedCommandRunner::new());
        runner.respond(
            "systemctl restart worker",
            ScriptedResponse::Output(CommandOutput::failure(5, "Unit worker.service not found.")),
        );
        let config = RecoveryConfig {
            restart_commands: vec![
                vec!["systemctl".into(), "restart".into(), "api".into()],
                vec!["systemctl".into(), "restart".into(), "worker".into()],
                Vec::new(),
            ],
            ..RecoveryConfig::default()
        };
        let actions = RecoveryActions::from_config(&config, runner.clone()).unwrap();
        let report = actions.run().await;
        assert_eq!(report.restarted, vec!["systemctl restart api".to_owned()]);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.circuit_breakers_reset, None);
        assert_eq!(runner.calls().len(), 2);
    }

    #[tokio::test]
    async fn no_actions_produce_empty_report() {
        let report = RecoveryActions::none().run().await;
        assert_eq!(report, RecoveryActionsReport::default());
    }
}
