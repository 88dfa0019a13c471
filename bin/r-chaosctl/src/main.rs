//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Control CLI for running chaos experiments."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use r_chaos_common::{init_tracing, AppConfig, ExperimentOverrides, ExperimentType};
use r_chaos_core::prelude::*;
use r_chaos_core::{CommandRunner, RecoveryActions};
use r_chaos_metrics::{new_registry, register_build_info, spawn_http_server};
use r_chaos_persistence::FileExperimentStore;
use serde_json::json;
use tokio::signal;
use tracing::{info, warn};

mod records;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "R-Chaos experiment orchestrator",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run one experiment and print its record")]
    Run(RunArgs),
    #[command(about = "Run every enabled experiment in sequence")]
    RunAll,
    #[command(about = "Sample system health and print the snapshot")]
    Baseline,
    #[command(about = "List experiment types with their effective settings")]
    List,
    #[command(subcommand, about = "Inspect persisted experiment records")]
    Records(records::RecordsCommand),
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    #[arg(value_name = "TYPE", help = "Experiment type, e.g. networkLatency")]
    experiment: ExperimentType,
    #[arg(long, value_name = "MS", help = "Override the experiment duration")]
    duration_ms: Option<u64>,
    #[arg(long, help = "Override the fault magnitude")]
    magnitude: Option<f64>,
    #[arg(long = "target", value_name = "TARGET", help = "Replace targets (repeatable)")]
    targets: Vec<String>,
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param, help = "Set a fault parameter (repeatable)")]
    params: Vec<(String, String)>,
}

impl RunArgs {
    fn overrides(&self) -> ExperimentOverrides {
        let mut overrides = ExperimentOverrides::default();
        if let Some(ms) = self.duration_ms {
            overrides = overrides.with_duration(Duration::from_millis(ms));
        }
        if let Some(magnitude) = self.magnitude {
            overrides = overrides.with_magnitude(magnitude);
        }
        if !self.targets.is_empty() {
            overrides = overrides.with_targets(self.targets.iter().cloned());
        }
        for (key, value) in &self.params {
            overrides = overrides.with_parameter(key.clone(), value.clone());
        }
        overrides
    }
}

fn parse_param(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_owned(), value.trim().to_owned()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/chaos.toml"));
    candidates.push(PathBuf::from("configs/example.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let config = loaded.config;
    init_tracing("r-chaosctl", &config.logging)?;
    info!(target: "r_chaos::cli", config_path = %loaded.source.display(), "configuration loaded");

    match cli.command {
        Commands::List => list(&config),
        Commands::Records(cmd) => records::run(&config, cmd),
        Commands::Baseline => {
            let probe = HttpMetricsProbe::with_system_resources(&config.probe)?;
            let snapshot = probe.capture_baseline().await?;
            print_json(&snapshot)
        }
        Commands::Run(args) => {
            let experiment = args.experiment;
            let overrides = args.overrides();
            with_orchestrator(config, |handle| async move {
                let result = supervise(&handle, handle.run_experiment(experiment, overrides)).await?;
                report(&[result])
            })
            .await
        }
        Commands::RunAll => {
            with_orchestrator(config, |handle| async move {
                let results = supervise(&handle, handle.run_all_enabled()).await?;
                report(&results)
            })
            .await
        }
    }
}

/// Start the orchestrator with the host stack, run `work`, then shut down.
async fn with_orchestrator<F, Fut>(config: AppConfig, work: F) -> Result<()>
where
    F: FnOnce(OrchestratorHandle) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner::default());
    let probe = HttpMetricsProbe::with_system_resources(&config.probe)?;
    let recovery = RecoveryActions::from_config(&config.recovery, runner.clone())?;
    let faults = FaultRegistry::platform(&config, runner);

    let metrics_settings = config.metrics.clone();
    let persistence = config.persistence.clone();
    let mut orchestrator =
        ChaosOrchestrator::new(config, Arc::new(probe), faults).with_recovery_actions(recovery);

    let metrics_server = if metrics_settings.enabled {
        let registry = new_registry();
        register_build_info(&registry, env!("CARGO_PKG_VERSION"))?;
        orchestrator = orchestrator.with_metrics(registry.clone());
        let server = spawn_http_server(registry, metrics_settings.listen)?;
        info!(target: "r_chaos::cli", address = %server.addr(), "metrics exporter enabled");
        Some(server)
    } else {
        None
    };

    if persistence.enabled {
        let store = FileExperimentStore::open(&persistence.directory).with_context(|| {
            format!(
                "unable to open record store at {}",
                persistence.directory.display()
            )
        })?;
        orchestrator = orchestrator.with_store(Arc::new(store));
    }

    let handle = orchestrator.start().await?;
    let outcome = work(handle.clone()).await;
    handle.shutdown().await?;
    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    outcome
}

/// Await `work`; on ctrl-c raise the emergency stop and keep waiting so the
/// running experiment still reverts its fault.
async fn supervise<T>(handle: &OrchestratorHandle, work: impl Future<Output = T>) -> Result<T> {
    tokio::pin!(work);
    tokio::select! {
        output = &mut work => return Ok(output),
        interrupted = signal::ctrl_c() => {
            interrupted?;
            warn!(target: "r_chaos::cli", "ctrl-c received; triggering emergency stop");
            handle.trigger_emergency_stop(EmergencyReason::Operator {
                reason: "interrupted from the command line".into(),
            });
        }
    }
    Ok(work.await)
}

/// Print each outcome as JSON; fails when any experiment did not complete.
fn report(results: &[ExperimentResult]) -> Result<()> {
    let mut unsuccessful = 0usize;
    for result in results {
        match result {
            Ok(record) => {
                if record.status != ExperimentStatus::Completed {
                    unsuccessful += 1;
                }
                print_json(record)?;
            }
            Err(err) => {
                unsuccessful += 1;
                match err.record() {
                    Some(record) => print_json(&json!({ "error": err.to_string(), "record": record }))?,
                    None => print_json(&json!({ "error": err.to_string() }))?,
                }
            }
        }
    }
    if unsuccessful > 0 {
        return Err(anyhow!(
            "{unsuccessful} of {} experiment(s) did not complete",
            results.len()
        ));
    }
    Ok(())
}

fn list(config: &AppConfig) -> Result<()> {
    for experiment_type in ExperimentType::all() {
        let experiment = config.experiment(experiment_type);
        print_json(&json!({
            "type": experiment_type,
            "enabled": experiment.enabled,
            "durationMs": experiment.duration.as_millis() as u64,
            "magnitude": experiment.magnitude,
            "targets": experiment.targets,
            "parameters": experiment.parameters,
        }))?;
    }
    Ok(())
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_arguments_become_overrides() {
        let cli = Cli::try_parse_from([
            "r-chaosctl",
            "run",
            "networkLatency",
            "--duration-ms",
            "5000",
            "--target",
            "eth0",
            "--target",
            "eth1",
            "--param",
            "jitter_ms=5",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.experiment, ExperimentType::NetworkLatency);
        let overrides = args.overrides();
        assert_eq!(overrides.duration, Some(Duration::from_millis(5000)));
        assert_eq!(
            overrides.targets,
            Some(vec!["eth0".to_owned(), "eth1".to_owned()])
        );
        assert_eq!(overrides.parameters.get("jitter_ms").map(String::as_str), Some("5"));
        assert_eq!(overrides.magnitude, None);
    }

    #[test]
    fn unknown_experiment_type_is_rejected() {
        assert!(Cli::try_parse_from(["r-chaosctl", "run", "meteorStrike"]).is_err());
    }

    #[test]
    fn params_need_a_key() {
        assert!(parse_param("=5").is_err());
        assert!(parse_param("jitter").is_err());
        assert_eq!(
            parse_param(" fill_mb = 32 ").unwrap(),
            ("fill_mb".to_owned(), "32".to_owned())
        );
    }
}
