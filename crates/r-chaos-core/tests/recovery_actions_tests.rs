//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "integration"
//! ems_type: "test"
//! ems_scope: "code"
//! ems_description: "Circuit-breaker reset against an in-process HTTP gateway."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
mod support;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use r_chaos_common::{AppConfig, ExperimentOverrides, ExperimentType, RecoveryConfig};
use r_chaos_core::faults::ScriptedCommandRunner;
use r_chaos_core::{ChaosOrchestrator, ExperimentStatus, FaultRegistry, RecoveryActions};
use tokio::net::TcpListener;
use url::Url;

use support::{FaultSwitch, RecordingController, ScriptedProbe};

async fn gateway(status: StatusCode) -> (SocketAddr, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route(
            "/admin/circuit-breakers/reset",
            post(move |State(hits): State<Arc<AtomicUsize>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                status
            }),
        )
        .with_state(hits.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, hits)
}

fn closed_port() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

fn actions(addr: SocketAddr) -> RecoveryActions {
    let config = RecoveryConfig {
        circuit_breaker_url: Some(Url::parse(&format!("http://{addr}")).unwrap()),
        timeout: Duration::from_secs(2),
        ..RecoveryConfig::default()
    };
    RecoveryActions::from_config(&config, Arc::new(ScriptedCommandRunner::new())).unwrap()
}

#[tokio::test]
async fn accepted_reset_is_reported() {
    let (addr, hits) = gateway(StatusCode::NO_CONTENT).await;

    let report = actions(addr).run().await;

    assert_eq!(report.circuit_breakers_reset, Some(true));
    assert!(report.warnings.is_empty());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn server_error_becomes_a_warning() {
    let (addr, hits) = gateway(StatusCode::SERVICE_UNAVAILABLE).await;

    let report = actions(addr).run().await;

    assert_eq!(report.circuit_breakers_reset, Some(false));
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("circuit breaker reset failed"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unreachable_gateway_does_not_fail_the_experiment() {
    let switch = Arc::new(FaultSwitch::default());
    let probe = Arc::new(ScriptedProbe::new(switch.clone()));
    let controller = Arc::new(RecordingController::new(
        ExperimentType::NetworkLatency,
        switch,
    ));
    let mut config = AppConfig::default();
    config.orchestrator.observation_interval = Duration::from_millis(20);
    config.orchestrator.settle_time = Duration::from_millis(10);
    let handle = ChaosOrchestrator::new(
        config,
        probe,
        FaultRegistry::new().with(controller.clone()),
    )
    .with_recovery_actions(actions(closed_port()))
    .without_safety_monitor()
    .start()
    .await
    .unwrap();

    let record = handle
        .run_experiment(
            ExperimentType::NetworkLatency,
            ExperimentOverrides::default().with_duration(Duration::from_millis(60)),
        )
        .await
        .unwrap();

    assert_eq!(record.status, ExperimentStatus::Completed);
    let report = record.recovery_actions.as_ref().unwrap();
    assert_eq!(report.circuit_breakers_reset, Some(false));
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(controller.recover_calls(), 1);
    assert_eq!(controller.live(), 0);
}
