//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "integration"
//! ems_type: "test"
//! ems_scope: "code"
//! ems_description: "HTTP health probe against a local axum server."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use r_chaos_common::{
    AppConfig, EndpointConfig, ExperimentOverrides, ExperimentType, ProbeConfig,
};
use r_chaos_core::faults::{NetworkLatencyController, ScriptedCommandRunner};
use r_chaos_core::probe::StaticResourceSampler;
use r_chaos_core::{
    ChaosOrchestrator, FaultRegistry, HealthStatus, HttpMetricsProbe, PhaseName, ResourceUsage,
    SystemProbe,
};
use tokio::net::TcpListener;
use url::Url;

async fn serve() -> SocketAddr {
    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(
            "/broken",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "down") }),
        );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn closed_port() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

fn endpoint(name: &str, url: Option<String>, essential: bool) -> EndpointConfig {
    EndpointConfig {
        name: name.into(),
        url: url.map(|u| Url::parse(&u).unwrap()),
        essential,
    }
}

fn probe(endpoints: Vec<EndpointConfig>) -> HttpMetricsProbe {
    let config = ProbeConfig {
        timeout: Duration::from_secs(2),
        endpoints,
    };
    let resources = StaticResourceSampler(ResourceUsage {
        memory_percent: 42.0,
        cpu_percent: 7.5,
    });
    HttpMetricsProbe::new(&config, Arc::new(resources)).unwrap()
}

#[tokio::test]
async fn mixed_endpoints_fold_into_one_snapshot() {
    let addr = serve().await;
    let gone = closed_port();
    let probe = probe(vec![
        endpoint("api", Some(format!("http://{addr}/health")), true),
        endpoint("worker", Some(format!("http://{addr}/broken")), false),
        endpoint("legacy", Some(format!("http://{gone}/health")), false),
        endpoint("batch", None, false),
    ]);

    let snapshot = probe.sample().await.unwrap();

    assert!(snapshot.response_time_ms.is_some());
    assert!((snapshot.error_rate - 200.0 / 3.0).abs() < 1e-9);
    assert_eq!(snapshot.memory_usage, 42.0);
    assert_eq!(snapshot.cpu_usage, 7.5);
    let status: Vec<HealthStatus> = snapshot.services.iter().map(|s| s.status).collect();
    assert_eq!(
        status,
        vec![
            HealthStatus::Healthy,
            HealthStatus::Unhealthy,
            HealthStatus::Unhealthy,
            HealthStatus::Unknown,
        ]
    );
    assert_eq!(snapshot.services[1].status_code, Some(500));
    assert_eq!(snapshot.services[2].status_code, None);
    assert_eq!(snapshot.unhealthy_count(), 2);
    assert_eq!(snapshot.unhealthy_essential().count(), 0);
}

#[tokio::test]
async fn nothing_reachable_leaves_response_time_empty() {
    let gone = closed_port();
    let probe = probe(vec![endpoint("api", Some(format!("http://{gone}/health")), true)]);

    let snapshot = probe.sample().await.unwrap();

    assert_eq!(snapshot.response_time_ms, None);
    assert_eq!(snapshot.error_rate, 100.0);
    assert_eq!(snapshot.throughput, 0.0);
    assert_eq!(snapshot.unhealthy_essential().count(), 1);
}

#[tokio::test]
async fn experiment_against_live_endpoints_recovers() {
    let addr = serve().await;
    let mut config = AppConfig::default();
    config.orchestrator.observation_interval = Duration::from_millis(50);
    config.orchestrator.settle_time = Duration::from_millis(10);
    let probe = probe(vec![
        endpoint("api", Some(format!("http://{addr}/health")), true),
        endpoint("db", Some(format!("http://{addr}/health")), true),
    ]);
    let runner = Arc::new(ScriptedCommandRunner::new());
    let latency = NetworkLatencyController::new(runner.clone()).with_platform_support(true);
    let handle = ChaosOrchestrator::new(
        config,
        Arc::new(probe),
        FaultRegistry::new().with(Arc::new(latency)),
    )
    .without_safety_monitor()
    .start()
    .await
    .unwrap();

    let record = handle
        .run_experiment(
            ExperimentType::NetworkLatency,
            ExperimentOverrides::default()
                .with_duration(Duration::from_millis(200))
                .with_targets(["lo"]),
        )
        .await
        .unwrap();

    assert!(record.status.is_terminal());
    assert_eq!(record.phase_names(), PhaseName::ORDER.to_vec());
    assert_eq!(record.observations.len(), 4);
    assert!(record.observations.iter().all(|s| s.error_rate == 0.0));
    let validation = record.recovery_validation.as_ref().unwrap();
    assert!(!validation.undetermined);
    assert_eq!(validation.error_rate_delta, 0.0);
    assert_eq!(runner.calls_matching("tc qdisc add dev lo"), 1);
    assert_eq!(runner.calls_matching("tc qdisc del dev lo"), 1);
}
