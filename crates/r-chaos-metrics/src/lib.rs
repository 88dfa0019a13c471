//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Prometheus registry and scrape endpoint for the chaos orchestrator."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared Prometheus registry plus a small axum exporter serving `/metrics`
//! and a `/healthz` liveness route.

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntGaugeVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub use prometheus;

/// Registry shared by every component that publishes metrics.
pub type SharedRegistry = Arc<Registry>;

pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Publish `r_chaos_build_info{version}` with a constant value of 1.
pub fn register_build_info(registry: &Registry, version: &str) -> Result<()> {
    let info = IntGaugeVec::new(
        Opts::new("r_chaos_build_info", "Build metadata of the running binary"),
        &["version"],
    )?;
    registry
        .register(Box::new(info.clone()))
        .context("build info already registered")?;
    info.with_label_values(&[version]).set(1);
    Ok(())
}

/// Running `/metrics` exporter; stop it with [`MetricsServer::shutdown`].
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

/// Bind `addr` and serve the registry until shut down.
///
/// Binding happens synchronously so configuration errors surface before the
/// orchestrator starts; port `0` picks a free port.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener on {addr}"))?;
    listener
        .set_nonblocking(true)
        .context("failed to make metrics listener non-blocking")?;
    let addr = listener
        .local_addr()
        .context("failed to read metrics listener address")?;
    let listener =
        TcpListener::from_std(listener).context("failed to hand metrics listener to tokio")?;

    let app = Router::new()
        .route("/metrics", get(scrape))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(registry);

    let (stop, mut stopped) = watch::channel(false);
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stopped.wait_for(|stop| *stop).await;
            })
            .await
            .context("metrics exporter failed")
    });

    info!(target: "r_chaos::metrics", address = %addr, "metrics exporter listening");
    Ok(MetricsServer { addr, stop, task })
}

impl MetricsServer {
    /// Bound address, with port `0` resolved.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(self) -> Result<()> {
        self.stop.send_replace(true);
        self.task.await.context("metrics exporter task panicked")??;
        debug!(target: "r_chaos::metrics", address = %self.addr, "metrics exporter stopped");
        Ok(())
    }
}

async fn scrape(State(registry): State<SharedRegistry>) -> Response {
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&registry.gather()) {
        Ok(body) => ([(header::CONTENT_TYPE, encoder.format_type())], body).into_response(),
        Err(err) => {
            error!(target: "r_chaos::metrics", error = %err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{IntCounter, Opts};

    #[tokio::test]
    async fn exporter_serves_registered_families() {
        let registry = new_registry();
        let counter = IntCounter::with_opts(Opts::new(
            "r_chaos_test_events_total",
            "Counter used by the exporter test",
        ))
        .unwrap();
        registry.register(Box::new(counter.clone())).unwrap();
        counter.inc();
        register_build_info(&registry, "0.1.0").unwrap();

        let server = spawn_http_server(registry, SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        let base = format!("http://{}", server.addr());
        let body = reqwest::get(format!("{base}/metrics"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("r_chaos_test_events_total 1"));
        assert!(body.contains("r_chaos_build_info{version=\"0.1.0\"} 1"));
        let health = reqwest::get(format!("{base}/healthz")).await.unwrap();
        assert_eq!(health.status(), 200);
        server.shutdown().await.unwrap();
    }

    #[test]
    fn build_info_registers_once() {
        let registry = new_registry();
        register_build_info(&registry, "0.1.0").unwrap();
        assert!(register_build_info(&registry, "0.1.0").is_err());
    }
}
