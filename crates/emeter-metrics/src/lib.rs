//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export utilities."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{Gauge, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across crates.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Prometheus scrape endpoint.
async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; charset=utf-8"),
                )],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address for convenience.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the integration engine.
#[derive(Clone, Debug)]
pub struct MeterMetrics {
    readings: IntCounterVec,
    periods_flushed: IntCounter,
    last_period_kwh: Gauge,
    month_rollovers: IntCounter,
}

impl MeterMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let readings = IntCounterVec::new(
            Opts::new(
                "emeter_readings_total",
                "Power-topic messages by outcome (integrated or rejected)",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(readings.clone()))?;

        let periods_flushed = IntCounter::with_opts(Opts::new(
            "emeter_periods_flushed_total",
            "Number of 15-minute periods closed and reported",
        ))?;
        registry.register(Box::new(periods_flushed.clone()))?;

        let last_period_kwh = Gauge::with_opts(Opts::new(
            "emeter_last_period_kwh",
            "Energy reported for the most recently closed period",
        ))?;
        registry.register(Box::new(last_period_kwh.clone()))?;

        let month_rollovers = IntCounter::with_opts(Opts::new(
            "emeter_month_rollovers_total",
            "Number of calendar-month rollovers detected",
        ))?;
        registry.register(Box::new(month_rollovers.clone()))?;

        Ok(Self {
            readings,
            periods_flushed,
            last_period_kwh,
            month_rollovers,
        })
    }

    pub fn record_reading(&self) {
        self.readings.with_label_values(&["integrated"]).inc();
    }

    pub fn record_rejected(&self) {
        self.readings.with_label_values(&["rejected"]).inc();
    }

    pub fn record_period(&self, kwh: f64) {
        self.periods_flushed.inc();
        self.last_period_kwh.set(kwh);
    }

    pub fn record_rollover(&self) {
        self.month_rollovers.inc();
    }
}

pub use prometheus;
