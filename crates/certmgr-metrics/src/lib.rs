//! ---
//! certmgr_section: "03-observability"
//! certmgr_subsection: "module"
//! certmgr_type: "source"
//! certmgr_scope: "code"
//! certmgr_description: "Metrics collection and export utilities."
//! certmgr_version: "v0.1.0"
//! certmgr_owner: "platform"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across services.
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
    /// Address the exporter is actually bound to.
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

/// Metrics recorded by the certificate request loop.
#[derive(Clone, Debug)]
pub struct RequesterMetrics {
    registry: SharedRegistry,
    requests_sent: IntCounterVec,
    responses_received: IntCounter,
    malformed_messages: IntCounterVec,
    installs: IntCounterVec,
    interval_seconds: Gauge,
    passthrough: IntGauge,
}

impl RequesterMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let requests_sent = IntCounterVec::new(
            Opts::new(
                "certmgr_cert_requests_total",
                "Certificate requests published, by trigger",
            ),
            &["trigger"],
        )?;
        registry.register(Box::new(requests_sent.clone()))?;

        let responses_received = IntCounter::with_opts(Opts::new(
            "certmgr_cert_responses_total",
            "Certificate responses decoded from the bus",
        ))?;
        registry.register(Box::new(responses_received.clone()))?;

        let malformed_messages = IntCounterVec::new(
            Opts::new(
                "certmgr_malformed_messages_total",
                "Messages that could not be decoded, by channel",
            ),
            &["channel"],
        )?;
        registry.register(Box::new(malformed_messages.clone()))?;

        let installs = IntCounterVec::new(
            Opts::new(
                "certmgr_cert_installs_total",
                "Certificate installation attempts, by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(installs.clone()))?;

        let interval_seconds = Gauge::with_opts(Opts::new(
            "certmgr_request_interval_seconds",
            "Current re-arm interval of the request loop",
        ))?;
        registry.register(Box::new(interval_seconds.clone()))?;

        let passthrough = IntGauge::with_opts(Opts::new(
            "certmgr_passthrough_enabled",
            "Indicator (0/1) whether the cluster runs in passthrough mode",
        ))?;
        registry.register(Box::new(passthrough.clone()))?;

        Ok(Self {
            registry,
            requests_sent,
            responses_received,
            malformed_messages,
            installs,
            interval_seconds,
            passthrough,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_request(&self, trigger: &str) {
        self.requests_sent.with_label_values(&[trigger]).inc();
    }

    pub fn record_response(&self) {
        self.responses_received.inc();
    }

    pub fn record_malformed(&self, channel: &str) {
        self.malformed_messages.with_label_values(&[channel]).inc();
    }

    pub fn record_install(&self, outcome: &str) {
        self.installs.with_label_values(&[outcome]).inc();
    }

    pub fn set_interval(&self, interval: Duration) {
        self.interval_seconds.set(interval.as_secs_f64());
    }

    pub fn set_passthrough(&self, enabled: bool) {
        self.passthrough.set(if enabled { 1 } else { 0 });
    }
}

pub use prometheus;
