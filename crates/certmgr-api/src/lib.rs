//! ---
//! certmgr_section: "05-networking-external-interfaces"
//! certmgr_subsection: "module"
//! certmgr_type: "source"
//! certmgr_scope: "code"
//! certmgr_description: "HTTP API: health, status, certificate installs and the message bus bridge."
//! certmgr_version: "v0.1.0"
//! certmgr_owner: "platform"
//! ---

use std::fmt;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use certmgr_core::{
    CertInstaller, InstallErrorKind, RequesterStatus, UpdateCertsRequest, UpdateCertsResponse,
};
use certmgr_msg::{MessageBus, Subscription};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Shared API state exposed to handlers.
pub struct ApiState {
    installer: CertInstaller,
    bus: Arc<dyn MessageBus>,
    status: Option<watch::Receiver<RequesterStatus>>,
}

impl ApiState {
    pub fn new(installer: CertInstaller, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            installer,
            bus,
            status: None,
        }
    }

    /// Serve `/v1/status` from the request loop's status channel.
    pub fn with_status(mut self, status: watch::Receiver<RequesterStatus>) -> Self {
        self.status = Some(status);
        self
    }
}

impl fmt::Debug for ApiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiState")
            .field("installer", &self.installer)
            .field("bus", &self.bus.name())
            .finish_non_exhaustive()
    }
}

/// Handle to the running API server.
#[derive(Debug)]
pub struct ApiServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl ApiServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(err.into()),
        }
    }
}

/// Build the API router without binding it.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(get_status))
        .route("/v1/certs", post(post_certs))
        .route("/v1/bus/:topic", post(post_bus))
        .route("/v1/bus/:topic/ws", get(bus_socket))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Bind `addr` and serve the API until [`ApiServer::shutdown`].
pub fn spawn_api_server(state: Arc<ApiState>, addr: SocketAddr) -> Result<ApiServer> {
    let router = router(state);

    let listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind API listener {addr}"))?;
    listener
        .set_nonblocking(true)
        .context("failed to configure API listener as non-blocking")?;
    let bound = listener
        .local_addr()
        .context("failed to read API listener address")?;
    let tcp_listener =
        TcpListener::from_std(listener).context("failed to create tokio listener")?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        info!(address = %bound, "api server listening");
        if let Err(err) = axum::serve(tcp_listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
        {
            error!(address = %bound, error = %err, "api server exited with error");
            return Err(err.into());
        }
        Ok(())
    });

    Ok(ApiServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct PublishAck {
    topic: String,
    bytes: usize,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    kind: Option<&'static str>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            kind: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.message,
            kind: self.kind,
        });
        (self.status, body).into_response()
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_status(State(state): State<Arc<ApiState>>) -> Result<Json<RequesterStatus>, ApiError> {
    let status = state.status.as_ref().ok_or_else(|| {
        ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "certificate requester not running")
    })?;
    let snapshot = status.borrow().clone();
    Ok(Json(snapshot))
}

async fn post_certs(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<UpdateCertsRequest>,
) -> Result<Json<UpdateCertsResponse>, ApiError> {
    match state.installer.update_certs(request).await {
        Ok(response) => Ok(Json(response)),
        Err(err) => {
            let kind = err.kind();
            let status = match kind {
                InstallErrorKind::Precondition => StatusCode::CONFLICT,
                _ => StatusCode::BAD_GATEWAY,
            };
            warn!(error = %err, kind = kind.as_str(), "update certs request failed");
            Err(ApiError {
                status,
                message: err.to_string(),
                kind: Some(kind.as_str()),
            })
        }
    }
}

async fn post_bus(
    State(state): State<Arc<ApiState>>,
    Path(topic): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<PublishAck>), ApiError> {
    let bytes = body.len();
    state
        .bus
        .publish(&topic, body)
        .await
        .map_err(|err| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string()))?;
    debug!(topic = %topic, bytes, "bridged message published");
    Ok((StatusCode::ACCEPTED, Json(PublishAck { topic, bytes })))
}

async fn bus_socket(
    ws: WebSocketUpgrade,
    Path(topic): Path<String>,
    State(state): State<Arc<ApiState>>,
) -> Result<Response, ApiError> {
    let subscription = state
        .bus
        .subscribe(&topic)
        .await
        .map_err(|err| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string()))?;
    info!(topic = %topic, "bus bridge client connected");
    Ok(ws.on_upgrade(move |socket| bridge_loop(socket, subscription)))
}

async fn bridge_loop(mut socket: WebSocket, mut subscription: Subscription) {
    loop {
        tokio::select! {
            delivery = subscription.recv() => {
                let Some(payload) = delivery else {
                    break;
                };
                if socket.send(WsMessage::Binary(payload.to_vec())).await.is_err() {
                    break;
                }
            }
            message = socket.recv() => {
                let Some(Ok(message)) = message else {
                    break;
                };

                match message {
                    WsMessage::Ping(payload) => {
                        if socket.send(WsMessage::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    WsMessage::Pong(_) => {}
                    WsMessage::Close(_) => break,
                    WsMessage::Text(_) | WsMessage::Binary(_) => {
                        warn!(topic = subscription.topic(), "bus bridge socket is receive-only; frame ignored");
                    }
                }
            }
        }
    }

    let topic = subscription.topic().to_owned();
    if let Err(err) = subscription.unsubscribe() {
        warn!(topic = %topic, error = %err, "failed to release bridged subscription");
    }
    info!(topic = %topic, "bus bridge client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use certmgr_common::InstallConfig;
    use certmgr_core::{ClusterMode, InMemoryResourceManager};
    use certmgr_msg::InMemoryBus;
    use futures::StreamExt;
    use tokio::time::timeout;
    use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as ClientMessage};

    struct Fixture {
        bus: InMemoryBus,
        resources: Arc<InMemoryResourceManager>,
        server: ApiServer,
    }

    impl Fixture {
        fn url(&self, path: &str) -> String {
            format!("http://{}{}", self.server.addr(), path)
        }
    }

    fn start(
        resources: InMemoryResourceManager,
        status: Option<watch::Receiver<RequesterStatus>>,
    ) -> Fixture {
        let bus = InMemoryBus::new();
        let resources = Arc::new(resources);
        let installer = CertInstaller::new(resources.clone(), &InstallConfig::default());
        let mut state = ApiState::new(installer, Arc::new(bus.clone()));
        if let Some(status) = status {
            state = state.with_status(status);
        }
        let server = spawn_api_server(Arc::new(state), "127.0.0.1:0".parse().unwrap())
            .expect("spawn api");
        Fixture {
            bus,
            resources,
            server,
        }
    }

    fn certs() -> serde_json::Value {
        serde_json::json!({"key": "KEY", "cert": "CERT"})
    }

    #[tokio::test]
    async fn health_and_missing_status() {
        let fixture = start(InMemoryResourceManager::new(), None);

        let health = reqwest::get(fixture.url("/healthz")).await.unwrap();
        assert_eq!(health.status(), reqwest::StatusCode::OK);
        assert_eq!(health.text().await.unwrap(), "ok");

        let status = reqwest::get(fixture.url("/v1/status")).await.unwrap();
        assert_eq!(status.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

        fixture.server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn status_reflects_requester_snapshot() {
        let (_tx, rx) = watch::channel(RequesterStatus {
            running: true,
            mode: ClusterMode::Passthrough,
            interval: Duration::from_secs(3600),
            requests_sent: 1,
            responses_received: 0,
            installs_completed: 0,
            malformed_messages: 0,
            last_request_at: None,
            last_install_at: None,
        });
        let fixture = start(InMemoryResourceManager::new(), Some(rx));

        let body: serde_json::Value = reqwest::get(fixture.url("/v1/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["mode"], "passthrough");
        assert_eq!(body["interval_secs"], 3600);

        fixture.server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn update_certs_installs_and_reports_ok() {
        let fixture = start(
            InMemoryResourceManager::new().with_instances("vizier-proxy-service", ["proxy-0"]),
            None,
        );
        let response = reqwest::Client::new()
            .post(fixture.url("/v1/certs"))
            .json(&certs())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["ok"], true);
        assert_eq!(fixture.resources.deleted_instances(), vec!["proxy-0"]);

        fixture.server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn update_certs_maps_failures_to_status_codes() {
        let fixture = start(InMemoryResourceManager::new(), None);
        let client = reqwest::Client::new();

        let precondition = client
            .post(fixture.url("/v1/certs"))
            .json(&certs())
            .send()
            .await
            .unwrap();
        assert_eq!(precondition.status(), reqwest::StatusCode::CONFLICT);
        let body: serde_json::Value = precondition.json().await.unwrap();
        assert_eq!(body["kind"], "precondition");

        fixture.resources.fail_secret_writes("forbidden");
        let storage = client
            .post(fixture.url("/v1/certs"))
            .json(&certs())
            .send()
            .await
            .unwrap();
        assert_eq!(storage.status(), reqwest::StatusCode::BAD_GATEWAY);
        let body: serde_json::Value = storage.json().await.unwrap();
        assert_eq!(body["kind"], "storage");

        fixture.server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn bus_bridge_streams_published_messages() {
        let fixture = start(InMemoryResourceManager::new(), None);
        let url = format!("ws://{}/v1/bus/c2v.sslResp/ws", fixture.server.addr());
        let (mut socket, _response) = connect_async(&url).await.unwrap();
        assert_eq!(fixture.bus.subscriber_count("c2v.sslResp"), 1);

        let response = reqwest::Client::new()
            .post(fixture.url("/v1/bus/c2v.sslResp"))
            .body("raw-envelope")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);

        let frame = timeout(Duration::from_secs(1), socket.next())
            .await
            .expect("frame in time")
            .unwrap()
            .unwrap();
        match frame {
            ClientMessage::Binary(payload) => assert_eq!(payload, b"raw-envelope".to_vec()),
            other => panic!("unexpected message: {other:?}"),
        }

        drop(socket);
        fixture.server.shutdown().await.unwrap();
    }
}
