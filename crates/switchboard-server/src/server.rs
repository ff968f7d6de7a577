//! `SwitchboardServer`: axum HTTP + WebSocket front end for a [`Hub`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{WebSocketUpgrade, rejection::WebSocketUpgradeRejection};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{Extensions, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use switchboard_core::AcceptError;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::hub::Hub;
use crate::metrics::{CONNECTIONS_REJECTED_TOTAL, render};
use crate::websocket::connection::run_connection;
use crate::websocket::handshake::{AnonymousAuthorizer, HandshakeAuthorizer};

/// Failures starting or running the listener.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding or serving the socket failed.
    #[error("server i/o: {0}")]
    Io(#[from] std::io::Error),
    /// The metrics recorder could not be installed.
    #[error("metrics recorder: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
}

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The node's session layer.
    pub hub: Arc<Hub>,
    /// Upgrade approval.
    pub authorizer: Arc<dyn HandshakeAuthorizer>,
    /// Prometheus handle; `/metrics` is 404 without one.
    pub metrics: Option<PrometheusHandle>,
}

/// HTTP front end: `/ws/{*path}`, `/health`, `/metrics`.
pub struct SwitchboardServer {
    hub: Arc<Hub>,
    authorizer: Arc<dyn HandshakeAuthorizer>,
    metrics: Option<PrometheusHandle>,
}

impl SwitchboardServer {
    /// Server for `hub` accepting anonymous connections.
    pub fn new(hub: Arc<Hub>) -> Self {
        Self {
            hub,
            authorizer: Arc::new(AnonymousAuthorizer),
            metrics: None,
        }
    }

    /// Replace the handshake authorizer.
    #[must_use]
    pub fn with_authorizer(mut self, authorizer: impl HandshakeAuthorizer + 'static) -> Self {
        self.authorizer = Arc::new(authorizer);
        self
    }

    /// Expose `/metrics` from this recorder handle.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// The hub behind this server.
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            hub: Arc::clone(&self.hub),
            authorizer: Arc::clone(&self.authorizer),
            metrics: self.metrics.clone(),
        };
        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws/{*path}", get(ws_handler))
            .with_state(state)
    }

    /// Start the hub and serve on `listener` until `signal` resolves, then
    /// shut the hub down.
    pub async fn serve<F>(self, listener: TcpListener, signal: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.hub.start().await;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, node_id = %self.hub.node_id(), "switchboard listening");

        let app = self.router();
        let hub = Arc::clone(&self.hub);
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move {
                signal.await;
                info!("shutdown signal received");
                hub.shutdown().await;
            })
            .await?;

        self.hub.shutdown().await;
        info!("switchboard stopped");
        Ok(())
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Response {
    let health = state.hub.health();
    let status = if health.degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(health)).into_response()
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => render(handle).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET /ws/{*path}: approve, then upgrade into a session on `/{path}`.
async fn ws_handler(
    State(state): State<AppState>,
    Path(rest): Path<String>,
    headers: HeaderMap,
    extensions: Extensions,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let path = format!("/{}", rest.trim_start_matches('/'));
    let hub = state.hub;

    if hub.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    if !hub.has_path(&path) {
        counter!(CONNECTIONS_REJECTED_TOTAL, "reason" => "unknown_path").increment(1);
        debug!(path, "no handler for requested path");
        return (StatusCode::NOT_FOUND, AcceptError::UnknownPath(path).to_string()).into_response();
    }

    let remote_addr = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let handshake = match state.authorizer.authorize(&path, &headers, remote_addr).await {
        Ok(info) => info,
        Err(err) => {
            counter!(CONNECTIONS_REJECTED_TOTAL, "reason" => "unauthorized").increment(1);
            warn!(path, ?remote_addr, error = %err, "handshake rejected");
            return (StatusCode::UNAUTHORIZED, err.to_string()).into_response();
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    ws.max_message_size(hub.config().max_message_size)
        .on_upgrade(move |socket| run_connection(socket, hub, path, handshake))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::dispatcher::{HandlerContext, MessageDispatcher, PathHandler};
    use crate::session::Session;
    use crate::websocket::handshake::{RequireUserAuthorizer, USER_ID_HEADER};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use switchboard_core::{HandlerError, NodeId};
    use tower::ServiceExt;

    struct Noop;

    #[async_trait]
    impl PathHandler for Noop {
        async fn on_message(&self, _cx: &HandlerContext, _s: &Arc<Session>, _t: &str) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn make_server() -> SwitchboardServer {
        let hub = Hub::with_node_id(
            NodeId::from("n1"),
            HubConfig::default(),
            MessageDispatcher::new().route("/chat", Noop),
            None,
        );
        SwitchboardServer::new(hub)
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let resp = make_server().router().oneshot(get_req("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let parsed = body_json(resp).await;
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["node_id"], "n1");
        assert_eq!(parsed["connections"], 0);
        assert_eq!(parsed["cluster_enabled"], false);
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_404() {
        let resp = make_server().router().oneshot(get_req("/metrics")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_with_recorder_renders() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let server = make_server().with_metrics(handle);
        let resp = server.router().oneshot(get_req("/metrics")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_ws_path_is_404() {
        let resp = make_server().router().oneshot(get_req("/ws/nope")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rejected_handshake_is_401() {
        let server = make_server().with_authorizer(RequireUserAuthorizer);
        let resp = server.router().oneshot(get_req("/ws/chat")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(server.hub().connection_count(), 0);
    }

    #[tokio::test]
    async fn known_path_without_upgrade_headers_is_refused() {
        let req = Request::builder()
            .uri("/ws/chat")
            .header(USER_ID_HEADER, "alice")
            .body(Body::empty())
            .unwrap();
        let resp = make_server().router().oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
        assert_ne!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let resp = make_server().router().oneshot(get_req("/nonexistent")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
