//! Axum router and listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use lipsync_engine::JobPipeline;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::metrics::WS_CONNECTIONS_REJECTED_TOTAL;
use crate::registry::SessionRegistry;
use crate::session;
use crate::shutdown::ShutdownCoordinator;

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    /// Runs requests for all sessions.
    pub pipeline: Arc<JobPipeline>,
    /// Open sessions.
    pub registry: Arc<SessionRegistry>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Shutdown signal.
    pub shutdown: ShutdownCoordinator,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// State with a fresh registry.
    pub fn new(
        pipeline: Arc<JobPipeline>,
        config: ServerConfig,
        shutdown: ShutdownCoordinator,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            pipeline,
            registry: Arc::new(SessionRegistry::new()),
            config: Arc::new(config),
            shutdown,
            start_time: Instant::now(),
            metrics,
        }
    }
}

/// Build the router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/lipsync", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// A running server.
#[derive(Debug)]
pub struct ServerHandle {
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Open sessions.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// The serve task. Finishes after shutdown once the listener has closed.
    pub fn into_task(self) -> JoinHandle<()> {
        self.task
    }
}

/// Bind and serve until `shutdown` fires.
pub async fn start(
    config: ServerConfig,
    pipeline: Arc<JobPipeline>,
    shutdown: ShutdownCoordinator,
    metrics: Option<PrometheusHandle>,
) -> std::io::Result<ServerHandle> {
    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let addr = listener.local_addr()?;

    let state = AppState::new(pipeline, config, shutdown.clone(), metrics);
    let registry = Arc::clone(&state.registry);
    let router = build_router(state);

    info!(%addr, "lipsync server listening");
    let token = shutdown.token();
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(token.cancelled_owned())
            .await
        {
            error!(error = %e, "server error");
        }
        info!("listener closed");
    });

    Ok(ServerHandle {
        addr,
        registry,
        task,
    })
}

/// GET /ws/lipsync, GET /ws
async fn ws_handler(
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    let Some(registration) = state
        .registry
        .try_register(state.config.max_connections, state.shutdown.session_token())
    else {
        counter!(WS_CONNECTIONS_REJECTED_TOTAL).increment(1);
        warn!(limit = state.config.max_connections, "connection refused, at capacity");
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let AppState {
        pipeline, config, ..
    } = state;
    ws.max_message_size(config.max_message_bytes)
        .on_upgrade(move |socket| session::handle_socket(socket, registration, pipeline, config))
        .into_response()
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.shutdown.is_shutting_down(),
        state.registry.count(),
        state.registry.active_jobs(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use lipsync_engine::{JobError, JobExit, JobInvocation, JobRunner, ProgressPublisher};
    use lipsync_settings::LipsyncSettings;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    struct NeverRuns;

    #[async_trait]
    impl JobRunner for NeverRuns {
        async fn run(
            &self,
            _invocation: &JobInvocation,
            _progress: ProgressPublisher,
            _cancel: CancellationToken,
        ) -> Result<JobExit, JobError> {
            Err(JobError::Worker("not expected".into()))
        }
    }

    fn make_state(config: ServerConfig) -> AppState {
        let pipeline = JobPipeline::from_settings(&LipsyncSettings::default(), Arc::new(NeverRuns));
        AppState::new(Arc::new(pipeline), config, ShutdownCoordinator::new(), None)
    }

    async fn get(app: Router, uri: &str) -> Response {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        app.oneshot(req).await.unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_reports_counts() {
        let state = make_state(ServerConfig::default());
        let _held = state
            .registry
            .try_register(8, CancellationToken::new())
            .unwrap();
        let resp = get(build_router(state), "/health").await;
        assert_eq!(resp.status(), StatusCode::OK);

        let parsed = body_json(resp).await;
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 1);
        assert_eq!(parsed["active_jobs"], 0);
    }

    #[tokio::test]
    async fn health_reports_shutdown() {
        let state = make_state(ServerConfig::default());
        state.shutdown.shutdown();
        let parsed = body_json(get(build_router(state), "/health").await).await;
        assert_eq!(parsed["status"], "shutting_down");
    }

    #[tokio::test]
    async fn ws_refused_at_capacity() {
        let state = make_state(ServerConfig {
            max_connections: 1,
            ..ServerConfig::default()
        });
        let _held = state
            .registry
            .try_register(1, CancellationToken::new())
            .unwrap();
        let resp = get(build_router(state), "/ws/lipsync").await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn ws_refused_while_shutting_down() {
        let state = make_state(ServerConfig::default());
        state.shutdown.shutdown();
        let resp = get(build_router(state), "/ws").await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn plain_get_on_ws_is_rejected_and_releases_slot() {
        let state = make_state(ServerConfig::default());
        let registry = Arc::clone(&state.registry);
        let resp = get(build_router(state), "/ws/lipsync").await;
        assert!(resp.status().is_client_error());
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn metrics_endpoint() {
        let resp = get(build_router(make_state(ServerConfig::default())), "/metrics").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let mut state = make_state(ServerConfig::default());
        state.metrics = Some(PrometheusBuilder::new().build_recorder().handle());
        let resp = get(build_router(state), "/metrics").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers()[header::CONTENT_TYPE].to_str().unwrap();
        assert!(content_type.starts_with("text/plain"));
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let resp = get(build_router(make_state(ServerConfig::default())), "/nope").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn start_binds_ephemeral_port_and_stops() {
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..ServerConfig::default()
        };
        let shutdown = ShutdownCoordinator::new();
        let pipeline = Arc::new(JobPipeline::from_settings(
            &LipsyncSettings::default(),
            Arc::new(NeverRuns),
        ));
        let handle = start(config, pipeline, shutdown.clone(), None).await.unwrap();
        assert_ne!(handle.addr().port(), 0);
        assert_eq!(handle.registry().count(), 0);

        shutdown.shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle.into_task())
            .await
            .unwrap()
            .unwrap();
    }
}
