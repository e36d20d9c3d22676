//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::Config;
use crate::orchestrator::Orchestrator;
use crate::run::{InMemoryRunStore, RunId, RunStore};

use super::queue::{spawn_consumer, QueueError, RunQueue};
use super::types::*;
use super::webhooks;

const QUEUE_CAPACITY: usize = 64;
const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 200;

/// Shared application state.
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn RunStore>,
    pub queue: RunQueue,
}

pub(super) type ApiError = (StatusCode, String);

impl From<QueueError> for (StatusCode, String) {
    fn from(err: QueueError) -> Self {
        let status = match err {
            QueueError::Full | QueueError::Closed => StatusCode::SERVICE_UNAVAILABLE,
            QueueError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, err.to_string())
    }
}

/// Build the router over `state`.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/runs", post(create_run).get(list_runs))
        .route("/api/runs/:id", get(get_run))
        .route("/webhook/linear", post(webhooks::linear))
        .route("/webhook/github", post(webhooks::github))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server and the run queue consumer.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::with_limit(
        config.orchestrator.max_retained_runs,
    ));
    let orchestrator = Arc::new(Orchestrator::from_config(
        Arc::clone(&config),
        Arc::clone(&store),
    ));

    let (queue, receiver) = RunQueue::new(Arc::clone(&store), QUEUE_CAPACITY);
    let consumer = spawn_consumer(
        receiver,
        orchestrator,
        config.orchestrator.max_concurrent_runs,
    );

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        store,
        queue,
    });
    let app = router(Arc::clone(&state));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let waiting = state.queue.waiting();
    if waiting > 0 {
        tracing::warn!("Shutting down with {} queued runs not started", waiting);
    }
    consumer.abort();
    tracing::info!("Graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        queued_runs: state.queue.waiting(),
    })
}

/// Accept a requirement and queue a run for it.
async fn create_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRunRequest>,
) -> Result<(StatusCode, Json<CreateRunResponse>), ApiError> {
    if req.requirement.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "requirement is empty".to_string()));
    }

    let run = state.queue.submit(req.into()).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CreateRunResponse {
            run_id: run.id,
            state: run.state,
        }),
    ))
}

async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Vec<RunSummary>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).min(MAX_PAGE);
    let runs = state
        .store
        .list(limit, query.offset.unwrap_or(0))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))?;
    Ok(Json(runs.iter().map(RunSummary::from).collect()))
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<RunDetail>, ApiError> {
    let run = state
        .store
        .get(RunId::from(id))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))?
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Run {} not found", id)))?;
    Ok(Json(RunDetail::from(&run)))
}

#[cfg(test)]
pub(super) mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use crate::run::{Run, RunRequest, RunState};

    pub(crate) struct TestApp {
        pub app: Router,
        pub store: InMemoryRunStore,
        pub rx: mpsc::Receiver<Run>,
    }

    pub(crate) fn test_app(secret: Option<&str>) -> TestApp {
        let mut config = Config::new("key".to_string(), "test/model".to_string());
        config.webhook_secret = secret.map(str::to_string);
        let store = InMemoryRunStore::new();
        let (queue, rx) = RunQueue::new(Arc::new(store.clone()), 8);
        let state = Arc::new(AppState {
            config: Arc::new(config),
            store: Arc::new(store.clone()),
            queue,
        });
        TestApp {
            app: router(state),
            store,
            rx,
        }
    }

    pub(crate) async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let t = test_app(None);
        let response = t
            .app
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_create_run_is_accepted_and_queued() {
        let mut t = test_app(None);
        let response = t
            .app
            .oneshot(post_json(
                "/api/runs",
                json!({"requirement": "Add image upload", "priority": "high"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["state"], "intake");

        let queued = t.rx.recv().await.unwrap();
        assert_eq!(body["runId"], queued.id.to_string());
        assert_eq!(
            queued.request.priority,
            Some(crate::run::Priority::High)
        );
        assert!(t.store.get(queued.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_empty_requirement_is_rejected() {
        let mut t = test_app(None);
        let response = t
            .app
            .oneshot(post_json("/api/runs", json!({"requirement": "  "})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(t.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_get_and_list_runs() {
        let t = test_app(None);
        let mut run = Run::new(RunRequest::new("Add dark mode"));
        run.transition(RunState::Decomposing).unwrap();
        t.store.save(run.clone()).await.unwrap();

        let response = t
            .app
            .clone()
            .oneshot(
                Request::get(format!("/api/runs/{}", run.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let detail = body_json(response).await;
        assert_eq!(detail["run_id"], run.id.to_string());
        assert_eq!(detail["state"], "decomposing");

        let response = t
            .app
            .clone()
            .oneshot(Request::get("/api/runs?limit=5").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let list = body_json(response).await;
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert_eq!(list[0]["title"], "Add dark mode");

        let response = t
            .app
            .oneshot(
                Request::get(format!("/api/runs/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
