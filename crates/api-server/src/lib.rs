//! The HTTP surface of the orchestration engine. Per the binary split:
//! this crate never walks a pipeline graph or runs agent logic on a request
//! thread. It reads and writes `Execution` rows through the same
//! `state-store` the `engine` binary uses, resolves approve/reject intents
//! through its own `approval-gate` instance, and fans execution-lifecycle
//! events out over a websocket. The two binaries never call into each
//! other in-process; they interact only through the shared database.

use std::sync::{atomic::AtomicU64, Arc};

use alpaca_broker::AlpacaClient;
use anyhow::Result;
use approval_gate::{ApprovalError, ApprovalGate};
use axum::{
    extract::FromRef,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use broker_trait::BrokerClient;
use event_bus::EventBus;
use notification_service::{NotificationConfig, NotificationService};
use pipeline_executor::Executor;
use serde::Serialize;
use state_store::StateStore;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use trigger_dispatcher::TriggerDispatcher;

pub mod audit;
pub mod auth;
mod brute_force;
mod event_ws_routes;
mod execution_routes;
mod pipeline_routes;
pub mod request_id;
mod security_headers;

use brute_force::BruteForceGuard;

/// Counters surfaced at `/metrics`. Deliberately minimal: the full
/// observability stack (Prometheus exposition, histograms) is external to
/// this core.
#[derive(Default)]
pub struct Metrics {
    pub approvals_granted: AtomicU64,
    pub approvals_rejected: AtomicU64,
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<StateStore>,
    pub events: Arc<EventBus>,
    pub approvals: Arc<ApprovalGate>,
    pub dispatcher: Arc<TriggerDispatcher>,
    pub agent_registry: Arc<agent_runtime::AgentRegistry>,
    pub brute_force: Arc<BruteForceGuard>,
    pub metrics: Arc<Metrics>,
}

impl FromRef<AppState> for Arc<BruteForceGuard> {
    fn from_ref(state: &AppState) -> Self {
        state.brute_force.clone()
    }
}

/// Uniform success/error envelope for every JSON response this crate returns.
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self { success: true, data: Some(data), error: None }
    }
}

impl ApiResponse<()> {
    pub fn error_message(message: impl Into<String>) -> Self {
        Self { success: false, data: None, error: Some(message.into()) }
    }
}

/// Top-level error type for route handlers. `ApprovalError` gets its own
/// typed status codes per the component design; everything else collapses
/// to a 500 with the message preserved for the logs.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Approval(#[from] ApprovalError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Approval(ApprovalError::NotAwaitingApproval(id)) => {
                (StatusCode::BAD_REQUEST, format!("execution {id} is not awaiting approval"))
            }
            AppError::Approval(ApprovalError::TokenMismatch) => {
                (StatusCode::FORBIDDEN, "approval token does not match".to_string())
            }
            AppError::Approval(ApprovalError::Expired) => {
                (StatusCode::BAD_REQUEST, "approval window has expired".to_string())
            }
            AppError::Approval(ApprovalError::State(e)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            AppError::Other(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };

        (status, Json(ApiResponse::<()>::error_message(message))).into_response()
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics(axum::extract::State(state): axum::extract::State<AppState>) -> String {
    format!(
        "approvals_granted {}\napprovals_rejected {}\n",
        state.metrics.approvals_granted.load(std::sync::atomic::Ordering::Relaxed),
        state.metrics.approvals_rejected.load(std::sync::atomic::Ordering::Relaxed),
    )
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .merge(execution_routes::routes())
        .merge(pipeline_routes::routes())
        .merge(event_ws_routes::routes())
        .layer(middleware::from_fn(security_headers::security_headers_middleware))
        .layer(middleware::from_fn(request_id::request_id_middleware))
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_server() -> Result<()> {
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:engine.db".to_string());
    let store = Arc::new(StateStore::connect(&database_url).await?);

    let notifications = Arc::new(NotificationService::new(&NotificationConfig::from_env()));
    let events = Arc::new(EventBus::with_notifications(notifications));

    let alpaca = Arc::new(AlpacaClient::new(
        std::env::var("ALPACA_API_KEY").unwrap_or_default(),
        std::env::var("ALPACA_SECRET_KEY").unwrap_or_default(),
        std::env::var("ALPACA_BASE_URL").unwrap_or_else(|_| "https://paper-api.alpaca.markets".to_string()),
    )?);

    let mut tool_registry = agent_runtime::ToolRegistry::new();
    let broker = alpaca.clone();
    tool_registry.register("broker", move |_config| {
        let client: Arc<dyn BrokerClient> = broker.clone();
        let tool: Arc<dyn agent_runtime::Tool> = Arc::new(agent_runtime::BrokerTool { client });
        Ok(tool)
    });
    let mut agent_registry = agent_runtime::AgentRegistry::new(tool_registry);
    agent_runtime::builtin::register_builtins(&mut agent_registry);
    let agent_registry = Arc::new(agent_registry);

    let executor = Arc::new(Executor::new(store.clone(), agent_registry.clone(), events.clone()));
    let approvals = Arc::new(ApprovalGate::new(store.clone(), executor.clone(), events.clone()));
    let dispatcher =
        Arc::new(TriggerDispatcher::new(store.clone(), executor, events.clone(), &database_url).await?);

    let state = AppState {
        store,
        events,
        approvals,
        dispatcher,
        agent_registry,
        brute_force: Arc::new(BruteForceGuard::new()),
        metrics: Arc::new(Metrics::default()),
    };

    let addr = std::env::var("API_SERVER_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "api-server listening");

    axum::serve(listener, router(state).into_make_service_with_connect_info::<std::net::SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("api-server shutting down");
}
