//! Sandbox Execution Service
//!
//! Accepts hex-encoded JavaScript as the request path, runs it in a disposable
//! worker process under a wall-clock deadline, and answers with the program's
//! completion value and its `console.log` output.

pub mod config;
pub mod decoder;
pub mod encoder;
pub mod reaper;
pub mod routes;
pub mod sandbox;

use std::any::Any;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::config::ServiceConfig;
use crate::decoder::DecodeError;
use crate::encoder::ExecutionResponse;
use crate::reaper::{Reaper, ReaperStats};
use crate::sandbox::{Sandbox, SandboxError};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub sandbox: Arc<Sandbox>,
    pub reaper: Reaper,
}

impl AppState {
    pub fn new(config: ServiceConfig) -> Self {
        let reaper = Reaper::new(config.grace_period);
        let sandbox = Arc::new(Sandbox::new(config.sandbox.clone()));
        Self {
            config: Arc::new(config),
            sandbox,
            reaper,
        }
    }

    pub fn reaper_stats(&self) -> ReaperStats {
        self.reaper.stats()
    }
}

/// Error type for API responses. Rendered in the same JSON shape as a
/// successful execution.
#[derive(Debug)]
pub struct AppError {
    pub status_code: StatusCode,
    pub message: String,
}

impl From<DecodeError> for AppError {
    fn from(err: DecodeError) -> Self {
        AppError {
            status_code: StatusCode::BAD_REQUEST,
            message: err.to_string(),
        }
    }
}

impl From<SandboxError> for AppError {
    fn from(err: SandboxError) -> Self {
        AppError {
            status_code: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("Sandbox unavailable: {}", err),
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (
            self.status_code,
            Json(ExecutionResponse::error(&self.message)),
        )
            .into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Health check endpoint
async fn healthz() -> impl IntoResponse {
    "OK"
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!("Handler panicked: {}", detail);
    AppError {
        status_code: StatusCode::INTERNAL_SERVER_ERROR,
        message: "Internal server error".to_string(),
    }
    .into_response()
}

/// Create the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/", get(routes::execute_program))
        .route("/*payload", get(routes::execute_program))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the configured address and serve until the process is stopped.
pub async fn serve(config: ServiceConfig) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    let app = create_app(AppState::new(config));

    info!("Server running at http://{}/", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
