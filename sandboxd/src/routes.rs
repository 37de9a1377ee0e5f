//! HTTP route handlers for the execution API

use crate::decoder::decode_path;
use crate::encoder::{encode, ExecutionResponse};
use crate::{AppError, AppResult, AppState};
use axum::{extract::State, http::Uri, response::Json};
use tracing::{debug, error, info};

/// GET /<hex> - Execute a hex-encoded program
///
/// Responds 200 for every program outcome, including thrown errors and
/// timeouts; 400 only when the path does not decode.
pub async fn execute_program(
    State(state): State<AppState>,
    uri: Uri,
) -> AppResult<Json<ExecutionResponse>> {
    let source = decode_path(uri.path()).map_err(|e| {
        debug!("Rejected request path: {}", e);
        AppError::from(e)
    })?;
    debug!(source_len = source.as_str().len(), "Handling program execution");

    let execution = state.sandbox.execute(source).await.map_err(|e| {
        error!("Failed to start sandbox: {}", e);
        AppError::from(e)
    })?;

    info!(
        execution_id = %execution.id,
        elapsed_ms = execution.elapsed.as_millis() as u64,
        outcome = execution.outcome.label(),
        log_entries = execution.logs.len(),
        "Execution finished"
    );

    let response = encode(execution.outcome, execution.logs, &state.config.encoder);
    state.reaper.schedule(execution.handle);
    Ok(Json(response))
}
