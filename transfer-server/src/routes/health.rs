use crate::state::AppState;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use std::sync::Arc;

/// GET /health - Health check endpoint
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let db = state.db.clone();
    let database = tokio::task::spawn_blocking(move || {
        db.get()
            .map(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).is_ok())
            .unwrap_or(false)
    })
    .await
    .unwrap_or(false);

    Json(json!({
        "status": if database { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "database": database,
    }))
}
