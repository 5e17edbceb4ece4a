//! Operator HTTP endpoint: liveness and the latest metrics snapshot.

use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, routing::get, Json, Router};
use scholar_db::{run_blocking, DbError, DbPool};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::metrics::{self, MetricsHandle};

/// State shared by the operator handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// Latest metrics snapshot.
    pub metrics: MetricsHandle,
}

/// Returns `200 OK` while the database answers, `503` otherwise.
async fn health(Extension(state): Extension<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let check = run_blocking(&state.pool, |conn| {
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(|e| HealthError(e.to_string()))
    })
    .await;

    let version = env!("CARGO_PKG_VERSION");
    match check {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "version": version, "database": "ok" })),
        ),
        Err(HealthError(e)) => {
            tracing::warn!(error = %e, "health check database query failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "version": version, "database": e })),
            )
        }
    }
}

/// Serves the latest snapshot, or `503` before the first collection.
async fn metrics_handler(Extension(state): Extension<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    match metrics::latest(&state.metrics) {
        Some(snapshot) => match serde_json::to_value(&snapshot) {
            Ok(value) => (StatusCode::OK, Json(value)),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize metrics snapshot");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "failed to serialize metrics" })),
                )
            }
        },
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "metrics not collected yet" })),
        ),
    }
}

/// Builds the operator router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}

/// Lets the health check report pool failures as text.
struct HealthError(String);

impl From<DbError> for HealthError {
    fn from(e: DbError) -> Self {
        Self(e.to_string())
    }
}
