//! HTTP API consumed by the dashboard and by the agents themselves.
//!
//! Every route lives under `/api`, apart from `/health`. Handlers are thin:
//! they validate input, call the store or the [`AgentManager`], record an
//! audit event where something changed, and return JSON.

use std::future::Future;

use axum::{
    Json, Router,
    http::{StatusCode, Uri},
    response::IntoResponse,
    routing::get,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use self::error::AppError;
use crate::broadcast::Hub;
use crate::orchestration::manager::AgentManager;
use crate::store::Store;

pub mod agents;
pub mod dashboard;
pub mod error;
pub mod events;
pub mod handoffs;
pub mod tasks;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub manager: AgentManager,
    /// Cancelled on shutdown so open event streams end.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(hub: Hub, manager: AgentManager) -> Self {
        Self {
            hub,
            manager,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &Store {
        self.hub.store()
    }
}

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api", api_router())
        .route("/health", get(health))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/tasks", tasks::router())
        .nest("/agents", agents::router())
        .nest("/handoffs", handoffs::router())
        .nest("/events", events::router())
        .nest("/dashboard", dashboard::router())
}

/// Serve until `shutdown` resolves. Open event streams are closed through
/// the state's token so the graceful shutdown can complete.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let token = state.shutdown.clone();
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            token.cancel();
        })
        .await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "timestamp": chrono::Utc::now() }))
}

async fn not_found(uri: Uri) -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("No route for {}", uri.path()), "code": "NOT_FOUND" })),
    )
}

/// Split a comma-separated query value into its non-empty parts.
pub(crate) fn split_list(raw: Option<&str>) -> Vec<&str> {
    raw.map(|s| s.split(',').map(str::trim).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

/// Decode a body that may be omitted. An empty body yields the defaults;
/// anything else must be valid JSON for `T`.
pub(crate) fn optional_json<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    Ok(serde_json::from_slice(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::agents::StartRequest;

    #[test]
    fn optional_json_defaults_only_when_empty() {
        let empty: StartRequest = optional_json(b"  ").unwrap();
        assert_eq!(empty.task_id, None);

        let given: StartRequest = optional_json(br#"{"taskId":"t-1"}"#).unwrap();
        assert_eq!(given.task_id.as_deref(), Some("t-1"));

        let err = optional_json::<StartRequest>(br#"{"taskId":5}"#).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[test]
    fn split_list_trims_and_skips_empty() {
        assert_eq!(split_list(Some("READY, DONE,,")), vec!["READY", "DONE"]);
        assert!(split_list(None).is_empty());
    }
}
