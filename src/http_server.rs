use crate::error::{RegistryError, ServiceError};
use crate::service::{HelpdeskCore, Page};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Read-only administrative API: SLA state per ticket, delivery logs and
/// per-subscription stats.
pub fn router(core: Arc<HelpdeskCore>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tickets/{ticket_id}/sla", get(ticket_sla))
        .route("/webhooks/{webhook_id}/deliveries", get(webhook_deliveries))
        .route("/webhooks/{webhook_id}/stats", get(webhook_stats))
        .with_state(core)
}

/// Bind `addr` and serve in the background. Returns the bound address.
pub async fn start(core: Arc<HelpdeskCore>, addr: &str) -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    tracing::info!(%bound, "admin HTTP server listening");

    let app = router(core);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "admin HTTP server error");
        }
    });

    Ok(bound)
}

struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ServiceError::TicketNotFound(_) | ServiceError::Registry(RegistryError::NotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn ticket_sla(
    Path(ticket_id): Path<String>,
    State(core): State<Arc<HelpdeskCore>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(core.sla_snapshot(&ticket_id).await?))
}

async fn webhook_deliveries(
    Path(webhook_id): Path<String>,
    Query(page): Query<Page>,
    State(core): State<Arc<HelpdeskCore>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(core.delivery_log(&webhook_id, page).await?))
}

async fn webhook_stats(
    Path(webhook_id): Path<String>,
    State(core): State<Arc<HelpdeskCore>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(core.subscription_stats(&webhook_id).await?))
}
