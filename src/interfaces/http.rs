//! HTTP ingress.
//!
//! | Method | Path                               | Success        |
//! |--------|------------------------------------|----------------|
//! | POST   | `/transactions/ingest`             | 200 or 202     |
//! | POST   | `/transactions/ingest/batch`       | 200            |
//! | GET    | `/transactions/{txn_id}/decision`  | 200 or 404     |
//! | GET    | `/health`                          | 200            |
//!
//! Admission rejections map to 429 (rate limited) and 503 (over capacity).

use crate::application::gateway::Gateway;
use crate::application::ingestion::IngestOutcome;
use crate::domain::transaction::{TransactionRequest, TxnId};
use crate::error::{GatewayError, RejectReason, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

type AppState = Arc<Gateway>;

/// Error body for everything that is not a decision.
struct ApiError(GatewayError);

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            GatewayError::AdmissionRejected(RejectReason::RateLimited) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::AdmissionRejected(RejectReason::OverCapacity) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ValidationError(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/transactions/ingest", post(ingest_handler))
        .route("/transactions/ingest/batch", post(ingest_batch_handler))
        .route("/transactions/:txn_id/decision", get(decision_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

/// Serves until Ctrl-C.
pub async fn serve(gateway: Arc<Gateway>, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "fraudgate listening");
    axum::serve(listener, router(gateway))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}

async fn ingest_handler(
    State(gateway): State<AppState>,
    Json(request): Json<TransactionRequest>,
) -> std::result::Result<Response, ApiError> {
    let outcome = gateway.ingestor.ingest(request).await?;
    Ok(match outcome {
        IngestOutcome::Decided(response) => (StatusCode::OK, Json(response)).into_response(),
        queued @ IngestOutcome::Queued { .. } => (StatusCode::ACCEPTED, Json(queued)).into_response(),
    })
}

async fn ingest_batch_handler(
    State(gateway): State<AppState>,
    Json(requests): Json<Vec<TransactionRequest>>,
) -> Json<serde_json::Value> {
    let results = gateway.ingestor.ingest_batch(requests).await;
    let items: Vec<serde_json::Value> = results
        .into_iter()
        .map(|result| match result {
            Ok(outcome) => serde_json::to_value(outcome)
                .unwrap_or_else(|e| json!({ "status": "error", "error": e.to_string() })),
            Err(GatewayError::AdmissionRejected(reason)) => {
                json!({ "status": "rejected", "reason": reason.to_string() })
            }
            Err(GatewayError::ValidationError(message)) => {
                json!({ "status": "invalid", "error": message })
            }
            Err(e) => json!({ "status": "error", "error": e.to_string() }),
        })
        .collect();
    Json(json!({ "results": items }))
}

async fn decision_handler(
    State(gateway): State<AppState>,
    Path(txn_id): Path<u64>,
) -> std::result::Result<Response, ApiError> {
    match gateway.pipeline.decisions().find(TxnId(txn_id)).await? {
        Some(decision) => Ok((StatusCode::OK, Json(decision)).into_response()),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no decision for transaction {}", txn_id) })),
        )
            .into_response()),
    }
}

async fn health_handler(State(gateway): State<AppState>) -> Json<serde_json::Value> {
    let health = gateway.health().await;
    let status = if health.failover.failover_active { "degraded" } else { "ok" };
    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "gateway": health,
    }))
}
