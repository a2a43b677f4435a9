//! The HTTP REST façade (spec §6): adapts JSON requests onto `TaskEngine`/
//! `ObligationQuery` operations. Grounded on the `Router`/`State`/`Json`
//! shape from `guyernest-rust-mcp-sdk`'s streamable HTTP server — the
//! teacher itself talks JSON-RPC over a raw WebSocket, not axum, so the
//! wiring pattern here is learned from the wider pack (see DESIGN.md).

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::engine::TaskEngine;
use crate::error::EngineError;
use crate::ids::{LeaseId, ReceiptId, TaskId};
use crate::model::{ReceiptFilter, TaskFilter, TaskSpec};

use super::middleware::{extract_auth, rate_limit_layer, RateLimiter};

#[derive(Clone)]
struct HttpState {
    engine: Arc<TaskEngine>,
}

pub fn build_router(engine: Arc<TaskEngine>) -> Router {
    let limiter = RateLimiter::new(60, 120);
    let state = HttpState { engine };

    Router::new()
        .route("/v1/tasks", post(create_task).get(list_tasks))
        .route("/v1/tasks/{task_id}", get(get_task))
        .route("/v1/tasks/{task_id}/cancel", post(cancel_task))
        .route("/v1/tasks/{task_id}/progress", post(report_progress))
        .route("/v1/tasks/{task_id}/complete", post(complete_task))
        .route("/v1/tasks/{task_id}/fail", post(fail_task))
        .route("/v1/claims", post(claim_next))
        .route("/v1/leases/{lease_id}/renew", post(renew_lease))
        .route("/v1/receipts", get(list_receipts))
        .route("/v1/receipts/{receipt_id}", get(get_receipt))
        .route("/v1/receipts/{receipt_id}/ack", post(ack_receipt))
        .route("/v1/obligations", get(list_obligations))
        .route("/healthz", get(healthz))
        .route("/v1/config", get(get_config))
        .layer(axum::middleware::from_fn_with_state(limiter, rate_limit_layer))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// `config() -> settings_snapshot` (spec §6). `GateConfig::database_url` is
/// `#[serde(skip_serializing)]` so the connection string never leaves the
/// process via this endpoint.
async fn get_config(State(state): State<HttpState>) -> Response {
    Json(state.engine.config()).into_response()
}

/// Wraps an `EngineError` into the wire shape `{error, message}`, mapping
/// each variant to the HTTP status a caller would expect — not derived from
/// `EngineError::code()` alone since e.g. `TaskNotFound` is 404, not 500.
fn error_response(err: EngineError) -> Response {
    let status = match &err {
        EngineError::TaskNotFound(_) | EngineError::ReceiptNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Unauthorized { .. } => StatusCode::FORBIDDEN,
        EngineError::InvalidStateTransition { .. }
        | EngineError::Validation(_)
        | EngineError::LeaseInvalidOrExpired(_)
        | EngineError::RenewalLimitExceeded { .. }
        | EngineError::LifetimeExceeded { .. } => StatusCode::CONFLICT,
        EngineError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = serde_json::json!({
        "error": err.code(),
        "message": err.to_string(),
    });
    (status, Json(body)).into_response()
}

fn auth_or_401(headers: &HeaderMap) -> Result<super::middleware::AuthContext, Response> {
    extract_auth(headers).map_err(|(status, msg)| {
        (status, Json(serde_json::json!({"error": "UNAUTHORIZED", "message": msg}))).into_response()
    })
}

#[derive(Deserialize)]
struct CreateTaskBody {
    #[serde(flatten)]
    spec: TaskSpec,
    idempotency_key: Option<String>,
}

async fn create_task(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Json(body): Json<CreateTaskBody>,
) -> Response {
    let auth = match auth_or_401(&headers) {
        Ok(a) => a,
        Err(r) => return r,
    };
    match state
        .engine
        .create_task(auth.tenant, &auth.principal, body.spec, body.idempotency_key)
        .await
    {
        Ok(task) => (StatusCode::CREATED, Json(task)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_task(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Path(task_id): Path<TaskId>,
) -> Response {
    let auth = match auth_or_401(&headers) {
        Ok(a) => a,
        Err(r) => return r,
    };
    match state.engine.get_task(auth.tenant, task_id).await {
        Ok(task) => Json(task).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct ListTasksQuery {
    status: Option<String>,
    #[serde(rename = "type")]
    task_type: Option<String>,
    cursor: Option<String>,
    limit: Option<i64>,
}

async fn list_tasks(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(q): Query<ListTasksQuery>,
) -> Response {
    let auth = match auth_or_401(&headers) {
        Ok(a) => a,
        Err(r) => return r,
    };
    let filter = TaskFilter {
        status: q.status.and_then(|s| s.parse().ok()),
        task_type: q.task_type,
    };
    let limit = q.limit.unwrap_or(state.engine.config().default_list_limit);
    match state
        .engine
        .list_tasks(auth.tenant, &filter, q.cursor.as_deref(), limit)
        .await
    {
        Ok(page) => Json(page).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct CancelTaskBody {
    #[serde(default)]
    reason: String,
}

async fn cancel_task(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Path(task_id): Path<TaskId>,
    Json(body): Json<CancelTaskBody>,
) -> Response {
    let auth = match auth_or_401(&headers) {
        Ok(a) => a,
        Err(r) => return r,
    };
    match state
        .engine
        .cancel_task(auth.tenant, &auth.principal, task_id, &body.reason)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct ClaimBody {
    worker_id: String,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default = "default_max_tasks")]
    max_tasks: i64,
    ttl_seconds: Option<i64>,
}

fn default_max_tasks() -> i64 {
    1
}

#[derive(Serialize)]
struct ClaimedItem {
    task: crate::model::Task,
    lease: crate::model::Lease,
}

async fn claim_next(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Json(body): Json<ClaimBody>,
) -> Response {
    let auth = match auth_or_401(&headers) {
        Ok(a) => a,
        Err(r) => return r,
    };
    match state
        .engine
        .claim_next(auth.tenant, &body.worker_id, &body.capabilities, body.max_tasks, body.ttl_seconds)
        .await
    {
        Ok(claimed) => {
            let items: Vec<ClaimedItem> = claimed
                .into_iter()
                .map(|(task, lease)| ClaimedItem { task, lease })
                .collect();
            Json(items).into_response()
        }
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct RenewBody {
    worker_id: String,
    task_id: TaskId,
    extend_by_seconds: i64,
}

async fn renew_lease(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Path(lease_id): Path<LeaseId>,
    Json(body): Json<RenewBody>,
) -> Response {
    let auth = match auth_or_401(&headers) {
        Ok(a) => a,
        Err(r) => return r,
    };
    match state
        .engine
        .renew_lease(auth.tenant, &body.worker_id, body.task_id, lease_id, body.extend_by_seconds)
        .await
    {
        Ok(lease) => Json(lease).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct ProgressBody {
    worker_id: String,
    lease_id: LeaseId,
    progress: serde_json::Value,
}

async fn report_progress(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Path(task_id): Path<TaskId>,
    Json(body): Json<ProgressBody>,
) -> Response {
    let auth = match auth_or_401(&headers) {
        Ok(a) => a,
        Err(r) => return r,
    };
    match state
        .engine
        .report_progress(auth.tenant, &body.worker_id, task_id, body.lease_id, body.progress)
        .await
    {
        Ok(receipt) => Json(receipt).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct CompleteBody {
    worker_id: String,
    lease_id: LeaseId,
    result: serde_json::Value,
    #[serde(default)]
    outcome: serde_json::Value,
}

async fn complete_task(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Path(task_id): Path<TaskId>,
    Json(body): Json<CompleteBody>,
) -> Response {
    let auth = match auth_or_401(&headers) {
        Ok(a) => a,
        Err(r) => return r,
    };
    match state
        .engine
        .complete(auth.tenant, &body.worker_id, task_id, body.lease_id, body.result, body.outcome)
        .await
    {
        Ok(task) => Json(task).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct FailBody {
    worker_id: String,
    lease_id: LeaseId,
    error: String,
    #[serde(default)]
    retryable: bool,
}

async fn fail_task(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Path(task_id): Path<TaskId>,
    Json(body): Json<FailBody>,
) -> Response {
    let auth = match auth_or_401(&headers) {
        Ok(a) => a,
        Err(r) => return r,
    };
    match state
        .engine
        .fail(auth.tenant, &body.worker_id, task_id, body.lease_id, &body.error, body.retryable)
        .await
    {
        Ok(task) => Json(task).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct ListReceiptsQuery {
    task_id: Option<TaskId>,
    #[serde(rename = "type")]
    receipt_type: Option<String>,
    cursor: Option<String>,
    limit: Option<i64>,
}

async fn list_receipts(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(q): Query<ListReceiptsQuery>,
) -> Response {
    let auth = match auth_or_401(&headers) {
        Ok(a) => a,
        Err(r) => return r,
    };
    let filter = ReceiptFilter {
        task_id: q.task_id,
        receipt_type: q.receipt_type.and_then(|s| s.parse().ok()),
    };
    let limit = q.limit.unwrap_or(state.engine.config().default_list_limit);
    match state
        .engine
        .list_receipts(auth.tenant, &filter, q.cursor.as_deref(), limit)
        .await
    {
        Ok(page) => Json(page).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_receipt(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Path(receipt_id): Path<ReceiptId>,
) -> Response {
    let auth = match auth_or_401(&headers) {
        Ok(a) => a,
        Err(r) => return r,
    };
    match state.engine.get_receipt(auth.tenant, receipt_id).await {
        Ok(receipt) => Json(receipt).into_response(),
        Err(e) => error_response(e),
    }
}

async fn ack_receipt(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Path(receipt_id): Path<ReceiptId>,
) -> Response {
    let auth = match auth_or_401(&headers) {
        Ok(a) => a,
        Err(r) => return r,
    };
    match state.engine.ack_receipt(auth.tenant, &auth.principal, receipt_id).await {
        Ok(receipt) => Json(receipt).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct ObligationsQuery {
    cursor: Option<String>,
    limit: Option<i64>,
}

/// The bootstrap shape spec §6/§9 requires — exactly `open_obligations` and
/// `cursor`, nothing bucketed. This is the type, not an inline `json!`, so
/// the I8 anti-regression test below can assert on its field set directly
/// rather than on a string template that could drift unnoticed.
#[derive(Serialize)]
struct ObligationsResponse {
    open_obligations: Vec<crate::model::Receipt>,
    cursor: Option<String>,
}

async fn list_obligations(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(q): Query<ObligationsQuery>,
) -> Response {
    let auth = match auth_or_401(&headers) {
        Ok(a) => a,
        Err(r) => return r,
    };
    let limit = q.limit.unwrap_or(state.engine.config().default_list_limit);
    match state
        .engine
        .obligations()
        .list_open_obligations(auth.tenant, &auth.principal, q.cursor.as_deref(), limit)
        .await
    {
        Ok(page) => Json(ObligationsResponse {
            open_obligations: page.items,
            cursor: page.cursor,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Permanent anti-regression test for I8: the bootstrap shape must be
    /// exactly `{open_obligations, cursor}` — no field named like
    /// `waiting_results`, `assigned_tasks`, `inbox`, or `attention` may ever
    /// reappear on this endpoint.
    #[test]
    fn obligations_response_shape_is_never_bucketed() {
        let response = ObligationsResponse {
            open_obligations: vec![],
            cursor: Some("2026-01-01T00:00:00Z:00000000-0000-0000-0000-000000000000".to_string()),
        };
        let value = serde_json::to_value(&response).unwrap();
        let obj = value.as_object().expect("response must serialize to a JSON object");

        let mut keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["cursor", "open_obligations"]);

        for forbidden in ["waiting_results", "assigned_tasks", "inbox", "attention"] {
            assert!(
                !obj.contains_key(forbidden),
                "bucketed field {forbidden:?} must never appear in the obligations bootstrap shape"
            );
        }
    }
}
