use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;

use crate::AppState;

pub mod handlers;

/// Build the management API router.
/// All routes are relative; the caller mounts this under `/api/v1`.
pub fn api_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/evaluate", post(handlers::evaluate))
        .route("/workflows/pending", get(handlers::list_pending_workflows))
        .route("/workflows/:id", get(handlers::get_workflow))
        .route("/workflows/:id/decisions", post(handlers::submit_decision))
        .route("/violations", get(handlers::list_violations))
        .route("/violations/:id", get(handlers::get_violation))
        .route("/violations/:id/audit", get(handlers::get_audit_chain))
        .route("/violations/:id/escalations", post(handlers::open_escalation))
        .route(
            "/violations/:id/unauthorized-payment",
            post(handlers::report_unauthorized_payment),
        )
        .route("/deductions", get(handlers::list_deductions))
        .route("/deductions/:id/processed", post(handlers::mark_deduction_processed))
        .route("/deductions/:id/cancel", post(handlers::cancel_deduction))
        .route("/deductions/:id/failed", post(handlers::mark_deduction_failed))
        .route("/deductions/:id/retry", post(handlers::retry_deduction))
        .route(
            "/policies",
            get(handlers::list_policies).put(handlers::upsert_policy),
        )
        .route("/tiers", get(handlers::list_tiers).put(handlers::upsert_tier))
        .route("/approvers", axum::routing::put(handlers::upsert_approver))
        .layer(middleware::from_fn_with_state(state, admin_auth))
        .fallback(fallback_404)
}

/// Full application: health checks plus the management API under `/api/v1`.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readiness_check))
        .nest("/api/v1", api_router(state.clone()))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn readiness_check(State(state): State<Arc<AppState>>) -> Result<&'static str, StatusCode> {
    match state.engine.store().health_check().await {
        Ok(()) => Ok("ok"),
        Err(e) => {
            tracing::warn!(error = %e, "readiness check failed");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

/// Middleware: validates the `X-Admin-Key` header against the configured admin key.
/// Returns 401 if missing or invalid, and also when no key is configured.
async fn admin_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let provided_key = req
        .headers()
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            req.headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|t| t.trim())
        });

    let Some(expected) = state.config.admin_key.as_deref() else {
        tracing::warn!("admin API: COSTGOV_ADMIN_KEY is not configured, rejecting request");
        return Err(StatusCode::UNAUTHORIZED);
    };

    match provided_key {
        Some(k) if bool::from(k.as_bytes().ct_eq(expected.as_bytes())) => Ok(next.run(req).await),
        Some(_) => {
            tracing::warn!("admin API: invalid key");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            tracing::warn!("admin API: missing X-Admin-Key header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}
