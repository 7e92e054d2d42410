use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::models::deduction::DeductionStatus;
use crate::models::policy::ApproverRole;
use crate::models::violation::ViolationStatus;
use crate::models::workflow::{ApprovalDecision, WorkflowStatus};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("no threshold policy for category '{category}'{}", .subcategory.as_deref().map(|s| format!(" / '{s}'")).unwrap_or_default())]
    PolicyNotFound {
        category: String,
        subcategory: Option<String>,
    },

    #[error("workflow {workflow_id} was already resolved as {status}")]
    WorkflowNotPending {
        workflow_id: Uuid,
        status: WorkflowStatus,
    },

    #[error("approver {approver_id} already decided '{}' on workflow {workflow_id}", .existing.decision)]
    DuplicateDecision {
        workflow_id: Uuid,
        approver_id: Uuid,
        existing: Box<ApprovalDecision>,
    },

    #[error("violation {violation_id} cannot be escalated while {status}")]
    InvalidEscalationState {
        violation_id: Uuid,
        status: ViolationStatus,
    },

    #[error("violation {violation_id} is {status}; {action} is not allowed")]
    InvalidViolationState {
        violation_id: Uuid,
        status: ViolationStatus,
        action: &'static str,
    },

    #[error("approver {0} is not registered or inactive")]
    UnknownApprover(Uuid),

    #[error("approver {approver_id} ({role}) is not a required approver for workflow {workflow_id}")]
    ApproverNotEligible {
        workflow_id: Uuid,
        approver_id: Uuid,
        role: ApproverRole,
    },

    #[error("deduction {deduction_id} cannot move from {from} to {to}")]
    InvalidDeductionTransition {
        deduction_id: Uuid,
        from: DeductionStatus,
        to: DeductionStatus,
    },

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        AppError::NotFound { entity, id }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, code) = match &self {
            AppError::PolicyNotFound { .. } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "configuration_error",
                "policy_not_found",
            ),
            AppError::WorkflowNotPending { .. } => {
                (StatusCode::CONFLICT, "conflict_error", "workflow_not_pending")
            }
            AppError::DuplicateDecision { .. } => {
                (StatusCode::CONFLICT, "conflict_error", "duplicate_decision")
            }
            AppError::InvalidEscalationState { .. } => (
                StatusCode::CONFLICT,
                "conflict_error",
                "invalid_escalation_state",
            ),
            AppError::InvalidViolationState { .. } => (
                StatusCode::CONFLICT,
                "conflict_error",
                "invalid_violation_state",
            ),
            AppError::UnknownApprover(_) => (
                StatusCode::FORBIDDEN,
                "permission_error",
                "unknown_approver",
            ),
            AppError::ApproverNotEligible { .. } => (
                StatusCode::FORBIDDEN,
                "permission_error",
                "approver_not_eligible",
            ),
            AppError::InvalidDeductionTransition { .. } => (
                StatusCode::CONFLICT,
                "conflict_error",
                "invalid_deduction_transition",
            ),
            AppError::Validation(_) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "validation_failed",
            ),
            AppError::NotFound { .. } => {
                (StatusCode::NOT_FOUND, "not_found_error", "not_found")
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                )
            }
        };

        // Store failures never leak their details to the caller.
        let msg = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "internal server error".to_string()
        } else {
            self.to_string()
        };

        let mut body = json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        });

        // Late deciders get the resolved state so the UI can explain why their vote was moot.
        if let AppError::WorkflowNotPending { status, .. } = &self {
            body["error"]["resolved_as"] = json!(status);
        }

        (status, Json(body)).into_response()
    }
}
