use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::{DecisionOutcome, EvaluationOutcome, ViolationDetail, WorkflowDetail};
use crate::errors::AppError;
use crate::models::audit::AuditEntry;
use crate::models::cost::CostRequest;
use crate::models::deduction::{DeductionStatus, SalaryDeduction};
use crate::models::escalation::{EscalationInput, EscalationRequest};
use crate::models::policy::{ApproverRole, ThresholdPolicy, TierRule};
use crate::models::violation::{ThresholdViolation, ViolationStatus};
use crate::models::workflow::{ApprovalWorkflow, Approver, Decision, DecisionSubmission};
use crate::store::DeductionFilter;
use crate::AppState;

const DEFAULT_ACTOR: &str = "admin";

// -- Request types --

#[derive(Deserialize)]
pub struct RoleParams {
    pub role: Option<String>,
}

#[derive(Deserialize)]
pub struct StatusParams {
    pub status: Option<String>,
}

#[derive(Deserialize)]
pub struct DeductionParams {
    pub status: Option<String>,
    pub user_id: Option<Uuid>,
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct DecisionRequest {
    pub approver_id: Uuid,
    /// "approve" or "reject" ("approved"/"rejected" also accepted).
    pub decision: String,
    pub comment: Option<String>,
}

#[derive(Deserialize)]
pub struct EscalationBody {
    pub justification: String,
    pub requested_by: Uuid,
    pub amount_requested: Option<Decimal>,
}

#[derive(Deserialize)]
pub struct ReportBody {
    pub reporter: String,
}

#[derive(Deserialize, Default)]
pub struct DeductionActionBody {
    pub reason: Option<String>,
    pub actor: Option<String>,
}

impl DeductionActionBody {
    fn actor(&self) -> &str {
        self.actor.as_deref().unwrap_or(DEFAULT_ACTOR)
    }
}

fn parse_role(raw: Option<&str>) -> Result<Option<ApproverRole>, AppError> {
    raw.map(|r| {
        ApproverRole::parse(r).ok_or_else(|| AppError::Validation(format!("unknown approver role '{}'", r)))
    })
    .transpose()
}

// -- Evaluate --

pub async fn evaluate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CostRequest>,
) -> Result<Json<EvaluationOutcome>, AppError> {
    let outcome = state.engine.evaluate(&request).await?;
    Ok(Json(outcome))
}

// -- Workflows --

pub async fn list_pending_workflows(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RoleParams>,
) -> Result<Json<Vec<ApprovalWorkflow>>, AppError> {
    let role = parse_role(params.role.as_deref())?;
    let workflows = state.engine.list_pending_workflows(role).await?;
    Ok(Json(workflows))
}

pub async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<WorkflowDetail>, AppError> {
    Ok(Json(state.engine.workflow_detail(id).await?))
}

pub async fn submit_decision(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DecisionRequest>,
) -> Result<(StatusCode, Json<DecisionOutcome>), AppError> {
    let decision = Decision::parse(&payload.decision).ok_or_else(|| {
        tracing::warn!(workflow_id = %id, decision = %payload.decision, "invalid decision value");
        AppError::Validation(format!(
            "decision must be 'approve' or 'reject', got '{}'",
            payload.decision
        ))
    })?;

    let outcome = state
        .engine
        .decide(DecisionSubmission {
            workflow_id: id,
            approver_id: payload.approver_id,
            decision,
            comment: payload.comment,
        })
        .await?;

    let status = if outcome.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(outcome)))
}

// -- Violations --

pub async fn list_violations(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatusParams>,
) -> Result<Json<Vec<ThresholdViolation>>, AppError> {
    let status = params
        .status
        .as_deref()
        .map(|s| {
            ViolationStatus::parse(s)
                .ok_or_else(|| AppError::Validation(format!("unknown violation status '{}'", s)))
        })
        .transpose()?;
    Ok(Json(state.engine.list_violations(status).await?))
}

pub async fn get_violation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ViolationDetail>, AppError> {
    Ok(Json(state.engine.violation_detail(id).await?))
}

pub async fn get_audit_chain(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<AuditEntry>>, AppError> {
    Ok(Json(state.engine.audit_chain(id).await?))
}

pub async fn open_escalation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<EscalationBody>,
) -> Result<(StatusCode, Json<EscalationRequest>), AppError> {
    let escalation = state
        .engine
        .escalate(EscalationInput {
            violation_id: id,
            justification: body.justification,
            requested_by: body.requested_by,
            amount_requested: body.amount_requested,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(escalation)))
}

pub async fn report_unauthorized_payment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<ReportBody>,
) -> Result<Json<ThresholdViolation>, AppError> {
    if body.reporter.trim().is_empty() {
        return Err(AppError::Validation("reporter must not be empty".into()));
    }
    let violation = state
        .engine
        .report_unauthorized_payment(id, body.reporter.trim())
        .await?;
    Ok(Json(violation))
}

// -- Payroll feed --

pub async fn list_deductions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DeductionParams>,
) -> Result<Json<Vec<SalaryDeduction>>, AppError> {
    let status = params
        .status
        .as_deref()
        .map(|s| {
            DeductionStatus::parse(s)
                .ok_or_else(|| AppError::Validation(format!("unknown deduction status '{}'", s)))
        })
        .transpose()?;

    let deductions = state
        .engine
        .deductions(DeductionFilter {
            status,
            user_id: params.user_id,
            limit: params.limit.map(|l| l.clamp(1, 1000)),
        })
        .await?;
    Ok(Json(deductions))
}

pub async fn mark_deduction_processed(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    body: Option<Json<DeductionActionBody>>,
) -> Result<Json<SalaryDeduction>, AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    Ok(Json(state.engine.mark_deduction_processed(id, body.actor()).await?))
}

pub async fn cancel_deduction(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    body: Option<Json<DeductionActionBody>>,
) -> Result<Json<SalaryDeduction>, AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let actor = body.actor().to_string();
    Ok(Json(state.engine.cancel_deduction(id, body.reason, &actor).await?))
}

pub async fn mark_deduction_failed(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    body: Option<Json<DeductionActionBody>>,
) -> Result<Json<SalaryDeduction>, AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let actor = body.actor().to_string();
    Ok(Json(state.engine.mark_deduction_failed(id, body.reason, &actor).await?))
}

pub async fn retry_deduction(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    body: Option<Json<DeductionActionBody>>,
) -> Result<Json<SalaryDeduction>, AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    Ok(Json(state.engine.retry_deduction(id, body.actor()).await?))
}

// -- Policy administration --

pub async fn list_policies(State(state): State<Arc<AppState>>) -> Json<Vec<ThresholdPolicy>> {
    Json(state.engine.list_policies().await)
}

pub async fn upsert_policy(
    State(state): State<Arc<AppState>>,
    Json(policy): Json<ThresholdPolicy>,
) -> Result<Json<ThresholdPolicy>, AppError> {
    Ok(Json(state.engine.upsert_policy(policy).await?))
}

pub async fn list_tiers(State(state): State<Arc<AppState>>) -> Json<Vec<TierRule>> {
    Json(state.engine.list_tiers().await)
}

pub async fn upsert_tier(
    State(state): State<Arc<AppState>>,
    Json(tier): Json<TierRule>,
) -> Result<Json<TierRule>, AppError> {
    Ok(Json(state.engine.upsert_tier(tier).await?))
}

pub async fn upsert_approver(
    State(state): State<Arc<AppState>>,
    Json(approver): Json<Approver>,
) -> Result<Json<Approver>, AppError> {
    Ok(Json(state.engine.upsert_approver(approver).await?))
}
