//! Escalation Manager.
//!
//! Reopens a rejected or expired violation for one higher-authority review.
//! The review is an ordinary workflow (kind `escalation`) so it shares the
//! decision ledger, quorum logic and timeout sweep with first-line reviews.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;

use super::workflow;
use crate::errors::AppError;
use crate::models::audit::{AuditAction, AuditEntity, AuditEntry};
use crate::models::escalation::{EscalationInput, EscalationRequest, EscalationStatus, EscalationType};
use crate::models::cost::check_money;
use crate::models::policy::{check_timeout_hours, ApproverRole, TierRule, WorkflowType};
use crate::models::violation::{ThresholdViolation, ViolationStatus};
use crate::models::workflow::{ApprovalWorkflow, WorkflowKind};

#[derive(Debug, Clone)]
pub struct EscalationOpening {
    pub escalation: EscalationRequest,
    pub workflow: ApprovalWorkflow,
    pub previous_violation_status: ViolationStatus,
    pub audit: Vec<AuditEntry>,
}

/// One tier above the highest role the previous review needed.
pub fn escalation_role(previous: &[ApproverRole]) -> ApproverRole {
    previous
        .iter()
        .max()
        .map(|r| r.next_tier())
        .unwrap_or(ApproverRole::Gm)
}

/// `latest` is the violation's most recent workflow; it must be terminal.
pub fn plan_escalation(
    violation: &ThresholdViolation,
    latest: Option<&ApprovalWorkflow>,
    input: &EscalationInput,
    timeout_hours: i64,
    at: DateTime<Utc>,
) -> Result<EscalationOpening, AppError> {
    if !violation.status.is_non_approved_terminal() {
        return Err(AppError::InvalidEscalationState {
            violation_id: violation.id,
            status: violation.status,
        });
    }
    if latest.is_some_and(|w| !w.status.is_terminal()) {
        return Err(AppError::InvalidEscalationState {
            violation_id: violation.id,
            status: violation.status,
        });
    }

    let justification = input.justification.trim();
    if justification.is_empty() {
        return Err(AppError::Validation("justification must not be empty".into()));
    }
    check_timeout_hours("escalation timeout", timeout_hours).map_err(AppError::Validation)?;

    let amount_requested = input.amount_requested.unwrap_or(violation.amount);
    check_money("amount_requested", amount_requested).map_err(AppError::Validation)?;
    if amount_requested <= Decimal::ZERO || amount_requested > violation.amount {
        return Err(AppError::Validation(format!(
            "amount_requested must be positive and at most {}",
            violation.amount
        )));
    }

    let previous_roles = latest
        .map(|w| w.required_approvers.clone())
        .unwrap_or_else(|| violation.workflow_type.default_approvers());
    let role = escalation_role(&previous_roles);
    let tier = TierRule {
        workflow_type: WorkflowType::single(role),
        required_approvers: vec![role],
        timeout_hours,
    };

    let escalation_id = Uuid::new_v4();
    let workflow = workflow::open(violation.id, &tier, WorkflowKind::Escalation, Some(escalation_id), at)?;

    let escalation = EscalationRequest {
        id: escalation_id,
        threshold_violation_id: violation.id,
        workflow_id: workflow.id,
        amount_requested,
        escalation_type: EscalationType::for_role(role),
        approval_required: vec![role],
        justification: justification.to_string(),
        requested_by: input.requested_by,
        status: EscalationStatus::PendingApproval,
        expires_at: workflow.expires_at,
        final_outcome: None,
        created_at: at,
        resolved_at: None,
    };

    let actor = input.requested_by.to_string();
    let audit = vec![
        AuditEntry::new(
            violation.id,
            AuditEntity::Escalation,
            escalation.id,
            AuditAction::EscalationOpened,
            actor.as_str(),
            at,
        )
        .transition(None, EscalationStatus::PendingApproval.as_str())
        .with_details(json!({
            "escalation_type": escalation.escalation_type,
            "approval_required": escalation.approval_required,
            "amount_requested": escalation.amount_requested,
            "justification": escalation.justification,
        })),
        AuditEntry::new(
            violation.id,
            AuditEntity::Violation,
            violation.id,
            AuditAction::ViolationResolved,
            actor.as_str(),
            at,
        )
        .transition(Some(violation.status.as_str()), ViolationStatus::Blocked.as_str())
        .with_details(json!({ "reopened_by_escalation": escalation.id })),
        workflow::opened_audit(&workflow, &actor),
    ];

    Ok(EscalationOpening {
        escalation,
        workflow,
        previous_violation_status: violation.status,
        audit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::cost::CostReference;
    use crate::models::policy::MAX_TIMEOUT_HOURS;
    use crate::models::workflow::WorkflowStatus;

    fn violation(status: ViolationStatus) -> ThresholdViolation {
        let now = Utc::now();
        ThresholdViolation {
            id: Uuid::new_v4(),
            policy_id: Uuid::new_v4(),
            cost_type: "bonus_payout".into(),
            cost_category: "bonus".into(),
            subcategory: None,
            amount: Decimal::from(10_000),
            threshold_limit: Decimal::from(8_000),
            overage_amount: Decimal::from(2_000),
            reference: CostReference::BonusPayout(Uuid::new_v4()),
            created_by: Uuid::new_v4(),
            status,
            workflow_type: WorkflowType::FcOnly,
            flat_penalty: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn input(v: &ThresholdViolation) -> EscalationInput {
        EscalationInput {
            violation_id: v.id,
            justification: "vendor price moved overnight".into(),
            requested_by: v.created_by,
            amount_requested: None,
        }
    }

    fn closed_workflow(v: &ThresholdViolation) -> ApprovalWorkflow {
        let mut wf = workflow::open(
            v.id,
            &TierRule::default_for(v.workflow_type),
            WorkflowKind::Standard,
            None,
            v.created_at,
        )
        .unwrap();
        wf.status = WorkflowStatus::Rejected;
        wf
    }

    #[test]
    fn test_escalation_roles_climb() {
        assert_eq!(escalation_role(&[ApproverRole::Fc]), ApproverRole::Gm);
        assert_eq!(escalation_role(&[ApproverRole::Fc, ApproverRole::Gm]), ApproverRole::Ceo);
        assert_eq!(escalation_role(&[ApproverRole::Gm, ApproverRole::Ceo]), ApproverRole::Ceo);
    }

    #[test]
    fn test_escalation_on_rejected_violation() {
        let v = violation(ViolationStatus::Rejected);
        let wf = closed_workflow(&v);
        let opening = plan_escalation(&v, Some(&wf), &input(&v), 72, Utc::now()).unwrap();
        assert_eq!(opening.workflow.kind, WorkflowKind::Escalation);
        assert_eq!(opening.workflow.required_approvers, vec![ApproverRole::Gm]);
        assert_eq!(opening.workflow.escalation_id, Some(opening.escalation.id));
        assert_eq!(opening.escalation.escalation_type, EscalationType::ManagerOverride);
        assert_eq!(opening.escalation.amount_requested, v.amount);
        assert_eq!(opening.escalation.expires_at, opening.workflow.expires_at);
    }

    #[test]
    fn test_escalation_refused_while_blocked() {
        let v = violation(ViolationStatus::Blocked);
        let err = plan_escalation(&v, None, &input(&v), 72, Utc::now()).unwrap_err();
        assert!(matches!(err, AppError::InvalidEscalationState { .. }));
    }

    #[test]
    fn test_escalation_refused_for_approved() {
        let v = violation(ViolationStatus::Approved);
        let err = plan_escalation(&v, None, &input(&v), 72, Utc::now()).unwrap_err();
        assert!(matches!(err, AppError::InvalidEscalationState { .. }));
    }

    #[test]
    fn test_amount_cannot_grow() {
        let v = violation(ViolationStatus::TimeoutRejected);
        let mut req = input(&v);
        req.amount_requested = Some(Decimal::from(20_000));
        let err = plan_escalation(&v, None, &req, 72, Utc::now()).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        req.amount_requested = Some(Decimal::from(9_000));
        let ok = plan_escalation(&v, None, &req, 72, Utc::now()).unwrap();
        assert_eq!(ok.escalation.amount_requested, Decimal::from(9_000));

        req.amount_requested = Some(Decimal::new(90_005, 3));
        let err = plan_escalation(&v, None, &req, 72, Utc::now()).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_escalation_window_is_bounded() {
        let v = violation(ViolationStatus::Rejected);
        for hours in [0, MAX_TIMEOUT_HOURS + 1, i64::MAX / 2] {
            let err = plan_escalation(&v, None, &input(&v), hours, Utc::now()).unwrap_err();
            assert!(matches!(err, AppError::Validation(_)), "{hours}h");
        }
        assert!(plan_escalation(&v, None, &input(&v), MAX_TIMEOUT_HOURS, Utc::now()).is_ok());
    }
}
