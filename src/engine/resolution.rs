//! Terminal transitions.
//!
//! One plan carries every write a resolution needs (workflow, violation,
//! escalation, deduction and audit rows) so a store can apply it atomically.

use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use super::deduction;
use super::workflow::Outcome;
use crate::errors::AppError;
use crate::models::audit::{AuditAction, AuditEntity, AuditEntry};
use crate::models::deduction::SalaryDeduction;
use crate::models::escalation::{EscalationRequest, EscalationStatus};
use crate::models::violation::{ThresholdViolation, ViolationStatus};
use crate::models::workflow::{ApprovalWorkflow, WorkflowKind, WorkflowStatus};

/// Note stamped on deductions withdrawn because the violation was approved.
pub const CANCELLED_ON_APPROVAL: &str = "violation approved on escalation";

#[derive(Debug, Clone)]
pub struct WorkflowChange {
    pub workflow_id: Uuid,
    pub kind: WorkflowKind,
    pub status: WorkflowStatus,
}

#[derive(Debug, Clone)]
pub struct EscalationChange {
    pub escalation_id: Uuid,
    pub status: EscalationStatus,
    pub final_outcome: String,
}

#[derive(Debug, Clone)]
pub struct ResolutionPlan {
    pub violation_id: Uuid,
    pub requester_id: Uuid,
    pub previous_violation_status: ViolationStatus,
    pub violation_status: ViolationStatus,
    /// Pending workflow to close with a conditional write.
    pub workflow: Option<WorkflowChange>,
    pub escalation: Option<EscalationChange>,
    pub issue: Option<SalaryDeduction>,
    pub cancel: Vec<Uuid>,
    pub audit: Vec<AuditEntry>,
    pub at: DateTime<Utc>,
}

impl ResolutionPlan {
    fn new(violation: &ThresholdViolation, status: ViolationStatus, at: DateTime<Utc>) -> Self {
        Self {
            violation_id: violation.id,
            requester_id: violation.created_by,
            previous_violation_status: violation.status,
            violation_status: status,
            workflow: None,
            escalation: None,
            issue: None,
            cancel: Vec::new(),
            audit: Vec::new(),
            at,
        }
    }

    fn close_workflow(&mut self, workflow: &ApprovalWorkflow, status: WorkflowStatus, actor: &str) {
        self.workflow = Some(WorkflowChange {
            workflow_id: workflow.id,
            kind: workflow.kind,
            status,
        });
        self.audit.push(
            AuditEntry::new(
                workflow.violation_id,
                AuditEntity::Workflow,
                workflow.id,
                AuditAction::WorkflowResolved,
                actor,
                self.at,
            )
            .transition(Some(workflow.status.as_str()), status.as_str()),
        );
    }

    fn close_escalation(&mut self, escalation: &EscalationRequest, status: EscalationStatus, summary: String, actor: &str) {
        self.audit.push(
            AuditEntry::new(
                escalation.threshold_violation_id,
                AuditEntity::Escalation,
                escalation.id,
                AuditAction::EscalationResolved,
                actor,
                self.at,
            )
            .transition(Some(escalation.status.as_str()), status.as_str())
            .with_details(json!({ "final_outcome": summary })),
        );
        self.escalation = Some(EscalationChange {
            escalation_id: escalation.id,
            status,
            final_outcome: summary,
        });
    }

    fn settle_violation(&mut self, violation: &ThresholdViolation, deductions: &[SalaryDeduction], actor: &str) {
        self.audit.push(
            AuditEntry::new(
                violation.id,
                AuditEntity::Violation,
                violation.id,
                AuditAction::ViolationResolved,
                actor,
                self.at,
            )
            .transition(Some(violation.status.as_str()), self.violation_status.as_str()),
        );

        if self.violation_status == ViolationStatus::Approved {
            for d in deduction::cancellable(deductions, violation.id) {
                self.cancel.push(d.id);
                self.audit.push(
                    AuditEntry::new(
                        violation.id,
                        AuditEntity::Deduction,
                        d.id,
                        AuditAction::DeductionStatusChanged,
                        actor,
                        self.at,
                    )
                    .transition(Some(d.status.as_str()), "cancelled")
                    .with_details(json!({ "note": CANCELLED_ON_APPROVAL })),
                );
            }
        } else if let Some(issued) =
            deduction::issue_if_needed(violation, self.violation_status, deductions, self.at)
        {
            self.audit.push(deduction::issued_audit(&issued, actor));
            self.issue = Some(issued);
        }
    }

    pub fn outcome_label(&self) -> &'static str {
        self.violation_status.as_str()
    }
}

/// Plan the writes for a pending workflow reaching `outcome`.
///
/// `escalation` must be the escalation the workflow belongs to (if any) and
/// `deductions` every deduction already recorded for the violation.
pub fn plan_workflow_resolution(
    workflow: &ApprovalWorkflow,
    outcome: Outcome,
    violation: &ThresholdViolation,
    escalation: Option<&EscalationRequest>,
    deductions: &[SalaryDeduction],
    actor: &str,
    at: DateTime<Utc>,
) -> ResolutionPlan {
    let violation_status = match outcome {
        Outcome::Approved => ViolationStatus::Approved,
        Outcome::Rejected => ViolationStatus::Rejected,
        Outcome::TimedOut => ViolationStatus::TimeoutRejected,
    };

    let mut plan = ResolutionPlan::new(violation, violation_status, at);
    plan.close_workflow(workflow, outcome.workflow_status(), actor);

    if let Some(esc) = escalation.filter(|e| e.status == EscalationStatus::PendingApproval) {
        let (status, summary) = match outcome {
            Outcome::Approved => (
                EscalationStatus::Approved,
                format!("approved by {}", role_list(workflow)),
            ),
            Outcome::Rejected => (
                EscalationStatus::Rejected,
                format!("rejected by {}", role_list(workflow)),
            ),
            Outcome::TimedOut => (
                EscalationStatus::Expired,
                format!("expired after {}h without a decision", workflow.timeout_hours),
            ),
        };
        plan.close_escalation(esc, status, summary, actor);
    }

    plan.settle_violation(violation, deductions, actor);
    plan
}

/// Plan the writes for an originating module reporting that money moved
/// without approval. A pending workflow is closed as rejected.
pub fn plan_unauthorized_payment(
    violation: &ThresholdViolation,
    pending: Option<&ApprovalWorkflow>,
    escalation: Option<&EscalationRequest>,
    deductions: &[SalaryDeduction],
    reporter: &str,
    at: DateTime<Utc>,
) -> Result<ResolutionPlan, AppError> {
    if !matches!(
        violation.status,
        ViolationStatus::Blocked | ViolationStatus::Rejected | ViolationStatus::TimeoutRejected
    ) {
        return Err(AppError::InvalidViolationState {
            violation_id: violation.id,
            status: violation.status,
            action: "reporting an unauthorized payment",
        });
    }

    let mut plan = ResolutionPlan::new(violation, ViolationStatus::UnauthorizedPayment, at);
    plan.audit.push(
        AuditEntry::new(
            violation.id,
            AuditEntity::Violation,
            violation.id,
            AuditAction::UnauthorizedPaymentReported,
            reporter,
            at,
        )
        .with_details(json!({ "amount": violation.amount })),
    );

    if let Some(wf) = pending.filter(|w| w.status == WorkflowStatus::Pending) {
        plan.close_workflow(wf, WorkflowStatus::Rejected, reporter);
        if let Some(esc) = escalation.filter(|e| e.status == EscalationStatus::PendingApproval) {
            plan.close_escalation(
                esc,
                EscalationStatus::Rejected,
                "superseded by unauthorized payment".to_string(),
                reporter,
            );
        }
    }

    plan.settle_violation(violation, deductions, reporter);
    Ok(plan)
}

fn role_list(workflow: &ApprovalWorkflow) -> String {
    workflow
        .required_approvers
        .iter()
        .map(|r| r.as_str())
        .collect::<Vec<_>>()
        .join("+")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::workflow;
    use crate::models::cost::CostReference;
    use crate::models::deduction::DeductionStatus;
    use crate::models::policy::{TierRule, WorkflowType};
    use rust_decimal::Decimal;

    fn blocked_violation() -> ThresholdViolation {
        let now = Utc::now();
        ThresholdViolation {
            id: Uuid::new_v4(),
            policy_id: Uuid::new_v4(),
            cost_type: "logistics_cost".into(),
            cost_category: "logistics".into(),
            subcategory: None,
            amount: Decimal::from(72_000),
            threshold_limit: Decimal::from(50_000),
            overage_amount: Decimal::from(22_000),
            reference: CostReference::LogisticsCost(Uuid::new_v4()),
            created_by: Uuid::new_v4(),
            status: ViolationStatus::Blocked,
            workflow_type: WorkflowType::FcGmDual,
            flat_penalty: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn pending_for(v: &ThresholdViolation) -> ApprovalWorkflow {
        workflow::open(
            v.id,
            &TierRule::default_for(v.workflow_type),
            WorkflowKind::Standard,
            None,
            v.created_at,
        )
        .unwrap()
    }

    #[test]
    fn test_timeout_issues_deduction() {
        let v = blocked_violation();
        let wf = pending_for(&v);
        let plan = plan_workflow_resolution(&wf, Outcome::TimedOut, &v, None, &[], "sweeper", Utc::now());
        assert_eq!(plan.violation_status, ViolationStatus::TimeoutRejected);
        assert_eq!(plan.workflow.as_ref().unwrap().status, WorkflowStatus::TimeoutRejected);
        let d = plan.issue.expect("deduction");
        assert_eq!(d.amount, Decimal::from(22_000));
        assert_eq!(d.user_id, v.created_by);
    }

    #[test]
    fn test_approval_issues_nothing() {
        let v = blocked_violation();
        let wf = pending_for(&v);
        let plan = plan_workflow_resolution(&wf, Outcome::Approved, &v, None, &[], "gm", Utc::now());
        assert_eq!(plan.violation_status, ViolationStatus::Approved);
        assert!(plan.issue.is_none());
        assert!(plan.cancel.is_empty());
    }

    #[test]
    fn test_escalation_approval_cancels_pending_deduction() {
        let mut v = blocked_violation();
        v.status = ViolationStatus::Rejected;
        let prior = deduction::issue_if_needed(&v, ViolationStatus::Rejected, &[], Utc::now()).unwrap();
        v.status = ViolationStatus::Blocked;

        let wf = pending_for(&v);
        let esc = EscalationRequest {
            id: Uuid::new_v4(),
            threshold_violation_id: v.id,
            workflow_id: wf.id,
            amount_requested: v.amount,
            escalation_type: crate::models::escalation::EscalationType::ExecutiveOverride,
            approval_required: wf.required_approvers.clone(),
            justification: "urgent shipment".into(),
            requested_by: v.created_by,
            status: EscalationStatus::PendingApproval,
            expires_at: wf.expires_at,
            final_outcome: None,
            created_at: wf.created_at,
            resolved_at: None,
        };
        let plan = plan_workflow_resolution(&wf, Outcome::Approved, &v, Some(&esc), &[prior.clone()], "ceo", Utc::now());
        assert_eq!(plan.cancel, vec![prior.id]);
        assert_eq!(plan.escalation.as_ref().unwrap().status, EscalationStatus::Approved);
        assert!(plan.issue.is_none());
    }

    #[test]
    fn test_escalation_timeout_does_not_double_issue() {
        let mut v = blocked_violation();
        v.status = ViolationStatus::Rejected;
        let prior = deduction::issue_if_needed(&v, ViolationStatus::Rejected, &[], Utc::now()).unwrap();
        v.status = ViolationStatus::Blocked;
        let wf = pending_for(&v);
        let plan = plan_workflow_resolution(&wf, Outcome::TimedOut, &v, None, &[prior], "sweeper", Utc::now());
        assert!(plan.issue.is_none());
        assert!(plan.cancel.is_empty());
    }

    #[test]
    fn test_unauthorized_payment_closes_pending_workflow() {
        let v = blocked_violation();
        let wf = pending_for(&v);
        let reporter = Uuid::new_v4().to_string();
        let plan = plan_unauthorized_payment(&v, Some(&wf), None, &[], &reporter, Utc::now()).unwrap();
        assert_eq!(plan.violation_status, ViolationStatus::UnauthorizedPayment);
        assert_eq!(plan.workflow.as_ref().unwrap().status, WorkflowStatus::Rejected);
        assert_eq!(plan.issue.as_ref().unwrap().status, DeductionStatus::Pending);
    }

    #[test]
    fn test_unauthorized_payment_refused_when_approved() {
        let mut v = blocked_violation();
        v.status = ViolationStatus::Approved;
        let err = plan_unauthorized_payment(&v, None, None, &[], "erp", Utc::now()).unwrap_err();
        assert!(matches!(err, AppError::InvalidViolationState { .. }));
    }
}
