//! Approval Workflow Engine state machine.
//!
//! ```text
//! pending --(all required roles approve)--> approved
//! pending --(any required approver rejects)--> rejected
//! pending --(expires_at passed, unresolved)--> timeout_rejected
//! ```
//!
//! Everything here is pure. Stores load the locked rows, ask these functions
//! what to do, and persist the answer in one transaction.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use super::ledger::{self, LedgerCheck};
use crate::errors::AppError;
use crate::models::audit::{AuditAction, AuditEntity, AuditEntry};
use crate::models::policy::{ApproverRole, TierRule};
use crate::models::workflow::{
    ApprovalDecision, ApprovalWorkflow, Decision, DecisionSubmission, WorkflowKind, WorkflowStatus,
};

/// How a pending workflow ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Approved,
    Rejected,
    TimedOut,
}

impl Outcome {
    pub fn workflow_status(&self) -> WorkflowStatus {
        match self {
            Outcome::Approved => WorkflowStatus::Approved,
            Outcome::Rejected => WorkflowStatus::Rejected,
            Outcome::TimedOut => WorkflowStatus::TimeoutRejected,
        }
    }
}

/// Build a new pending workflow, snapshotting the tier rule.
pub fn open(
    violation_id: Uuid,
    tier: &TierRule,
    kind: WorkflowKind,
    escalation_id: Option<Uuid>,
    at: DateTime<Utc>,
) -> Result<ApprovalWorkflow, AppError> {
    let expires_at = Duration::try_hours(tier.timeout_hours)
        .and_then(|window| at.checked_add_signed(window))
        .ok_or_else(|| {
            AppError::Validation(format!(
                "timeout of {}h for {} is out of range",
                tier.timeout_hours, tier.workflow_type
            ))
        })?;

    Ok(ApprovalWorkflow {
        id: Uuid::new_v4(),
        violation_id,
        escalation_id,
        kind,
        workflow_type: tier.workflow_type,
        required_approvers: tier.required_approvers.clone(),
        timeout_hours: tier.timeout_hours,
        status: WorkflowStatus::Pending,
        created_at: at,
        expires_at,
        completed_at: None,
    })
}

pub fn opened_audit(workflow: &ApprovalWorkflow, actor: &str) -> AuditEntry {
    AuditEntry::new(
        workflow.violation_id,
        AuditEntity::Workflow,
        workflow.id,
        AuditAction::WorkflowOpened,
        actor,
        workflow.created_at,
    )
    .transition(None, WorkflowStatus::Pending.as_str())
    .with_details(json!({
        "kind": workflow.kind,
        "workflow_type": workflow.workflow_type,
        "required_approvers": workflow.required_approvers,
        "timeout_hours": workflow.timeout_hours,
        "expires_at": workflow.expires_at,
        "escalation_id": workflow.escalation_id,
    }))
}

/// True once every required role has an approval and nobody rejected.
pub fn quorum_reached(required: &[ApproverRole], decisions: &[ApprovalDecision]) -> bool {
    if decisions.iter().any(|d| d.decision == Decision::Reject) {
        return false;
    }
    let covered: HashSet<ApproverRole> = decisions
        .iter()
        .filter(|d| d.decision == Decision::Approve)
        .map(|d| d.approver_role)
        .collect();
    required.iter().all(|role| covered.contains(role))
}

/// What a store must do with an incoming decision.
#[derive(Debug, Clone, PartialEq)]
pub enum DecisionPlan {
    /// Identical resubmission; return the stored decision untouched.
    Replay(ApprovalDecision),
    /// Insert `decision`; if `outcome` is set, resolve the workflow with it.
    Record {
        decision: ApprovalDecision,
        outcome: Option<Outcome>,
    },
    /// The deadline passed before this vote landed; apply the timeout instead.
    Expire,
}

/// Decide what an approver's vote does to `workflow`.
///
/// `existing` must be every decision already recorded for the workflow and
/// `role` the approver's role from the directory.
pub fn plan_decision(
    workflow: &ApprovalWorkflow,
    existing: &[ApprovalDecision],
    submission: &DecisionSubmission,
    role: ApproverRole,
    at: DateTime<Utc>,
) -> Result<DecisionPlan, AppError> {
    let check = ledger::check(existing, submission.approver_id, submission.decision);

    // Client retries are answered with the stored record even after resolution.
    if let LedgerCheck::Replay(prior) = check {
        return Ok(DecisionPlan::Replay(prior));
    }

    if workflow.status.is_terminal() {
        return Err(AppError::WorkflowNotPending {
            workflow_id: workflow.id,
            status: workflow.status,
        });
    }

    if workflow.is_expired(at) {
        return Ok(DecisionPlan::Expire);
    }

    if let LedgerCheck::Conflict(prior) = check {
        return Err(AppError::DuplicateDecision {
            workflow_id: workflow.id,
            approver_id: submission.approver_id,
            existing: Box::new(prior),
        });
    }

    if !workflow.requires(role) {
        return Err(AppError::ApproverNotEligible {
            workflow_id: workflow.id,
            approver_id: submission.approver_id,
            role,
        });
    }

    let decision = ledger::entry(submission, role, at);
    let outcome = match decision.decision {
        Decision::Reject => Some(Outcome::Rejected),
        Decision::Approve => {
            let mut all = existing.to_vec();
            all.push(decision.clone());
            quorum_reached(&workflow.required_approvers, &all).then_some(Outcome::Approved)
        }
    };

    Ok(DecisionPlan::Record { decision, outcome })
}

pub fn decision_audit(violation_id: Uuid, decision: &ApprovalDecision) -> AuditEntry {
    AuditEntry::new(
        violation_id,
        AuditEntity::Decision,
        decision.id,
        AuditAction::DecisionRecorded,
        decision.approver_id.to_string(),
        decision.decision_at,
    )
    .with_details(json!({
        "workflow_id": decision.workflow_id,
        "approver_role": decision.approver_role,
        "decision": decision.decision,
        "comment": decision.comment,
    }))
}

/// Trail entry for a vote turned away because `workflow` already resolved.
pub fn refused_audit(
    workflow: &ApprovalWorkflow,
    submission: &DecisionSubmission,
    at: DateTime<Utc>,
) -> AuditEntry {
    AuditEntry::new(
        workflow.violation_id,
        AuditEntity::Workflow,
        workflow.id,
        AuditAction::DecisionRefused,
        submission.approver_id.to_string(),
        at,
    )
    .with_details(json!({
        "approver_id": submission.approver_id,
        "decision": submission.decision,
        "comment": submission.comment,
        "workflow_status": workflow.status,
    }))
}

/// Whether the sweeper may time this workflow out at `at`.
pub fn due_for_timeout(workflow: &ApprovalWorkflow, at: DateTime<Utc>) -> bool {
    workflow.status == WorkflowStatus::Pending && workflow.is_expired(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::policy::WorkflowType;

    fn dual_workflow(at: DateTime<Utc>) -> ApprovalWorkflow {
        open(
            Uuid::new_v4(),
            &TierRule::default_for(WorkflowType::FcGmDual),
            WorkflowKind::Standard,
            None,
            at,
        )
        .unwrap()
    }

    fn vote(wf: &ApprovalWorkflow, approver: Uuid, decision: Decision) -> DecisionSubmission {
        DecisionSubmission {
            workflow_id: wf.id,
            approver_id: approver,
            decision,
            comment: None,
        }
    }

    fn record(plan: DecisionPlan) -> (ApprovalDecision, Option<Outcome>) {
        match plan {
            DecisionPlan::Record { decision, outcome } => (decision, outcome),
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[test]
    fn test_open_snapshots_tier() {
        let now = Utc::now();
        let wf = dual_workflow(now);
        assert_eq!(wf.required_approvers, vec![ApproverRole::Fc, ApproverRole::Gm]);
        assert_eq!(wf.expires_at - wf.created_at, Duration::hours(48));
        assert_eq!(wf.status, WorkflowStatus::Pending);
    }

    #[test]
    fn test_dual_needs_both_roles() {
        let t0 = Utc::now();
        let wf = dual_workflow(t0);
        let fc = Uuid::new_v4();
        let gm = Uuid::new_v4();

        let (first, outcome) = record(
            plan_decision(&wf, &[], &vote(&wf, fc, Decision::Approve), ApproverRole::Fc, t0 + Duration::hours(1))
                .unwrap(),
        );
        assert_eq!(outcome, None, "FC alone must not satisfy a dual tier");

        let (_, outcome) = record(
            plan_decision(&wf, &[first], &vote(&wf, gm, Decision::Approve), ApproverRole::Gm, t0 + Duration::hours(3))
                .unwrap(),
        );
        assert_eq!(outcome, Some(Outcome::Approved));
    }

    #[test]
    fn test_open_rejects_window_past_calendar_range() {
        let tier = TierRule {
            workflow_type: WorkflowType::FcOnly,
            required_approvers: vec![ApproverRole::Fc],
            timeout_hours: i64::MAX / 2,
        };
        let err = open(Uuid::new_v4(), &tier, WorkflowKind::Standard, None, Utc::now()).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_same_role_twice_is_not_quorum() {
        let t0 = Utc::now();
        let wf = dual_workflow(t0);
        let (first, _) = record(
            plan_decision(&wf, &[], &vote(&wf, Uuid::new_v4(), Decision::Approve), ApproverRole::Fc, t0).unwrap(),
        );
        let (_, outcome) = record(
            plan_decision(&wf, &[first], &vote(&wf, Uuid::new_v4(), Decision::Approve), ApproverRole::Fc, t0)
                .unwrap(),
        );
        assert_eq!(outcome, None);
    }

    #[test]
    fn test_single_reject_fails_fast() {
        let t0 = Utc::now();
        let wf = dual_workflow(t0);
        let (fc_vote, _) = record(
            plan_decision(&wf, &[], &vote(&wf, Uuid::new_v4(), Decision::Approve), ApproverRole::Fc, t0).unwrap(),
        );
        let (_, outcome) = record(
            plan_decision(&wf, &[fc_vote], &vote(&wf, Uuid::new_v4(), Decision::Reject), ApproverRole::Gm, t0)
                .unwrap(),
        );
        assert_eq!(outcome, Some(Outcome::Rejected));
    }

    #[test]
    fn test_replay_and_conflict() {
        let t0 = Utc::now();
        let wf = dual_workflow(t0);
        let fc = Uuid::new_v4();
        let (stored, _) = record(
            plan_decision(&wf, &[], &vote(&wf, fc, Decision::Approve), ApproverRole::Fc, t0).unwrap(),
        );
        let existing = vec![stored.clone()];

        let replay = plan_decision(&wf, &existing, &vote(&wf, fc, Decision::Approve), ApproverRole::Fc, t0).unwrap();
        assert_eq!(replay, DecisionPlan::Replay(stored));

        let err = plan_decision(&wf, &existing, &vote(&wf, fc, Decision::Reject), ApproverRole::Fc, t0).unwrap_err();
        assert!(matches!(err, AppError::DuplicateDecision { .. }));
    }

    #[test]
    fn test_late_vote_after_resolution() {
        let t0 = Utc::now();
        let mut wf = dual_workflow(t0);
        wf.status = WorkflowStatus::Rejected;
        let err = plan_decision(&wf, &[], &vote(&wf, Uuid::new_v4(), Decision::Approve), ApproverRole::Fc, t0)
            .unwrap_err();
        match err {
            AppError::WorkflowNotPending { status, .. } => assert_eq!(status, WorkflowStatus::Rejected),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_vote_after_deadline_expires_workflow() {
        let t0 = Utc::now();
        let wf = dual_workflow(t0);
        let plan = plan_decision(
            &wf,
            &[],
            &vote(&wf, Uuid::new_v4(), Decision::Approve),
            ApproverRole::Fc,
            t0 + Duration::hours(49),
        )
        .unwrap();
        assert_eq!(plan, DecisionPlan::Expire);
        assert!(due_for_timeout(&wf, t0 + Duration::hours(49)));
        assert!(!due_for_timeout(&wf, t0 + Duration::hours(47)));
    }

    #[test]
    fn test_ineligible_role() {
        let t0 = Utc::now();
        let wf = dual_workflow(t0);
        let err = plan_decision(&wf, &[], &vote(&wf, Uuid::new_v4(), Decision::Approve), ApproverRole::Ceo, t0)
            .unwrap_err();
        assert!(matches!(err, AppError::ApproverNotEligible { .. }));
    }
}
