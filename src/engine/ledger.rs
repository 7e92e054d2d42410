//! Decision Ledger.
//!
//! At most one decision per (workflow, approver). Shared by standard and
//! escalation workflows; stores back this check with a unique constraint.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::policy::ApproverRole;
use crate::models::workflow::{ApprovalDecision, Decision, DecisionSubmission};

#[derive(Debug, Clone, PartialEq)]
pub enum LedgerCheck {
    /// No prior decision from this approver.
    Fresh,
    /// Same approver, same value: a client retry.
    Replay(ApprovalDecision),
    /// Same approver, different value.
    Conflict(ApprovalDecision),
}

pub fn check(existing: &[ApprovalDecision], approver_id: Uuid, decision: Decision) -> LedgerCheck {
    match existing.iter().find(|d| d.approver_id == approver_id) {
        None => LedgerCheck::Fresh,
        Some(prior) if prior.decision == decision => LedgerCheck::Replay(prior.clone()),
        Some(prior) => LedgerCheck::Conflict(prior.clone()),
    }
}

pub fn entry(
    submission: &DecisionSubmission,
    role: ApproverRole,
    at: DateTime<Utc>,
) -> ApprovalDecision {
    ApprovalDecision {
        id: Uuid::new_v4(),
        workflow_id: submission.workflow_id,
        approver_id: submission.approver_id,
        approver_role: role,
        decision: submission.decision,
        comment: submission
            .comment
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(String::from),
        decision_at: at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission(approver: Uuid, decision: Decision) -> DecisionSubmission {
        DecisionSubmission {
            workflow_id: Uuid::nil(),
            approver_id: approver,
            decision,
            comment: Some("  ".into()),
        }
    }

    #[test]
    fn test_check_outcomes() {
        let fc = Uuid::new_v4();
        let prior = entry(&submission(fc, Decision::Approve), ApproverRole::Fc, Utc::now());
        let ledger = vec![prior.clone()];

        assert_eq!(check(&ledger, Uuid::new_v4(), Decision::Approve), LedgerCheck::Fresh);
        assert_eq!(check(&ledger, fc, Decision::Approve), LedgerCheck::Replay(prior.clone()));
        assert_eq!(check(&ledger, fc, Decision::Reject), LedgerCheck::Conflict(prior));
    }

    #[test]
    fn test_blank_comment_dropped() {
        let d = entry(&submission(Uuid::new_v4(), Decision::Reject), ApproverRole::Gm, Utc::now());
        assert!(d.comment.is_none());
    }
}
