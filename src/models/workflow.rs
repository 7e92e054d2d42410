use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::policy::{ApproverRole, WorkflowType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Approved,
    Rejected,
    TimeoutRejected,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Approved => "approved",
            WorkflowStatus::Rejected => "rejected",
            WorkflowStatus::TimeoutRejected => "timeout_rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowStatus::Pending)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum WorkflowKind {
    /// Opened by the registry when a violation is first recorded.
    Standard,
    /// Second-chance review opened by the escalation manager.
    Escalation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approve" | "approved" => Some(Decision::Approve),
            "reject" | "rejected" => Some(Decision::Reject),
            _ => None,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An approval cycle attached to a violation.
///
/// `required_approvers` and `timeout_hours` are captured from the tier rules
/// at creation and never re-read from live policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalWorkflow {
    pub id: Uuid,
    pub violation_id: Uuid,
    pub escalation_id: Option<Uuid>,
    pub kind: WorkflowKind,
    pub workflow_type: WorkflowType,
    pub required_approvers: Vec<ApproverRole>,
    pub timeout_hours: i64,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ApprovalWorkflow {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    pub fn requires(&self, role: ApproverRole) -> bool {
        self.required_approvers.contains(&role)
    }
}

/// One approver's vote on one workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ApprovalDecision {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub approver_id: Uuid,
    pub approver_role: ApproverRole,
    pub decision: Decision,
    pub comment: Option<String>,
    pub decision_at: DateTime<Utc>,
}

/// A vote as submitted by an approver, before it reaches the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionSubmission {
    pub workflow_id: Uuid,
    pub approver_id: Uuid,
    pub decision: Decision,
    pub comment: Option<String>,
}

/// Entry in the approver directory.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Approver {
    pub user_id: Uuid,
    pub role: ApproverRole,
    pub display_name: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}
