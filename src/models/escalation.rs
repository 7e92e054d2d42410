use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::policy::ApproverRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum EscalationStatus {
    PendingApproval,
    Approved,
    Rejected,
    Expired,
}

impl EscalationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationStatus::PendingApproval => "pending_approval",
            EscalationStatus::Approved => "approved",
            EscalationStatus::Rejected => "rejected",
            EscalationStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for EscalationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum EscalationType {
    /// Reviewed by a General Manager.
    ManagerOverride,
    /// Reviewed by the Chief Executive.
    ExecutiveOverride,
}

impl EscalationType {
    pub fn for_role(role: ApproverRole) -> Self {
        match role {
            ApproverRole::Fc | ApproverRole::Gm => EscalationType::ManagerOverride,
            ApproverRole::Ceo => EscalationType::ExecutiveOverride,
        }
    }
}

/// A second-chance, higher-authority review of a rejected or expired violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRequest {
    pub id: Uuid,
    pub threshold_violation_id: Uuid,
    pub workflow_id: Uuid,
    pub amount_requested: Decimal,
    pub escalation_type: EscalationType,
    pub approval_required: Vec<ApproverRole>,
    pub justification: String,
    pub requested_by: Uuid,
    pub status: EscalationStatus,
    pub expires_at: DateTime<Utc>,
    pub final_outcome: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Caller input for opening an escalation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationInput {
    pub violation_id: Uuid,
    pub justification: String,
    pub requested_by: Uuid,
    /// May lower the amount under review; defaults to the violation amount.
    pub amount_requested: Option<Decimal>,
}
