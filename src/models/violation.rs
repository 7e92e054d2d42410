use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::cost::CostReference;
use super::policy::WorkflowType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum ViolationStatus {
    /// Spend is held while an approval workflow is pending.
    Blocked,
    Approved,
    Rejected,
    TimeoutRejected,
    UnauthorizedPayment,
    /// The resulting deduction was applied by payroll.
    Processed,
}

impl ViolationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationStatus::Blocked => "blocked",
            ViolationStatus::Approved => "approved",
            ViolationStatus::Rejected => "rejected",
            ViolationStatus::TimeoutRejected => "timeout_rejected",
            ViolationStatus::UnauthorizedPayment => "unauthorized_payment",
            ViolationStatus::Processed => "processed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "blocked" => Some(ViolationStatus::Blocked),
            "approved" => Some(ViolationStatus::Approved),
            "rejected" => Some(ViolationStatus::Rejected),
            "timeout_rejected" => Some(ViolationStatus::TimeoutRejected),
            "unauthorized_payment" => Some(ViolationStatus::UnauthorizedPayment),
            "processed" => Some(ViolationStatus::Processed),
            _ => None,
        }
    }

    /// States that carry a payroll consequence and may be escalated.
    pub fn is_non_approved_terminal(&self) -> bool {
        matches!(
            self,
            ViolationStatus::Rejected
                | ViolationStatus::TimeoutRejected
                | ViolationStatus::UnauthorizedPayment
        )
    }
}

impl fmt::Display for ViolationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of a cost request that exceeded its threshold. Never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdViolation {
    pub id: Uuid,
    pub policy_id: Uuid,
    pub cost_type: String,
    pub cost_category: String,
    pub subcategory: Option<String>,
    pub amount: Decimal,
    pub threshold_limit: Decimal,
    pub overage_amount: Decimal,
    #[serde(flatten)]
    pub reference: CostReference,
    pub created_by: Uuid,
    pub status: ViolationStatus,
    pub workflow_type: WorkflowType,
    /// Snapshot of the policy's flat penalty at registration time.
    pub flat_penalty: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ThresholdViolation {
    /// Payroll consequence for this violation: the flat penalty if the policy
    /// carried one, the overage otherwise.
    pub fn deduction_amount(&self) -> Decimal {
        self.flat_penalty.unwrap_or(self.overage_amount)
    }
}

/// Evaluator output for a request that exceeded its threshold, before persistence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViolationDraft {
    pub policy_id: Uuid,
    pub cost_type: String,
    pub cost_category: String,
    pub subcategory: Option<String>,
    pub amount: Decimal,
    pub threshold_limit: Decimal,
    pub overage_amount: Decimal,
    pub reference: CostReference,
    pub created_by: Uuid,
    pub workflow_type: WorkflowType,
    pub flat_penalty: Option<Decimal>,
}
