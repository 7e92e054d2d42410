use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::violation::ViolationStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum DeductionStatus {
    Pending,
    Processed,
    Cancelled,
    Failed,
}

impl DeductionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeductionStatus::Pending => "pending",
            DeductionStatus::Processed => "processed",
            DeductionStatus::Cancelled => "cancelled",
            DeductionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(DeductionStatus::Pending),
            "processed" => Some(DeductionStatus::Processed),
            "cancelled" => Some(DeductionStatus::Cancelled),
            "failed" => Some(DeductionStatus::Failed),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, DeductionStatus::Cancelled)
    }
}

impl fmt::Display for DeductionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payroll consequence raised against the requester of a failed violation.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SalaryDeduction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub violation_id: Uuid,
    pub amount: Decimal,
    /// Violation status that triggered the deduction.
    pub trigger_status: ViolationStatus,
    pub status: DeductionStatus,
    pub deduction_date: NaiveDate,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
