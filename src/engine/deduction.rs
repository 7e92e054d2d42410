//! Salary Deduction Issuer.
//!
//! Turns a failed violation into a payroll deduction, at most once per
//! violation, and governs the payroll-side status changes afterwards.

use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::audit::{AuditAction, AuditEntity, AuditEntry};
use crate::models::deduction::{DeductionStatus, SalaryDeduction};
use crate::models::violation::{ThresholdViolation, ViolationStatus};

/// Draft a deduction for `violation` now that it sits at `status`.
///
/// Returns `None` when the status carries no consequence or a non-cancelled
/// deduction already exists for the violation.
pub fn issue_if_needed(
    violation: &ThresholdViolation,
    status: ViolationStatus,
    existing: &[SalaryDeduction],
    at: DateTime<Utc>,
) -> Option<SalaryDeduction> {
    if !status.is_non_approved_terminal() {
        return None;
    }
    if existing
        .iter()
        .any(|d| d.violation_id == violation.id && d.status.is_active())
    {
        return None;
    }

    Some(SalaryDeduction {
        id: Uuid::new_v4(),
        user_id: violation.created_by,
        violation_id: violation.id,
        amount: violation.deduction_amount(),
        trigger_status: status,
        status: DeductionStatus::Pending,
        deduction_date: at.date_naive(),
        note: None,
        created_at: at,
        updated_at: at,
    })
}

pub fn issued_audit(deduction: &SalaryDeduction, actor: &str) -> AuditEntry {
    AuditEntry::new(
        deduction.violation_id,
        AuditEntity::Deduction,
        deduction.id,
        AuditAction::DeductionIssued,
        actor,
        deduction.created_at,
    )
    .transition(None, DeductionStatus::Pending.as_str())
    .with_details(json!({
        "user_id": deduction.user_id,
        "amount": deduction.amount,
        "trigger_status": deduction.trigger_status,
    }))
}

/// Deductions that should be withdrawn when a violation is finally approved.
pub fn cancellable(existing: &[SalaryDeduction], violation_id: Uuid) -> Vec<&SalaryDeduction> {
    existing
        .iter()
        .filter(|d| {
            d.violation_id == violation_id
                && matches!(d.status, DeductionStatus::Pending | DeductionStatus::Failed)
        })
        .collect()
}

pub fn can_transition(from: DeductionStatus, to: DeductionStatus) -> bool {
    use DeductionStatus::*;
    matches!(
        (from, to),
        (Pending, Processed) | (Pending, Cancelled) | (Pending, Failed) | (Failed, Pending) | (Failed, Cancelled)
    )
}

/// Result of a payroll-side status change.
#[derive(Debug, Clone)]
pub struct DeductionTransition {
    pub deduction: SalaryDeduction,
    /// Set when the violation itself moves (payroll applied the deduction).
    pub violation_status: Option<ViolationStatus>,
    pub audit: Vec<AuditEntry>,
}

pub fn plan_transition(
    deduction: &SalaryDeduction,
    violation: &ThresholdViolation,
    to: DeductionStatus,
    note: Option<String>,
    actor: &str,
    at: DateTime<Utc>,
) -> Result<DeductionTransition, AppError> {
    if !can_transition(deduction.status, to) {
        return Err(AppError::InvalidDeductionTransition {
            deduction_id: deduction.id,
            from: deduction.status,
            to,
        });
    }

    let mut updated = deduction.clone();
    updated.status = to;
    updated.updated_at = at;
    if note.is_some() {
        updated.note = note;
    }

    let mut audit = vec![AuditEntry::new(
        deduction.violation_id,
        AuditEntity::Deduction,
        deduction.id,
        AuditAction::DeductionStatusChanged,
        actor,
        at,
    )
    .transition(Some(deduction.status.as_str()), to.as_str())
    .with_details(json!({ "note": updated.note }))];

    let violation_status = (to == DeductionStatus::Processed
        && violation.status.is_non_approved_terminal())
    .then_some(ViolationStatus::Processed);

    if let Some(next) = violation_status {
        audit.push(
            AuditEntry::new(
                violation.id,
                AuditEntity::Violation,
                violation.id,
                AuditAction::ViolationResolved,
                actor,
                at,
            )
            .transition(Some(violation.status.as_str()), next.as_str()),
        );
    }

    Ok(DeductionTransition {
        deduction: updated,
        violation_status,
        audit,
    })
}
