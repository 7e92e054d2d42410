//! Violation Registry.
//!
//! A violation is always registered together with its first workflow; the
//! pair is written in one transaction by the store.

use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use super::workflow;
use crate::errors::AppError;
use crate::models::audit::{AuditAction, AuditEntity, AuditEntry};
use crate::models::policy::PolicyBook;
use crate::models::violation::{ThresholdViolation, ViolationDraft, ViolationStatus};
use crate::models::workflow::{ApprovalWorkflow, WorkflowKind};

#[derive(Debug, Clone)]
pub struct Registration {
    pub violation: ThresholdViolation,
    pub workflow: ApprovalWorkflow,
    pub audit: Vec<AuditEntry>,
}

pub fn plan_registration(
    draft: ViolationDraft,
    book: &PolicyBook,
    at: DateTime<Utc>,
) -> Result<Registration, AppError> {
    let violation = ThresholdViolation {
        id: Uuid::new_v4(),
        policy_id: draft.policy_id,
        cost_type: draft.cost_type,
        cost_category: draft.cost_category,
        subcategory: draft.subcategory,
        amount: draft.amount,
        threshold_limit: draft.threshold_limit,
        overage_amount: draft.overage_amount,
        reference: draft.reference,
        created_by: draft.created_by,
        status: ViolationStatus::Blocked,
        workflow_type: draft.workflow_type,
        flat_penalty: draft.flat_penalty,
        created_at: at,
        updated_at: at,
    };

    let tier = book.tier(violation.workflow_type);
    let workflow = workflow::open(violation.id, &tier, WorkflowKind::Standard, None, at)?;

    let actor = violation.created_by.to_string();
    let audit = vec![
        AuditEntry::new(
            violation.id,
            AuditEntity::Violation,
            violation.id,
            AuditAction::ViolationRegistered,
            actor.as_str(),
            at,
        )
        .transition(None, ViolationStatus::Blocked.as_str())
        .with_details(json!({
            "policy_id": violation.policy_id,
            "cost_category": violation.cost_category,
            "subcategory": violation.subcategory,
            "amount": violation.amount,
            "threshold_limit": violation.threshold_limit,
            "overage_amount": violation.overage_amount,
            "reference_type": violation.reference.reference_type(),
            "reference_id": violation.reference.reference_id(),
        })),
        workflow::opened_audit(&workflow, &actor),
    ];

    Ok(Registration {
        violation,
        workflow,
        audit,
    })
}
