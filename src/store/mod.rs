pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::engine::deduction::DeductionTransition;
use crate::engine::escalation::EscalationOpening;
use crate::engine::registry::Registration;
use crate::engine::resolution::ResolutionPlan;
use crate::errors::AppError;
use crate::models::audit::AuditEntry;
use crate::models::deduction::{DeductionStatus, SalaryDeduction};
use crate::models::escalation::{EscalationInput, EscalationRequest};
use crate::models::policy::{ApproverRole, PolicyBook, ThresholdPolicy, TierRule};
use crate::models::violation::{ThresholdViolation, ViolationStatus};
use crate::models::workflow::{ApprovalDecision, ApprovalWorkflow, Approver, DecisionSubmission};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// What a committed decision did.
#[derive(Debug, Clone)]
pub enum DecisionCommit {
    /// Identical resubmission; nothing was written.
    Replayed(ApprovalDecision),
    /// The vote was stored. `resolution` is set when it closed the workflow.
    Recorded {
        decision: ApprovalDecision,
        workflow: ApprovalWorkflow,
        resolution: Option<ResolutionPlan>,
    },
    /// The deadline had passed; the timeout was applied instead of the vote.
    Expired(ResolutionPlan),
}

/// Filters for the payroll feed.
#[derive(Debug, Clone, Default)]
pub struct DeductionFilter {
    pub status: Option<DeductionStatus>,
    pub user_id: Option<Uuid>,
    pub limit: Option<i64>,
}

/// Durable state of the governance engine.
///
/// Every mutating method is atomic: it either applies all of its writes
/// (including audit rows) or none. Transition rules live in `crate::engine`;
/// implementations lock, load, call the planner and persist its plan.
#[async_trait]
pub trait GovernanceStore: Send + Sync {
    /// Connectivity check behind `/readyz`.
    async fn health_check(&self) -> Result<(), AppError>;

    // -- Policy administration --

    async fn load_policy_book(&self) -> Result<PolicyBook, AppError>;
    async fn upsert_policy(&self, policy: &ThresholdPolicy) -> Result<(), AppError>;
    async fn upsert_tier(&self, tier: &TierRule) -> Result<(), AppError>;
    async fn upsert_approver(&self, approver: &Approver) -> Result<(), AppError>;
    async fn get_approver(&self, user_id: Uuid) -> Result<Option<Approver>, AppError>;

    // -- Violations & workflows --

    async fn register_violation(&self, registration: &Registration) -> Result<(), AppError>;
    async fn get_violation(&self, id: Uuid) -> Result<Option<ThresholdViolation>, AppError>;
    async fn list_violations(
        &self,
        status: Option<ViolationStatus>,
        limit: i64,
    ) -> Result<Vec<ThresholdViolation>, AppError>;
    async fn get_workflow(&self, id: Uuid) -> Result<Option<ApprovalWorkflow>, AppError>;
    /// Oldest first.
    async fn workflows_for_violation(&self, violation_id: Uuid) -> Result<Vec<ApprovalWorkflow>, AppError>;
    async fn list_decisions(&self, workflow_id: Uuid) -> Result<Vec<ApprovalDecision>, AppError>;
    /// Pending workflows, oldest deadline first, optionally only those needing `role`.
    async fn list_pending_workflows(
        &self,
        role: Option<ApproverRole>,
        limit: i64,
    ) -> Result<Vec<ApprovalWorkflow>, AppError>;
    async fn get_escalation(&self, id: Uuid) -> Result<Option<EscalationRequest>, AppError>;
    async fn escalations_for_violation(&self, violation_id: Uuid) -> Result<Vec<EscalationRequest>, AppError>;
    async fn deductions_for_violation(&self, violation_id: Uuid) -> Result<Vec<SalaryDeduction>, AppError>;

    // -- Transitions --

    /// Record an approver's vote. `role` comes from the approver directory.
    async fn commit_decision(
        &self,
        submission: &DecisionSubmission,
        role: ApproverRole,
        now: DateTime<Utc>,
    ) -> Result<DecisionCommit, AppError>;

    /// Ids of pending workflows whose deadline passed before `now`.
    async fn list_expired_workflows(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>, AppError>;

    /// Time out one workflow. `Ok(None)` when it is no longer pending or not
    /// yet due, i.e. another sweeper or a decision got there first.
    async fn expire_workflow(&self, workflow_id: Uuid, now: DateTime<Utc>) -> Result<Option<ResolutionPlan>, AppError>;

    async fn open_escalation(
        &self,
        input: &EscalationInput,
        timeout_hours: i64,
        now: DateTime<Utc>,
    ) -> Result<EscalationOpening, AppError>;

    async fn report_unauthorized_payment(
        &self,
        violation_id: Uuid,
        reporter: &str,
        now: DateTime<Utc>,
    ) -> Result<ResolutionPlan, AppError>;

    // -- Payroll feed --

    async fn list_deductions(&self, filter: &DeductionFilter) -> Result<Vec<SalaryDeduction>, AppError>;
    async fn transition_deduction(
        &self,
        deduction_id: Uuid,
        to: DeductionStatus,
        note: Option<String>,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<DeductionTransition, AppError>;

    // -- Audit --

    /// Every audit entry for the violation in insertion order.
    async fn audit_chain(&self, violation_id: Uuid) -> Result<Vec<AuditEntry>, AppError>;

    /// Standalone trail entry for events that change no state.
    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), AppError>;
}
