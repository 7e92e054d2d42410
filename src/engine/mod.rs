//! Cost-governance escalation engine.
//!
//! The submodules are pure planners; `EscalationEngine` wires them to a
//! `GovernanceStore`, the policy snapshot, a clock and the post-commit
//! notifier.

pub mod clock;
pub mod deduction;
pub mod escalation;
pub mod evaluator;
pub mod ledger;
pub mod policy_store;
pub mod registry;
pub mod resolution;
pub mod workflow;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::audit::AuditEntry;
use crate::models::cost::CostRequest;
use crate::models::deduction::{DeductionStatus, SalaryDeduction};
use crate::models::escalation::{EscalationInput, EscalationRequest};
use crate::models::policy::{ApproverRole, ThresholdPolicy, TierRule, WorkflowType};
use crate::models::violation::{ThresholdViolation, ViolationStatus};
use crate::models::workflow::{
    ApprovalDecision, ApprovalWorkflow, Approver, DecisionSubmission, WorkflowStatus,
};
use crate::notification::Notifier;
use crate::store::{DecisionCommit, DeductionFilter, GovernanceStore};

use self::clock::{Clock, SystemClock};
use self::evaluator::Evaluation;
use self::policy_store::PolicyStore;
use self::resolution::ResolutionPlan;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub escalation_timeout_hours: i64,
    /// Upper bound on rows returned by list queries.
    pub list_limit: i64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            escalation_timeout_hours: 72,
            list_limit: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum EvaluationOutcome {
    Pass {
        policy_id: Uuid,
        threshold_limit: Decimal,
    },
    Blocked {
        violation_id: Uuid,
        workflow_id: Uuid,
        workflow_type: WorkflowType,
        overage_amount: Decimal,
        required_approvers: Vec<ApproverRole>,
        expires_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionOutcome {
    pub decision: ApprovalDecision,
    /// True when this was an identical resubmission of a stored decision.
    pub replayed: bool,
    pub workflow_status: WorkflowStatus,
    /// Set when this decision resolved the workflow.
    pub violation_status: Option<ViolationStatus>,
    pub deduction_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowDetail {
    pub workflow: ApprovalWorkflow,
    pub decisions: Vec<ApprovalDecision>,
    pub violation: ThresholdViolation,
    pub escalation: Option<EscalationRequest>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ViolationDetail {
    pub violation: ThresholdViolation,
    pub workflows: Vec<ApprovalWorkflow>,
    pub escalations: Vec<EscalationRequest>,
    pub deductions: Vec<SalaryDeduction>,
}

#[derive(Clone)]
pub struct EscalationEngine {
    store: Arc<dyn GovernanceStore>,
    policies: PolicyStore,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
}

impl EscalationEngine {
    pub fn new(
        store: Arc<dyn GovernanceStore>,
        policies: PolicyStore,
        notifier: Notifier,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            policies,
            notifier,
            clock: Arc::new(SystemClock),
            settings,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn store(&self) -> &Arc<dyn GovernanceStore> {
        &self.store
    }

    pub fn policies(&self) -> &PolicyStore {
        &self.policies
    }

    // -- Policy administration --

    pub async fn reload_policies(&self) -> Result<(), AppError> {
        let book = self.store.load_policy_book().await?;
        info!(policies = book.policies().len(), "policy book reloaded");
        self.policies.reload(book).await;
        Ok(())
    }

    pub async fn list_policies(&self) -> Vec<ThresholdPolicy> {
        self.policies.snapshot().await.policies().to_vec()
    }

    pub async fn list_tiers(&self) -> Vec<TierRule> {
        self.policies.snapshot().await.tiers()
    }

    /// Validate, persist and reload. Open workflows keep their snapshot.
    pub async fn upsert_policy(&self, policy: ThresholdPolicy) -> Result<ThresholdPolicy, AppError> {
        policy.validate().map_err(AppError::Validation)?;
        self.store.upsert_policy(&policy).await?;
        self.reload_policies().await?;
        info!(policy_id = %policy.id, category = %policy.category, "threshold policy upserted");
        Ok(policy)
    }

    pub async fn upsert_tier(&self, tier: TierRule) -> Result<TierRule, AppError> {
        tier.validate().map_err(AppError::Validation)?;
        self.store.upsert_tier(&tier).await?;
        self.reload_policies().await?;
        info!(workflow_type = %tier.workflow_type, timeout_hours = tier.timeout_hours, "tier rule upserted");
        Ok(tier)
    }

    pub async fn upsert_approver(&self, approver: Approver) -> Result<Approver, AppError> {
        if approver.display_name.trim().is_empty() {
            return Err(AppError::Validation("display_name must not be empty".into()));
        }
        self.store.upsert_approver(&approver).await?;
        Ok(approver)
    }

    // -- Evaluate --

    /// Entry point for originating modules before they commit a spend.
    pub async fn evaluate(&self, request: &CostRequest) -> Result<EvaluationOutcome, AppError> {
        let now = self.clock.now();
        let book = self.policies.snapshot().await;

        match evaluator::evaluate(&book, request, now)? {
            Evaluation::Pass {
                policy_id,
                threshold_limit,
            } => {
                debug!(
                    category = %request.category,
                    amount = %request.amount,
                    %threshold_limit,
                    "cost request within threshold"
                );
                Ok(EvaluationOutcome::Pass {
                    policy_id,
                    threshold_limit,
                })
            }
            Evaluation::Violation(draft) => {
                let reg = registry::plan_registration(draft, &book, now)?;
                self.store.register_violation(&reg).await?;

                info!(
                    violation_id = %reg.violation.id,
                    workflow_id = %reg.workflow.id,
                    workflow_type = %reg.workflow.workflow_type,
                    amount = %reg.violation.amount,
                    overage = %reg.violation.overage_amount,
                    "cost request blocked pending approval"
                );
                self.notifier.violation_blocked(&reg.violation, &reg.workflow);

                Ok(EvaluationOutcome::Blocked {
                    violation_id: reg.violation.id,
                    workflow_id: reg.workflow.id,
                    workflow_type: reg.workflow.workflow_type,
                    overage_amount: reg.violation.overage_amount,
                    required_approvers: reg.workflow.required_approvers,
                    expires_at: reg.workflow.expires_at,
                })
            }
        }
    }

    // -- Decide --

    pub async fn decide(&self, submission: DecisionSubmission) -> Result<DecisionOutcome, AppError> {
        let approver = self
            .store
            .get_approver(submission.approver_id)
            .await?
            .filter(|a| a.is_active)
            .ok_or(AppError::UnknownApprover(submission.approver_id))?;

        let now = self.clock.now();
        let commit = match self.store.commit_decision(&submission, approver.role, now).await {
            Err(AppError::WorkflowNotPending { workflow_id, status }) => {
                self.record_refused_decision(&submission, now).await;
                return Err(AppError::WorkflowNotPending { workflow_id, status });
            }
            other => other?,
        };
        match commit {
            DecisionCommit::Replayed(decision) => {
                let workflow = self
                    .store
                    .get_workflow(decision.workflow_id)
                    .await?
                    .ok_or_else(|| AppError::not_found("workflow", decision.workflow_id))?;
                debug!(
                    workflow_id = %workflow.id,
                    approver_id = %decision.approver_id,
                    "identical decision resubmitted"
                );
                Ok(DecisionOutcome {
                    decision,
                    replayed: true,
                    workflow_status: workflow.status,
                    violation_status: None,
                    deduction_id: None,
                })
            }
            DecisionCommit::Recorded {
                decision,
                workflow,
                resolution,
            } => {
                info!(
                    workflow_id = %workflow.id,
                    violation_id = %workflow.violation_id,
                    approver_id = %decision.approver_id,
                    role = %decision.approver_role,
                    decision = %decision.decision,
                    status = %workflow.status,
                    "approval decision recorded"
                );
                if let Some(plan) = &resolution {
                    self.announce(plan);
                }
                Ok(DecisionOutcome {
                    decision,
                    replayed: false,
                    workflow_status: workflow.status,
                    violation_status: resolution.as_ref().map(|p| p.violation_status),
                    deduction_id: resolution.as_ref().and_then(|p| p.issue.as_ref().map(|d| d.id)),
                })
            }
            DecisionCommit::Expired(plan) => {
                warn!(
                    workflow_id = %submission.workflow_id,
                    violation_id = %plan.violation_id,
                    approver_id = %submission.approver_id,
                    "decision arrived after the deadline, workflow timed out instead"
                );
                self.announce(&plan);
                self.record_refused_decision(&submission, now).await;
                Err(AppError::WorkflowNotPending {
                    workflow_id: submission.workflow_id,
                    status: WorkflowStatus::TimeoutRejected,
                })
            }
        }
    }

    /// Best effort: a failed write is logged, the caller still gets the refusal.
    async fn record_refused_decision(&self, submission: &DecisionSubmission, at: DateTime<Utc>) {
        let wf = match self.store.get_workflow(submission.workflow_id).await {
            Ok(Some(w)) => w,
            Ok(None) => return,
            Err(e) => {
                warn!(workflow_id = %submission.workflow_id, error = %e, "could not load workflow to audit refused decision");
                return;
            }
        };
        debug!(
            workflow_id = %wf.id,
            approver_id = %submission.approver_id,
            status = %wf.status,
            "late decision refused"
        );
        let entry = workflow::refused_audit(&wf, submission, at);
        if let Err(e) = self.store.append_audit(&entry).await {
            warn!(workflow_id = %wf.id, error = %e, "failed to audit refused decision");
        }
    }

    // -- Timeouts --

    pub async fn list_expired_workflows(&self, limit: i64) -> Result<Vec<Uuid>, AppError> {
        self.store.list_expired_workflows(self.clock.now(), limit).await
    }

    /// Time out one workflow. `Ok(None)` when something else resolved it first.
    pub async fn expire_workflow(&self, workflow_id: Uuid) -> Result<Option<ResolutionPlan>, AppError> {
        let plan = self.store.expire_workflow(workflow_id, self.clock.now()).await?;
        if let Some(plan) = &plan {
            info!(
                workflow_id = %workflow_id,
                violation_id = %plan.violation_id,
                status = %plan.violation_status,
                deduction_issued = plan.issue.is_some(),
                "workflow timed out"
            );
            self.notifier.resolved(plan);
        }
        Ok(plan)
    }

    // -- Queries --

    pub async fn list_pending_workflows(&self, role: Option<ApproverRole>) -> Result<Vec<ApprovalWorkflow>, AppError> {
        self.store
            .list_pending_workflows(role, self.settings.list_limit)
            .await
    }

    pub async fn workflow_detail(&self, workflow_id: Uuid) -> Result<WorkflowDetail, AppError> {
        let workflow = self
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| AppError::not_found("workflow", workflow_id))?;
        let violation = self.violation(workflow.violation_id).await?;
        let decisions = self.store.list_decisions(workflow_id).await?;
        let escalation = match workflow.escalation_id {
            Some(id) => self.store.get_escalation(id).await?,
            None => None,
        };
        Ok(WorkflowDetail {
            workflow,
            decisions,
            violation,
            escalation,
        })
    }

    pub async fn violation(&self, violation_id: Uuid) -> Result<ThresholdViolation, AppError> {
        self.store
            .get_violation(violation_id)
            .await?
            .ok_or_else(|| AppError::not_found("violation", violation_id))
    }

    pub async fn violation_detail(&self, violation_id: Uuid) -> Result<ViolationDetail, AppError> {
        let violation = self.violation(violation_id).await?;
        let workflows = self.store.workflows_for_violation(violation_id).await?;
        let escalations = self.store.escalations_for_violation(violation_id).await?;
        let deductions = self.store.deductions_for_violation(violation_id).await?;
        Ok(ViolationDetail {
            violation,
            workflows,
            escalations,
            deductions,
        })
    }

    pub async fn list_violations(&self, status: Option<ViolationStatus>) -> Result<Vec<ThresholdViolation>, AppError> {
        self.store.list_violations(status, self.settings.list_limit).await
    }

    pub async fn audit_chain(&self, violation_id: Uuid) -> Result<Vec<AuditEntry>, AppError> {
        self.violation(violation_id).await?;
        self.store.audit_chain(violation_id).await
    }

    // -- Escalation --

    pub async fn escalate(&self, input: EscalationInput) -> Result<EscalationRequest, AppError> {
        let opening = self
            .store
            .open_escalation(&input, self.settings.escalation_timeout_hours, self.clock.now())
            .await?;

        info!(
            violation_id = %input.violation_id,
            escalation_id = %opening.escalation.id,
            workflow_id = %opening.workflow.id,
            escalation_type = ?opening.escalation.escalation_type,
            previous_status = %opening.previous_violation_status,
            "escalation opened"
        );

        match self.store.get_violation(input.violation_id).await {
            Ok(Some(violation)) => self.notifier.escalation_opened(&opening, &violation),
            Ok(None) => {}
            Err(e) => warn!(violation_id = %input.violation_id, error = %e, "could not load violation for escalation notice"),
        }
        Ok(opening.escalation)
    }

    pub async fn report_unauthorized_payment(
        &self,
        violation_id: Uuid,
        reporter: &str,
    ) -> Result<ThresholdViolation, AppError> {
        let plan = self
            .store
            .report_unauthorized_payment(violation_id, reporter, self.clock.now())
            .await?;
        warn!(
            violation_id = %violation_id,
            reporter,
            previous_status = %plan.previous_violation_status,
            deduction_issued = plan.issue.is_some(),
            "unauthorized payment reported"
        );
        self.announce(&plan);
        self.violation(violation_id).await
    }

    // -- Payroll feed --

    pub async fn deductions(&self, filter: DeductionFilter) -> Result<Vec<SalaryDeduction>, AppError> {
        let filter = DeductionFilter {
            limit: Some(filter.limit.unwrap_or(self.settings.list_limit)),
            ..filter
        };
        self.store.list_deductions(&filter).await
    }

    pub async fn mark_deduction_processed(&self, id: Uuid, actor: &str) -> Result<SalaryDeduction, AppError> {
        self.move_deduction(id, DeductionStatus::Processed, None, actor).await
    }

    pub async fn cancel_deduction(&self, id: Uuid, reason: Option<String>, actor: &str) -> Result<SalaryDeduction, AppError> {
        self.move_deduction(id, DeductionStatus::Cancelled, reason, actor).await
    }

    pub async fn mark_deduction_failed(&self, id: Uuid, reason: Option<String>, actor: &str) -> Result<SalaryDeduction, AppError> {
        self.move_deduction(id, DeductionStatus::Failed, reason, actor).await
    }

    pub async fn retry_deduction(&self, id: Uuid, actor: &str) -> Result<SalaryDeduction, AppError> {
        self.move_deduction(id, DeductionStatus::Pending, None, actor).await
    }

    async fn move_deduction(
        &self,
        id: Uuid,
        to: DeductionStatus,
        note: Option<String>,
        actor: &str,
    ) -> Result<SalaryDeduction, AppError> {
        let transition = self
            .store
            .transition_deduction(id, to, note, actor, self.clock.now())
            .await?;
        info!(
            deduction_id = %id,
            violation_id = %transition.deduction.violation_id,
            status = %transition.deduction.status,
            actor,
            "deduction status changed"
        );
        Ok(transition.deduction)
    }

    fn announce(&self, plan: &ResolutionPlan) {
        info!(
            violation_id = %plan.violation_id,
            status = plan.outcome_label(),
            cancelled_deductions = plan.cancel.len(),
            deduction_issued = plan.issue.is_some(),
            "violation resolved"
        );
        self.notifier.resolved(plan);
    }
}
