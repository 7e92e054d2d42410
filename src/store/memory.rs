//! In-process store for local runs and tests.
//!
//! One mutex guards the whole state, so every method is trivially atomic and
//! serialised. Behaviour must match `PgStore` row for row.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{DecisionCommit, DeductionFilter, GovernanceStore};
use crate::engine::deduction::{self, DeductionTransition};
use crate::engine::escalation::{self, EscalationOpening};
use crate::engine::registry::Registration;
use crate::engine::resolution::{self, ResolutionPlan, CANCELLED_ON_APPROVAL};
use crate::engine::workflow::{self, DecisionPlan, Outcome};
use crate::errors::AppError;
use crate::models::audit::{AuditEntry, SYSTEM_SWEEPER};
use crate::models::deduction::{DeductionStatus, SalaryDeduction};
use crate::models::escalation::{EscalationInput, EscalationRequest, EscalationStatus};
use crate::models::policy::{ApproverRole, PolicyBook, ThresholdPolicy, TierRule, WorkflowType};
use crate::models::violation::{ThresholdViolation, ViolationStatus};
use crate::models::workflow::{ApprovalDecision, ApprovalWorkflow, Approver, DecisionSubmission, WorkflowStatus};

#[derive(Default)]
struct State {
    policies: Vec<ThresholdPolicy>,
    tiers: HashMap<WorkflowType, TierRule>,
    approvers: HashMap<Uuid, Approver>,
    violations: HashMap<Uuid, ThresholdViolation>,
    workflows: Vec<ApprovalWorkflow>,
    decisions: Vec<ApprovalDecision>,
    escalations: Vec<EscalationRequest>,
    deductions: Vec<SalaryDeduction>,
    audit: Vec<AuditEntry>,
}

impl State {
    fn violation(&self, id: Uuid) -> Result<ThresholdViolation, AppError> {
        self.violations
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::not_found("violation", id))
    }

    fn workflow(&self, id: Uuid) -> Result<ApprovalWorkflow, AppError> {
        self.workflows
            .iter()
            .find(|w| w.id == id)
            .cloned()
            .ok_or_else(|| AppError::not_found("workflow", id))
    }

    fn decisions_for(&self, workflow_id: Uuid) -> Vec<ApprovalDecision> {
        self.decisions
            .iter()
            .filter(|d| d.workflow_id == workflow_id)
            .cloned()
            .collect()
    }

    fn deductions_for(&self, violation_id: Uuid) -> Vec<SalaryDeduction> {
        self.deductions
            .iter()
            .filter(|d| d.violation_id == violation_id)
            .cloned()
            .collect()
    }

    fn escalation(&self, id: Option<Uuid>) -> Option<EscalationRequest> {
        let id = id?;
        self.escalations.iter().find(|e| e.id == id).cloned()
    }

    fn pending_workflow_for(&self, violation_id: Uuid) -> Option<ApprovalWorkflow> {
        self.workflows
            .iter()
            .find(|w| w.violation_id == violation_id && w.status == WorkflowStatus::Pending)
            .cloned()
    }

    fn resolution_for(
        &self,
        wf: &ApprovalWorkflow,
        outcome: Outcome,
        violation: &ThresholdViolation,
        actor: &str,
        now: DateTime<Utc>,
    ) -> ResolutionPlan {
        resolution::plan_workflow_resolution(
            wf,
            outcome,
            violation,
            self.escalation(wf.escalation_id).as_ref(),
            &self.deductions_for(violation.id),
            actor,
            now,
        )
    }

    /// Apply a resolution plan. Returns false, writing nothing, when the
    /// workflow it closes is no longer pending.
    fn apply(&mut self, plan: &ResolutionPlan) -> bool {
        if let Some(change) = &plan.workflow {
            match self.workflows.iter_mut().find(|w| w.id == change.workflow_id) {
                Some(wf) if wf.status == WorkflowStatus::Pending => {
                    wf.status = change.status;
                    wf.completed_at = Some(plan.at);
                }
                _ => return false,
            }
        }

        if let Some(v) = self.violations.get_mut(&plan.violation_id) {
            v.status = plan.violation_status;
            v.updated_at = plan.at;
        }

        if let Some(change) = &plan.escalation {
            if let Some(esc) = self
                .escalations
                .iter_mut()
                .find(|e| e.id == change.escalation_id && e.status == EscalationStatus::PendingApproval)
            {
                esc.status = change.status;
                esc.final_outcome = Some(change.final_outcome.clone());
                esc.resolved_at = Some(plan.at);
            }
        }

        for id in &plan.cancel {
            if let Some(d) = self.deductions.iter_mut().find(|d| {
                d.id == *id && matches!(d.status, DeductionStatus::Pending | DeductionStatus::Failed)
            }) {
                d.status = DeductionStatus::Cancelled;
                d.note = Some(CANCELLED_ON_APPROVAL.to_string());
                d.updated_at = plan.at;
            }
        }

        if let Some(d) = &plan.issue {
            self.deductions.push(d.clone());
        }

        self.audit.extend(plan.audit.iter().cloned());
        true
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GovernanceStore for MemoryStore {
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn load_policy_book(&self) -> Result<PolicyBook, AppError> {
        let state = self.state.lock().await;
        Ok(PolicyBook::new(
            state.policies.clone(),
            state.tiers.values().cloned().collect(),
        ))
    }

    async fn upsert_policy(&self, policy: &ThresholdPolicy) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        match state.policies.iter_mut().find(|p| p.id == policy.id) {
            Some(existing) => *existing = policy.clone(),
            None => state.policies.push(policy.clone()),
        }
        Ok(())
    }

    async fn upsert_tier(&self, tier: &TierRule) -> Result<(), AppError> {
        self.state
            .lock()
            .await
            .tiers
            .insert(tier.workflow_type, tier.clone());
        Ok(())
    }

    async fn upsert_approver(&self, approver: &Approver) -> Result<(), AppError> {
        self.state
            .lock()
            .await
            .approvers
            .insert(approver.user_id, approver.clone());
        Ok(())
    }

    async fn get_approver(&self, user_id: Uuid) -> Result<Option<Approver>, AppError> {
        Ok(self.state.lock().await.approvers.get(&user_id).cloned())
    }

    async fn register_violation(&self, registration: &Registration) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        state
            .violations
            .insert(registration.violation.id, registration.violation.clone());
        state.workflows.push(registration.workflow.clone());
        state.audit.extend(registration.audit.iter().cloned());
        Ok(())
    }

    async fn get_violation(&self, id: Uuid) -> Result<Option<ThresholdViolation>, AppError> {
        Ok(self.state.lock().await.violations.get(&id).cloned())
    }

    async fn list_violations(
        &self,
        status: Option<ViolationStatus>,
        limit: i64,
    ) -> Result<Vec<ThresholdViolation>, AppError> {
        let state = self.state.lock().await;
        let mut rows: Vec<ThresholdViolation> = state
            .violations
            .values()
            .filter(|v| status.map_or(true, |s| v.status == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<ApprovalWorkflow>, AppError> {
        Ok(self
            .state
            .lock()
            .await
            .workflows
            .iter()
            .find(|w| w.id == id)
            .cloned())
    }

    async fn workflows_for_violation(&self, violation_id: Uuid) -> Result<Vec<ApprovalWorkflow>, AppError> {
        Ok(self
            .state
            .lock()
            .await
            .workflows
            .iter()
            .filter(|w| w.violation_id == violation_id)
            .cloned()
            .collect())
    }

    async fn list_decisions(&self, workflow_id: Uuid) -> Result<Vec<ApprovalDecision>, AppError> {
        Ok(self.state.lock().await.decisions_for(workflow_id))
    }

    async fn list_pending_workflows(
        &self,
        role: Option<ApproverRole>,
        limit: i64,
    ) -> Result<Vec<ApprovalWorkflow>, AppError> {
        let state = self.state.lock().await;
        let mut rows: Vec<ApprovalWorkflow> = state
            .workflows
            .iter()
            .filter(|w| w.status == WorkflowStatus::Pending)
            .filter(|w| role.map_or(true, |r| w.requires(r)))
            .cloned()
            .collect();
        rows.sort_by_key(|w| w.expires_at);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn get_escalation(&self, id: Uuid) -> Result<Option<EscalationRequest>, AppError> {
        Ok(self.state.lock().await.escalation(Some(id)))
    }

    async fn escalations_for_violation(&self, violation_id: Uuid) -> Result<Vec<EscalationRequest>, AppError> {
        Ok(self
            .state
            .lock()
            .await
            .escalations
            .iter()
            .filter(|e| e.threshold_violation_id == violation_id)
            .cloned()
            .collect())
    }

    async fn deductions_for_violation(&self, violation_id: Uuid) -> Result<Vec<SalaryDeduction>, AppError> {
        let mut rows: Vec<SalaryDeduction> = self
            .state
            .lock()
            .await
            .deductions
            .iter()
            .filter(|d| d.violation_id == violation_id)
            .cloned()
            .collect();
        rows.sort_by_key(|d| d.created_at);
        Ok(rows)
    }

    async fn commit_decision(
        &self,
        submission: &DecisionSubmission,
        role: ApproverRole,
        now: DateTime<Utc>,
    ) -> Result<DecisionCommit, AppError> {
        let mut state = self.state.lock().await;
        let wf = state.workflow(submission.workflow_id)?;
        let violation = state.violation(wf.violation_id)?;
        let existing = state.decisions_for(wf.id);

        match workflow::plan_decision(&wf, &existing, submission, role, now)? {
            DecisionPlan::Replay(prior) => Ok(DecisionCommit::Replayed(prior)),
            DecisionPlan::Expire => {
                let plan = state.resolution_for(&wf, Outcome::TimedOut, &violation, SYSTEM_SWEEPER, now);
                state.apply(&plan);
                Ok(DecisionCommit::Expired(plan))
            }
            DecisionPlan::Record { decision, outcome } => {
                state.decisions.push(decision.clone());
                state.audit.push(workflow::decision_audit(violation.id, &decision));

                let resolution = outcome.map(|outcome| {
                    let actor = decision.approver_id.to_string();
                    let plan = state.resolution_for(&wf, outcome, &violation, &actor, now);
                    state.apply(&plan);
                    plan
                });

                Ok(DecisionCommit::Recorded {
                    decision,
                    workflow: state.workflow(wf.id)?,
                    resolution,
                })
            }
        }
    }

    async fn list_expired_workflows(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>, AppError> {
        let state = self.state.lock().await;
        let mut due: Vec<&ApprovalWorkflow> = state
            .workflows
            .iter()
            .filter(|w| workflow::due_for_timeout(w, now))
            .collect();
        due.sort_by_key(|w| w.expires_at);
        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|w| w.id)
            .collect())
    }

    async fn expire_workflow(&self, workflow_id: Uuid, now: DateTime<Utc>) -> Result<Option<ResolutionPlan>, AppError> {
        let mut state = self.state.lock().await;
        let wf = state.workflow(workflow_id)?;
        if !workflow::due_for_timeout(&wf, now) {
            return Ok(None);
        }
        let violation = state.violation(wf.violation_id)?;
        let plan = state.resolution_for(&wf, Outcome::TimedOut, &violation, SYSTEM_SWEEPER, now);
        Ok(state.apply(&plan).then_some(plan))
    }

    async fn open_escalation(
        &self,
        input: &EscalationInput,
        timeout_hours: i64,
        now: DateTime<Utc>,
    ) -> Result<EscalationOpening, AppError> {
        let mut state = self.state.lock().await;
        let violation = state.violation(input.violation_id)?;
        let latest = state.pending_workflow_for(violation.id).or_else(|| {
            state
                .workflows
                .iter()
                .filter(|w| w.violation_id == violation.id)
                .last()
                .cloned()
        });

        let opening = escalation::plan_escalation(&violation, latest.as_ref(), input, timeout_hours, now)?;

        state.escalations.push(opening.escalation.clone());
        state.workflows.push(opening.workflow.clone());
        if let Some(v) = state.violations.get_mut(&violation.id) {
            v.status = ViolationStatus::Blocked;
            v.updated_at = now;
        }
        state.audit.extend(opening.audit.iter().cloned());
        Ok(opening)
    }

    async fn report_unauthorized_payment(
        &self,
        violation_id: Uuid,
        reporter: &str,
        now: DateTime<Utc>,
    ) -> Result<ResolutionPlan, AppError> {
        let mut state = self.state.lock().await;
        let violation = state.violation(violation_id)?;
        let pending = state.pending_workflow_for(violation_id);
        let escalation = pending.as_ref().and_then(|w| state.escalation(w.escalation_id));

        let plan = resolution::plan_unauthorized_payment(
            &violation,
            pending.as_ref(),
            escalation.as_ref(),
            &state.deductions_for(violation_id),
            reporter,
            now,
        )?;
        state.apply(&plan);
        Ok(plan)
    }

    async fn list_deductions(&self, filter: &DeductionFilter) -> Result<Vec<SalaryDeduction>, AppError> {
        let state = self.state.lock().await;
        let mut rows: Vec<SalaryDeduction> = state
            .deductions
            .iter()
            .filter(|d| filter.status.map_or(true, |s| d.status == s))
            .filter(|d| filter.user_id.map_or(true, |u| d.user_id == u))
            .cloned()
            .collect();
        rows.sort_by_key(|d| d.created_at);
        if let Some(limit) = filter.limit {
            rows.truncate(limit.max(0) as usize);
        }
        Ok(rows)
    }

    async fn transition_deduction(
        &self,
        deduction_id: Uuid,
        to: DeductionStatus,
        note: Option<String>,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<DeductionTransition, AppError> {
        let mut state = self.state.lock().await;
        let current = state
            .deductions
            .iter()
            .find(|d| d.id == deduction_id)
            .cloned()
            .ok_or_else(|| AppError::not_found("deduction", deduction_id))?;
        let violation = state.violation(current.violation_id)?;

        let transition = deduction::plan_transition(&current, &violation, to, note, actor, now)?;

        if let Some(slot) = state.deductions.iter_mut().find(|d| d.id == deduction_id) {
            *slot = transition.deduction.clone();
        }
        if let (Some(status), Some(v)) = (
            transition.violation_status,
            state.violations.get_mut(&violation.id),
        ) {
            v.status = status;
            v.updated_at = now;
        }
        state.audit.extend(transition.audit.iter().cloned());
        Ok(transition)
    }

    async fn audit_chain(&self, violation_id: Uuid) -> Result<Vec<AuditEntry>, AppError> {
        Ok(self
            .state
            .lock()
            .await
            .audit
            .iter()
            .filter(|e| e.violation_id == violation_id)
            .cloned()
            .collect())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), AppError> {
        self.state.lock().await.audit.push(entry.clone());
        Ok(())
    }
}
