use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::{DecisionCommit, DeductionFilter, GovernanceStore};
use crate::engine::deduction::{self, DeductionTransition};
use crate::engine::escalation::{self, EscalationOpening};
use crate::engine::registry::Registration;
use crate::engine::resolution::{self, ResolutionPlan, CANCELLED_ON_APPROVAL};
use crate::engine::workflow::{self, DecisionPlan, Outcome};
use crate::errors::AppError;
use crate::models::audit::{AuditEntry, SYSTEM_SWEEPER};
use crate::models::cost::CostReference;
use crate::models::deduction::{DeductionStatus, SalaryDeduction};
use crate::models::escalation::{EscalationInput, EscalationRequest, EscalationStatus, EscalationType};
use crate::models::policy::{ApproverRole, OverageBand, PolicyBook, ThresholdPolicy, TierRule, WorkflowType};
use crate::models::violation::{ThresholdViolation, ViolationStatus};
use crate::models::workflow::{
    ApprovalDecision, ApprovalWorkflow, Approver, DecisionSubmission, WorkflowKind, WorkflowStatus,
};

const VIOLATION_COLUMNS: &str = "id, policy_id, cost_type, cost_category, subcategory, amount, \
    threshold_limit, overage_amount, reference_type, reference_id, created_by, status, workflow_type, \
    flat_penalty, created_at, updated_at";

const WORKFLOW_COLUMNS: &str = "id, violation_id, escalation_id, kind, workflow_type, required_approvers, \
    timeout_hours, status, created_at, expires_at, completed_at";

const ESCALATION_COLUMNS: &str = "id, threshold_violation_id, workflow_id, amount_requested, escalation_type, \
    approval_required, justification, requested_by, status, expires_at, final_outcome, created_at, resolved_at";

const DECISION_COLUMNS: &str =
    "id, workflow_id, approver_id, approver_role, decision, comment, decision_at";

const DEDUCTION_COLUMNS: &str = "id, user_id, violation_id, amount, trigger_status, status, deduction_date, \
    note, created_at, updated_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

// -- Rows --

#[derive(sqlx::FromRow)]
struct ViolationRow {
    id: Uuid,
    policy_id: Uuid,
    cost_type: String,
    cost_category: String,
    subcategory: Option<String>,
    amount: Decimal,
    threshold_limit: Decimal,
    overage_amount: Decimal,
    reference_type: String,
    reference_id: Uuid,
    created_by: Uuid,
    status: ViolationStatus,
    workflow_type: WorkflowType,
    flat_penalty: Option<Decimal>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ViolationRow> for ThresholdViolation {
    type Error = AppError;

    fn try_from(row: ViolationRow) -> Result<Self, Self::Error> {
        let reference = CostReference::from_parts(&row.reference_type, row.reference_id).ok_or_else(|| {
            anyhow::anyhow!("violation {} has unknown reference_type '{}'", row.id, row.reference_type)
        })?;
        Ok(ThresholdViolation {
            id: row.id,
            policy_id: row.policy_id,
            cost_type: row.cost_type,
            cost_category: row.cost_category,
            subcategory: row.subcategory,
            amount: row.amount,
            threshold_limit: row.threshold_limit,
            overage_amount: row.overage_amount,
            reference,
            created_by: row.created_by,
            status: row.status,
            workflow_type: row.workflow_type,
            flat_penalty: row.flat_penalty,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WorkflowRow {
    id: Uuid,
    violation_id: Uuid,
    escalation_id: Option<Uuid>,
    kind: WorkflowKind,
    workflow_type: WorkflowType,
    required_approvers: Json<Vec<ApproverRole>>,
    timeout_hours: i64,
    status: WorkflowStatus,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<WorkflowRow> for ApprovalWorkflow {
    fn from(row: WorkflowRow) -> Self {
        ApprovalWorkflow {
            id: row.id,
            violation_id: row.violation_id,
            escalation_id: row.escalation_id,
            kind: row.kind,
            workflow_type: row.workflow_type,
            required_approvers: row.required_approvers.0,
            timeout_hours: row.timeout_hours,
            status: row.status,
            created_at: row.created_at,
            expires_at: row.expires_at,
            completed_at: row.completed_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EscalationRow {
    id: Uuid,
    threshold_violation_id: Uuid,
    workflow_id: Uuid,
    amount_requested: Decimal,
    escalation_type: EscalationType,
    approval_required: Json<Vec<ApproverRole>>,
    justification: String,
    requested_by: Uuid,
    status: EscalationStatus,
    expires_at: DateTime<Utc>,
    final_outcome: Option<String>,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl From<EscalationRow> for EscalationRequest {
    fn from(row: EscalationRow) -> Self {
        EscalationRequest {
            id: row.id,
            threshold_violation_id: row.threshold_violation_id,
            workflow_id: row.workflow_id,
            amount_requested: row.amount_requested,
            escalation_type: row.escalation_type,
            approval_required: row.approval_required.0,
            justification: row.justification,
            requested_by: row.requested_by,
            status: row.status,
            expires_at: row.expires_at,
            final_outcome: row.final_outcome,
            created_at: row.created_at,
            resolved_at: row.resolved_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PolicyRow {
    id: Uuid,
    category: String,
    subcategory: Option<String>,
    fixed_limit: Decimal,
    dual_approval_limit: Option<Decimal>,
    critical: bool,
    flat_penalty: Option<Decimal>,
    workflow_type_rules: Json<Vec<OverageBand>>,
    effective_from: DateTime<Utc>,
}

impl From<PolicyRow> for ThresholdPolicy {
    fn from(row: PolicyRow) -> Self {
        ThresholdPolicy {
            id: row.id,
            category: row.category,
            subcategory: row.subcategory,
            fixed_limit: row.fixed_limit,
            dual_approval_limit: row.dual_approval_limit,
            critical: row.critical,
            flat_penalty: row.flat_penalty,
            workflow_type_rules: row.workflow_type_rules.0,
            effective_from: row.effective_from,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TierRow {
    workflow_type: WorkflowType,
    required_approvers: Json<Vec<ApproverRole>>,
    timeout_hours: i64,
}

// -- Transaction helpers --

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|e| e.code())
        .is_some_and(|code| code == "23505")
}

async fn lock_violation(conn: &mut PgConnection, id: Uuid) -> Result<ThresholdViolation, AppError> {
    let sql = format!("SELECT {VIOLATION_COLUMNS} FROM threshold_violations WHERE id = $1 FOR UPDATE");
    let row = sqlx::query_as::<_, ViolationRow>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::not_found("violation", id))?;
    row.try_into()
}

async fn lock_workflow(conn: &mut PgConnection, id: Uuid) -> Result<ApprovalWorkflow, AppError> {
    let sql = format!("SELECT {WORKFLOW_COLUMNS} FROM approval_workflows WHERE id = $1 FOR UPDATE");
    let row = sqlx::query_as::<_, WorkflowRow>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::not_found("workflow", id))?;
    Ok(row.into())
}

async fn workflow_owner(conn: &mut PgConnection, workflow_id: Uuid) -> Result<Uuid, AppError> {
    sqlx::query_scalar::<_, Uuid>("SELECT violation_id FROM approval_workflows WHERE id = $1")
        .bind(workflow_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::not_found("workflow", workflow_id))
}

async fn load_decisions(conn: &mut PgConnection, workflow_id: Uuid) -> Result<Vec<ApprovalDecision>, AppError> {
    let sql = format!(
        "SELECT {DECISION_COLUMNS} FROM approval_decisions WHERE workflow_id = $1 ORDER BY decision_at ASC"
    );
    let rows = sqlx::query_as::<_, ApprovalDecision>(&sql)
        .bind(workflow_id)
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows)
}

async fn load_escalation(conn: &mut PgConnection, id: Option<Uuid>) -> Result<Option<EscalationRequest>, AppError> {
    let Some(id) = id else {
        return Ok(None);
    };
    let sql = format!("SELECT {ESCALATION_COLUMNS} FROM escalation_requests WHERE id = $1");
    let row = sqlx::query_as::<_, EscalationRow>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(Into::into))
}

async fn load_deductions(conn: &mut PgConnection, violation_id: Uuid) -> Result<Vec<SalaryDeduction>, AppError> {
    let sql = format!(
        "SELECT {DEDUCTION_COLUMNS} FROM salary_deductions WHERE violation_id = $1 ORDER BY created_at ASC"
    );
    let rows = sqlx::query_as::<_, SalaryDeduction>(&sql)
        .bind(violation_id)
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows)
}

async fn pending_workflow_for(conn: &mut PgConnection, violation_id: Uuid) -> Result<Option<ApprovalWorkflow>, AppError> {
    let sql = format!(
        "SELECT {WORKFLOW_COLUMNS} FROM approval_workflows \
         WHERE violation_id = $1 AND status = 'pending' FOR UPDATE"
    );
    let row = sqlx::query_as::<_, WorkflowRow>(&sql)
        .bind(violation_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(Into::into))
}

async fn insert_workflow(conn: &mut PgConnection, wf: &ApprovalWorkflow) -> Result<(), AppError> {
    sqlx::query(
        r#"INSERT INTO approval_workflows
             (id, violation_id, escalation_id, kind, workflow_type, required_approvers,
              timeout_hours, status, created_at, expires_at)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
    )
    .bind(wf.id)
    .bind(wf.violation_id)
    .bind(wf.escalation_id)
    .bind(wf.kind)
    .bind(wf.workflow_type)
    .bind(Json(&wf.required_approvers))
    .bind(wf.timeout_hours)
    .bind(wf.status)
    .bind(wf.created_at)
    .bind(wf.expires_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_audit(conn: &mut PgConnection, entries: &[AuditEntry]) -> Result<(), AppError> {
    for e in entries {
        sqlx::query(
            r#"INSERT INTO governance_audit
                 (id, violation_id, entity, entity_id, action, actor, from_status, to_status, details, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
        )
        .bind(e.id)
        .bind(e.violation_id)
        .bind(e.entity)
        .bind(e.entity_id)
        .bind(e.action)
        .bind(&e.actor)
        .bind(&e.from_status)
        .bind(&e.to_status)
        .bind(&e.details)
        .bind(e.created_at)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn insert_deduction(conn: &mut PgConnection, d: &SalaryDeduction) -> Result<(), AppError> {
    sqlx::query(
        r#"INSERT INTO salary_deductions
             (id, user_id, violation_id, amount, trigger_status, status, deduction_date, note, created_at, updated_at)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
    )
    .bind(d.id)
    .bind(d.user_id)
    .bind(d.violation_id)
    .bind(d.amount)
    .bind(d.trigger_status)
    .bind(d.status)
    .bind(d.deduction_date)
    .bind(&d.note)
    .bind(d.created_at)
    .bind(d.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn set_violation_status(
    conn: &mut PgConnection,
    id: Uuid,
    status: ViolationStatus,
    at: DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query("UPDATE threshold_violations SET status = $1, updated_at = $2 WHERE id = $3")
        .bind(status)
        .bind(at)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Persist a resolution plan. Returns `false` when the workflow it closes
/// is no longer pending; the caller must then roll back.
async fn apply_plan(conn: &mut PgConnection, plan: &ResolutionPlan) -> Result<bool, AppError> {
    if let Some(change) = &plan.workflow {
        let result = sqlx::query(
            "UPDATE approval_workflows SET status = $1, completed_at = $2 WHERE id = $3 AND status = 'pending'",
        )
        .bind(change.status)
        .bind(plan.at)
        .bind(change.workflow_id)
        .execute(&mut *conn)
        .await?;
        if result.rows_affected() != 1 {
            return Ok(false);
        }
    }

    set_violation_status(conn, plan.violation_id, plan.violation_status, plan.at).await?;

    if let Some(change) = &plan.escalation {
        sqlx::query(
            r#"UPDATE escalation_requests
               SET status = $1, final_outcome = $2, resolved_at = $3
               WHERE id = $4 AND status = 'pending_approval'"#,
        )
        .bind(change.status)
        .bind(&change.final_outcome)
        .bind(plan.at)
        .bind(change.escalation_id)
        .execute(&mut *conn)
        .await?;
    }

    if !plan.cancel.is_empty() {
        sqlx::query(
            r#"UPDATE salary_deductions
               SET status = 'cancelled', note = $1, updated_at = $2
               WHERE id = ANY($3) AND status IN ('pending', 'failed')"#,
        )
        .bind(CANCELLED_ON_APPROVAL)
        .bind(plan.at)
        .bind(&plan.cancel)
        .execute(&mut *conn)
        .await?;
    }

    if let Some(d) = &plan.issue {
        insert_deduction(conn, d).await?;
    }

    insert_audit(conn, &plan.audit).await?;
    Ok(true)
}

async fn resolution_for(
    conn: &mut PgConnection,
    wf: &ApprovalWorkflow,
    outcome: Outcome,
    violation: &ThresholdViolation,
    actor: &str,
    now: DateTime<Utc>,
) -> Result<ResolutionPlan, AppError> {
    let escalation = load_escalation(conn, wf.escalation_id).await?;
    let deductions = load_deductions(conn, violation.id).await?;
    Ok(resolution::plan_workflow_resolution(
        wf,
        outcome,
        violation,
        escalation.as_ref(),
        &deductions,
        actor,
        now,
    ))
}

#[async_trait]
impl GovernanceStore for PgStore {
    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // -- Policy administration --

    async fn load_policy_book(&self) -> Result<PolicyBook, AppError> {
        let policies = sqlx::query_as::<_, PolicyRow>(
            r#"SELECT id, category, subcategory, fixed_limit, dual_approval_limit, critical,
                      flat_penalty, workflow_type_rules, effective_from
               FROM threshold_policies
               ORDER BY category ASC, effective_from ASC"#,
        )
        .fetch_all(&self.pool)
        .await?;

        let tiers = sqlx::query_as::<_, TierRow>(
            "SELECT workflow_type, required_approvers, timeout_hours FROM workflow_tiers",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(PolicyBook::new(
            policies.into_iter().map(Into::into).collect(),
            tiers
                .into_iter()
                .map(|t| TierRule {
                    workflow_type: t.workflow_type,
                    required_approvers: t.required_approvers.0,
                    timeout_hours: t.timeout_hours,
                })
                .collect(),
        ))
    }

    async fn upsert_policy(&self, policy: &ThresholdPolicy) -> Result<(), AppError> {
        sqlx::query(
            r#"INSERT INTO threshold_policies
                 (id, category, subcategory, fixed_limit, dual_approval_limit, critical,
                  flat_penalty, workflow_type_rules, effective_from)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               ON CONFLICT (id) DO UPDATE
                 SET category = EXCLUDED.category,
                     subcategory = EXCLUDED.subcategory,
                     fixed_limit = EXCLUDED.fixed_limit,
                     dual_approval_limit = EXCLUDED.dual_approval_limit,
                     critical = EXCLUDED.critical,
                     flat_penalty = EXCLUDED.flat_penalty,
                     workflow_type_rules = EXCLUDED.workflow_type_rules,
                     effective_from = EXCLUDED.effective_from,
                     updated_at = NOW()"#,
        )
        .bind(policy.id)
        .bind(&policy.category)
        .bind(&policy.subcategory)
        .bind(policy.fixed_limit)
        .bind(policy.dual_approval_limit)
        .bind(policy.critical)
        .bind(policy.flat_penalty)
        .bind(Json(&policy.workflow_type_rules))
        .bind(policy.effective_from)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_tier(&self, tier: &TierRule) -> Result<(), AppError> {
        sqlx::query(
            r#"INSERT INTO workflow_tiers (workflow_type, required_approvers, timeout_hours)
               VALUES ($1, $2, $3)
               ON CONFLICT (workflow_type) DO UPDATE
                 SET required_approvers = EXCLUDED.required_approvers,
                     timeout_hours = EXCLUDED.timeout_hours,
                     updated_at = NOW()"#,
        )
        .bind(tier.workflow_type)
        .bind(Json(&tier.required_approvers))
        .bind(tier.timeout_hours)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_approver(&self, approver: &Approver) -> Result<(), AppError> {
        sqlx::query(
            r#"INSERT INTO approvers (user_id, role, display_name, is_active)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (user_id) DO UPDATE
                 SET role = EXCLUDED.role,
                     display_name = EXCLUDED.display_name,
                     is_active = EXCLUDED.is_active,
                     updated_at = NOW()"#,
        )
        .bind(approver.user_id)
        .bind(approver.role)
        .bind(&approver.display_name)
        .bind(approver.is_active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_approver(&self, user_id: Uuid) -> Result<Option<Approver>, AppError> {
        let row = sqlx::query_as::<_, Approver>(
            "SELECT user_id, role, display_name, is_active FROM approvers WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    // -- Violations & workflows --

    async fn register_violation(&self, registration: &Registration) -> Result<(), AppError> {
        let v = &registration.violation;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"INSERT INTO threshold_violations
                 (id, policy_id, cost_type, cost_category, subcategory, amount, threshold_limit,
                  overage_amount, reference_type, reference_id, created_by, status, workflow_type,
                  flat_penalty, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"#,
        )
        .bind(v.id)
        .bind(v.policy_id)
        .bind(&v.cost_type)
        .bind(&v.cost_category)
        .bind(&v.subcategory)
        .bind(v.amount)
        .bind(v.threshold_limit)
        .bind(v.overage_amount)
        .bind(v.reference.reference_type())
        .bind(v.reference.reference_id())
        .bind(v.created_by)
        .bind(v.status)
        .bind(v.workflow_type)
        .bind(v.flat_penalty)
        .bind(v.created_at)
        .bind(v.updated_at)
        .execute(&mut *tx)
        .await?;

        insert_workflow(&mut tx, &registration.workflow).await?;
        insert_audit(&mut tx, &registration.audit).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_violation(&self, id: Uuid) -> Result<Option<ThresholdViolation>, AppError> {
        let sql = format!("SELECT {VIOLATION_COLUMNS} FROM threshold_violations WHERE id = $1");
        let row = sqlx::query_as::<_, ViolationRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_violations(
        &self,
        status: Option<ViolationStatus>,
        limit: i64,
    ) -> Result<Vec<ThresholdViolation>, AppError> {
        let sql = format!(
            "SELECT {VIOLATION_COLUMNS} FROM threshold_violations \
             WHERE ($1::varchar IS NULL OR status = $1) \
             ORDER BY created_at DESC LIMIT $2"
        );
        let rows = sqlx::query_as::<_, ViolationRow>(&sql)
            .bind(status.map(|s| s.as_str()))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<ApprovalWorkflow>, AppError> {
        let sql = format!("SELECT {WORKFLOW_COLUMNS} FROM approval_workflows WHERE id = $1");
        let row = sqlx::query_as::<_, WorkflowRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn workflows_for_violation(&self, violation_id: Uuid) -> Result<Vec<ApprovalWorkflow>, AppError> {
        let sql = format!(
            "SELECT {WORKFLOW_COLUMNS} FROM approval_workflows WHERE violation_id = $1 ORDER BY created_at ASC"
        );
        let rows = sqlx::query_as::<_, WorkflowRow>(&sql)
            .bind(violation_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_decisions(&self, workflow_id: Uuid) -> Result<Vec<ApprovalDecision>, AppError> {
        let mut conn = self.pool.acquire().await?;
        load_decisions(&mut conn, workflow_id).await
    }

    async fn list_pending_workflows(
        &self,
        role: Option<ApproverRole>,
        limit: i64,
    ) -> Result<Vec<ApprovalWorkflow>, AppError> {
        let sql = format!(
            "SELECT {WORKFLOW_COLUMNS} FROM approval_workflows \
             WHERE status = 'pending' AND ($1::text IS NULL OR required_approvers ? $1) \
             ORDER BY expires_at ASC LIMIT $2"
        );
        let rows = sqlx::query_as::<_, WorkflowRow>(&sql)
            .bind(role.map(|r| r.as_str()))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_escalation(&self, id: Uuid) -> Result<Option<EscalationRequest>, AppError> {
        let mut conn = self.pool.acquire().await?;
        load_escalation(&mut conn, Some(id)).await
    }

    async fn escalations_for_violation(&self, violation_id: Uuid) -> Result<Vec<EscalationRequest>, AppError> {
        let sql = format!(
            "SELECT {ESCALATION_COLUMNS} FROM escalation_requests \
             WHERE threshold_violation_id = $1 ORDER BY created_at ASC"
        );
        let rows = sqlx::query_as::<_, EscalationRow>(&sql)
            .bind(violation_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn deductions_for_violation(&self, violation_id: Uuid) -> Result<Vec<SalaryDeduction>, AppError> {
        let mut conn = self.pool.acquire().await?;
        load_deductions(&mut conn, violation_id).await
    }

    // -- Transitions --

    async fn commit_decision(
        &self,
        submission: &DecisionSubmission,
        role: ApproverRole,
        now: DateTime<Utc>,
    ) -> Result<DecisionCommit, AppError> {
        let mut tx = self.pool.begin().await?;

        // Violation before workflow, as everywhere else.
        let violation_id = workflow_owner(&mut tx, submission.workflow_id).await?;
        let violation = lock_violation(&mut tx, violation_id).await?;
        let wf = lock_workflow(&mut tx, submission.workflow_id).await?;
        let existing = load_decisions(&mut tx, wf.id).await?;

        match workflow::plan_decision(&wf, &existing, submission, role, now)? {
            DecisionPlan::Replay(prior) => Ok(DecisionCommit::Replayed(prior)),
            DecisionPlan::Expire => {
                let plan = resolution_for(&mut tx, &wf, Outcome::TimedOut, &violation, SYSTEM_SWEEPER, now).await?;
                if !apply_plan(&mut tx, &plan).await? {
                    return Err(anyhow::anyhow!("workflow {} changed under its row lock", wf.id).into());
                }
                tx.commit().await?;
                Ok(DecisionCommit::Expired(plan))
            }
            DecisionPlan::Record { decision, outcome } => {
                let inserted = sqlx::query(
                    r#"INSERT INTO approval_decisions
                         (id, workflow_id, approver_id, approver_role, decision, comment, decision_at)
                       VALUES ($1, $2, $3, $4, $5, $6, $7)
                       ON CONFLICT (workflow_id, approver_id) DO NOTHING"#,
                )
                .bind(decision.id)
                .bind(decision.workflow_id)
                .bind(decision.approver_id)
                .bind(decision.approver_role)
                .bind(decision.decision)
                .bind(&decision.comment)
                .bind(decision.decision_at)
                .execute(&mut *tx)
                .await?;

                if inserted.rows_affected() == 0 {
                    let sql = format!(
                        "SELECT {DECISION_COLUMNS} FROM approval_decisions WHERE workflow_id = $1 AND approver_id = $2"
                    );
                    let prior = sqlx::query_as::<_, ApprovalDecision>(&sql)
                        .bind(wf.id)
                        .bind(submission.approver_id)
                        .fetch_one(&mut *tx)
                        .await?;
                    return Err(AppError::DuplicateDecision {
                        workflow_id: wf.id,
                        approver_id: submission.approver_id,
                        existing: Box::new(prior),
                    });
                }

                insert_audit(&mut tx, &[workflow::decision_audit(violation.id, &decision)]).await?;

                let resolution = match outcome {
                    Some(outcome) => {
                        let actor = decision.approver_id.to_string();
                        let plan = resolution_for(&mut tx, &wf, outcome, &violation, &actor, now).await?;
                        if !apply_plan(&mut tx, &plan).await? {
                            return Err(anyhow::anyhow!("workflow {} changed under its row lock", wf.id).into());
                        }
                        Some(plan)
                    }
                    None => None,
                };

                let workflow = lock_workflow(&mut tx, wf.id).await?;
                tx.commit().await?;

                Ok(DecisionCommit::Recorded {
                    decision,
                    workflow,
                    resolution,
                })
            }
        }
    }

    async fn list_expired_workflows(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>, AppError> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"SELECT id FROM approval_workflows
               WHERE status = 'pending' AND expires_at < $1
               ORDER BY expires_at ASC
               LIMIT $2"#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn expire_workflow(&self, workflow_id: Uuid, now: DateTime<Utc>) -> Result<Option<ResolutionPlan>, AppError> {
        let mut tx = self.pool.begin().await?;

        let violation_id = workflow_owner(&mut tx, workflow_id).await?;
        let violation = lock_violation(&mut tx, violation_id).await?;
        let wf = lock_workflow(&mut tx, workflow_id).await?;

        // Re-check under the lock: a decision or another sweeper may have won.
        if !workflow::due_for_timeout(&wf, now) {
            return Ok(None);
        }

        let plan = resolution_for(&mut tx, &wf, Outcome::TimedOut, &violation, SYSTEM_SWEEPER, now).await?;
        if !apply_plan(&mut tx, &plan).await? {
            return Ok(None);
        }

        match tx.commit().await {
            Ok(()) => Ok(Some(plan)),
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn open_escalation(
        &self,
        input: &EscalationInput,
        timeout_hours: i64,
        now: DateTime<Utc>,
    ) -> Result<EscalationOpening, AppError> {
        let mut tx = self.pool.begin().await?;

        let violation = lock_violation(&mut tx, input.violation_id).await?;
        let latest = match pending_workflow_for(&mut tx, violation.id).await? {
            Some(pending) => Some(pending),
            None => {
                let sql = format!(
                    "SELECT {WORKFLOW_COLUMNS} FROM approval_workflows \
                     WHERE violation_id = $1 ORDER BY created_at DESC LIMIT 1"
                );
                sqlx::query_as::<_, WorkflowRow>(&sql)
                    .bind(violation.id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .map(Into::into)
            }
        };

        let opening = escalation::plan_escalation(&violation, latest.as_ref(), input, timeout_hours, now)?;
        let esc = &opening.escalation;

        sqlx::query(
            r#"INSERT INTO escalation_requests
                 (id, threshold_violation_id, workflow_id, amount_requested, escalation_type,
                  approval_required, justification, requested_by, status, expires_at, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
        )
        .bind(esc.id)
        .bind(esc.threshold_violation_id)
        .bind(esc.workflow_id)
        .bind(esc.amount_requested)
        .bind(esc.escalation_type)
        .bind(Json(&esc.approval_required))
        .bind(&esc.justification)
        .bind(esc.requested_by)
        .bind(esc.status)
        .bind(esc.expires_at)
        .bind(esc.created_at)
        .execute(&mut *tx)
        .await?;

        insert_workflow(&mut tx, &opening.workflow).await?;
        set_violation_status(&mut tx, violation.id, ViolationStatus::Blocked, now).await?;
        insert_audit(&mut tx, &opening.audit).await?;

        tx.commit().await?;
        Ok(opening)
    }

    async fn report_unauthorized_payment(
        &self,
        violation_id: Uuid,
        reporter: &str,
        now: DateTime<Utc>,
    ) -> Result<ResolutionPlan, AppError> {
        let mut tx = self.pool.begin().await?;

        let violation = lock_violation(&mut tx, violation_id).await?;
        let pending = pending_workflow_for(&mut tx, violation_id).await?;
        let escalation = match &pending {
            Some(wf) => load_escalation(&mut tx, wf.escalation_id).await?,
            None => None,
        };
        let deductions = load_deductions(&mut tx, violation_id).await?;

        let plan = resolution::plan_unauthorized_payment(
            &violation,
            pending.as_ref(),
            escalation.as_ref(),
            &deductions,
            reporter,
            now,
        )?;
        if !apply_plan(&mut tx, &plan).await? {
            return Err(anyhow::anyhow!("pending workflow for violation {violation_id} changed under its row lock").into());
        }

        tx.commit().await?;
        Ok(plan)
    }

    // -- Payroll feed --

    async fn list_deductions(&self, filter: &DeductionFilter) -> Result<Vec<SalaryDeduction>, AppError> {
        let sql = format!(
            "SELECT {DEDUCTION_COLUMNS} FROM salary_deductions \
             WHERE ($1::varchar IS NULL OR status = $1) AND ($2::uuid IS NULL OR user_id = $2) \
             ORDER BY created_at ASC LIMIT $3"
        );
        let rows = sqlx::query_as::<_, SalaryDeduction>(&sql)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.user_id)
            .bind(filter.limit.unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
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
        let mut tx = self.pool.begin().await?;

        let violation_id = sqlx::query_scalar::<_, Uuid>("SELECT violation_id FROM salary_deductions WHERE id = $1")
            .bind(deduction_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::not_found("deduction", deduction_id))?;
        let violation = lock_violation(&mut tx, violation_id).await?;

        let sql = format!("SELECT {DEDUCTION_COLUMNS} FROM salary_deductions WHERE id = $1 FOR UPDATE");
        let current = sqlx::query_as::<_, SalaryDeduction>(&sql)
            .bind(deduction_id)
            .fetch_one(&mut *tx)
            .await?;

        let transition = deduction::plan_transition(&current, &violation, to, note, actor, now)?;
        let updated = &transition.deduction;

        let result = sqlx::query(
            "UPDATE salary_deductions SET status = $1, note = $2, updated_at = $3 WHERE id = $4 AND status = $5",
        )
        .bind(updated.status)
        .bind(&updated.note)
        .bind(updated.updated_at)
        .bind(updated.id)
        .bind(current.status)
        .execute(&mut *tx)
        .await;

        match result {
            Ok(r) if r.rows_affected() == 1 => {}
            Ok(_) => {
                return Err(anyhow::anyhow!("deduction {deduction_id} changed under its row lock").into());
            }
            // Re-activating a failed deduction after another one was issued.
            Err(e) if is_unique_violation(&e) => {
                return Err(AppError::InvalidDeductionTransition {
                    deduction_id,
                    from: current.status,
                    to,
                });
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(status) = transition.violation_status {
            set_violation_status(&mut tx, violation.id, status, now).await?;
        }
        insert_audit(&mut tx, &transition.audit).await?;

        tx.commit().await?;
        Ok(transition)
    }

    // -- Audit --

    async fn audit_chain(&self, violation_id: Uuid) -> Result<Vec<AuditEntry>, AppError> {
        let rows = sqlx::query_as::<_, AuditEntry>(
            r#"SELECT id, violation_id, entity, entity_id, action, actor, from_status, to_status, details, created_at
               FROM governance_audit
               WHERE violation_id = $1
               ORDER BY seq ASC"#,
        )
        .bind(violation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), AppError> {
        let mut conn = self.pool.acquire().await?;
        insert_audit(&mut conn, std::slice::from_ref(entry)).await
    }
}
