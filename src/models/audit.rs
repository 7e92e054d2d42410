use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum AuditEntity {
    Violation,
    Workflow,
    Decision,
    Escalation,
    Deduction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum AuditAction {
    ViolationRegistered,
    WorkflowOpened,
    DecisionRecorded,
    /// A vote that arrived after the workflow had already resolved.
    DecisionRefused,
    WorkflowResolved,
    ViolationResolved,
    EscalationOpened,
    EscalationResolved,
    UnauthorizedPaymentReported,
    DeductionIssued,
    DeductionStatusChanged,
}

/// Actor recorded for transitions nobody clicked on.
pub const SYSTEM_SWEEPER: &str = "system:timeout-sweeper";

/// One append-only row in the audit trail. Every entry hangs off the
/// violation it belongs to so the full chain can be read in one query.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditEntry {
    pub id: Uuid,
    pub violation_id: Uuid,
    pub entity: AuditEntity,
    pub entity_id: Uuid,
    pub action: AuditAction,
    pub actor: String,
    pub from_status: Option<String>,
    pub to_status: Option<String>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        violation_id: Uuid,
        entity: AuditEntity,
        entity_id: Uuid,
        action: AuditAction,
        actor: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            violation_id,
            entity,
            entity_id,
            action,
            actor: actor.into(),
            from_status: None,
            to_status: None,
            details: serde_json::Value::Null,
            created_at: at,
        }
    }

    #[must_use]
    pub fn transition(mut self, from: Option<&str>, to: &str) -> Self {
        self.from_status = from.map(String::from);
        self.to_status = Some(to.to_string());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}
