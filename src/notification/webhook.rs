use anyhow::Result;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::escalation::EscalationOpening;
use crate::engine::resolution::ResolutionPlan;
use crate::models::deduction::SalaryDeduction;
use crate::models::violation::ThresholdViolation;
use crate::models::workflow::ApprovalWorkflow;

// ── Governance Events ─────────────────────────────────────────

/// A structured event payload sent to webhook endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct GovernanceEvent {
    /// "violation_blocked", "workflow_resolved", "escalation_opened" or "deduction_issued".
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub violation_id: Uuid,
    /// Event-specific details (amounts, statuses, deadlines).
    pub details: serde_json::Value,
}

impl GovernanceEvent {
    pub fn violation_blocked(violation: &ThresholdViolation, workflow: &ApprovalWorkflow) -> Self {
        Self {
            event_type: "violation_blocked".to_string(),
            timestamp: violation.created_at,
            violation_id: violation.id,
            details: serde_json::json!({
                "requested_by": violation.created_by,
                "cost_category": violation.cost_category,
                "amount": violation.amount,
                "threshold_limit": violation.threshold_limit,
                "overage_amount": violation.overage_amount,
                "reference_type": violation.reference.reference_type(),
                "reference_id": violation.reference.reference_id(),
                "workflow_id": workflow.id,
                "workflow_type": workflow.workflow_type,
                "required_approvers": workflow.required_approvers,
                "expires_at": workflow.expires_at,
            }),
        }
    }

    pub fn workflow_resolved(plan: &ResolutionPlan) -> Self {
        Self {
            event_type: "workflow_resolved".to_string(),
            timestamp: plan.at,
            violation_id: plan.violation_id,
            details: serde_json::json!({
                "workflow_id": plan.workflow.as_ref().map(|w| w.workflow_id),
                "workflow_kind": plan.workflow.as_ref().map(|w| w.kind),
                "workflow_status": plan.workflow.as_ref().map(|w| w.status),
                "previous_violation_status": plan.previous_violation_status,
                "violation_status": plan.violation_status,
                "escalation_id": plan.escalation.as_ref().map(|e| e.escalation_id),
                "escalation_outcome": plan.escalation.as_ref().map(|e| e.final_outcome.clone()),
                "cancelled_deductions": plan.cancel,
            }),
        }
    }

    pub fn escalation_opened(opening: &EscalationOpening) -> Self {
        let esc = &opening.escalation;
        Self {
            event_type: "escalation_opened".to_string(),
            timestamp: esc.created_at,
            violation_id: esc.threshold_violation_id,
            details: serde_json::json!({
                "escalation_id": esc.id,
                "workflow_id": esc.workflow_id,
                "escalation_type": esc.escalation_type,
                "approval_required": esc.approval_required,
                "amount_requested": esc.amount_requested,
                "requested_by": esc.requested_by,
                "expires_at": esc.expires_at,
            }),
        }
    }

    pub fn deduction_issued(deduction: &SalaryDeduction) -> Self {
        Self {
            event_type: "deduction_issued".to_string(),
            timestamp: deduction.created_at,
            violation_id: deduction.violation_id,
            details: serde_json::json!({
                "deduction_id": deduction.id,
                "user_id": deduction.user_id,
                "amount": deduction.amount,
                "trigger_status": deduction.trigger_status,
                "deduction_date": deduction.deduction_date,
            }),
        }
    }
}

// ── HMAC Signing ─────────────────────────────────────────────

/// HMAC-SHA256 of `payload` under `secret`, as "sha256=<hex>".
pub fn sign_payload(secret: &str, payload: &[u8]) -> Option<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

// ── Webhook Notifier ──────────────────────────────────────────

/// Dispatches governance events to the configured URLs.
/// Bodies are signed with HMAC-SHA256 (`X-Costgov-Signature`) when a secret
/// is set, and each delivery is retried with back-off (1s → 5s → 25s).
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    backoff_secs: Vec<u64>,
}

impl WebhookNotifier {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("costgov-webhook/1.0")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            backoff_secs: vec![0, 1, 5, 25],
        }
    }

    /// Single attempt, no retries. Used by tests against mock servers.
    pub fn without_retries() -> Self {
        Self {
            backoff_secs: vec![0],
            ..Self::new()
        }
    }

    /// Send a (optionally signed) event to one URL, retrying on failure.
    pub async fn send_signed(
        &self,
        url: &str,
        event: &GovernanceEvent,
        signing_secret: Option<&str>,
    ) -> Result<()> {
        let payload = serde_json::to_vec(event)
            .map_err(|e| anyhow::anyhow!("webhook serialize error: {}", e))?;
        let delivery_id = Uuid::new_v4().to_string();
        let timestamp = Utc::now().timestamp().to_string();
        let signature = signing_secret.and_then(|s| sign_payload(s, &payload));

        for (attempt, &delay) in self.backoff_secs.iter().enumerate() {
            if delay > 0 {
                debug!(
                    url,
                    attempt,
                    delay_secs = delay,
                    event_type = %event.event_type,
                    "retrying webhook delivery"
                );
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }

            let mut req = self
                .client
                .post(url)
                .header("content-type", "application/json")
                .header("x-costgov-delivery-id", &delivery_id)
                .header("x-costgov-timestamp", &timestamp)
                .header("x-costgov-event", &event.event_type);

            if let Some(ref sig) = signature {
                req = req.header("x-costgov-signature", sig.as_str());
            }

            match req.body(payload.clone()).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(
                        url,
                        event_type = %event.event_type,
                        violation_id = %event.violation_id,
                        delivery_id = %delivery_id,
                        attempt,
                        "webhook delivered"
                    );
                    return Ok(());
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    warn!(
                        url,
                        event_type = %event.event_type,
                        delivery_id = %delivery_id,
                        attempt,
                        status = %status,
                        body = %body,
                        "webhook delivery failed (non-2xx)"
                    );
                }
                Err(e) => {
                    warn!(
                        url,
                        event_type = %event.event_type,
                        delivery_id = %delivery_id,
                        attempt,
                        error = %e,
                        "webhook request error"
                    );
                }
            }
        }

        Err(anyhow::anyhow!(
            "webhook delivery failed after {} attempts: {}",
            self.backoff_secs.len(),
            url
        ))
    }

    /// Fire-and-forget delivery to every target. Failures in one do not block others.
    pub fn dispatch(&self, targets: &[String], secret: Option<&str>, event: GovernanceEvent) {
        if targets.is_empty() {
            debug!(event_type = %event.event_type, "no webhook targets, skipping");
            return;
        }

        let notifier = self.clone();
        let targets = targets.to_vec();
        let secret = secret.map(String::from);

        tokio::spawn(async move {
            for url in &targets {
                if let Err(e) = notifier.send_signed(url, &event, secret.as_deref()).await {
                    warn!(url, error = %e, "webhook dispatch ultimately failed");
                }
            }
        });
    }
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::deduction::DeductionStatus;
    use crate::models::violation::ViolationStatus;
    use rust_decimal::Decimal;

    #[test]
    fn test_deduction_issued_event_shape() {
        let now = Utc::now();
        let d = SalaryDeduction {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            violation_id: Uuid::new_v4(),
            amount: Decimal::from(22_000),
            trigger_status: ViolationStatus::TimeoutRejected,
            status: DeductionStatus::Pending,
            deduction_date: now.date_naive(),
            note: None,
            created_at: now,
            updated_at: now,
        };
        let event = GovernanceEvent::deduction_issued(&d);
        assert_eq!(event.event_type, "deduction_issued");
        assert_eq!(event.violation_id, d.violation_id);
        assert_eq!(event.details["trigger_status"], "timeout_rejected");
        assert_eq!(event.details["amount"], "22000");
    }

    #[test]
    fn test_signature_is_deterministic_per_secret() {
        let a = sign_payload("secret1", b"payload").unwrap();
        assert_eq!(a, sign_payload("secret1", b"payload").unwrap());
        assert_ne!(a, sign_payload("secret2", b"payload").unwrap());
        assert!(a.starts_with("sha256="));
    }
}
