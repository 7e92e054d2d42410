pub mod slack;
pub mod webhook;

pub use slack::SlackNotifier;
pub use webhook::{GovernanceEvent, WebhookNotifier};

use crate::engine::escalation::EscalationOpening;
use crate::engine::resolution::ResolutionPlan;
use crate::models::violation::ThresholdViolation;
use crate::models::workflow::ApprovalWorkflow;

/// Post-commit fan-out. Callers only reach this after their transaction
/// committed; every send runs on a spawned task and never fails the caller.
#[derive(Clone, Default)]
pub struct Notifier {
    webhook: WebhookNotifier,
    targets: Vec<String>,
    secret: Option<String>,
    slack: SlackNotifier,
}

impl Notifier {
    pub fn new(targets: Vec<String>, secret: Option<String>, slack_webhook_url: Option<String>) -> Self {
        Self {
            webhook: WebhookNotifier::new(),
            targets,
            secret,
            slack: SlackNotifier::new(slack_webhook_url),
        }
    }

    /// Swap the webhook transport (tests use one without retries).
    pub fn with_webhook(mut self, webhook: WebhookNotifier) -> Self {
        self.webhook = webhook;
        self
    }

    fn emit(&self, event: GovernanceEvent) {
        self.webhook.dispatch(&self.targets, self.secret.as_deref(), event);
    }

    fn request_approval(&self, violation: &ThresholdViolation, workflow: &ApprovalWorkflow) {
        if !self.slack.is_enabled() {
            return;
        }
        let slack = self.slack.clone();
        let violation = violation.clone();
        let workflow = workflow.clone();
        tokio::spawn(async move {
            if let Err(e) = slack.send_approval_request(&violation, &workflow).await {
                tracing::warn!(workflow_id = %workflow.id, error = %e, "slack approval request failed");
            }
        });
    }

    pub fn violation_blocked(&self, violation: &ThresholdViolation, workflow: &ApprovalWorkflow) {
        self.emit(GovernanceEvent::violation_blocked(violation, workflow));
        self.request_approval(violation, workflow);
    }

    pub fn escalation_opened(&self, opening: &EscalationOpening, violation: &ThresholdViolation) {
        self.emit(GovernanceEvent::escalation_opened(opening));
        self.request_approval(violation, &opening.workflow);
    }

    /// Announce a committed resolution and any deduction it issued.
    pub fn resolved(&self, plan: &ResolutionPlan) {
        self.emit(GovernanceEvent::workflow_resolved(plan));
        if let Some(deduction) = &plan.issue {
            self.emit(GovernanceEvent::deduction_issued(deduction));
        }
    }
}
