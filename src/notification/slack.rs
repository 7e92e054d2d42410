use anyhow::Context;
use serde::Serialize;

use crate::models::violation::ThresholdViolation;
use crate::models::workflow::ApprovalWorkflow;

#[derive(Clone, Default)]
pub struct SlackNotifier {
    client: reqwest::Client,
    webhook_url: Option<String>,
}

impl SlackNotifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    /// Tell the channel that a workflow is waiting on its approvers.
    pub async fn send_approval_request(
        &self,
        violation: &ThresholdViolation,
        workflow: &ApprovalWorkflow,
    ) -> anyhow::Result<()> {
        let Some(url) = &self.webhook_url else {
            tracing::debug!("No Slack webhook URL configured, skipping notification");
            return Ok(());
        };

        let roles = workflow
            .required_approvers
            .iter()
            .map(|r| r.as_str().to_uppercase())
            .collect::<Vec<_>>()
            .join(" + ");

        let message = SlackMessage {
            text: format!(
                "*Approval required* ({roles})\n\n\
                 {category} spend of {amount} exceeds its limit of {limit} by {overage}.\n\
                 Workflow: `{wf}` ({kind:?})\nExpires: {expires}\n\n\
                 Run `costgov workflow decide {wf} --approver <your-id> --decision approve` or `--decision reject`",
                category = violation.cost_category,
                amount = violation.amount,
                limit = violation.threshold_limit,
                overage = violation.overage_amount,
                wf = workflow.id,
                kind = workflow.kind,
                expires = workflow.expires_at,
            ),
        };

        let resp = self
            .client
            .post(url)
            .json(&message)
            .send()
            .await
            .context("failed to send slack notification")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("slack returned error: status={}, body={}", status, body);
        }

        tracing::info!(workflow_id = %workflow.id, "sent Slack approval request");
        Ok(())
    }
}

#[derive(Serialize)]
struct SlackMessage {
    text: String,
}
