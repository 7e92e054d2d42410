//! Background job: time out approval workflows nobody decided in time.
//!
//! Each tick selects pending workflows whose `expires_at` has passed and asks
//! the store to expire them one by one. The expiry write is conditional on
//! the row still being pending, so any number of sweepers (and late human
//! decisions) may race on the same workflow and exactly one wins.

use std::time::Duration;

use tokio::time;
use tracing::{debug, info, warn};

use crate::engine::EscalationEngine;

pub const DEFAULT_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_BATCH_SIZE: i64 = 100;

/// Statistics from one sweep tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Expired workflows selected this tick.
    pub found: usize,
    /// Workflows this sweeper moved to timeout_rejected.
    pub timed_out: usize,
    /// Deductions issued as a result.
    pub deductions_issued: usize,
    /// Rows someone else resolved between select and update.
    pub lost_race: usize,
    /// Rows that failed; retried next tick.
    pub failed: usize,
}

/// Run one sweep. Per-row failures are logged and counted, never fatal.
pub async fn run_sweep(engine: &EscalationEngine, batch_size: i64) -> anyhow::Result<SweepStats> {
    let mut stats = SweepStats::default();

    let due = engine.list_expired_workflows(batch_size.max(1)).await?;
    if due.is_empty() {
        debug!("timeout sweep: nothing due");
        return Ok(stats);
    }
    stats.found = due.len();

    for workflow_id in due {
        match engine.expire_workflow(workflow_id).await {
            Ok(Some(plan)) => {
                stats.timed_out += 1;
                if plan.issue.is_some() {
                    stats.deductions_issued += 1;
                }
            }
            Ok(None) => {
                debug!(workflow_id = %workflow_id, "workflow resolved elsewhere before timeout");
                stats.lost_race += 1;
            }
            Err(e) => {
                warn!(workflow_id = %workflow_id, error = %e, "failed to time out workflow, will retry next tick");
                stats.failed += 1;
            }
        }
    }

    info!(
        found = stats.found,
        timed_out = stats.timed_out,
        deductions_issued = stats.deductions_issued,
        lost_race = stats.lost_race,
        failed = stats.failed,
        "timeout sweep complete"
    );
    Ok(stats)
}

/// Spawn the periodic sweeper. Call this once at startup.
pub fn spawn(engine: EscalationEngine, interval: Duration, batch_size: i64) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = run_sweep(&engine, batch_size).await {
                tracing::error!("timeout sweep failed: {:#}", e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use rust_decimal::Decimal;
    use uuid::Uuid;

    use crate::engine::clock::{Clock, ManualClock};
    use crate::engine::policy_store::PolicyStore;
    use crate::engine::{EngineSettings, EvaluationOutcome};
    use crate::models::cost::{CostReference, CostRequest};
    use crate::models::policy::ThresholdPolicy;
    use crate::models::violation::ViolationStatus;
    use crate::notification::Notifier;
    use crate::store::MemoryStore;

    async fn engine(clock: Arc<ManualClock>) -> EscalationEngine {
        let engine = EscalationEngine::new(
            Arc::new(MemoryStore::new()),
            PolicyStore::default(),
            Notifier::default(),
            EngineSettings::default(),
        )
        .with_clock(clock.clone());
        engine
            .upsert_policy(ThresholdPolicy {
                id: Uuid::new_v4(),
                category: "logistics".into(),
                subcategory: None,
                fixed_limit: Decimal::from(50_000),
                dual_approval_limit: None,
                critical: false,
                flat_penalty: None,
                workflow_type_rules: ThresholdPolicy::default_bands(),
                effective_from: clock.now() - ChronoDuration::days(1),
            })
            .await
            .unwrap();
        engine
    }

    async fn block(engine: &EscalationEngine) -> Uuid {
        let outcome = engine
            .evaluate(&CostRequest {
                category: "logistics".into(),
                subcategory: None,
                amount: Decimal::from(72_000),
                reference: CostReference::LogisticsCost(Uuid::new_v4()),
                requested_by: Uuid::new_v4(),
            })
            .await
            .unwrap();
        match outcome {
            EvaluationOutcome::Blocked { violation_id, .. } => violation_id,
            other => panic!("expected a block, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sweep_ignores_workflows_before_deadline() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap()));
        let engine = engine(clock.clone()).await;
        block(&engine).await;

        clock.advance(ChronoDuration::hours(47));
        let stats = run_sweep(&engine, DEFAULT_BATCH_SIZE).await.unwrap();
        assert_eq!(stats, SweepStats::default());
    }

    #[tokio::test]
    async fn test_sweep_times_out_once_and_issues_deduction() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap()));
        let engine = engine(clock.clone()).await;
        let violation_id = block(&engine).await;

        clock.advance(ChronoDuration::hours(49));
        let stats = run_sweep(&engine, DEFAULT_BATCH_SIZE).await.unwrap();
        assert_eq!(stats.found, 1);
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.deductions_issued, 1);

        let again = run_sweep(&engine, DEFAULT_BATCH_SIZE).await.unwrap();
        assert_eq!(again.found, 0);

        let violation = engine.violation(violation_id).await.unwrap();
        assert_eq!(violation.status, ViolationStatus::TimeoutRejected);
    }

    #[tokio::test]
    async fn test_sweep_respects_batch_size() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap()));
        let engine = engine(clock.clone()).await;
        for _ in 0..3 {
            block(&engine).await;
        }

        clock.advance(ChronoDuration::hours(49));
        let first = run_sweep(&engine, 2).await.unwrap();
        assert_eq!(first.timed_out, 2);
        let second = run_sweep(&engine, 2).await.unwrap();
        assert_eq!(second.timed_out, 1);
    }
}
