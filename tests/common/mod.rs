//! Shared fixtures: an engine over `MemoryStore` driven by a manual clock,
//! with one logistics policy (limit 50,000) and one approver per role.
#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use costgov::engine::clock::ManualClock;
use costgov::engine::policy_store::PolicyStore;
use costgov::engine::{DecisionOutcome, EngineSettings, EscalationEngine, EvaluationOutcome};
use costgov::errors::AppError;
use costgov::models::cost::{CostReference, CostRequest};
use costgov::models::policy::{ApproverRole, ThresholdPolicy};
use costgov::models::workflow::{Approver, Decision, DecisionSubmission};
use costgov::notification::Notifier;
use costgov::store::MemoryStore;

pub struct Harness {
    pub engine: EscalationEngine,
    pub clock: Arc<ManualClock>,
    pub fc: Uuid,
    pub gm: Uuid,
    pub ceo: Uuid,
    pub requester: Uuid,
}

pub struct Blocked {
    pub violation_id: Uuid,
    pub workflow_id: Uuid,
}

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap()
}

pub async fn harness() -> Harness {
    harness_with(Notifier::default()).await
}

pub async fn harness_with(notifier: Notifier) -> Harness {
    let clock = Arc::new(ManualClock::new(start()));
    let engine = EscalationEngine::new(
        Arc::new(MemoryStore::new()),
        PolicyStore::default(),
        notifier,
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
            effective_from: start() - Duration::days(30),
        })
        .await
        .unwrap();

    let mut ids = Vec::new();
    for (role, name) in [
        (ApproverRole::Fc, "Financial Controller"),
        (ApproverRole::Gm, "General Manager"),
        (ApproverRole::Ceo, "Chief Executive"),
    ] {
        let user_id = Uuid::new_v4();
        engine
            .upsert_approver(Approver {
                user_id,
                role,
                display_name: name.into(),
                is_active: true,
            })
            .await
            .unwrap();
        ids.push(user_id);
    }

    Harness {
        engine,
        clock,
        fc: ids[0],
        gm: ids[1],
        ceo: ids[2],
        requester: Uuid::new_v4(),
    }
}

impl Harness {
    pub fn request(&self, amount: i64) -> CostRequest {
        CostRequest {
            category: "logistics".into(),
            subcategory: None,
            amount: Decimal::from(amount),
            reference: CostReference::LogisticsCost(Uuid::new_v4()),
            requested_by: self.requester,
        }
    }

    /// Submit a request that must be blocked.
    pub async fn block(&self, amount: i64) -> Blocked {
        match self.engine.evaluate(&self.request(amount)).await.unwrap() {
            EvaluationOutcome::Blocked {
                violation_id,
                workflow_id,
                ..
            } => Blocked {
                violation_id,
                workflow_id,
            },
            other => panic!("expected a block, got {:?}", other),
        }
    }

    pub async fn decide(
        &self,
        workflow_id: Uuid,
        approver_id: Uuid,
        decision: Decision,
    ) -> Result<DecisionOutcome, AppError> {
        self.engine
            .decide(DecisionSubmission {
                workflow_id,
                approver_id,
                decision,
                comment: None,
            })
            .await
    }

    pub fn advance_hours(&self, hours: i64) {
        self.clock.advance(Duration::hours(hours));
    }
}
