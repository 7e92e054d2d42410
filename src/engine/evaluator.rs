//! Threshold Evaluator.
//!
//! Pure function from (policy snapshot, cost request) to pass or a violation
//! draft with its approval tier. No I/O, no clock reads beyond the `at` argument.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::cost::{check_money, CostRequest};
use crate::models::policy::{PolicyBook, ThresholdPolicy, WorkflowType};
use crate::models::violation::ViolationDraft;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Evaluation {
    Pass { policy_id: Uuid, threshold_limit: Decimal },
    Violation(ViolationDraft),
}

pub fn evaluate(
    book: &PolicyBook,
    request: &CostRequest,
    at: DateTime<Utc>,
) -> Result<Evaluation, AppError> {
    if request.amount <= Decimal::ZERO {
        return Err(AppError::Validation("amount must be positive".into()));
    }
    check_money("amount", request.amount).map_err(AppError::Validation)?;

    let policy = book
        .lookup(&request.category, request.subcategory.as_deref(), at)
        .ok_or_else(|| AppError::PolicyNotFound {
            category: request.category.clone(),
            subcategory: request.subcategory.clone(),
        })?;

    let overage = request.amount - policy.fixed_limit;
    if overage <= Decimal::ZERO {
        return Ok(Evaluation::Pass {
            policy_id: policy.id,
            threshold_limit: policy.fixed_limit,
        });
    }

    Ok(Evaluation::Violation(ViolationDraft {
        policy_id: policy.id,
        cost_type: request.reference.reference_type().to_string(),
        cost_category: request.category.clone(),
        subcategory: request.subcategory.clone(),
        amount: request.amount,
        threshold_limit: policy.fixed_limit,
        overage_amount: overage,
        reference: request.reference,
        created_by: request.requested_by,
        workflow_type: select_workflow_type(policy, request.amount, overage),
        flat_penalty: policy.flat_penalty,
    }))
}

/// Overage as a percentage of the limit. `None` when it does not fit a `Decimal`.
pub fn overage_pct(limit: Decimal, overage: Decimal) -> Option<Decimal> {
    overage.checked_mul(Decimal::ONE_HUNDRED)?.checked_div(limit)
}

/// Pick the tier for a positive overage.
pub fn select_workflow_type(
    policy: &ThresholdPolicy,
    amount: Decimal,
    overage: Decimal,
) -> WorkflowType {
    if policy.critical {
        return WorkflowType::GmCeoDual;
    }

    // An overage too large to express is past every bounded band.
    let pct = overage_pct(policy.fixed_limit, overage);
    let banded = policy
        .workflow_type_rules
        .iter()
        .find(|band| match (band.max_overage_pct, pct) {
            (None, _) => true,
            (Some(max), Some(pct)) => pct <= max,
            (Some(_), None) => false,
        })
        .map(|band| band.workflow_type)
        // A policy without an open-ended band still has to land somewhere.
        .unwrap_or(WorkflowType::GmCeoDual);

    match policy.dual_approval_limit {
        Some(dual) if amount > dual => banded.at_least_dual(),
        _ => banded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::cost::CostReference;
    use crate::models::policy::OverageBand;
    use chrono::Duration;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn policy(category: &str, limit: &str) -> ThresholdPolicy {
        ThresholdPolicy {
            id: Uuid::new_v4(),
            category: category.into(),
            subcategory: None,
            fixed_limit: dec(limit),
            dual_approval_limit: None,
            critical: false,
            flat_penalty: None,
            workflow_type_rules: ThresholdPolicy::default_bands(),
            effective_from: Utc::now() - Duration::days(30),
        }
    }

    fn request(category: &str, amount: &str) -> CostRequest {
        CostRequest {
            category: category.into(),
            subcategory: None,
            amount: dec(amount),
            reference: CostReference::LogisticsCost(Uuid::new_v4()),
            requested_by: Uuid::new_v4(),
        }
    }

    fn run(book: &PolicyBook, category: &str, amount: &str) -> Evaluation {
        evaluate(book, &request(category, amount), Utc::now()).unwrap()
    }

    #[test]
    fn test_pass_iff_amount_within_limit() {
        let book = PolicyBook::new(vec![policy("logistics", "50000")], vec![]);
        for amount in ["1", "49999.99", "50000"] {
            assert!(
                matches!(run(&book, "logistics", amount), Evaluation::Pass { .. }),
                "{amount} should pass"
            );
        }
        match run(&book, "logistics", "50000.01") {
            Evaluation::Violation(d) => assert_eq!(d.overage_amount, dec("0.01")),
            other => panic!("expected violation, got {:?}", other),
        }
    }

    #[test]
    fn test_logistics_scenario_is_dual_tier() {
        let book = PolicyBook::new(vec![policy("logistics", "50000")], vec![]);
        let Evaluation::Violation(draft) = run(&book, "logistics", "72000") else {
            panic!("expected violation");
        };
        assert_eq!(draft.overage_amount, dec("22000"));
        assert_eq!(overage_pct(draft.threshold_limit, draft.overage_amount), Some(dec("44")));
        assert_eq!(draft.workflow_type, WorkflowType::FcGmDual);
        assert_eq!(draft.cost_type, "logistics_cost");
    }

    #[test]
    fn test_band_table() {
        let book = PolicyBook::new(vec![policy("expense", "1000")], vec![]);
        let cases = [
            ("1100", WorkflowType::FcOnly),    // 10%
            ("1200", WorkflowType::FcOnly),    // 20% (inclusive)
            ("1200.01", WorkflowType::FcGmDual),
            ("2000", WorkflowType::FcGmDual),  // 100%
            ("2000.01", WorkflowType::GmCeoDual),
            ("9000", WorkflowType::GmCeoDual),
        ];
        for (amount, expected) in cases {
            match run(&book, "expense", amount) {
                Evaluation::Violation(d) => {
                    assert_eq!(d.workflow_type, expected, "amount {amount}")
                }
                other => panic!("{amount}: expected violation, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_critical_category_goes_to_top_tier() {
        let mut p = policy("bonus", "1000");
        p.critical = true;
        let book = PolicyBook::new(vec![p], vec![]);
        let Evaluation::Violation(d) = run(&book, "bonus", "1001") else {
            panic!("expected violation");
        };
        assert_eq!(d.workflow_type, WorkflowType::GmCeoDual);
    }

    #[test]
    fn test_dual_approval_limit_raises_single_tier() {
        let mut p = policy("inventory", "1000");
        p.dual_approval_limit = Some(dec("1100"));
        let book = PolicyBook::new(vec![p], vec![]);

        let Evaluation::Violation(d) = run(&book, "inventory", "1050") else {
            panic!("expected violation");
        };
        assert_eq!(d.workflow_type, WorkflowType::FcOnly);

        let Evaluation::Violation(d) = run(&book, "inventory", "1150") else {
            panic!("expected violation");
        };
        assert_eq!(d.workflow_type, WorkflowType::FcGmDual);
    }

    #[test]
    fn test_custom_bands() {
        let mut p = policy("procurement", "100");
        p.workflow_type_rules = vec![
            OverageBand {
                max_overage_pct: Some(dec("50")),
                workflow_type: WorkflowType::GmOnly,
            },
            OverageBand {
                max_overage_pct: None,
                workflow_type: WorkflowType::CeoOnly,
            },
        ];
        let book = PolicyBook::new(vec![p], vec![]);
        let Evaluation::Violation(d) = run(&book, "procurement", "140") else {
            panic!("expected violation");
        };
        assert_eq!(d.workflow_type, WorkflowType::GmOnly);
        let Evaluation::Violation(d) = run(&book, "procurement", "151") else {
            panic!("expected violation");
        };
        assert_eq!(d.workflow_type, WorkflowType::CeoOnly);
    }

    #[test]
    fn test_missing_policy() {
        let book = PolicyBook::new(vec![policy("logistics", "50000")], vec![]);
        let err = evaluate(&book, &request("payroll", "10"), Utc::now()).unwrap_err();
        assert!(matches!(err, AppError::PolicyNotFound { .. }));
    }

    #[test]
    fn test_non_positive_amount_rejected() {
        let book = PolicyBook::new(vec![policy("logistics", "50000")], vec![]);
        let err = evaluate(&book, &request("logistics", "0"), Utc::now()).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_sub_cent_amount_rejected() {
        let book = PolicyBook::new(vec![policy("logistics", "50000")], vec![]);
        let err = evaluate(&book, &request("logistics", "50000.004"), Utc::now()).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        // Trailing zeros are not extra precision.
        match run(&book, "logistics", "50000.010") {
            Evaluation::Violation(d) => assert_eq!(d.overage_amount, dec("0.01")),
            other => panic!("expected violation, got {:?}", other),
        }
    }

    #[test]
    fn test_amount_beyond_money_range_rejected() {
        let book = PolicyBook::new(vec![policy("logistics", "1")], vec![]);
        let max = Decimal::MAX.to_string();
        for amount in ["10000000000000000", max.as_str()] {
            let err = evaluate(&book, &request("logistics", amount), Utc::now()).unwrap_err();
            assert!(matches!(err, AppError::Validation(_)), "{amount}");
        }
        assert!(matches!(
            run(&book, "logistics", "9999999999999999.99"),
            Evaluation::Violation(_)
        ));
    }

    #[test]
    fn test_overage_pct_overflow_lands_in_top_band() {
        assert_eq!(overage_pct(dec("1"), Decimal::MAX), None);
        let p = policy("logistics", "0.01");
        assert_eq!(
            select_workflow_type(&p, Decimal::MAX, Decimal::MAX),
            WorkflowType::GmCeoDual
        );
    }

    #[test]
    fn test_flat_penalty_snapshot() {
        let mut p = policy("expense", "100");
        p.flat_penalty = Some(dec("25"));
        let book = PolicyBook::new(vec![p], vec![]);
        let Evaluation::Violation(d) = run(&book, "expense", "500") else {
            panic!("expected violation");
        };
        assert_eq!(d.flat_penalty, Some(dec("25")));
    }
}
