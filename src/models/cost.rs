use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The originating record a cost request was raised from.
///
/// Serialized as `{"reference_type": "...", "reference_id": "..."}` so the
/// pair can sit flat inside API payloads and rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reference_type", content = "reference_id", rename_all = "snake_case")]
pub enum CostReference {
    Expense(Uuid),
    LogisticsCost(Uuid),
    BonusPayout(Uuid),
    InventoryAdjustment(Uuid),
    PurchaseOrder(Uuid),
}

impl CostReference {
    pub fn reference_type(&self) -> &'static str {
        match self {
            CostReference::Expense(_) => "expense",
            CostReference::LogisticsCost(_) => "logistics_cost",
            CostReference::BonusPayout(_) => "bonus_payout",
            CostReference::InventoryAdjustment(_) => "inventory_adjustment",
            CostReference::PurchaseOrder(_) => "purchase_order",
        }
    }

    pub fn reference_id(&self) -> Uuid {
        match *self {
            CostReference::Expense(id)
            | CostReference::LogisticsCost(id)
            | CostReference::BonusPayout(id)
            | CostReference::InventoryAdjustment(id)
            | CostReference::PurchaseOrder(id) => id,
        }
    }

    /// Rebuild from a stored (`reference_type`, `reference_id`) pair.
    pub fn from_parts(reference_type: &str, id: Uuid) -> Option<Self> {
        match reference_type {
            "expense" => Some(CostReference::Expense(id)),
            "logistics_cost" => Some(CostReference::LogisticsCost(id)),
            "bonus_payout" => Some(CostReference::BonusPayout(id)),
            "inventory_adjustment" => Some(CostReference::InventoryAdjustment(id)),
            "purchase_order" => Some(CostReference::PurchaseOrder(id)),
            _ => None,
        }
    }
}

/// Money is stored as `NUMERIC(18, 2)`: two decimal places, 16 integer digits.
pub const MONEY_SCALE: u32 = 2;

/// First value `NUMERIC(18, 2)` cannot hold.
pub fn money_ceiling() -> Decimal {
    Decimal::from(10_000_000_000_000_000i64)
}

/// Reject values the money columns would round or overflow.
pub fn check_money(field: &str, value: Decimal) -> Result<(), String> {
    if value.normalize().scale() > MONEY_SCALE {
        return Err(format!("{} must have at most {} decimal places", field, MONEY_SCALE));
    }
    if value.abs() >= money_ceiling() {
        return Err(format!("{} must be below {}", field, money_ceiling()));
    }
    Ok(())
}

/// A cost-bearing request submitted by an originating module before it commits a spend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRequest {
    pub category: String,
    pub subcategory: Option<String>,
    pub amount: Decimal,
    #[serde(flatten)]
    pub reference: CostReference,
    pub requested_by: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_money_bounds() {
        use std::str::FromStr;
        let dec = |s: &str| Decimal::from_str(s).unwrap();
        assert!(check_money("amount", dec("50000.01")).is_ok());
        assert!(check_money("amount", dec("50000.100")).is_ok());
        assert!(check_money("amount", dec("9999999999999999.99")).is_ok());
        assert!(check_money("amount", dec("50000.004")).is_err());
        assert!(check_money("amount", dec("10000000000000000")).is_err());
        assert!(check_money("amount", Decimal::MAX).is_err());
    }

    #[test]
    fn test_reference_parts_roundtrip() {
        let id = Uuid::new_v4();
        for r in [
            CostReference::Expense(id),
            CostReference::LogisticsCost(id),
            CostReference::BonusPayout(id),
            CostReference::InventoryAdjustment(id),
            CostReference::PurchaseOrder(id),
        ] {
            assert_eq!(CostReference::from_parts(r.reference_type(), id), Some(r));
        }
        assert_eq!(CostReference::from_parts("invoice", id), None);
    }

    #[test]
    fn test_cost_request_flat_json() {
        let id = Uuid::new_v4();
        let user = Uuid::new_v4();
        let req: CostRequest = serde_json::from_value(json!({
            "category": "logistics",
            "subcategory": null,
            "amount": "72000",
            "reference_type": "logistics_cost",
            "reference_id": id,
            "requested_by": user,
        }))
        .unwrap();
        assert_eq!(req.reference, CostReference::LogisticsCost(id));
        assert_eq!(req.amount, Decimal::from(72_000));
    }
}
