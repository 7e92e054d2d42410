//! Threshold policies and approval tier rules (the Policy Store's data).
//!
//! A `ThresholdPolicy` says how much may be spent in a category before the
//! request is blocked, and which approval tier an overage falls into. A
//! `TierRule` says who must approve a tier and how long they have.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::cost::check_money;

/// Longest review window a tier or escalation may be given: one year.
pub const MAX_TIMEOUT_HOURS: i64 = 24 * 365;

/// Shared bound for tier and escalation review windows.
pub fn check_timeout_hours(field: &str, hours: i64) -> Result<(), String> {
    if hours <= 0 || hours > MAX_TIMEOUT_HOURS {
        return Err(format!("{} must be between 1 and {}", field, MAX_TIMEOUT_HOURS));
    }
    Ok(())
}

// ── Roles & workflow types ───────────────────────────────────

/// Approval authority tiers, ordered from lowest to highest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum ApproverRole {
    /// Financial Controller
    Fc,
    /// General Manager
    Gm,
    /// Chief Executive
    Ceo,
}

impl ApproverRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApproverRole::Fc => "fc",
            ApproverRole::Gm => "gm",
            ApproverRole::Ceo => "ceo",
        }
    }

    /// The next authority tier up. The CEO is the ceiling.
    pub fn next_tier(&self) -> ApproverRole {
        match self {
            ApproverRole::Fc => ApproverRole::Gm,
            ApproverRole::Gm | ApproverRole::Ceo => ApproverRole::Ceo,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fc" => Some(ApproverRole::Fc),
            "gm" => Some(ApproverRole::Gm),
            "ceo" => Some(ApproverRole::Ceo),
            _ => None,
        }
    }
}

impl fmt::Display for ApproverRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum WorkflowType {
    FcOnly,
    GmOnly,
    CeoOnly,
    FcGmDual,
    GmCeoDual,
}

impl WorkflowType {
    pub const ALL: [WorkflowType; 5] = [
        WorkflowType::FcOnly,
        WorkflowType::GmOnly,
        WorkflowType::CeoOnly,
        WorkflowType::FcGmDual,
        WorkflowType::GmCeoDual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowType::FcOnly => "fc_only",
            WorkflowType::GmOnly => "gm_only",
            WorkflowType::CeoOnly => "ceo_only",
            WorkflowType::FcGmDual => "fc_gm_dual",
            WorkflowType::GmCeoDual => "gm_ceo_dual",
        }
    }

    pub fn is_dual(&self) -> bool {
        matches!(self, WorkflowType::FcGmDual | WorkflowType::GmCeoDual)
    }

    /// Smallest dual tier that still includes this tier's authority.
    pub fn at_least_dual(&self) -> WorkflowType {
        match self {
            WorkflowType::FcOnly | WorkflowType::FcGmDual => WorkflowType::FcGmDual,
            WorkflowType::GmOnly | WorkflowType::CeoOnly | WorkflowType::GmCeoDual => {
                WorkflowType::GmCeoDual
            }
        }
    }

    /// Roles a tier needs when no operator override is configured.
    pub fn default_approvers(&self) -> Vec<ApproverRole> {
        match self {
            WorkflowType::FcOnly => vec![ApproverRole::Fc],
            WorkflowType::GmOnly => vec![ApproverRole::Gm],
            WorkflowType::CeoOnly => vec![ApproverRole::Ceo],
            WorkflowType::FcGmDual => vec![ApproverRole::Fc, ApproverRole::Gm],
            WorkflowType::GmCeoDual => vec![ApproverRole::Gm, ApproverRole::Ceo],
        }
    }

    /// Single-role tier for a given role, used when escalating.
    pub fn single(role: ApproverRole) -> WorkflowType {
        match role {
            ApproverRole::Fc => WorkflowType::FcOnly,
            ApproverRole::Gm => WorkflowType::GmOnly,
            ApproverRole::Ceo => WorkflowType::CeoOnly,
        }
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Threshold policy ─────────────────────────────────────────

/// Maps an overage band (as a percentage of the limit) to a workflow tier.
/// `max_overage_pct = None` marks the open-ended top band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverageBand {
    pub max_overage_pct: Option<Decimal>,
    pub workflow_type: WorkflowType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdPolicy {
    pub id: Uuid,
    pub category: String,
    pub subcategory: Option<String>,
    pub fixed_limit: Decimal,
    /// Amount above which at least a dual tier is required.
    pub dual_approval_limit: Option<Decimal>,
    /// Critical categories always go to the top tier.
    #[serde(default)]
    pub critical: bool,
    /// Flat payroll penalty instead of the overage amount.
    pub flat_penalty: Option<Decimal>,
    #[serde(default = "ThresholdPolicy::default_bands")]
    pub workflow_type_rules: Vec<OverageBand>,
    pub effective_from: DateTime<Utc>,
}

impl ThresholdPolicy {
    /// ≤20% over → FC alone, ≤100% over → FC + GM, beyond that → GM + CEO.
    pub fn default_bands() -> Vec<OverageBand> {
        vec![
            OverageBand {
                max_overage_pct: Some(Decimal::from(20)),
                workflow_type: WorkflowType::FcOnly,
            },
            OverageBand {
                max_overage_pct: Some(Decimal::from(100)),
                workflow_type: WorkflowType::FcGmDual,
            },
            OverageBand {
                max_overage_pct: None,
                workflow_type: WorkflowType::GmCeoDual,
            },
        ]
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.category.trim().is_empty() {
            return Err("category must not be empty".into());
        }
        if self.fixed_limit <= Decimal::ZERO {
            return Err("fixed_limit must be positive".into());
        }
        check_money("fixed_limit", self.fixed_limit)?;
        if let Some(dual) = self.dual_approval_limit {
            check_money("dual_approval_limit", dual)?;
            if dual < self.fixed_limit {
                return Err("dual_approval_limit must not be below fixed_limit".into());
            }
        }
        if let Some(penalty) = self.flat_penalty {
            if penalty <= Decimal::ZERO {
                return Err("flat_penalty must be positive".into());
            }
            check_money("flat_penalty", penalty)?;
        }

        let bands = &self.workflow_type_rules;
        if bands.is_empty() {
            return Err("workflow_type_rules must not be empty".into());
        }
        let (last, bounded) = bands.split_last().ok_or("workflow_type_rules must not be empty")?;
        if last.max_overage_pct.is_some() {
            return Err("the last overage band must be open-ended".into());
        }
        let mut previous = Decimal::ZERO;
        for band in bounded {
            let Some(max) = band.max_overage_pct else {
                return Err("only the last overage band may be open-ended".into());
            };
            if max <= previous {
                return Err("overage bands must be strictly ascending and positive".into());
            }
            previous = max;
        }
        Ok(())
    }

    fn matches(&self, category: &str, subcategory: Option<&str>) -> bool {
        if !self.category.eq_ignore_ascii_case(category) {
            return false;
        }
        match (self.subcategory.as_deref(), subcategory) {
            (None, _) => true,
            (Some(mine), Some(theirs)) => mine.eq_ignore_ascii_case(theirs),
            (Some(_), None) => false,
        }
    }
}

// ── Tier rules ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierRule {
    pub workflow_type: WorkflowType,
    pub required_approvers: Vec<ApproverRole>,
    pub timeout_hours: i64,
}

impl TierRule {
    pub fn default_for(workflow_type: WorkflowType) -> Self {
        let timeout_hours = if workflow_type.is_dual() { 48 } else { 24 };
        Self {
            workflow_type,
            required_approvers: workflow_type.default_approvers(),
            timeout_hours,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        check_timeout_hours("timeout_hours", self.timeout_hours)?;
        if self.required_approvers.is_empty() || self.required_approvers.len() > 2 {
            return Err("required_approvers must hold one or two roles".into());
        }
        if self.required_approvers.len() == 2
            && self.required_approvers[0] == self.required_approvers[1]
        {
            return Err("required_approvers must not repeat a role".into());
        }
        Ok(())
    }
}

// ── Policy book ──────────────────────────────────────────────

/// A point-in-time snapshot of every threshold policy and tier rule.
#[derive(Debug, Clone, Default)]
pub struct PolicyBook {
    policies: Vec<ThresholdPolicy>,
    tiers: HashMap<WorkflowType, TierRule>,
}

impl PolicyBook {
    pub fn new(policies: Vec<ThresholdPolicy>, tiers: Vec<TierRule>) -> Self {
        Self {
            policies,
            tiers: tiers.into_iter().map(|t| (t.workflow_type, t)).collect(),
        }
    }

    pub fn policies(&self) -> &[ThresholdPolicy] {
        &self.policies
    }

    /// Most specific policy in force at `at`: a subcategory match beats a
    /// category-level one; among equals the latest `effective_from` wins.
    pub fn lookup(
        &self,
        category: &str,
        subcategory: Option<&str>,
        at: DateTime<Utc>,
    ) -> Option<&ThresholdPolicy> {
        self.policies
            .iter()
            .filter(|p| p.effective_from <= at && p.matches(category, subcategory))
            .max_by_key(|p| (p.subcategory.is_some(), p.effective_from))
    }

    /// Configured tier rule, or the built-in default for the tier.
    pub fn tier(&self, workflow_type: WorkflowType) -> TierRule {
        self.tiers
            .get(&workflow_type)
            .cloned()
            .unwrap_or_else(|| TierRule::default_for(workflow_type))
    }

    pub fn tiers(&self) -> Vec<TierRule> {
        WorkflowType::ALL.iter().map(|t| self.tier(*t)).collect()
    }
}
