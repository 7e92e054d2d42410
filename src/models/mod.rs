pub mod audit;
pub mod cost;
pub mod deduction;
pub mod escalation;
pub mod policy;
pub mod violation;
pub mod workflow;
