//! 预算：日 / 月硬上限与原子化的授权 + 记账

pub mod ledger;

pub use ledger::{
    BudgetDecision, BudgetLedger, BudgetPeriod, BudgetSummary, DenyReason, Reservation, SpendEvent,
};
