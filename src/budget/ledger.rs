//! 预算账本
//!
//! 日 / 月两个周期（UTC 自然日、自然月）。authorize 在同一把锁内检查「已花 + 在途预留 + 本次估算」
//! 并登记预留，两个并发授权不可能合计超限；调用结束后 commit（记实际花费并释放预留）或 release。
//! record 永不被限额拦截。跨周期时运行总额清零，历史事件保留在 spend_events。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::params;
use serde::Serialize;

use crate::config::BudgetSection;
use crate::core::AgentError;
use crate::store::Store;

const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    Today,
    Month,
    All,
}

/// 已授权但尚未结算的预留
#[derive(Debug)]
#[must_use = "a reservation must be committed or released"]
pub struct Reservation {
    id: u64,
    amount: f64,
}

impl Reservation {
    pub fn amount(&self) -> f64 {
        self.amount
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DenyReason {
    DailyLimit { spent: f64, limit: f64, requested: f64 },
    MonthlyLimit { spent: f64, limit: f64, requested: f64 },
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::DailyLimit { spent, limit, requested } => write!(
                f,
                "daily_budget_exceeded: spent {spent:.4} + requested {requested:.4} > limit {limit:.4}"
            ),
            DenyReason::MonthlyLimit { spent, limit, requested } => write!(
                f,
                "monthly_budget_exceeded: spent {spent:.4} + requested {requested:.4} > limit {limit:.4}"
            ),
        }
    }
}

#[derive(Debug)]
pub enum BudgetDecision {
    Allow(Reservation),
    Deny(DenyReason),
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetSummary {
    pub period: BudgetPeriod,
    pub spent: f64,
    /// All 周期没有上限
    pub limit: Option<f64>,
    pub percentage_used: f64,
    pub reserved: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpendEvent {
    pub amount: f64,
    pub path: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
struct LedgerState {
    day: NaiveDate,
    month: (i32, u32),
    day_spent: f64,
    month_spent: f64,
    reservations: HashMap<u64, f64>,
    next_id: u64,
}

impl LedgerState {
    fn reserved(&self) -> f64 {
        self.reservations.values().sum()
    }

    /// 跨日 / 跨月时清零对应的运行总额
    fn roll(&mut self, now: DateTime<Utc>) {
        let day = now.date_naive();
        let month = (now.year(), now.month());
        if day != self.day {
            tracing::info!(from = %self.day, to = %day, "daily budget period rolled over");
            self.day = day;
            self.day_spent = 0.0;
        }
        if month != self.month {
            self.month = month;
            self.month_spent = 0.0;
        }
    }

    fn in_day(&self, at: DateTime<Utc>) -> bool {
        at.date_naive() == self.day
    }

    fn in_month(&self, at: DateTime<Utc>) -> bool {
        (at.year(), at.month()) == self.month
    }
}

pub struct BudgetLedger {
    store: Arc<Store>,
    limits: BudgetSection,
    state: Mutex<LedgerState>,
}

impl BudgetLedger {
    /// 从持久化事件重建当前日 / 月的运行总额
    pub fn open(store: Arc<Store>, limits: BudgetSection) -> Result<Self, AgentError> {
        Self::open_at(store, limits, Utc::now())
    }

    pub fn open_at(
        store: Arc<Store>,
        limits: BudgetSection,
        now: DateTime<Utc>,
    ) -> Result<Self, AgentError> {
        let day = now.date_naive();
        let month_start = month_start(now);
        let day_start = Utc.from_utc_datetime(&day.and_time(chrono::NaiveTime::MIN));
        let (day_spent, month_spent) = store.with_conn(|c| {
            let sum = |since: DateTime<Utc>| -> Result<f64, rusqlite::Error> {
                c.query_row(
                    "SELECT COALESCE(SUM(amount), 0.0) FROM spend_events WHERE at >= ?1",
                    params![since],
                    |r| r.get(0),
                )
            };
            Ok((sum(day_start)?, sum(month_start)?))
        })?;
        tracing::debug!(day_spent, month_spent, "budget ledger restored");
        Ok(Self {
            store,
            limits,
            state: Mutex::new(LedgerState {
                day,
                month: (now.year(), now.month()),
                day_spent,
                month_spent,
                reservations: HashMap::new(),
                next_id: 1,
            }),
        })
    }

    pub fn authorize(&self, estimated_cost: f64) -> BudgetDecision {
        self.authorize_at(estimated_cost, Utc::now())
    }

    /// 日或月「已花 + 预留 + 估算」超过上限即拒绝；否则登记预留
    pub fn authorize_at(&self, estimated_cost: f64, now: DateTime<Utc>) -> BudgetDecision {
        let estimate = estimated_cost.max(0.0);
        let mut state = self.state.lock();
        state.roll(now);
        let reserved = state.reserved();

        let day_committed = state.day_spent + reserved;
        if day_committed + estimate > self.limits.daily_limit + EPSILON {
            let reason = DenyReason::DailyLimit {
                spent: day_committed,
                limit: self.limits.daily_limit,
                requested: estimate,
            };
            tracing::warn!(%reason, "spend denied");
            return BudgetDecision::Deny(reason);
        }
        let month_committed = state.month_spent + reserved;
        if month_committed + estimate > self.limits.monthly_limit + EPSILON {
            let reason = DenyReason::MonthlyLimit {
                spent: month_committed,
                limit: self.limits.monthly_limit,
                requested: estimate,
            };
            tracing::warn!(%reason, "spend denied");
            return BudgetDecision::Deny(reason);
        }

        let id = state.next_id;
        state.next_id += 1;
        state.reservations.insert(id, estimate);
        BudgetDecision::Allow(Reservation {
            id,
            amount: estimate,
        })
    }

    /// 记一笔实际花费；不受上限约束
    pub fn record(&self, actual_cost: f64, path: &str, at: DateTime<Utc>) {
        let mut state = self.state.lock();
        self.record_locked(&mut state, actual_cost, path, at);
    }

    /// 释放预留并记实际花费（同一临界区内完成）
    pub fn commit(&self, reservation: Reservation, actual_cost: f64, path: &str) {
        let mut state = self.state.lock();
        state.reservations.remove(&reservation.id);
        self.record_locked(&mut state, actual_cost, path, Utc::now());
    }

    /// 调用失败时归还预留
    pub fn release(&self, reservation: Reservation) {
        self.state.lock().reservations.remove(&reservation.id);
    }

    fn record_locked(&self, state: &mut LedgerState, amount: f64, path: &str, at: DateTime<Utc>) {
        let amount = amount.max(0.0);
        if let Err(e) = self.store.with_conn(|c| {
            c.execute(
                "INSERT INTO spend_events (amount, path, at) VALUES (?1, ?2, ?3)",
                params![amount, path, at],
            )?;
            Ok(())
        }) {
            tracing::error!(error = %e, amount, path, "failed to persist spend event");
        }
        if at.date_naive() > state.day {
            state.roll(at);
        }
        if state.in_day(at) {
            state.day_spent += amount;
        }
        if state.in_month(at) {
            state.month_spent += amount;
        }
        tracing::debug!(amount, path, day_spent = state.day_spent, "spend recorded");
    }

    pub fn summary(&self, period: BudgetPeriod) -> Result<BudgetSummary, AgentError> {
        self.summary_at(period, Utc::now())
    }

    pub fn summary_at(
        &self,
        period: BudgetPeriod,
        now: DateTime<Utc>,
    ) -> Result<BudgetSummary, AgentError> {
        let (spent, limit, reserved) = match period {
            BudgetPeriod::Today | BudgetPeriod::Month => {
                let mut state = self.state.lock();
                state.roll(now);
                let reserved = state.reserved();
                if period == BudgetPeriod::Today {
                    (state.day_spent, Some(self.limits.daily_limit), reserved)
                } else {
                    (state.month_spent, Some(self.limits.monthly_limit), reserved)
                }
            }
            BudgetPeriod::All => {
                let total: f64 = self.store.with_conn(|c| {
                    Ok(c.query_row(
                        "SELECT COALESCE(SUM(amount), 0.0) FROM spend_events",
                        [],
                        |r| r.get(0),
                    )?)
                })?;
                (total, None, self.state.lock().reserved())
            }
        };
        let percentage_used = match limit {
            Some(l) if l > 0.0 => spent / l * 100.0,
            _ => 0.0,
        };
        Ok(BudgetSummary {
            period,
            spent,
            limit,
            percentage_used,
            reserved,
        })
    }

    /// 使用率超过 warn_ratio 的提示
    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        for period in [BudgetPeriod::Today, BudgetPeriod::Month] {
            if let Ok(s) = self.summary(period) {
                if s.percentage_used >= self.limits.warn_ratio * 100.0 {
                    out.push(format!(
                        "{:?} spend at {:.0}% of limit ({:.2} / {:.2})",
                        period,
                        s.percentage_used,
                        s.spent,
                        s.limit.unwrap_or_default()
                    ));
                }
            }
        }
        out
    }

    /// 指定时间之后的账本事件（审计）
    pub fn events_since(&self, since: DateTime<Utc>) -> Result<Vec<SpendEvent>, AgentError> {
        self.store.with_conn(|c| {
            let mut stmt = c.prepare(
                "SELECT amount, path, at FROM spend_events WHERE at >= ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![since], |r| {
                Ok(SpendEvent {
                    amount: r.get(0)?,
                    path: r.get(1)?,
                    at: r.get(2)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }
}

fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let first = NaiveDate::from_ymd_opt(now.year(), now.month(), 1).unwrap_or(now.date_naive());
    Utc.from_utc_datetime(&first.and_time(chrono::NaiveTime::MIN))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(daily: f64, monthly: f64) -> BudgetLedger {
        let store = Arc::new(Store::open_in_memory().unwrap());
        BudgetLedger::open(
            store,
            BudgetSection {
                daily_limit: daily,
                monthly_limit: monthly,
                warn_ratio: 0.8,
            },
        )
        .unwrap()
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_denies_after_two_recorded_events() {
        let l = ledger(1.0, 100.0);
        let now = Utc::now();
        l.record(0.60, "costly", now);
        l.record(0.60, "costly", now);
        match l.authorize(0.50) {
            BudgetDecision::Deny(DenyReason::DailyLimit { .. }) => {}
            other => panic!("expected daily deny, got {other:?}"),
        }
    }

    #[test]
    fn test_record_is_never_blocked() {
        let l = ledger(0.10, 100.0);
        l.record(5.0, "costly", Utc::now());
        let s = l.summary(BudgetPeriod::Today).unwrap();
        assert!((s.spent - 5.0).abs() < 1e-9);
        assert!(s.percentage_used > 100.0);
    }

    #[test]
    fn test_reservations_count_until_released() {
        let l = ledger(1.0, 100.0);
        let first = match l.authorize(0.7) {
            BudgetDecision::Allow(r) => r,
            other => panic!("{other:?}"),
        };
        assert!(matches!(l.authorize(0.5), BudgetDecision::Deny(_)));
        l.release(first);
        assert!(matches!(l.authorize(0.5), BudgetDecision::Allow(_)));
    }

    #[test]
    fn test_commit_replaces_estimate_with_actual() {
        let l = ledger(1.0, 100.0);
        let r = match l.authorize(0.9) {
            BudgetDecision::Allow(r) => r,
            other => panic!("{other:?}"),
        };
        l.commit(r, 0.2, "costly");
        let s = l.summary(BudgetPeriod::Today).unwrap();
        assert!((s.spent - 0.2).abs() < 1e-9);
        assert_eq!(s.reserved, 0.0);
        assert!(matches!(l.authorize(0.8), BudgetDecision::Allow(_)));
    }

    #[test]
    fn test_monthly_limit_applies() {
        let l = ledger(100.0, 1.0);
        l.record(0.9, "costly", Utc::now());
        assert!(matches!(
            l.authorize(0.2),
            BudgetDecision::Deny(DenyReason::MonthlyLimit { .. })
        ));
    }

    #[test]
    fn test_daily_rollover_keeps_history() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let limits = BudgetSection {
            daily_limit: 1.0,
            monthly_limit: 100.0,
            warn_ratio: 0.8,
        };
        let day1 = at(2024, 3, 10, 12);
        let l = BudgetLedger::open_at(store, limits, day1).unwrap();
        l.record(0.9, "costly", day1);
        assert!(matches!(l.authorize_at(0.5, day1), BudgetDecision::Deny(_)));

        let day2 = at(2024, 3, 11, 1);
        match l.authorize_at(0.5, day2) {
            BudgetDecision::Allow(r) => l.release(r),
            other => panic!("{other:?}"),
        }
        let month = l.summary_at(BudgetPeriod::Month, day2).unwrap();
        assert!((month.spent - 0.9).abs() < 1e-9);
        let today = l.summary_at(BudgetPeriod::Today, day2).unwrap();
        assert_eq!(today.spent, 0.0);
        assert_eq!(l.events_since(day1).unwrap().len(), 1);
    }

    #[test]
    fn test_totals_restored_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.db");
        let limits = BudgetSection::default();
        {
            let store = Arc::new(Store::open(&path).unwrap());
            let l = BudgetLedger::open(store, limits.clone()).unwrap();
            l.record(1.25, "costly", Utc::now());
        }
        let store = Arc::new(Store::open(&path).unwrap());
        let l = BudgetLedger::open(store, limits).unwrap();
        let s = l.summary(BudgetPeriod::Today).unwrap();
        assert!((s.spent - 1.25).abs() < 1e-9);
        assert!((l.summary(BudgetPeriod::All).unwrap().spent - 1.25).abs() < 1e-9);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_authorizations_never_overspend() {
        let l = Arc::new(ledger(1.0, 100.0));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let l = l.clone();
            handles.push(tokio::spawn(async move {
                match l.authorize(0.3) {
                    BudgetDecision::Allow(r) => {
                        l.commit(r, 0.3, "costly");
                        true
                    }
                    BudgetDecision::Deny(_) => false,
                }
            }));
        }
        let mut allowed = 0;
        for h in handles {
            if h.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 3);
        let s = l.summary(BudgetPeriod::Today).unwrap();
        assert!(s.spent <= 1.0 + 1e-9);
    }

    #[test]
    fn test_warnings_above_ratio() {
        let l = ledger(1.0, 100.0);
        assert!(l.warnings().is_empty());
        l.record(0.85, "costly", Utc::now());
        let w = l.warnings();
        assert_eq!(w.len(), 1);
        assert!(w[0].starts_with("Today"));
    }
}
