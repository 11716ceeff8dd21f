//! 周期历史：每个周期结束时追加一条摘要（cycle_history 表）

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::store::Store;

/// 周期结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// 前台活动
    Activity,
    Shutdown,
    TimeCap,
    CostCap,
    TaskCap,
    NoEligibleTask,
    Error,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::Activity => "activity",
            StopReason::Shutdown => "shutdown",
            StopReason::TimeCap => "time_cap",
            StopReason::CostCap => "cost_cap",
            StopReason::TaskCap => "task_cap",
            StopReason::NoEligibleTask => "no_eligible_task",
            StopReason::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub goals_decomposed: usize,
    pub tasks_touched: Vec<String>,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub cost: f64,
    pub stop_reason: StopReason,
}

pub struct CycleHistory {
    store: Arc<Store>,
}

impl CycleHistory {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn append(&self, summary: &CycleSummary) -> Result<i64, AgentError> {
        let payload = serde_json::to_string(summary)?;
        self.store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO cycle_history (started_at, payload) VALUES (?1, ?2)",
                params![summary.started_at, payload],
            )?;
            Ok(tx.last_insert_rowid())
        })
    }

    /// 最近 n 条，最新的在前
    pub fn recent(&self, n: usize) -> Result<Vec<CycleSummary>, AgentError> {
        let payloads: Vec<String> = self.store.with_conn(|c| {
            let mut stmt = c.prepare("SELECT payload FROM cycle_history ORDER BY id DESC LIMIT ?1")?;
            let rows = stmt.query_map(params![n as i64], |r| r.get::<_, String>(0))?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })?;
        payloads
            .iter()
            .map(|p| serde_json::from_str(p).map_err(AgentError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(cost: f64, reason: StopReason) -> CycleSummary {
        CycleSummary {
            started_at: Utc::now(),
            duration_ms: 1200,
            goals_decomposed: 1,
            tasks_touched: vec!["task_a".into()],
            tasks_completed: 1,
            tasks_failed: 0,
            cost,
            stop_reason: reason,
        }
    }

    #[test]
    fn test_recent_is_newest_first_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.db");
        {
            let history = CycleHistory::new(Arc::new(Store::open(&path).unwrap()));
            history.append(&summary(0.1, StopReason::NoEligibleTask)).unwrap();
            history.append(&summary(0.2, StopReason::Activity)).unwrap();
        }
        let history = CycleHistory::new(Arc::new(Store::open(&path).unwrap()));
        let recent = history.recent(5).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].stop_reason, StopReason::Activity);
        assert_eq!(history.recent(1).unwrap().len(), 1);
    }
}
