//! 状态投影：调度阶段、当前周期统计、操作员告警
//!
//! 只有预算授权拒绝与目标反复分解失败会进入 AlertLog，其余失败只记录到日志与任务结果。

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// 空闲调度器阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerPhase {
    Idle,
    Cycling,
}

/// 正在运行的周期的实时统计
#[derive(Clone, Debug, Default, Serialize)]
pub struct CycleStats {
    pub started_at: Option<DateTime<Utc>>,
    pub goals_decomposed: usize,
    pub tasks_touched: Vec<String>,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub cost: f64,
    pub current_task: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    BudgetDenied,
    DecompositionReview,
}

#[derive(Clone, Debug, Serialize)]
pub struct Alert {
    pub at: DateTime<Utc>,
    pub kind: AlertKind,
    pub message: String,
}

/// 有界告警队列，超出容量丢弃最旧的
#[derive(Debug)]
pub struct AlertLog {
    entries: Mutex<VecDeque<Alert>>,
    capacity: usize,
}

impl AlertLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, kind: AlertKind, message: impl Into<String>) {
        let alert = Alert {
            at: Utc::now(),
            kind,
            message: message.into(),
        };
        tracing::warn!(kind = ?alert.kind, message = %alert.message, "operator alert");
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(alert);
    }

    /// 最新的在后
    pub fn recent(&self) -> Vec<Alert> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn count(&self, kind: AlertKind) -> usize {
        self.entries.lock().iter().filter(|a| a.kind == kind).count()
    }
}

impl Default for AlertLog {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_log_is_bounded() {
        let log = AlertLog::new(2);
        log.push(AlertKind::BudgetDenied, "a");
        log.push(AlertKind::DecompositionReview, "b");
        log.push(AlertKind::BudgetDenied, "c");
        let recent = log.recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "b");
        assert_eq!(log.count(AlertKind::BudgetDenied), 1);
    }
}
