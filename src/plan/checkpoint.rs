//! 执行断点：每步之后写入，进程重启后据此续跑
//!
//! 每个任务至多一条断点（task_id 为主键，写入即 upsert）；任务完成或放弃时删除。
//! 超过 max_age 的断点在读取时丢弃。

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::plan::step::Step;
use crate::store::Store;

/// 一个已完成步骤的记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub step: Step,
    pub ok: bool,
    pub output: String,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task_id: String,
    pub steps: Vec<StepRecord>,
    pub cost: f64,
    /// 写入过的工作区文件（验证阶段回读）
    pub artifacts: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            steps: Vec::new(),
            cost: 0.0,
            artifacts: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// 下一个待执行步骤的下标
    pub fn next_step(&self) -> usize {
        self.steps.len()
    }

    pub fn is_done(&self) -> bool {
        matches!(self.steps.last(), Some(r) if matches!(r.step, Step::Done { .. }))
    }

    pub fn summary(&self) -> Option<&str> {
        self.steps.iter().rev().find_map(|r| match &r.step {
            Step::Done { summary } => Some(summary.as_str()),
            _ => None,
        })
    }

    pub fn add_artifact(&mut self, path: String) {
        if !self.artifacts.contains(&path) {
            self.artifacts.push(path);
        }
    }
}

pub struct CheckpointStore {
    store: Arc<Store>,
    max_age: ChronoDuration,
}

impl CheckpointStore {
    pub fn new(store: Arc<Store>, max_age_hours: i64) -> Self {
        Self {
            store,
            max_age: ChronoDuration::hours(max_age_hours.max(1)),
        }
    }

    pub fn save(&self, checkpoint: &mut Checkpoint) -> Result<(), AgentError> {
        checkpoint.updated_at = Utc::now();
        let payload = serde_json::to_string(checkpoint)?;
        self.store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO checkpoints (task_id, payload, updated_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(task_id) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
                params![checkpoint.task_id, payload, checkpoint.updated_at],
            )?;
            Ok(())
        })?;
        tracing::debug!(
            task_id = %checkpoint.task_id,
            steps = checkpoint.steps.len(),
            cost = checkpoint.cost,
            "checkpoint saved"
        );
        Ok(())
    }

    /// 读取断点；过期的直接删除并返回 None
    pub fn load(&self, task_id: &str) -> Result<Option<Checkpoint>, AgentError> {
        let payload: Option<String> = self.store.with_conn(|c| {
            Ok(c.query_row(
                "SELECT payload FROM checkpoints WHERE task_id = ?1",
                params![task_id],
                |r| r.get(0),
            )
            .optional()?)
        })?;
        let Some(payload) = payload else {
            return Ok(None);
        };
        let checkpoint: Checkpoint = serde_json::from_str(&payload)?;
        if Utc::now() - checkpoint.updated_at > self.max_age {
            tracing::info!(task_id, "discarding expired checkpoint");
            self.delete(task_id)?;
            return Ok(None);
        }
        Ok(Some(checkpoint))
    }

    pub fn delete(&self, task_id: &str) -> Result<bool, AgentError> {
        let n = self.store.with_tx(|tx| {
            Ok(tx.execute("DELETE FROM checkpoints WHERE task_id = ?1", params![task_id])?)
        })?;
        Ok(n > 0)
    }

    pub fn list(&self) -> Result<Vec<Checkpoint>, AgentError> {
        let payloads: Vec<String> = self.store.with_conn(|c| {
            let mut stmt = c.prepare("SELECT payload FROM checkpoints ORDER BY updated_at ASC")?;
            let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })?;
        payloads
            .iter()
            .map(|p| serde_json::from_str(p).map_err(AgentError::from))
            .collect()
    }

    /// 启动时清理过期断点
    pub fn discard_stale(&self) -> Result<usize, AgentError> {
        let cutoff = Utc::now() - self.max_age;
        let n = self.store.with_tx(|tx| {
            Ok(tx.execute("DELETE FROM checkpoints WHERE updated_at < ?1", params![cutoff])?)
        })?;
        if n > 0 {
            tracing::info!(count = n, "discarded stale checkpoints");
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(i: usize) -> StepRecord {
        StepRecord {
            index: i,
            step: Step::Think {
                note: format!("n{i}"),
            },
            ok: true,
            output: String::new(),
            cost: 0.01,
        }
    }

    #[test]
    fn test_save_is_upsert_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.db");
        {
            let cps = CheckpointStore::new(Arc::new(Store::open(&path).unwrap()), 24);
            let mut cp = Checkpoint::new("task_1");
            cp.steps.push(record(0));
            cps.save(&mut cp).unwrap();
            cp.steps.push(record(1));
            cp.add_artifact("a.md".into());
            cp.add_artifact("a.md".into());
            cps.save(&mut cp).unwrap();
            assert_eq!(cps.list().unwrap().len(), 1);
        }
        let cps = CheckpointStore::new(Arc::new(Store::open(&path).unwrap()), 24);
        let cp = cps.load("task_1").unwrap().unwrap();
        assert_eq!(cp.next_step(), 2);
        assert_eq!(cp.artifacts, vec!["a.md".to_string()]);
        assert!(cps.delete("task_1").unwrap());
        assert!(cps.load("task_1").unwrap().is_none());
    }

    #[test]
    fn test_expired_checkpoint_is_discarded() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cps = CheckpointStore::new(store.clone(), 24);
        let mut cp = Checkpoint::new("task_old");
        cp.updated_at = Utc::now() - ChronoDuration::hours(30);
        let payload = serde_json::to_string(&cp).unwrap();
        store
            .with_conn(|c| {
                c.execute(
                    "INSERT INTO checkpoints (task_id, payload, updated_at) VALUES (?1, ?2, ?3)",
                    params![cp.task_id, payload, cp.updated_at],
                )?;
                Ok(())
            })
            .unwrap();
        assert!(cps.load("task_old").unwrap().is_none());
        assert!(cps.list().unwrap().is_empty());
    }

    #[test]
    fn test_done_detection() {
        let mut cp = Checkpoint::new("t");
        assert!(!cp.is_done());
        cp.steps.push(StepRecord {
            index: 0,
            step: Step::Done {
                summary: "finished".into(),
            },
            ok: true,
            output: "finished".into(),
            cost: 0.0,
        });
        assert!(cp.is_done());
        assert_eq!(cp.summary(), Some("finished"));
    }
}
