//! 目标存储：目标 / 任务的持久化、分解、优先级选择与生命周期
//!
//! 所有变更在一个事务内完成：先读出当前状态与 version，校验迁移是否合法，
//! 再以 `UPDATE ... WHERE id = ? AND version = ?` 写回；version 不符说明被并发修改，
//! 返回 InvalidStateTransition 且不改动任何数据。
//! 同一目标的分解由每目标一把异步锁串行化，已有任务时直接返回现有任务 id。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use uuid::Uuid;

use crate::config::GoalsSection;
use crate::core::{AgentError, AlertKind, AlertLog};
use crate::goals::decompose::{build_prompt, parse_tasks};
use crate::goals::types::{
    Goal, GoalId, GoalProgress, GoalStatus, Task, TaskId, TaskStatus, MAX_PRIORITY, MIN_PRIORITY,
};
use crate::router::{Dispatch, WorkRequest};
use crate::store::Store;

const GOAL_COLS: &str = "id, description, intent, priority, status, created_at, touched_at, \
                         decomposition_failures, needs_review, version";
const TASK_COLS: &str = "id, goal_id, ordinal, description, dependencies, priority, estimated_minutes, \
                         status, result, failure_reason, retry_count, created_at, updated_at, version";

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "to", "for", "in", "of", "on", "with", "is", "by",
];
const DUPLICATE_JACCARD: f64 = 0.6;

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn goal_from_row(row: &Row<'_>) -> rusqlite::Result<Goal> {
    let status: String = row.get(4)?;
    Ok(Goal {
        id: row.get(0)?,
        description: row.get(1)?,
        intent: row.get(2)?,
        priority: row.get(3)?,
        status: GoalStatus::parse(&status)
            .ok_or_else(|| conversion_error(4, format!("unknown goal status {status}")))?,
        created_at: row.get(5)?,
        touched_at: row.get(6)?,
        decomposition_failures: row.get(7)?,
        needs_review: row.get(8)?,
        version: row.get(9)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let deps: String = row.get(4)?;
    let status: String = row.get(7)?;
    Ok(Task {
        id: row.get(0)?,
        goal_id: row.get(1)?,
        ordinal: row.get(2)?,
        description: row.get(3)?,
        dependencies: serde_json::from_str(&deps)
            .map_err(|e| conversion_error(4, format!("bad dependency list: {e}")))?,
        priority: row.get(5)?,
        estimated_minutes: row.get(6)?,
        status: TaskStatus::parse(&status)
            .ok_or_else(|| conversion_error(7, format!("unknown task status {status}")))?,
        result: row.get(8)?,
        failure_reason: row.get(9)?,
        retry_count: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
        version: row.get(13)?,
    })
}

fn load_goal(conn: &Connection, id: &str) -> Result<Goal, AgentError> {
    conn.query_row(
        &format!("SELECT {GOAL_COLS} FROM goals WHERE id = ?1"),
        params![id],
        goal_from_row,
    )
    .optional()?
    .ok_or_else(|| AgentError::NotFound(format!("goal {id}")))
}

fn load_task(conn: &Connection, id: &str) -> Result<Task, AgentError> {
    conn.query_row(
        &format!("SELECT {TASK_COLS} FROM tasks WHERE id = ?1"),
        params![id],
        task_from_row,
    )
    .optional()?
    .ok_or_else(|| AgentError::NotFound(format!("task {id}")))
}

fn load_tasks(conn: &Connection, goal_id: &str) -> Result<Vec<Task>, AgentError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TASK_COLS} FROM tasks WHERE goal_id = ?1 ORDER BY ordinal ASC"
    ))?;
    let rows = stmt.query_map(params![goal_id], task_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn touch_goal(tx: &Transaction<'_>, goal_id: &str, now: DateTime<Utc>) -> Result<(), AgentError> {
    tx.execute(
        "UPDATE goals SET touched_at = ?1 WHERE id = ?2",
        params![now, goal_id],
    )?;
    Ok(())
}

/// 目标的状态迁移（带 version 检查）
fn set_goal_status(tx: &Transaction<'_>, goal: &Goal, to: GoalStatus, now: DateTime<Utc>) -> Result<(), AgentError> {
    if !goal.status.can_transition_to(to) {
        return Err(AgentError::InvalidStateTransition {
            entity: "goal",
            id: goal.id.clone(),
            from: goal.status.to_string(),
            to: to.to_string(),
        });
    }
    let changed = tx.execute(
        "UPDATE goals SET status = ?1, touched_at = ?2, version = version + 1 WHERE id = ?3 AND version = ?4",
        params![to.as_str(), now, goal.id, goal.version],
    )?;
    if changed == 0 {
        return Err(AgentError::InvalidStateTransition {
            entity: "goal",
            id: goal.id.clone(),
            from: format!("{} (stale read)", goal.status),
            to: to.to_string(),
        });
    }
    Ok(())
}

/// 关闭目标下尚未结束的任务并删除其断点
fn close_open_tasks(tx: &Transaction<'_>, goal_id: &str, reason: &str, now: DateTime<Utc>) -> Result<usize, AgentError> {
    tx.execute(
        "DELETE FROM checkpoints WHERE task_id IN (SELECT id FROM tasks WHERE goal_id = ?1)",
        params![goal_id],
    )?;
    let closed = tx.execute(
        "UPDATE tasks SET status = 'failed', failure_reason = ?1, updated_at = ?2, version = version + 1 \
         WHERE goal_id = ?3 AND status IN ('pending', 'in_progress')",
        params![reason, now, goal_id],
    )?;
    Ok(closed)
}

fn normalized_words(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|w| w.to_string())
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

fn is_duplicate(a: &str, b: &str) -> bool {
    if a.contains(b) || b.contains(a) {
        return true;
    }
    let wa = normalized_words(a);
    let wb = normalized_words(b);
    if wa.is_empty() || wb.is_empty() {
        return false;
    }
    let overlap = wa.intersection(&wb).count() as f64;
    let union = wa.union(&wb).count() as f64;
    overlap / union > DUPLICATE_JACCARD
}

pub struct GoalStore {
    store: Arc<Store>,
    config: GoalsSection,
    alerts: Arc<AlertLog>,
    decompose_locks: Mutex<HashMap<GoalId, Arc<tokio::sync::Mutex<()>>>>,
}

impl GoalStore {
    pub fn new(store: Arc<Store>, config: GoalsSection, alerts: Arc<AlertLog>) -> Self {
        Self {
            store,
            config,
            alerts,
            decompose_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &GoalsSection {
        &self.config
    }

    /// 创建目标，优先级钳制到 1-10，状态为 active
    pub fn create_goal(&self, description: &str, intent: &str, priority: i64) -> Result<GoalId, AgentError> {
        let id = format!("goal_{}", Uuid::new_v4().simple());
        let priority = priority.clamp(MIN_PRIORITY as i64, MAX_PRIORITY as i64) as u8;
        let now = Utc::now();
        self.store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO goals (id, description, intent, priority, status, created_at, touched_at) \
                 VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?5)",
                params![id, description.trim(), intent.trim(), priority, now],
            )?;
            Ok(())
        })?;
        tracing::info!(goal_id = %id, priority, "goal created");
        Ok(id)
    }

    pub fn get_goal(&self, id: &str) -> Result<Goal, AgentError> {
        self.store.with_conn(|c| load_goal(c, id))
    }

    pub fn get_task(&self, id: &str) -> Result<Task, AgentError> {
        self.store.with_conn(|c| load_task(c, id))
    }

    /// 按优先级降序、创建时间升序列出目标；status 为 None 时列出全部
    pub fn list_goals(&self, status: Option<GoalStatus>) -> Result<Vec<Goal>, AgentError> {
        self.store.with_conn(|c| {
            let sql = format!(
                "SELECT {GOAL_COLS} FROM goals WHERE (?1 IS NULL OR status = ?1) \
                 ORDER BY priority DESC, created_at ASC"
            );
            let mut stmt = c.prepare(&sql)?;
            let rows = stmt.query_map(params![status.map(|s| s.as_str())], goal_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn list_tasks(&self, goal_id: &str) -> Result<Vec<Task>, AgentError> {
        self.store.with_conn(|c| {
            load_goal(c, goal_id)?;
            load_tasks(c, goal_id)
        })
    }

    pub fn goal_progress(&self, goal_id: &str) -> Result<GoalProgress, AgentError> {
        let tasks = self.list_tasks(goal_id)?;
        let mut progress = GoalProgress {
            total: tasks.len(),
            ..Default::default()
        };
        for t in &tasks {
            match t.status {
                TaskStatus::Pending => progress.pending += 1,
                TaskStatus::InProgress => progress.in_progress += 1,
                TaskStatus::Completed => progress.completed += 1,
                TaskStatus::Failed => progress.failed += 1,
            }
        }
        Ok(progress)
    }

    /// 尚未分解、未转人工复核的 active 目标
    pub fn undecomposed_goals(&self, limit: usize) -> Result<Vec<Goal>, AgentError> {
        self.store.with_conn(|c| {
            let sql = format!(
                "SELECT {GOAL_COLS} FROM goals g WHERE status = 'active' AND needs_review = 0 \
                 AND NOT EXISTS (SELECT 1 FROM tasks t WHERE t.goal_id = g.id) \
                 ORDER BY priority DESC, created_at ASC LIMIT ?1"
            );
            let mut stmt = c.prepare(&sql)?;
            let rows = stmt.query_map(params![limit as i64], goal_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    fn decompose_lock(&self, goal_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.decompose_locks
            .lock()
            .entry(goal_id.to_string())
            .or_default()
            .clone()
    }

    /// 调用一次调度器把目标拆成 min_tasks..=max_tasks 个任务；要么全部写入，要么一个都不写
    pub async fn decompose(&self, goal_id: &str, dispatcher: &dyn Dispatch) -> Result<Vec<TaskId>, AgentError> {
        let lock = self.decompose_lock(goal_id);
        let _guard = lock.lock().await;

        let goal = self.get_goal(goal_id)?;
        if matches!(goal.status, GoalStatus::Completed | GoalStatus::Abandoned) {
            return Err(AgentError::Decomposition {
                goal_id: goal_id.to_string(),
                reason: format!("goal is {}", goal.status),
            });
        }
        let existing = self.list_tasks(goal_id)?;
        if !existing.is_empty() {
            tracing::debug!(goal_id, tasks = existing.len(), "goal already decomposed");
            return Ok(existing.into_iter().map(|t| t.id).collect());
        }

        tracing::info!(goal_id, description = %goal.description, "decomposing goal");
        let prompt = build_prompt(&goal, self.config.min_tasks, self.config.max_tasks);
        let outcome = match dispatcher.dispatch(WorkRequest::background(prompt).strict().uncached()).await {
            Ok(o) => o,
            Err(e) => return Err(self.decomposition_failed(goal_id, e.to_string())),
        };
        let drafts = match parse_tasks(&outcome.text, self.config.min_tasks, self.config.max_tasks) {
            Ok(d) => d,
            Err(reason) => return Err(self.decomposition_failed(goal_id, reason)),
        };

        let now = Utc::now();
        let ids: Vec<TaskId> = drafts
            .iter()
            .map(|_| format!("task_{}", Uuid::new_v4().simple()))
            .collect();
        self.store.with_tx(|tx| {
            for (ordinal, (draft, id)) in drafts.iter().zip(&ids).enumerate() {
                let deps: Vec<&TaskId> = draft.dependencies.iter().map(|d| &ids[*d]).collect();
                tx.execute(
                    "INSERT INTO tasks (id, goal_id, ordinal, description, dependencies, priority, \
                     estimated_minutes, status, retry_count, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', 0, ?8, ?8)",
                    params![
                        id,
                        goal_id,
                        ordinal as u32,
                        draft.description,
                        serde_json::to_string(&deps)?,
                        draft.priority,
                        draft.estimated_minutes,
                        now
                    ],
                )?;
            }
            tx.execute(
                "UPDATE goals SET touched_at = ?1, version = version + 1 WHERE id = ?2",
                params![now, goal_id],
            )?;
            Ok(())
        })?;
        tracing::info!(goal_id, tasks = ids.len(), cost = outcome.cost, "goal decomposed");
        Ok(ids)
    }

    /// 记一次分解失败；达到上限时转人工复核并写入操作员告警
    fn decomposition_failed(&self, goal_id: &str, reason: String) -> AgentError {
        let max = self.config.max_decomposition_failures;
        let recorded = self.store.with_tx(|tx| {
            tx.execute(
                "UPDATE goals SET decomposition_failures = decomposition_failures + 1, \
                 needs_review = (decomposition_failures + 1 >= ?1), version = version + 1 WHERE id = ?2",
                params![max, goal_id],
            )?;
            let g = load_goal(tx, goal_id)?;
            Ok((g.decomposition_failures, g.needs_review))
        });
        match recorded {
            Ok((failures, needs_review)) => {
                tracing::warn!(goal_id, failures, reason = %reason, "decomposition failed");
                if needs_review && failures == max {
                    self.alerts.push(
                        AlertKind::DecompositionReview,
                        format!("goal {goal_id} failed decomposition {failures} times: {reason}"),
                    );
                }
            }
            Err(e) => tracing::error!(goal_id, error = %e, "failed to record decomposition failure"),
        }
        AgentError::Decomposition {
            goal_id: goal_id.to_string(),
            reason,
        }
    }

    /// 在 active 目标的 pending 任务中选择依赖已满足者：目标优先级最高，其次任务创建最早。
    /// max_priority_goals 限制只考虑优先级最高的前 N 个 active 目标
    pub fn next_eligible_task(&self, max_priority_goals: Option<usize>) -> Result<Option<TaskId>, AgentError> {
        self.store.with_conn(|c| {
            let allowed: Option<HashSet<String>> = match max_priority_goals {
                Some(n) => {
                    let mut stmt = c.prepare(
                        "SELECT id FROM goals WHERE status = 'active' \
                         ORDER BY priority DESC, created_at ASC LIMIT ?1",
                    )?;
                    let ids = stmt.query_map(params![n as i64], |r| r.get::<_, String>(0))?;
                    Some(ids.collect::<Result<HashSet<_>, _>>()?)
                }
                None => None,
            };

            let mut stmt = c.prepare(
                "SELECT t.id, t.goal_id, t.dependencies FROM tasks t JOIN goals g ON g.id = t.goal_id \
                 WHERE t.status = 'pending' AND g.status = 'active' \
                 ORDER BY g.priority DESC, t.created_at ASC, t.ordinal ASC",
            )?;
            let candidates = stmt
                .query_map([], |r| {
                    Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut done_stmt = c.prepare("SELECT id FROM tasks WHERE status = 'completed'")?;
            let completed = done_stmt
                .query_map([], |r| r.get::<_, String>(0))?
                .collect::<Result<HashSet<_>, _>>()?;

            for (task_id, goal_id, deps) in candidates {
                if let Some(allowed) = &allowed {
                    if !allowed.contains(&goal_id) {
                        continue;
                    }
                }
                let deps: Vec<String> = serde_json::from_str(&deps)?;
                if deps.iter().all(|d| completed.contains(d)) {
                    return Ok(Some(task_id));
                }
            }
            Ok(None)
        })
    }

    /// 通用任务迁移：校验合法性与 version，extra 在同一事务内做附加写入
    fn transition_task(
        &self,
        task_id: &str,
        to: TaskStatus,
        extra: impl FnOnce(&Transaction<'_>, &Task) -> Result<(), AgentError>,
    ) -> Result<Task, AgentError> {
        let now = Utc::now();
        let updated = self.store.with_tx(|tx| {
            let task = load_task(tx, task_id)?;
            if !task.status.can_transition_to(to) {
                return Err(AgentError::InvalidStateTransition {
                    entity: "task",
                    id: task_id.to_string(),
                    from: task.status.to_string(),
                    to: to.to_string(),
                });
            }
            let changed = tx.execute(
                "UPDATE tasks SET status = ?1, updated_at = ?2, version = version + 1 \
                 WHERE id = ?3 AND version = ?4",
                params![to.as_str(), now, task_id, task.version],
            )?;
            if changed == 0 {
                return Err(AgentError::InvalidStateTransition {
                    entity: "task",
                    id: task_id.to_string(),
                    from: format!("{} (stale read)", task.status),
                    to: to.to_string(),
                });
            }
            extra(tx, &task)?;
            touch_goal(tx, &task.goal_id, now)?;
            load_task(tx, task_id)
        });
        match &updated {
            Ok(t) => tracing::debug!(task_id, goal_id = %t.goal_id, status = %to, "task transition"),
            Err(e) => tracing::warn!(task_id, to = %to, error = %e, "task transition rejected"),
        }
        updated
    }

    pub fn start_task(&self, task_id: &str) -> Result<Task, AgentError> {
        self.transition_task(task_id, TaskStatus::InProgress, |_, _| Ok(()))
    }

    /// 完成任务并删除断点；目标下全部任务完成时目标自动完成
    pub fn complete_task(&self, task_id: &str, result: &str) -> Result<Task, AgentError> {
        let task = self.transition_task(task_id, TaskStatus::Completed, |tx, task| {
            tx.execute(
                "UPDATE tasks SET result = ?1, failure_reason = NULL WHERE id = ?2",
                params![result, task.id],
            )?;
            tx.execute("DELETE FROM checkpoints WHERE task_id = ?1", params![task.id])?;
            let open: i64 = tx.query_row(
                "SELECT COUNT(*) FROM tasks WHERE goal_id = ?1 AND status != 'completed'",
                params![task.goal_id],
                |r| r.get(0),
            )?;
            if open == 0 {
                let goal = load_goal(tx, &task.goal_id)?;
                if goal.status.can_transition_to(GoalStatus::Completed) {
                    set_goal_status(tx, &goal, GoalStatus::Completed, Utc::now())?;
                    tracing::info!(goal_id = %goal.id, "all tasks completed, goal completed");
                }
            }
            Ok(())
        })?;
        tracing::info!(task_id, goal_id = %task.goal_id, "task completed");
        Ok(task)
    }

    pub fn fail_task(&self, task_id: &str, reason: &str) -> Result<Task, AgentError> {
        let task = self.transition_task(task_id, TaskStatus::Failed, |tx, task| {
            tx.execute(
                "UPDATE tasks SET failure_reason = ?1 WHERE id = ?2",
                params![reason, task.id],
            )?;
            tx.execute("DELETE FROM checkpoints WHERE task_id = ?1", params![task.id])?;
            Ok(())
        })?;
        tracing::warn!(task_id, goal_id = %task.goal_id, reason, "task failed");
        Ok(task)
    }

    /// in_progress → pending（中断或启动恢复），断点保留；failed 任务只能经 retry_task 回到 pending
    pub fn requeue_task(&self, task_id: &str) -> Result<Task, AgentError> {
        self.transition_task(task_id, TaskStatus::Pending, |_, task| {
            if task.status != TaskStatus::InProgress {
                return Err(AgentError::InvalidStateTransition {
                    entity: "task",
                    id: task.id.clone(),
                    from: task.status.to_string(),
                    to: "pending (requeue)".into(),
                });
            }
            Ok(())
        })
    }

    /// failed → pending，重试次数受 max_task_retries 限制
    pub fn retry_task(&self, task_id: &str) -> Result<Task, AgentError> {
        let max = self.config.max_task_retries;
        self.transition_task(task_id, TaskStatus::Pending, |tx, task| {
            if task.status != TaskStatus::Failed {
                return Err(AgentError::InvalidStateTransition {
                    entity: "task",
                    id: task.id.clone(),
                    from: task.status.to_string(),
                    to: "pending (retry)".into(),
                });
            }
            if task.retry_count >= max {
                return Err(AgentError::BudgetExceeded(format!(
                    "task {} exhausted {max} retries",
                    task.id
                )));
            }
            tx.execute(
                "UPDATE tasks SET retry_count = retry_count + 1, failure_reason = NULL WHERE id = ?1",
                params![task.id],
            )?;
            Ok(())
        })
    }

    /// 启动时把上次运行遗留的 in_progress 任务放回 pending
    pub fn recover_orphaned(&self) -> Result<Vec<TaskId>, AgentError> {
        let ids: Vec<TaskId> = self.store.with_conn(|c| {
            let mut stmt = c.prepare("SELECT id FROM tasks WHERE status = 'in_progress'")?;
            let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })?;
        let mut recovered = Vec::with_capacity(ids.len());
        for id in ids {
            match self.requeue_task(&id) {
                Ok(_) => recovered.push(id),
                Err(e) => tracing::warn!(task_id = %id, error = %e, "could not recover orphaned task"),
            }
        }
        if !recovered.is_empty() {
            tracing::info!(count = recovered.len(), "recovered orphaned tasks");
        }
        Ok(recovered)
    }

    pub fn mark_stale_goals(&self, age: ChronoDuration) -> Result<Vec<GoalId>, AgentError> {
        self.mark_stale_goals_at(age, Utc::now())
    }

    /// active 且 touched_at 早于 now - age 的目标转为 stale；不改动任务
    pub fn mark_stale_goals_at(&self, age: ChronoDuration, now: DateTime<Utc>) -> Result<Vec<GoalId>, AgentError> {
        let cutoff = now - age;
        let stale = self.store.with_tx(|tx| {
            let mut stmt = tx.prepare(&format!(
                "SELECT {GOAL_COLS} FROM goals WHERE status = 'active' AND touched_at < ?1"
            ))?;
            let goals = stmt
                .query_map(params![cutoff], goal_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            drop(stmt);
            let mut ids = Vec::with_capacity(goals.len());
            for goal in goals {
                let changed = tx.execute(
                    "UPDATE goals SET status = 'stale', version = version + 1 WHERE id = ?1 AND version = ?2",
                    params![goal.id, goal.version],
                )?;
                if changed == 1 {
                    ids.push(goal.id);
                }
            }
            Ok(ids)
        })?;
        if !stale.is_empty() {
            tracing::info!(count = stale.len(), "goals marked stale");
        }
        Ok(stale)
    }

    /// stale → active，同时清除复核标记与分解失败计数
    pub fn reactivate_goal(&self, goal_id: &str) -> Result<(), AgentError> {
        let now = Utc::now();
        self.store.with_tx(|tx| {
            let goal = load_goal(tx, goal_id)?;
            if goal.status == GoalStatus::Active {
                tx.execute(
                    "UPDATE goals SET needs_review = 0, decomposition_failures = 0, touched_at = ?1, \
                     version = version + 1 WHERE id = ?2",
                    params![now, goal_id],
                )?;
                return Ok(());
            }
            set_goal_status(tx, &goal, GoalStatus::Active, now)?;
            tx.execute(
                "UPDATE goals SET needs_review = 0, decomposition_failures = 0 WHERE id = ?1",
                params![goal_id],
            )?;
            Ok(())
        })?;
        tracing::info!(goal_id, "goal reactivated");
        Ok(())
    }

    pub fn complete_goal(&self, goal_id: &str) -> Result<(), AgentError> {
        self.close_goal(goal_id, GoalStatus::Completed, "goal completed")
    }

    /// 放弃目标：未结束的任务转 failed，断点删除
    pub fn abandon_goal(&self, goal_id: &str) -> Result<(), AgentError> {
        self.close_goal(goal_id, GoalStatus::Abandoned, "goal abandoned")
    }

    fn close_goal(&self, goal_id: &str, to: GoalStatus, reason: &str) -> Result<(), AgentError> {
        let now = Utc::now();
        let closed = self.store.with_tx(|tx| {
            let goal = load_goal(tx, goal_id)?;
            set_goal_status(tx, &goal, to, now)?;
            close_open_tasks(tx, goal_id, reason, now)
        })?;
        tracing::info!(goal_id, status = %to, closed_tasks = closed, "goal closed");
        Ok(())
    }

    /// 在 active 目标间去重：描述互相包含或词集 Jaccard > 0.6 视为重复，
    /// 保留优先级更高（其次更早）的一个；已分解的目标不会被放弃
    pub fn prune_duplicates(&self) -> Result<Vec<GoalId>, AgentError> {
        let goals = self.list_goals(Some(GoalStatus::Active))?;
        let decomposed: HashSet<GoalId> = self.store.with_conn(|c| {
            let mut stmt = c.prepare("SELECT DISTINCT goal_id FROM tasks")?;
            let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
            Ok(rows.collect::<Result<HashSet<_>, _>>()?)
        })?;

        let mut kept: Vec<String> = Vec::new();
        let mut pruned = Vec::new();
        for goal in goals {
            let desc = goal.description.to_lowercase().trim().to_string();
            let dup = kept.iter().any(|k| is_duplicate(&desc, k));
            if dup && !decomposed.contains(&goal.id) {
                self.abandon_goal(&goal.id)?;
                pruned.push(goal.id);
            } else {
                kept.push(desc);
            }
        }
        if !pruned.is_empty() {
            tracing::info!(count = pruned.len(), "pruned duplicate goals");
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Mode;
    use crate::router::{Complexity, DispatchOutcome, ExecutionPath};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 固定返回同一文本的调度器
    struct Scripted {
        text: String,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(text: &str) -> Self {
            Self {
                text: text.to_string(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Dispatch for Scripted {
        async fn dispatch(&self, request: WorkRequest) -> Result<DispatchOutcome, AgentError> {
            assert_eq!(request.mode, Mode::Background);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(DispatchOutcome {
                text: self.text.clone(),
                confidence: 0.9,
                cost: 0.0,
                path: ExecutionPath::Cheap,
                degraded: false,
                complexity: Complexity::Simple,
            })
        }
    }

    struct Down;

    #[async_trait]
    impl Dispatch for Down {
        async fn dispatch(&self, _request: WorkRequest) -> Result<DispatchOutcome, AgentError> {
            Err(AgentError::Network("offline".into()))
        }
    }

    fn store() -> (GoalStore, Arc<AlertLog>) {
        let alerts = Arc::new(AlertLog::default());
        let s = GoalStore::new(
            Arc::new(Store::open_in_memory().unwrap()),
            GoalsSection::default(),
            alerts.clone(),
        );
        (s, alerts)
    }

    const THREE: &str = r#"[
        {"description": "gather", "dependencies": []},
        {"description": "draft", "dependencies": [0]},
        {"description": "polish", "dependencies": [1]}
    ]"#;

    #[tokio::test]
    async fn test_decompose_stores_tasks_with_dependencies() {
        let (s, _) = store();
        let g = s.create_goal("write a report", "learn things", 7).unwrap();
        let ids = s.decompose(&g, &Scripted::new(THREE)).await.unwrap();
        assert_eq!(ids.len(), 3);
        let tasks = s.list_tasks(&g).unwrap();
        assert_eq!(tasks[1].dependencies, vec![ids[0].clone()]);
        assert_eq!(tasks[2].dependencies, vec![ids[1].clone()]);
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Pending));
    }

    #[tokio::test]
    async fn test_decompose_twice_returns_existing() {
        let (s, _) = store();
        let g = s.create_goal("write a report", "", 5).unwrap();
        let d = Scripted::new(THREE);
        let first = s.decompose(&g, &d).await.unwrap();
        let second = s.decompose(&g, &d).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(d.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_decompose_zero_tasks_stores_nothing() {
        let (s, _) = store();
        let g = s.create_goal("vague", "", 5).unwrap();
        let err = s.decompose(&g, &Scripted::new("[]")).await.unwrap_err();
        assert!(matches!(err, AgentError::Decomposition { .. }));
        assert!(s.list_tasks(&g).unwrap().is_empty());
        assert_eq!(s.get_goal(&g).unwrap().decomposition_failures, 1);
    }

    #[tokio::test]
    async fn test_decompose_retry_reaches_model_after_rejected_reply() {
        use crate::budget::BudgetLedger;
        use crate::config::{BudgetSection, DispatcherSection, ResilienceSection};
        use crate::llm::MockLlmClient;
        use crate::resilience::Resilience;
        use crate::router::Dispatcher;

        let db = Arc::new(Store::open_in_memory().unwrap());
        let alerts = Arc::new(AlertLog::default());
        let s = GoalStore::new(db.clone(), GoalsSection::default(), alerts.clone());
        let cheap = Arc::new(
            MockLlmClient::new("cheap")
                .with_reply("[]", 0.95, 0.0)
                .with_reply(r#"["a", "b"]"#, 0.95, 0.0),
        );
        let dispatcher = Dispatcher::new(
            cheap.clone(),
            None,
            Arc::new(BudgetLedger::open(db, BudgetSection::default()).unwrap()),
            Arc::new(Resilience::from_config(&ResilienceSection::default())),
            alerts,
            &DispatcherSection::default(),
        );
        let g = s.create_goal("tidy the garden", "", 5).unwrap();

        assert!(s.decompose(&g, &dispatcher).await.is_err());
        let ids = s.decompose(&g, &dispatcher).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(cheap.calls(), 2);
        let goal = s.get_goal(&g).unwrap();
        assert_eq!(goal.decomposition_failures, 1);
        assert!(!goal.needs_review);
    }

    #[tokio::test]
    async fn test_repeated_decomposition_failure_flags_review() {
        let (s, alerts) = store();
        let g = s.create_goal("impossible", "", 5).unwrap();
        for _ in 0..3 {
            assert!(s.decompose(&g, &Down).await.is_err());
        }
        let goal = s.get_goal(&g).unwrap();
        assert!(goal.needs_review);
        assert_eq!(alerts.count(AlertKind::DecompositionReview), 1);
        assert!(s.undecomposed_goals(10).unwrap().is_empty());
        s.reactivate_goal(&g).unwrap();
        assert_eq!(s.undecomposed_goals(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_decomposition_is_serialized() {
        let (s, _) = store();
        let s = Arc::new(s);
        let g = s.create_goal("write a report", "", 5).unwrap();
        let d = Arc::new(Scripted::new(THREE));
        let (a, b) = tokio::join!(s.decompose(&g, d.as_ref()), s.decompose(&g, d.as_ref()));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(s.list_tasks(&g).unwrap().len(), 3);
        assert_eq!(d.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_next_eligible_respects_dependencies_and_priority() {
        let (s, _) = store();
        let low = s.create_goal("low priority goal", "", 2).unwrap();
        let high = s.create_goal("high priority goal", "", 9).unwrap();
        s.decompose(&low, &Scripted::new(r#"["x1", "x2"]"#)).await.unwrap();
        let ids = s.decompose(&high, &Scripted::new(THREE)).await.unwrap();

        assert_eq!(s.next_eligible_task(None).unwrap(), Some(ids[0].clone()));
        s.start_task(&ids[0]).unwrap();
        // ids[1] 依赖 ids[0]，尚未完成，只能选低优先级目标的任务
        let next = s.next_eligible_task(None).unwrap().unwrap();
        assert_eq!(s.get_task(&next).unwrap().goal_id, low);
        assert_eq!(s.next_eligible_task(Some(1)).unwrap(), None);

        s.complete_task(&ids[0], "done").unwrap();
        assert_eq!(s.next_eligible_task(None).unwrap(), Some(ids[1].clone()));
    }

    #[tokio::test]
    async fn test_stale_goals_are_not_scheduled() {
        let (s, _) = store();
        let g = s.create_goal("old goal", "", 5).unwrap();
        s.decompose(&g, &Scripted::new(r#"["a", "b"]"#)).await.unwrap();
        let later = Utc::now() + ChronoDuration::hours(49);
        let stale = s.mark_stale_goals_at(ChronoDuration::hours(48), later).unwrap();
        assert_eq!(stale, vec![g.clone()]);
        assert_eq!(s.next_eligible_task(None).unwrap(), None);
        assert_eq!(s.goal_progress(&g).unwrap().pending, 2);
        s.reactivate_goal(&g).unwrap();
        assert!(s.next_eligible_task(None).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_marking_reports_only_changed_goals() {
        let db = Arc::new(Store::open_in_memory().unwrap());
        let s = GoalStore::new(db.clone(), GoalsSection::default(), Arc::new(AlertLog::default()));
        let moved = s.create_goal("old goal", "", 5).unwrap();
        let held = s.create_goal("another old goal", "", 5).unwrap();
        // 让 held 的更新被跳过，等价于行在读取后被并发修改
        db.with_conn(|c| {
            c.execute_batch(&format!(
                "CREATE TRIGGER hold_goal BEFORE UPDATE OF status ON goals \
                 WHEN OLD.id = '{held}' BEGIN SELECT RAISE(IGNORE); END;"
            ))?;
            Ok(())
        })
        .unwrap();

        let later = Utc::now() + ChronoDuration::hours(49);
        let stale = s.mark_stale_goals_at(ChronoDuration::hours(48), later).unwrap();
        assert_eq!(stale, vec![moved]);
        assert_eq!(s.get_goal(&held).unwrap().status, GoalStatus::Active);
    }

    #[tokio::test]
    async fn test_illegal_transition_does_not_mutate() {
        let (s, _) = store();
        let g = s.create_goal("goal", "", 5).unwrap();
        let ids = s.decompose(&g, &Scripted::new(r#"["a", "b"]"#)).await.unwrap();
        let before = s.get_task(&ids[0]).unwrap();
        let err = s.complete_task(&ids[0], "skip").unwrap_err();
        assert!(matches!(err, AgentError::InvalidStateTransition { .. }));
        let after = s.get_task(&ids[0]).unwrap();
        assert_eq!(after.status, TaskStatus::Pending);
        assert_eq!(after.version, before.version);
        assert!(after.result.is_none());
    }

    #[tokio::test]
    async fn test_goal_auto_completes() {
        let (s, _) = store();
        let g = s.create_goal("goal", "", 5).unwrap();
        let ids = s.decompose(&g, &Scripted::new(r#"["a", "b"]"#)).await.unwrap();
        for id in &ids {
            s.start_task(id).unwrap();
            s.complete_task(id, "ok").unwrap();
        }
        assert_eq!(s.get_goal(&g).unwrap().status, GoalStatus::Completed);
        assert!(s.goal_progress(&g).unwrap().is_done());
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let (s, _) = store();
        let g = s.create_goal("goal", "", 5).unwrap();
        let ids = s.decompose(&g, &Scripted::new(r#"["a", "b"]"#)).await.unwrap();
        for _ in 0..2 {
            s.start_task(&ids[0]).unwrap();
            s.fail_task(&ids[0], "boom").unwrap();
            s.retry_task(&ids[0]).unwrap();
        }
        s.start_task(&ids[0]).unwrap();
        s.fail_task(&ids[0], "boom").unwrap();
        assert!(matches!(s.retry_task(&ids[0]), Err(AgentError::BudgetExceeded(_))));
        assert_eq!(s.get_task(&ids[0]).unwrap().retry_count, 2);
    }

    #[tokio::test]
    async fn test_requeue_only_from_in_progress() {
        let (s, _) = store();
        let g = s.create_goal("goal", "", 5).unwrap();
        let ids = s.decompose(&g, &Scripted::new(r#"["a", "b"]"#)).await.unwrap();
        s.start_task(&ids[0]).unwrap();
        s.fail_task(&ids[0], "boom").unwrap();

        let err = s.requeue_task(&ids[0]).unwrap_err();
        assert!(matches!(err, AgentError::InvalidStateTransition { .. }));
        let task = s.get_task(&ids[0]).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 0);
        assert!(s.requeue_task(&ids[1]).is_err());
    }

    #[tokio::test]
    async fn test_recover_orphaned_and_abandon_cascade() {
        let (s, _) = store();
        let g = s.create_goal("goal", "", 5).unwrap();
        let ids = s.decompose(&g, &Scripted::new(r#"["a", "b"]"#)).await.unwrap();
        s.start_task(&ids[0]).unwrap();
        assert_eq!(s.recover_orphaned().unwrap(), vec![ids[0].clone()]);
        assert_eq!(s.get_task(&ids[0]).unwrap().status, TaskStatus::Pending);

        s.abandon_goal(&g).unwrap();
        let p = s.goal_progress(&g).unwrap();
        assert_eq!(p.failed, 2);
        assert!(matches!(
            s.reactivate_goal(&g),
            Err(AgentError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_prune_duplicates_keeps_higher_priority() {
        let (s, _) = store();
        let keep = s.create_goal("Research rust async runtimes", "", 8).unwrap();
        let dup = s.create_goal("research rust async runtimes", "", 3).unwrap();
        let similar = s.create_goal("research the async rust runtimes landscape", "", 2).unwrap();
        let other = s.create_goal("plan a garden", "", 5).unwrap();
        let pruned = s.prune_duplicates().unwrap();
        assert!(pruned.contains(&dup));
        assert!(pruned.contains(&similar));
        assert!(!pruned.contains(&keep));
        assert!(!pruned.contains(&other));
        assert_eq!(s.get_goal(&dup).unwrap().status, GoalStatus::Abandoned);
    }

    #[test]
    fn test_priority_is_clamped() {
        let (s, _) = store();
        let g = s.create_goal("x", "", 99).unwrap();
        assert_eq!(s.get_goal(&g).unwrap().priority, 10);
    }
}
