//! SQLite 持久化
//!
//! 目标、任务、执行断点、账本事件、周期历史共用一个数据库文件（WAL + synchronous=FULL）。
//! 每个变更操作在单个事务内完成并在返回前提交，调用方随后崩溃也能在重启后看到结果。

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, Transaction};
use tracing::{debug, instrument};

use crate::core::AgentError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS goals (
    id TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    intent TEXT NOT NULL,
    priority INTEGER NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    touched_at TEXT NOT NULL,
    decomposition_failures INTEGER NOT NULL DEFAULT 0,
    needs_review INTEGER NOT NULL DEFAULT 0,
    version INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    goal_id TEXT NOT NULL REFERENCES goals(id) ON DELETE CASCADE,
    ordinal INTEGER NOT NULL,
    description TEXT NOT NULL,
    dependencies TEXT NOT NULL,
    priority INTEGER NOT NULL,
    estimated_minutes INTEGER NOT NULL,
    status TEXT NOT NULL,
    result TEXT,
    failure_reason TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_tasks_goal ON tasks(goal_id);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE TABLE IF NOT EXISTS checkpoints (
    task_id TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS spend_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    amount REAL NOT NULL,
    path TEXT NOT NULL,
    at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_spend_at ON spend_events(at);
CREATE TABLE IF NOT EXISTS cycle_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at TEXT NOT NULL,
    payload TEXT NOT NULL
);
"#;

/// 单连接存储；rusqlite 为同步 API，临界区内不跨 await
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// 打开（或创建）数据库文件，父目录不存在时自动创建
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn open(path: &Path) -> Result<Self, AgentError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA foreign_keys=ON;",
        )?;
        conn.execute_batch(SCHEMA)?;
        debug!("Opened store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// 内存数据库（测试用）
    pub fn open_in_memory() -> Result<Self, AgentError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// 只读 / 单语句访问
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, AgentError>,
    ) -> Result<T, AgentError> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// 在事务内执行，闭包返回 Err 时回滚（Transaction drop 即回滚）
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, AgentError>,
    ) -> Result<T, AgentError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_schema_and_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("hive.db");
        let store = Store::open(&path).unwrap();
        let count: i64 = store
            .with_conn(|c| {
                Ok(c.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('goals','tasks','checkpoints','spend_events','cycle_history')",
                    [],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(count, 5);
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let store = Store::open_in_memory().unwrap();
        let res: Result<(), AgentError> = store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO spend_events (amount, path, at) VALUES (1.0, 'x', '2024-01-01')",
                [],
            )?;
            Err(AgentError::NotFound("abort".into()))
        });
        assert!(res.is_err());
        let count: i64 = store
            .with_conn(|c| Ok(c.query_row("SELECT COUNT(*) FROM spend_events", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }
}
