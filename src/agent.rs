//! 运行时装配
//!
//! Runtime 从 AppConfig 构建存储、账本、弹性层、调度器（Dispatcher）、工具、计划执行器与空闲调度器，
//! 并向前端暴露三类接口：
//! - chat：交互式请求（总能得到回复，必要时降级），同时刷新空闲时钟
//! - 目标控制：创建目标、列出目标 / 任务、强制分解
//! - status：调度阶段、当前周期统计、预算摘要、熔断状态、告警

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::budget::{BudgetLedger, BudgetPeriod, BudgetSummary};
use crate::config::AppConfig;
use crate::core::{Alert, AgentError, AlertLog, CycleStats, SchedulerPhase};
use crate::goals::{Goal, GoalId, GoalProgress, GoalStatus, GoalStore, Task, TaskId};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::plan::{CheckpointStore, PlanExecutor};
use crate::resilience::{CircuitSnapshot, Degradation, Resilience};
use crate::router::{Dispatch, DispatchStats, Dispatcher, WorkRequest};
use crate::scheduler::{ActivityMonitor, CycleHistory, CycleSummary, IdleScheduler};
use crate::store::Store;
use crate::tools::{default_registry, ToolExecutor};

/// 启动恢复的结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub requeued_tasks: Vec<TaskId>,
    pub discarded_checkpoints: usize,
    pub stale_goals: Vec<GoalId>,
}

/// 状态查询
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub phase: SchedulerPhase,
    pub idle_secs: u64,
    pub cycle: Option<CycleStats>,
    pub budget_today: BudgetSummary,
    pub budget_month: BudgetSummary,
    pub budget_warnings: Vec<String>,
    pub circuits: Vec<CircuitSnapshot>,
    pub alerts: Vec<Alert>,
    pub dispatch: DispatchStats,
}

pub struct Runtime {
    config: AppConfig,
    goals: Arc<GoalStore>,
    ledger: Arc<BudgetLedger>,
    resilience: Arc<Resilience>,
    dispatcher: Arc<Dispatcher>,
    checkpoints: CheckpointStore,
    scheduler: Arc<IdleScheduler>,
    activity: Arc<ActivityMonitor>,
    alerts: Arc<AlertLog>,
}

impl Runtime {
    /// 按配置创建推理客户端：未配置廉价端点时使用离线 Mock
    pub fn build(config: AppConfig) -> Result<Self, AgentError> {
        let expected = config.dispatcher.expected_output_tokens;
        let cheap: Arc<dyn LlmClient> = match &config.llm.cheap {
            Some(ep) => Arc::new(OpenAiClient::from_endpoint("cheap", ep, expected)),
            None => {
                tracing::warn!("no cheap inference endpoint configured, using offline echo client");
                Arc::new(MockLlmClient::new("offline"))
            }
        };
        let costly: Option<Arc<dyn LlmClient>> = config
            .llm
            .costly
            .as_ref()
            .map(|ep| Arc::new(OpenAiClient::from_endpoint("costly", ep, expected)) as Arc<dyn LlmClient>);
        Self::with_clients(config, cheap, costly)
    }

    pub fn with_clients(
        config: AppConfig,
        cheap: Arc<dyn LlmClient>,
        costly: Option<Arc<dyn LlmClient>>,
    ) -> Result<Self, AgentError> {
        std::fs::create_dir_all(&config.app.workspace_root)?;
        let store = Arc::new(Store::open(&config.app.database_path())?);
        let alerts = Arc::new(AlertLog::default());
        let ledger = Arc::new(BudgetLedger::open(store.clone(), config.budget.clone())?);
        let resilience = Arc::new(Resilience::from_config(&config.resilience));
        let dispatcher = Arc::new(
            Dispatcher::new(
                cheap,
                costly,
                ledger.clone(),
                resilience.clone(),
                alerts.clone(),
                &config.dispatcher,
            )
            .with_degradation(Degradation::default()),
        );
        let goals = Arc::new(GoalStore::new(store.clone(), config.goals.clone(), alerts.clone()));
        let tools = Arc::new(ToolExecutor::new(
            default_registry(&config.app.workspace_root, &config.tools),
            config.tools.tool_timeout_secs,
            resilience.clone(),
            ledger.clone(),
        ));
        let checkpoints = CheckpointStore::new(store.clone(), config.executor.checkpoint_max_age_hours);
        let executor = Arc::new(PlanExecutor::new(
            goals.clone(),
            dispatcher.clone(),
            tools,
            CheckpointStore::new(store.clone(), config.executor.checkpoint_max_age_hours),
            config.executor.clone(),
        ));
        let activity = Arc::new(ActivityMonitor::new());
        let scheduler = Arc::new(IdleScheduler::new(
            config.scheduler.clone(),
            goals.clone(),
            executor,
            dispatcher.clone(),
            activity.clone(),
            CycleHistory::new(store),
        ));
        tracing::info!(
            database = %config.app.database_path().display(),
            workspace = %config.app.workspace_root.display(),
            "runtime ready"
        );
        Ok(Self {
            config,
            goals,
            ledger,
            resilience,
            dispatcher,
            checkpoints,
            scheduler,
            activity,
            alerts,
        })
    }

    /// 启动恢复：孤儿任务回到 pending，清理过期断点，标记过期目标
    pub fn recover(&self) -> Result<RecoveryReport, AgentError> {
        let requeued_tasks = self.goals.recover_orphaned()?;
        let discarded_checkpoints = self.checkpoints.discard_stale()?;
        let stale_goals = self
            .goals
            .mark_stale_goals(ChronoDuration::hours(self.config.goals.stale_after_hours))?;
        tracing::info!(
            requeued = requeued_tasks.len(),
            checkpoints_discarded = discarded_checkpoints,
            stale = stale_goals.len(),
            "startup recovery done"
        );
        Ok(RecoveryReport {
            requeued_tasks,
            discarded_checkpoints,
            stale_goals,
        })
    }

    /// 交互式请求：刷新空闲时钟（打断正在运行的周期），走廉价路径，失败时给出降级回复
    pub async fn chat(&self, user_text: &str, source: &str) -> String {
        self.activity.mark_activity();
        tracing::info!(source, chars = user_text.chars().count(), "interactive request");
        match self.dispatcher.dispatch(WorkRequest::interactive(user_text)).await {
            Ok(outcome) => outcome.text,
            Err(e) => {
                tracing::warn!(source, error = %e, "interactive dispatch failed, degrading");
                Degradation::default().respond(user_text, None).text
            }
        }
    }

    pub fn create_goal(&self, description: &str, priority: i64) -> Result<GoalId, AgentError> {
        self.activity.mark_activity();
        self.goals.create_goal(description, description, priority)
    }

    pub fn list_goals(&self, status: Option<GoalStatus>) -> Result<Vec<(Goal, GoalProgress)>, AgentError> {
        self.goals
            .list_goals(status)?
            .into_iter()
            .map(|g| {
                let progress = self.goals.goal_progress(&g.id)?;
                Ok((g, progress))
            })
            .collect()
    }

    pub fn list_tasks(&self, goal_id: &str) -> Result<Vec<Task>, AgentError> {
        self.goals.list_tasks(goal_id)
    }

    /// 强制分解（needs_review 的目标也可由操作员手动分解）
    pub async fn decompose(&self, goal_id: &str) -> Result<Vec<TaskId>, AgentError> {
        self.activity.mark_activity();
        self.goals.decompose(goal_id, self.dispatcher.as_ref()).await
    }

    pub fn status(&self) -> Result<StatusReport, AgentError> {
        Ok(StatusReport {
            phase: self.scheduler.phase(),
            idle_secs: self.activity.idle_for().as_secs(),
            cycle: self.scheduler.current_cycle(),
            budget_today: self.ledger.summary(BudgetPeriod::Today)?,
            budget_month: self.ledger.summary(BudgetPeriod::Month)?,
            budget_warnings: self.ledger.warnings(),
            circuits: self.resilience.circuits().snapshot(),
            alerts: self.alerts.recent(),
            dispatch: self.dispatcher.stats(),
        })
    }

    pub fn recent_cycles(&self, n: usize) -> Result<Vec<CycleSummary>, AgentError> {
        self.scheduler.recent_cycles(n)
    }

    /// 在后台运行空闲调度器，shutdown 取消后退出
    pub fn spawn_scheduler(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.scheduler.clone().run(shutdown))
    }

    pub fn goals(&self) -> &Arc<GoalStore> {
        &self.goals
    }

    pub fn scheduler(&self) -> &Arc<IdleScheduler> {
        &self.scheduler
    }

    pub fn ledger(&self) -> &Arc<BudgetLedger> {
        &self.ledger
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockFailure;

    fn config(dir: &std::path::Path) -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.app.data_dir = dir.join("data");
        cfg.app.workspace_root = dir.join("workspace");
        cfg
    }

    #[tokio::test]
    async fn test_chat_answers_and_marks_activity() {
        let dir = tempfile::tempdir().unwrap();
        let cheap = Arc::new(MockLlmClient::new("local").with_reply("Hi there!", 0.95, 0.0));
        let rt = Runtime::with_clients(config(dir.path()), cheap, None).unwrap();
        assert_eq!(rt.chat("hello", "console").await, "Hi there!");
        assert!(rt.status().unwrap().idle_secs < 5);
    }

    #[tokio::test]
    async fn test_chat_degrades_when_backends_down() {
        let dir = tempfile::tempdir().unwrap();
        let cheap = Arc::new(
            MockLlmClient::new("local")
                .with_failure(MockFailure::Unauthorized)
                .with_failure(MockFailure::Unauthorized),
        );
        let rt = Runtime::with_clients(config(dir.path()), cheap, None).unwrap();
        let reply = rt.chat("hello", "console").await;
        assert!(!reply.is_empty());
        assert_eq!(rt.status().unwrap().dispatch.degraded, 1);
    }

    #[tokio::test]
    async fn test_recover_requeues_orphaned_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let cheap = Arc::new(MockLlmClient::new("local").with_reply(r#"["one", "two"]"#, 0.95, 0.0));
        let rt = Runtime::with_clients(config(dir.path()), cheap, None).unwrap();
        let goal = rt.create_goal("learn sqlite internals", 7).unwrap();
        let tasks = rt.decompose(&goal).await.unwrap();
        rt.goals().start_task(&tasks[0]).unwrap();

        let report = rt.recover().unwrap();
        assert_eq!(report.requeued_tasks, vec![tasks[0].clone()]);
        let listed = rt.list_goals(None).unwrap();
        assert_eq!(listed[0].1.total, 2);
        assert_eq!(listed[0].1.pending, 2);
    }
}
