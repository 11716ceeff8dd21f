//! 空闲调度器（Dream Cycle）
//!
//! 固定间隔轮询活动时钟，空闲超过阈值时开始一个周期：
//! 1. 维护：标记过期目标、清理重复目标
//! 2. 分解至多 goals_per_cycle 个尚未分解的目标
//! 3. 逐个取出优先级最高的可执行任务交给 PlanExecutor，直到触达时间 / 花费 / 任务数上限、
//!    没有可执行任务，或观察到前台活动
//!
//! 同一时刻只运行一个周期；单个任务的失败只记入统计，不会中止周期。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerSection;
use crate::core::{AgentError, CycleStats, SchedulerPhase};
use crate::goals::GoalStore;
use crate::plan::{ExecutionState, PlanExecutor};
use crate::router::{Dispatch, DispatchOutcome, WorkRequest};
use crate::scheduler::history::{CycleHistory, CycleSummary, StopReason};
use crate::scheduler::idle::ActivityMonitor;

pub struct IdleScheduler {
    config: SchedulerSection,
    goals: Arc<GoalStore>,
    executor: Arc<PlanExecutor>,
    dispatcher: Arc<dyn Dispatch>,
    activity: Arc<ActivityMonitor>,
    history: CycleHistory,
    phase: Mutex<SchedulerPhase>,
    current: Mutex<Option<CycleStats>>,
    running: AtomicBool,
}

/// 周期结束（包括提前返回）时复位 running 标志
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl IdleScheduler {
    pub fn new(
        config: SchedulerSection,
        goals: Arc<GoalStore>,
        executor: Arc<PlanExecutor>,
        dispatcher: Arc<dyn Dispatch>,
        activity: Arc<ActivityMonitor>,
        history: CycleHistory,
    ) -> Self {
        Self {
            config,
            goals,
            executor,
            dispatcher,
            activity,
            history,
            phase: Mutex::new(SchedulerPhase::Idle),
            current: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn activity(&self) -> &Arc<ActivityMonitor> {
        &self.activity
    }

    pub fn phase(&self) -> SchedulerPhase {
        *self.phase.lock()
    }

    /// 正在运行的周期的实时统计
    pub fn current_cycle(&self) -> Option<CycleStats> {
        self.current.lock().clone()
    }

    pub fn recent_cycles(&self, n: usize) -> Result<Vec<CycleSummary>, AgentError> {
        self.history.recent(n)
    }

    fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.config.idle_threshold_secs)
    }

    /// 轮询循环，直到 shutdown 被取消
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let poll = Duration::from_secs(self.config.poll_interval_secs.max(1));
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            poll_secs = poll.as_secs(),
            idle_threshold_secs = self.config.idle_threshold_secs,
            "idle scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.tick(&shutdown).await {
                        Ok(Some(summary)) => tracing::info!(
                            tasks = summary.tasks_touched.len(),
                            cost = summary.cost,
                            reason = %summary.stop_reason,
                            "cycle finished"
                        ),
                        Ok(None) => {}
                        Err(e) => tracing::error!(error = %e, "cycle failed"),
                    }
                }
            }
        }
        tracing::info!("idle scheduler stopped");
    }

    /// 一次轮询：空闲且没有周期在运行时执行一个周期
    pub async fn tick(&self, shutdown: &CancellationToken) -> Result<Option<CycleSummary>, AgentError> {
        if shutdown.is_cancelled() || !self.activity.is_idle(self.idle_threshold()) {
            return Ok(None);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::debug!("cycle already running, skipping tick");
            return Ok(None);
        }
        let _guard = RunningGuard(&self.running);
        self.run_cycle(shutdown).await.map(Some)
    }

    async fn run_cycle(&self, shutdown: &CancellationToken) -> Result<CycleSummary, AgentError> {
        let started_at = Utc::now();
        let start = Instant::now();
        let deadline = start + Duration::from_secs(self.config.cycle_max_secs);
        let token = self.activity.begin_cycle(shutdown);
        *self.phase.lock() = SchedulerPhase::Cycling;
        *self.current.lock() = Some(CycleStats {
            started_at: Some(started_at),
            ..CycleStats::default()
        });
        tracing::info!(idle_secs = self.activity.idle_for().as_secs(), "idle cycle started");

        self.housekeeping();
        let decomposed = self.decompose_pending(&token, deadline).await;
        self.update(|s| s.goals_decomposed = decomposed);
        let stop_reason = self.work_tasks(shutdown, &token, deadline).await;

        let stats = self.current.lock().take().unwrap_or_default();
        *self.phase.lock() = SchedulerPhase::Idle;
        self.activity.end_cycle();

        let summary = CycleSummary {
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
            goals_decomposed: stats.goals_decomposed,
            tasks_touched: stats.tasks_touched,
            tasks_completed: stats.tasks_completed,
            tasks_failed: stats.tasks_failed,
            cost: stats.cost,
            stop_reason,
        };
        self.history.append(&summary)?;
        Ok(summary)
    }

    /// 维护失败只记录日志，不影响周期
    fn housekeeping(&self) {
        let age = ChronoDuration::hours(self.goals.config().stale_after_hours);
        match self.goals.mark_stale_goals(age) {
            Ok(stale) if !stale.is_empty() => tracing::info!(count = stale.len(), "goals marked stale"),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "stale marking failed"),
        }
        match self.goals.prune_duplicates() {
            Ok(pruned) if !pruned.is_empty() => tracing::info!(count = pruned.len(), "duplicate goals pruned"),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "duplicate pruning failed"),
        }
    }

    async fn decompose_pending(&self, token: &CancellationToken, deadline: Instant) -> usize {
        let pending = match self.goals.undecomposed_goals(self.config.goals_per_cycle) {
            Ok(goals) => goals,
            Err(e) => {
                tracing::warn!(error = %e, "could not list undecomposed goals");
                return 0;
            }
        };
        let mut count = 0;
        for goal in pending {
            if token.is_cancelled() || Instant::now() >= deadline || self.spent() >= self.config.cycle_cost_cap {
                break;
            }
            let metered = Metered::new(self.dispatcher.as_ref());
            let result = self.goals.decompose(&goal.id, &metered).await;
            let cost = metered.cost();
            self.update(|s| s.cost += cost);
            match result {
                Ok(tasks) => {
                    count += 1;
                    tracing::info!(goal_id = %goal.id, tasks = tasks.len(), cost, "goal decomposed");
                }
                Err(e) => tracing::warn!(goal_id = %goal.id, error = %e, "decomposition failed"),
            }
        }
        count
    }

    async fn work_tasks(&self, shutdown: &CancellationToken, token: &CancellationToken, deadline: Instant) -> StopReason {
        let max_goals = Some(self.goals.config().max_active_goals);
        loop {
            if token.is_cancelled() {
                return interrupted_reason(shutdown);
            }
            if Instant::now() >= deadline {
                return StopReason::TimeCap;
            }
            let (spent, touched) = self
                .current
                .lock()
                .as_ref()
                .map(|s| (s.cost, s.tasks_touched.len()))
                .unwrap_or_default();
            let remaining = self.config.cycle_cost_cap - spent;
            if remaining <= 0.0 {
                return StopReason::CostCap;
            }
            if touched >= self.config.cycle_max_tasks {
                return StopReason::TaskCap;
            }
            let task_id = match self.goals.next_eligible_task(max_goals) {
                Ok(Some(id)) => id,
                Ok(None) => return StopReason::NoEligibleTask,
                Err(e) => {
                    tracing::error!(error = %e, "task selection failed");
                    return StopReason::Error;
                }
            };
            self.update(|s| {
                s.current_task = Some(task_id.clone());
                s.tasks_touched.push(task_id.clone());
            });

            // 周期时间上限通过取消令牌在步骤边界生效
            let task_token = token.child_token();
            let watchdog = {
                let t = task_token.clone();
                tokio::spawn(async move {
                    sleep_until(deadline).await;
                    t.cancel();
                })
            };
            let result = self.executor.run_within(&task_id, &task_token, remaining).await;
            watchdog.abort();
            self.update(|s| s.current_task = None);

            match result {
                Ok(report) => {
                    self.update(|s| {
                        s.cost += report.cost;
                        match report.state {
                            ExecutionState::Completed => s.tasks_completed += 1,
                            ExecutionState::Failed => s.tasks_failed += 1,
                            _ => {}
                        }
                    });
                    if report.interrupted() {
                        return if token.is_cancelled() {
                            interrupted_reason(shutdown)
                        } else if self.spent() >= self.config.cycle_cost_cap {
                            StopReason::CostCap
                        } else {
                            StopReason::TimeCap
                        };
                    }
                }
                // 单个任务的错误不结束周期
                Err(e) => {
                    tracing::error!(task_id = %task_id, error = %e, "task run failed");
                    self.update(|s| s.tasks_failed += 1);
                }
            }
        }
    }

    fn update(&self, f: impl FnOnce(&mut CycleStats)) {
        if let Some(stats) = self.current.lock().as_mut() {
            f(stats);
        }
    }

    fn spent(&self) -> f64 {
        self.current.lock().as_ref().map(|s| s.cost).unwrap_or_default()
    }
}

/// 累计经由它的调度成本（含被拒绝的回复）
struct Metered<'a> {
    inner: &'a dyn Dispatch,
    cost: Mutex<f64>,
}

impl<'a> Metered<'a> {
    fn new(inner: &'a dyn Dispatch) -> Self {
        Self {
            inner,
            cost: Mutex::new(0.0),
        }
    }

    fn cost(&self) -> f64 {
        *self.cost.lock()
    }
}

#[async_trait]
impl Dispatch for Metered<'_> {
    async fn dispatch(&self, request: WorkRequest) -> Result<DispatchOutcome, AgentError> {
        let outcome = self.inner.dispatch(request).await?;
        *self.cost.lock() += outcome.cost;
        Ok(outcome)
    }
}

fn interrupted_reason(shutdown: &CancellationToken) -> StopReason {
    if shutdown.is_cancelled() {
        StopReason::Shutdown
    } else {
        StopReason::Activity
    }
}
