//! 计划执行器：为一个任务运行有上限的步骤序列
//!
//! 状态机：Initializing → Executing(i) → {Verifying → Completed} | Failed | Aborted
//!
//! - 启动时读取断点，从第一个未完成的步骤续跑
//! - 每步前检查取消令牌；已开始的步骤总会完整执行，取消后不再开始新步骤，任务回到 pending、断点保留
//! - 每步后写断点；累计成本超过任务上限或步数达到上限时以 BudgetExceeded 失败
//! - 步骤内 panic 在步骤边界被捕获并转为 Failed，不会传播到调度器
//! - 写过文件时进入 Verifying：回读文件请调度器打分，低分只记录在结果中，不令任务失败

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::ExecutorSection;
use crate::core::extract::truncate_chars;
use crate::core::{AgentError, RecoveryAction};
use crate::goals::{Goal, GoalStore, Task, TaskStatus};
use crate::plan::checkpoint::{Checkpoint, CheckpointStore, StepRecord};
use crate::plan::step::Step;
use crate::plan::verify::{verify_artifacts, Verification};
use crate::router::{Dispatch, WorkRequest};
use crate::tools::{ToolExecutor, ToolOutput};

const HISTORY_SNIPPET_CHARS: usize = 300;
const REASK_SUFFIX: &str = "\n\nRespond with ONLY a valid JSON object.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "step")]
pub enum ExecutionState {
    Initializing,
    Executing(usize),
    Verifying,
    Completed,
    Failed,
    Aborted,
}

/// 一次 run 的结果
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub task_id: String,
    /// 中断时为 Executing(下一步下标)
    pub state: ExecutionState,
    pub resumed_from: usize,
    pub steps_run: usize,
    pub total_steps: usize,
    /// 本次 run 新产生的成本
    pub cost: f64,
    pub summary: Option<String>,
    pub verification: Option<Verification>,
    pub failure: Option<String>,
}

impl ExecutionReport {
    pub fn interrupted(&self) -> bool {
        matches!(self.state, ExecutionState::Executing(_))
    }
}

/// 写回 GoalStore 的结果载荷
#[derive(Debug, Serialize)]
struct TaskResultPayload<'a> {
    summary: &'a str,
    steps: usize,
    cost: f64,
    artifacts: &'a [String],
    verification: Option<&'a Verification>,
}

pub struct PlanExecutor {
    goals: Arc<GoalStore>,
    dispatcher: Arc<dyn Dispatch>,
    tools: Arc<ToolExecutor>,
    checkpoints: CheckpointStore,
    config: ExecutorSection,
}

impl PlanExecutor {
    pub fn new(
        goals: Arc<GoalStore>,
        dispatcher: Arc<dyn Dispatch>,
        tools: Arc<ToolExecutor>,
        checkpoints: CheckpointStore,
        config: ExecutorSection,
    ) -> Self {
        Self {
            goals,
            dispatcher,
            tools,
            checkpoints,
            config,
        }
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// 执行一个 pending 任务直到完成、失败或被取消
    pub async fn run(&self, task_id: &str, cancel: &CancellationToken) -> Result<ExecutionReport, AgentError> {
        self.run_within(task_id, cancel, f64::INFINITY).await
    }

    /// 同 run，但本次 run 新产生的成本达到 spend_limit 后不再开始新步骤：
    /// 任务回到 pending、断点保留，与取消相同
    #[tracing::instrument(skip(self, cancel), fields(goal_id = tracing::field::Empty))]
    pub async fn run_within(
        &self,
        task_id: &str,
        cancel: &CancellationToken,
        spend_limit: f64,
    ) -> Result<ExecutionReport, AgentError> {
        // Initializing
        let task = self.goals.start_task(task_id)?;
        tracing::Span::current().record("goal_id", task.goal_id.as_str());
        let result = self.drive(&task, cancel, spend_limit).await;
        if let Err(err) = &result {
            self.release(task_id, err);
        }
        result
    }

    /// 任务已进入 in_progress 后的全部工作；返回 Err 时由 release 收尾
    async fn drive(&self, task: &Task, cancel: &CancellationToken, spend_limit: f64) -> Result<ExecutionReport, AgentError> {
        let task_id = task.id.as_str();
        let goal = self.goals.get_goal(&task.goal_id)?;
        let mut cp = match self.checkpoints.load(task_id)? {
            Some(cp) => {
                tracing::info!(task_id, from_step = cp.next_step(), "resuming from checkpoint");
                cp
            }
            None => Checkpoint::new(task_id),
        };
        let resumed_from = cp.next_step();
        let start_cost = cp.cost;
        let mut report = ExecutionReport {
            task_id: task_id.to_string(),
            state: ExecutionState::Initializing,
            resumed_from,
            steps_run: 0,
            total_steps: resumed_from,
            cost: 0.0,
            summary: None,
            verification: None,
            failure: None,
        };

        while !cp.is_done() {
            let index = cp.next_step();
            report.state = ExecutionState::Executing(index);

            if cancel.is_cancelled() {
                self.goals.requeue_task(task_id)?;
                tracing::info!(task_id, next_step = index, "interrupted, task returned to pending");
                report.cost = cp.cost - start_cost;
                return Ok(report);
            }
            if index >= self.config.max_steps {
                let err = AgentError::BudgetExceeded(format!("step cap of {} reached", self.config.max_steps));
                return Ok(self.fail(report, &cp, start_cost, err));
            }

            let step = match self.plan_next(task, &goal, &mut cp).await {
                Ok(step) => step,
                Err(err) => return Ok(self.fail(report, &cp, start_cost, err)),
            };
            tracing::info!(task_id, step = index + 1, action = step.kind(), "executing step");

            let outcome = AssertUnwindSafe(self.execute_step(&step)).catch_unwind().await;
            let record = match outcome {
                Ok(Ok(output)) => {
                    if let Some(path) = output.written.clone() {
                        cp.add_artifact(path);
                    }
                    StepRecord {
                        index,
                        step,
                        ok: true,
                        cost: output.cost,
                        output: output.artifact,
                    }
                }
                // 工具失败不终止任务：记录错误，由模型在下一步调整
                Ok(Err(err)) => {
                    tracing::warn!(task_id, step = index + 1, error = %err, "step failed");
                    StepRecord {
                        index,
                        step,
                        ok: false,
                        cost: 0.0,
                        output: format!("error: {err}"),
                    }
                }
                Err(panic) => {
                    let msg = panic_message(panic.as_ref());
                    tracing::error!(task_id, step = index + 1, panic = %msg, "step panicked");
                    return Ok(self.fail(report, &cp, start_cost, AgentError::StepPanicked(msg)));
                }
            };
            cp.cost += record.cost;
            cp.steps.push(record);
            self.checkpoints.save(&mut cp)?;
            report.steps_run += 1;
            report.total_steps = cp.steps.len();

            if cp.cost > self.config.task_cost_cap {
                let err = AgentError::BudgetExceeded(format!(
                    "task cost {:.4} exceeds cap {:.4}",
                    cp.cost, self.config.task_cost_cap
                ));
                return Ok(self.fail(report, &cp, start_cost, err));
            }
            if !cp.is_done() && cp.cost - start_cost >= spend_limit {
                self.goals.requeue_task(task_id)?;
                report.state = ExecutionState::Executing(cp.next_step());
                report.cost = cp.cost - start_cost;
                tracing::info!(
                    task_id,
                    next_step = cp.next_step(),
                    spent = report.cost,
                    limit = spend_limit,
                    "spend limit reached, task returned to pending"
                );
                return Ok(report);
            }
        }

        report.summary = cp.summary().map(str::to_string);
        if !cp.artifacts.is_empty() {
            report.state = ExecutionState::Verifying;
            let verification = verify_artifacts(
                self.dispatcher.as_ref(),
                &self.tools,
                task,
                &goal,
                &cp.artifacts,
                &self.config,
            )
            .await;
            cp.cost += verification.cost;
            if !verification.passed {
                tracing::warn!(task_id, score = ?verification.score, "verification judged work below bar");
            }
            report.verification = Some(verification);
        }

        let summary = report.summary.clone().unwrap_or_else(|| "Task completed.".to_string());
        let payload = serde_json::to_string(&TaskResultPayload {
            summary: &summary,
            steps: cp.steps.len(),
            cost: cp.cost,
            artifacts: &cp.artifacts,
            verification: report.verification.as_ref(),
        })?;
        report.cost = cp.cost - start_cost;
        match self.goals.complete_task(task_id, &payload) {
            Ok(_) => {
                report.state = ExecutionState::Completed;
                tracing::info!(task_id, steps = cp.steps.len(), cost = cp.cost, "task completed");
            }
            // 执行期间任务被外部关闭（例如目标被放弃）
            Err(err @ AgentError::InvalidStateTransition { .. }) => {
                tracing::warn!(task_id, error = %err, "task closed externally, aborting");
                self.checkpoints.delete(task_id)?;
                report.state = ExecutionState::Aborted;
                report.failure = Some(err.to_string());
            }
            Err(err) => return Err(err),
        }
        Ok(report)
    }

    /// 请调度器给出下一步；输出无法解析时追加提示重问一次
    async fn plan_next(&self, task: &Task, goal: &Goal, cp: &mut Checkpoint) -> Result<Step, AgentError> {
        let prompt = self.step_prompt(task, goal, cp);
        let first = self
            .dispatcher
            .dispatch(WorkRequest::background(prompt.clone()).strict().uncached())
            .await?;
        cp.cost += first.cost;
        match Step::parse(&first.text) {
            Ok(step) => Ok(step),
            Err(err) => {
                tracing::warn!(task_id = %task.id, error = %err, "invalid step JSON, re-asking");
                let retry = self
                    .dispatcher
                    .dispatch(WorkRequest::background(format!("{prompt}{REASK_SUFFIX}")).strict().uncached())
                    .await?;
                cp.cost += retry.cost;
                Step::parse(&retry.text)
            }
        }
    }

    async fn execute_step(&self, step: &Step) -> Result<ToolOutput, AgentError> {
        match (step, step.capability()) {
            (_, Some(capability)) => self.tools.invoke(capability, step.params()).await,
            (Step::Think { note }, None) => Ok(ToolOutput::text(note.clone())),
            (Step::Done { summary }, None) => Ok(ToolOutput::text(summary.clone())),
            (other, None) => Err(AgentError::Tool(format!("no handler for {}", other.kind()))),
        }
    }

    fn step_prompt(&self, task: &Task, goal: &Goal, cp: &Checkpoint) -> String {
        let mut history = String::new();
        for r in &cp.steps {
            let status = if r.ok { "" } else { " (failed)" };
            history.push_str(&format!(
                "  {}. [{}]{} -> {}\n",
                r.index + 1,
                r.step.label(),
                status,
                truncate_chars(&r.output.replace('\n', " "), HISTORY_SNIPPET_CHARS)
            ));
        }
        if history.is_empty() {
            history.push_str("  (none)\n");
        }
        let actions = self
            .tools
            .descriptions()
            .into_iter()
            .map(|(cap, desc)| format!("- {cap}: {desc}"))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            r#"You are an autonomous agent working on a task in the background.

Goal: {goal}
Task: {task}

Completed steps: {count}
{history}
What is the NEXT step? Choose ONE action and reply with a JSON object whose "action" field names it:
{actions}
- think: reason about the approach. Args: {{"note": "..."}}
- done: the task is finished. Args: {{"summary": "what was accomplished"}}

Rules:
- Be specific and actionable; adapt if a step failed.
- Save findings to files and read them back before calling done.

Respond with ONLY a valid JSON object, e.g. {{"action": "search", "query": "..."}}"#,
            goal = goal.description,
            task = task.description,
            count = cp.steps.len(),
        )
    }

    /// 令任务失败；瞬时类错误在重试次数内放回 pending
    fn fail(&self, mut report: ExecutionReport, cp: &Checkpoint, start_cost: f64, err: AgentError) -> ExecutionReport {
        let task_id = report.task_id.clone();
        report.state = ExecutionState::Failed;
        report.cost = cp.cost - start_cost;
        report.failure = Some(err.to_string());
        if let Err(e) = self.settle_failure(&task_id, &err) {
            tracing::error!(task_id = %task_id, error = %e, "could not record task failure");
        }
        report
    }

    /// 记录失败；瞬时类错误在重试次数内放回 pending
    fn settle_failure(&self, task_id: &str, err: &AgentError) -> Result<(), AgentError> {
        self.goals.fail_task(task_id, &err.to_string())?;
        let retryable = matches!(
            err.recovery_action(),
            RecoveryAction::Retry | RecoveryAction::Fallback
        ) || matches!(err, AgentError::AllPathsFailed { .. });
        if retryable {
            match self.goals.retry_task(task_id) {
                Ok(t) => tracing::info!(task_id, retry = t.retry_count, "task queued for retry"),
                Err(e) => tracing::warn!(task_id, error = %e, "task will not be retried"),
            }
        }
        Ok(())
    }

    /// drive 出错时尽力让任务离开 in_progress：先记失败，不行再放回 pending
    fn release(&self, task_id: &str, err: &AgentError) {
        match self.goals.get_task(task_id) {
            Ok(t) if t.status != TaskStatus::InProgress => return,
            Ok(_) => {}
            Err(e) => tracing::warn!(task_id, error = %e, "could not read task after run error"),
        }
        tracing::error!(task_id, error = %err, "task run failed, releasing task");
        if let Err(e) = self.settle_failure(task_id, err) {
            tracing::warn!(task_id, error = %e, "could not mark task failed, requeueing");
            if let Err(e) = self.goals.requeue_task(task_id) {
                tracing::error!(task_id, error = %e, "task left in progress until restart");
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
