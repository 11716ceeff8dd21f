//! 能力调度器（Router）
//!
//! 为一个工作单元选择执行路径并调用：
//! - 缓存命中：立即返回，零成本，不经过账本与弹性层
//! - 廉价路径优先；interactive 模式只走廉价路径
//! - background 模式下，若（置信度 - 复杂度惩罚）低于阈值且账本授权，升级到昂贵路径
//! - 升级失败或被拒绝时退回廉价结果并标记 degraded；廉价路径本身不可用时，background 经回退链尝试昂贵路径
//! - 全部路径耗尽：容忍降级的调用方得到模板 / 缓存响应，其余返回 AllPathsFailed

pub mod cache;
pub mod classifier;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;

pub use cache::{fingerprint, CacheStats, CachedAnswer, QueryCache};
pub use classifier::{Complexity, ComplexityClassifier};

use crate::budget::{BudgetDecision, BudgetLedger};
use crate::config::DispatcherSection;
use crate::core::{AgentError, AlertKind, AlertLog};
use crate::llm::{Inference, LlmClient, Mode};
use crate::resilience::{fallback_chain, Degradation, Resilience, Strategy};

pub const CHEAP_DEPENDENCY: &str = "llm:cheap";
pub const COSTLY_DEPENDENCY: &str = "llm:costly";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPath {
    Cheap,
    Costly,
    Cache,
    Degraded,
}

/// 一个工作单元
#[derive(Debug, Clone)]
pub struct WorkRequest {
    pub prompt: String,
    pub mode: Mode,
    /// 为 true 时全部路径失败也返回降级响应而非错误
    pub degradation_tolerant: bool,
    /// 为 false 时既不读缓存也不写缓存
    pub cacheable: bool,
}

impl WorkRequest {
    pub fn interactive(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            mode: Mode::Interactive,
            degradation_tolerant: true,
            cacheable: true,
        }
    }

    pub fn background(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            mode: Mode::Background,
            degradation_tolerant: true,
            cacheable: true,
        }
    }

    /// 需要真实结果的调用（分解、规划）：全部路径失败时返回错误
    pub fn strict(mut self) -> Self {
        self.degradation_tolerant = false;
        self
    }

    /// 调用方会校验输出并可能重问（分解、规划）：被拒绝的回复不能从缓存重放
    pub fn uncached(mut self) -> Self {
        self.cacheable = false;
        self
    }
}

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub text: String,
    pub confidence: f64,
    pub cost: f64,
    pub path: ExecutionPath,
    /// 低于阈值却未能升级，或来自降级兜底
    pub degraded: bool,
    pub complexity: Complexity,
}

/// 调度接口：目标分解、计划执行、交互对话都经由它
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, request: WorkRequest) -> Result<DispatchOutcome, AgentError>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchStats {
    pub cheap_calls: u64,
    pub costly_calls: u64,
    pub escalations: u64,
    pub degraded: u64,
    pub budget_denials: u64,
    pub total_cost: f64,
    pub cache: CacheStats,
}

pub struct Dispatcher {
    cheap: Arc<dyn LlmClient>,
    costly: Option<Arc<dyn LlmClient>>,
    ledger: Arc<BudgetLedger>,
    resilience: Arc<Resilience>,
    alerts: Arc<AlertLog>,
    cache: QueryCache,
    degradation: Degradation,
    confidence_threshold: f64,
    stats: Mutex<DispatchStats>,
}

/// 一次推理得到的答案及其来源路径
struct Answer {
    inference: Inference,
    path: ExecutionPath,
}

impl Dispatcher {
    pub fn new(
        cheap: Arc<dyn LlmClient>,
        costly: Option<Arc<dyn LlmClient>>,
        ledger: Arc<BudgetLedger>,
        resilience: Arc<Resilience>,
        alerts: Arc<AlertLog>,
        config: &DispatcherSection,
    ) -> Self {
        Self {
            cheap,
            costly,
            ledger,
            resilience,
            alerts,
            cache: QueryCache::new(
                Duration::from_secs(config.cache_ttl_secs),
                config.cache_max_entries,
            ),
            degradation: Degradation::default(),
            confidence_threshold: config.confidence_threshold,
            stats: Mutex::new(DispatchStats::default()),
        }
    }

    pub fn with_degradation(mut self, degradation: Degradation) -> Self {
        self.degradation = degradation;
        self
    }

    pub fn stats(&self) -> DispatchStats {
        let mut stats = self.stats.lock().clone();
        stats.cache = self.cache.stats();
        stats
    }

    async fn cheap_attempt(&self, prompt: &str, mode: Mode) -> Result<Answer, AgentError> {
        let cheap = &self.cheap;
        let inference = self
            .resilience
            .call(CHEAP_DEPENDENCY, move || cheap.infer(prompt, mode))
            .await?;
        if inference.cost > 0.0 {
            self.ledger.record(inference.cost, CHEAP_DEPENDENCY, Utc::now());
        }
        let mut stats = self.stats.lock();
        stats.cheap_calls += 1;
        stats.total_cost += inference.cost;
        Ok(Answer {
            inference,
            path: ExecutionPath::Cheap,
        })
    }

    /// 授权 → 调用 → 结算；被拒绝时写入操作员告警
    async fn costly_attempt(&self, prompt: &str, mode: Mode) -> Result<Answer, AgentError> {
        let Some(costly) = self.costly.as_ref() else {
            return Err(AgentError::NotFound("no costly path configured".into()));
        };
        let estimate = costly.estimate_cost(prompt);
        let reservation = match self.ledger.authorize(estimate) {
            BudgetDecision::Allow(r) => r,
            BudgetDecision::Deny(reason) => {
                self.stats.lock().budget_denials += 1;
                self.alerts.push(
                    AlertKind::BudgetDenied,
                    format!("escalation of {estimate:.4} denied: {reason}"),
                );
                return Err(AgentError::Authorization(reason.to_string()));
            }
        };
        let result = self
            .resilience
            .call(COSTLY_DEPENDENCY, move || costly.infer(prompt, mode))
            .await;
        match result {
            Ok(inference) => {
                self.ledger.commit(reservation, inference.cost, COSTLY_DEPENDENCY);
                let mut stats = self.stats.lock();
                stats.costly_calls += 1;
                stats.total_cost += inference.cost;
                Ok(Answer {
                    inference,
                    path: ExecutionPath::Costly,
                })
            }
            Err(e) => {
                self.ledger.release(reservation);
                Err(e)
            }
        }
    }

    fn outcome(&self, answer: Answer, complexity: Complexity, degraded: bool) -> DispatchOutcome {
        DispatchOutcome {
            text: answer.inference.text,
            confidence: answer.inference.confidence,
            cost: answer.inference.cost,
            path: answer.path,
            degraded,
            complexity,
        }
    }

    fn remember(&self, key: Option<String>, outcome: &DispatchOutcome) {
        let Some(key) = key else { return };
        if outcome.degraded {
            return;
        }
        self.cache.insert(
            key,
            CachedAnswer {
                text: outcome.text.clone(),
                confidence: outcome.confidence,
                path: outcome.path,
            },
        );
    }
}

#[async_trait]
impl Dispatch for Dispatcher {
    async fn dispatch(&self, request: WorkRequest) -> Result<DispatchOutcome, AgentError> {
        let key = request
            .cacheable
            .then(|| format!("{:?}:{}", request.mode, fingerprint(&request.prompt)));
        let complexity = ComplexityClassifier::classify(&request.prompt);

        if let Some(hit) = key.as_deref().and_then(|k| self.cache.get(k)) {
            tracing::debug!(path = ?hit.path, "dispatch cache hit");
            return Ok(DispatchOutcome {
                text: hit.text,
                confidence: hit.confidence,
                cost: 0.0,
                path: ExecutionPath::Cache,
                degraded: false,
                complexity,
            });
        }

        let prompt = request.prompt.as_str();
        let mode = request.mode;
        let mut strategies: Vec<Strategy<'_, Answer>> =
            vec![("cheap".into(), self.cheap_attempt(prompt, mode).boxed())];
        if mode == Mode::Background && self.costly.is_some() {
            strategies.push(("costly".into(), self.costly_attempt(prompt, mode).boxed()));
        }

        let answer = match fallback_chain(strategies).await {
            Ok(success) => {
                if !success.failures.is_empty() {
                    tracing::warn!(failures = ?success.failures, "cheap path unavailable, used fallback");
                }
                success.value
            }
            Err(err) => {
                if !request.degradation_tolerant {
                    return Err(err);
                }
                tracing::warn!(error = %err, "all paths exhausted, degrading");
                let response = self
                    .degradation
                    .respond(prompt, key.as_deref().and_then(|k| self.cache.get_stale(k)).map(|c| c.text));
                self.stats.lock().degraded += 1;
                return Ok(DispatchOutcome {
                    text: response.text,
                    confidence: 0.0,
                    cost: 0.0,
                    path: ExecutionPath::Degraded,
                    degraded: true,
                    complexity,
                });
            }
        };

        if answer.path == ExecutionPath::Costly {
            let outcome = self.outcome(answer, complexity, false);
            self.remember(key, &outcome);
            return Ok(outcome);
        }

        let adjusted = (answer.inference.confidence - complexity.confidence_penalty()).clamp(0.0, 1.0);
        let wants_escalation = mode == Mode::Background
            && adjusted < self.confidence_threshold
            && self.costly.is_some();
        if !wants_escalation {
            let outcome = self.outcome(answer, complexity, false);
            self.remember(key, &outcome);
            return Ok(outcome);
        }

        tracing::info!(
            confidence = answer.inference.confidence,
            adjusted,
            ?complexity,
            "escalating to costly path"
        );
        match self.costly_attempt(prompt, mode).await {
            Ok(costly) => {
                self.stats.lock().escalations += 1;
                let outcome = self.outcome(costly, complexity, false);
                self.remember(key, &outcome);
                Ok(outcome)
            }
            Err(err) => {
                tracing::warn!(error = %err, "escalation unavailable, keeping cheap result");
                self.stats.lock().degraded += 1;
                Ok(self.outcome(answer, complexity, true))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BudgetSection;
    use crate::llm::{MockFailure, MockLlmClient};
    use crate::resilience::{CircuitConfig, RetryPolicy};
    use crate::store::Store;

    struct Fixture {
        cheap: Arc<MockLlmClient>,
        costly: Arc<MockLlmClient>,
        ledger: Arc<BudgetLedger>,
        alerts: Arc<AlertLog>,
        dispatcher: Dispatcher,
    }

    fn fixture(cheap: MockLlmClient, costly: MockLlmClient, daily_limit: f64) -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let ledger = Arc::new(
            BudgetLedger::open(
                store,
                BudgetSection {
                    daily_limit,
                    monthly_limit: 100.0,
                    warn_ratio: 0.8,
                },
            )
            .unwrap(),
        );
        let resilience = Arc::new(Resilience::new(
            CircuitConfig {
                failure_threshold: 3,
                cooldown: Duration::from_secs(60),
            },
            RetryPolicy::new(1, Duration::from_millis(1)),
            Duration::from_secs(5),
        ));
        let alerts = Arc::new(AlertLog::default());
        let cheap = Arc::new(cheap);
        let costly = Arc::new(costly);
        let dispatcher = Dispatcher::new(
            cheap.clone(),
            Some(costly.clone() as Arc<dyn LlmClient>),
            ledger.clone(),
            resilience,
            alerts.clone(),
            &DispatcherSection::default(),
        );
        Fixture {
            cheap,
            costly,
            ledger,
            alerts,
            dispatcher,
        }
    }

    #[tokio::test]
    async fn test_interactive_never_escalates() {
        let f = fixture(
            MockLlmClient::new("cheap").with_reply("meh", 0.2, 0.0),
            MockLlmClient::new("costly").with_estimate(0.01),
            10.0,
        );
        let out = f
            .dispatcher
            .dispatch(WorkRequest::interactive("what is rust"))
            .await
            .unwrap();
        assert_eq!(out.path, ExecutionPath::Cheap);
        assert!(!out.degraded);
        assert_eq!(f.costly.calls(), 0);
    }

    #[tokio::test]
    async fn test_background_low_confidence_escalates() {
        let f = fixture(
            MockLlmClient::new("cheap").with_reply("meh", 0.5, 0.0),
            MockLlmClient::new("costly")
                .with_estimate(0.05)
                .with_reply("great answer", 0.95, 0.04),
            10.0,
        );
        let out = f
            .dispatcher
            .dispatch(WorkRequest::background("summarize the report"))
            .await
            .unwrap();
        assert_eq!(out.path, ExecutionPath::Costly);
        assert_eq!(out.text, "great answer");
        let spent = f
            .ledger
            .summary(crate::budget::BudgetPeriod::Today)
            .unwrap()
            .spent;
        assert!((spent - 0.04).abs() < 1e-9);
        assert_eq!(f.dispatcher.stats().escalations, 1);
    }

    #[tokio::test]
    async fn test_high_confidence_stays_cheap() {
        let f = fixture(
            MockLlmClient::new("cheap").with_reply("sure", 0.95, 0.0),
            MockLlmClient::new("costly"),
            10.0,
        );
        let out = f
            .dispatcher
            .dispatch(WorkRequest::background("hi"))
            .await
            .unwrap();
        assert_eq!(out.path, ExecutionPath::Cheap);
        assert_eq!(f.costly.calls(), 0);
    }

    #[tokio::test]
    async fn test_budget_denial_falls_back_to_cheap_and_alerts() {
        let f = fixture(
            MockLlmClient::new("cheap").with_reply("rough answer", 0.4, 0.0),
            MockLlmClient::new("costly").with_estimate(5.0),
            1.0,
        );
        let out = f
            .dispatcher
            .dispatch(WorkRequest::background("research the market"))
            .await
            .unwrap();
        assert_eq!(out.path, ExecutionPath::Cheap);
        assert!(out.degraded);
        assert_eq!(out.text, "rough answer");
        assert_eq!(f.costly.calls(), 0);
        assert_eq!(f.alerts.count(AlertKind::BudgetDenied), 1);
    }

    #[tokio::test]
    async fn test_costly_failure_keeps_cheap_result() {
        let f = fixture(
            MockLlmClient::new("cheap").with_reply("rough", 0.3, 0.0),
            MockLlmClient::new("costly")
                .with_estimate(0.1)
                .with_failure(MockFailure::Unauthorized),
            10.0,
        );
        let out = f
            .dispatcher
            .dispatch(WorkRequest::background("plan the migration"))
            .await
            .unwrap();
        assert!(out.degraded);
        assert_eq!(out.text, "rough");
        // 预留已释放
        let s = f.ledger.summary(crate::budget::BudgetPeriod::Today).unwrap();
        assert_eq!(s.reserved, 0.0);
    }

    #[tokio::test]
    async fn test_cache_hit_bypasses_everything() {
        let f = fixture(
            MockLlmClient::new("cheap").with_reply("cached me", 0.99, 0.0),
            MockLlmClient::new("costly"),
            10.0,
        );
        f.dispatcher
            .dispatch(WorkRequest::interactive("Capital of France?"))
            .await
            .unwrap();
        let again = f
            .dispatcher
            .dispatch(WorkRequest::interactive("capital   of france?"))
            .await
            .unwrap();
        assert_eq!(again.path, ExecutionPath::Cache);
        assert_eq!(again.cost, 0.0);
        assert_eq!(again.text, "cached me");
        assert_eq!(f.cheap.calls(), 1);
    }

    #[tokio::test]
    async fn test_uncached_request_always_reaches_model() {
        let f = fixture(
            MockLlmClient::new("cheap")
                .with_reply("[]", 0.95, 0.0)
                .with_reply(r#"["a", "b"]"#, 0.95, 0.0),
            MockLlmClient::new("costly"),
            10.0,
        );
        let first = f
            .dispatcher
            .dispatch(WorkRequest::background("split it").strict().uncached())
            .await
            .unwrap();
        let second = f
            .dispatcher
            .dispatch(WorkRequest::background("split it").strict().uncached())
            .await
            .unwrap();
        assert_eq!(first.text, "[]");
        assert_eq!(second.text, r#"["a", "b"]"#);
        assert_eq!(second.path, ExecutionPath::Cheap);
        assert_eq!(f.cheap.calls(), 2);
        assert_eq!(f.dispatcher.stats().cache.entries, 0);
    }

    #[tokio::test]
    async fn test_interactive_degrades_when_cheap_down() {
        let f = fixture(
            MockLlmClient::new("cheap").with_failure(MockFailure::Network),
            MockLlmClient::new("costly"),
            10.0,
        );
        let out = f
            .dispatcher
            .dispatch(WorkRequest::interactive("hello"))
            .await
            .unwrap();
        assert_eq!(out.path, ExecutionPath::Degraded);
        assert!(out.degraded);
        assert_eq!(f.costly.calls(), 0);
    }

    #[tokio::test]
    async fn test_background_uses_costly_when_cheap_down() {
        let f = fixture(
            MockLlmClient::new("cheap").with_failure(MockFailure::Invalid),
            MockLlmClient::new("costly").with_reply("remote", 0.9, 0.02),
            10.0,
        );
        let out = f
            .dispatcher
            .dispatch(WorkRequest::background("list three colors"))
            .await
            .unwrap();
        assert_eq!(out.path, ExecutionPath::Costly);
        assert_eq!(out.text, "remote");
    }

    #[tokio::test]
    async fn test_strict_request_errors_when_all_paths_fail() {
        let f = fixture(
            MockLlmClient::new("cheap").with_failure(MockFailure::Invalid),
            MockLlmClient::new("costly").with_failure(MockFailure::Invalid),
            10.0,
        );
        let err = f
            .dispatcher
            .dispatch(WorkRequest::background("decompose this").strict())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::AllPathsFailed { .. }));
    }
}
