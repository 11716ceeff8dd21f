//! 弹性层：熔断、退避重试、回退链、降级
//!
//! `Resilience::call` 把三者组合成一个包装：熔断许可 → 超时 → 结算熔断 → 瞬时失败退避重试。
//! 所有外部调用（推理、检索、抓取）都经由它，保证任何调用都不会无限阻塞。

pub mod circuit;
pub mod fallback;
pub mod retry;

use std::future::Future;
use std::time::Duration;

pub use circuit::{CircuitBreaker, CircuitConfig, CircuitRegistry, CircuitSnapshot, CircuitState};
pub use fallback::{fallback_chain, Degradation, DegradedResponse, DegradedSource, FallbackSuccess, Strategy};
pub use retry::{retry_with_backoff, RetryPolicy};

use crate::config::ResilienceSection;
use crate::core::AgentError;

pub struct Resilience {
    circuits: CircuitRegistry,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl Resilience {
    pub fn new(circuit: CircuitConfig, retry: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            circuits: CircuitRegistry::new(circuit),
            retry,
            call_timeout,
        }
    }

    pub fn from_config(cfg: &ResilienceSection) -> Self {
        Self::new(
            CircuitConfig {
                failure_threshold: cfg.failure_threshold.max(1),
                cooldown: Duration::from_secs(cfg.cooldown_secs),
            },
            RetryPolicy {
                max_attempts: cfg.max_attempts.max(1),
                base_delay: Duration::from_millis(cfg.base_delay_ms),
                max_delay: Duration::from_millis(cfg.max_delay_ms),
            },
            Duration::from_secs(cfg.call_timeout_secs.max(1)),
        )
    }

    /// 以 dependency 名义执行 op：熔断打开时快速失败（不调用 op，不重试）；
    /// 每次尝试带超时，超时视为瞬时失败
    pub async fn call<T, F, Fut>(&self, dependency: &str, op: F) -> Result<T, AgentError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, AgentError>>,
    {
        let breaker = self.circuits.breaker(dependency);
        let breaker = breaker.as_ref();
        let op = &op;
        let limit = self.call_timeout;
        retry_with_backoff(&self.retry, dependency, move |_attempt| {
            guarded_call(breaker, limit, op)
        })
        .await
    }

    pub fn circuit_state(&self, dependency: &str) -> CircuitState {
        self.circuits.state(dependency)
    }

    pub fn circuits(&self) -> &CircuitRegistry {
        &self.circuits
    }
}

async fn guarded_call<T, F, Fut>(
    breaker: &CircuitBreaker,
    limit: Duration,
    op: &F,
) -> Result<T, AgentError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, AgentError>>,
{
    let permit = breaker.acquire()?;
    match tokio::time::timeout(limit, op()).await {
        Ok(Ok(value)) => {
            permit.success();
            Ok(value)
        }
        Ok(Err(err)) => {
            permit.failure();
            Err(err)
        }
        Err(_) => {
            permit.failure();
            Err(AgentError::Timeout(format!(
                "{} did not respond within {}s",
                breaker.name(),
                limit.as_secs()
            )))
        }
    }
}
