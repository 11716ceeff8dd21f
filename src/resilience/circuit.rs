//! 熔断器
//!
//! 每个依赖名一个 CircuitBreaker：closed 放行；连续失败达到阈值后 open，期间快速失败；
//! 冷却结束后 half_open 只放行一次试探调用，成功则 closed，失败则重新 open 并重新计时。
//! 状态迁移在锁内完成，`state()` 读取原子快照（允许短暂不一致）。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::core::AgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    last_failure: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

/// 供状态接口展示的快照
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub dependency: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<Inner>,
    state_hint: AtomicU8,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                last_failure: None,
                trial_in_flight: false,
            }),
            state_hint: AtomicU8::new(CircuitState::Closed.to_u8()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 无锁读取（最终一致）
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state_hint.load(Ordering::Acquire))
    }

    /// 申请一次调用许可；open 且未冷却、或 half_open 已有试探在途时返回 CircuitOpen
    pub fn acquire(&self) -> Result<CallPermit<'_>, AgentError> {
        let mut inner = self.inner.lock();
        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if !cooled {
                    return Err(self.open_error());
                }
                self.set_state(&mut inner, CircuitState::HalfOpen);
                inner.trial_in_flight = true;
                tracing::info!(dependency = %self.name, "circuit half-open, allowing trial call");
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(self.open_error());
                }
                inner.trial_in_flight = true;
                true
            }
        };
        Ok(CallPermit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        if trial || inner.state != CircuitState::Closed {
            inner.trial_in_flight = false;
            inner.opened_at = None;
            self.set_state(&mut inner, CircuitState::Closed);
            tracing::info!(dependency = %self.name, "circuit closed");
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.inner.lock();
        inner.last_failure = Some(Utc::now());
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        if trial || inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
            inner.opened_at = Some(Instant::now());
            self.set_state(&mut inner, CircuitState::Open);
            tracing::warn!(dependency = %self.name, "trial call failed, circuit reopened");
            return;
        }
        if inner.state == CircuitState::Closed
            && inner.consecutive_failures >= self.config.failure_threshold
        {
            inner.opened_at = Some(Instant::now());
            self.set_state(&mut inner, CircuitState::Open);
            tracing::warn!(
                dependency = %self.name,
                failures = inner.consecutive_failures,
                "circuit opened"
            );
        }
    }

    /// 操作员手动复位
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
        self.set_state(&mut inner, CircuitState::Closed);
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            dependency: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure: inner.last_failure,
        }
    }

    fn set_state(&self, inner: &mut Inner, state: CircuitState) {
        inner.state = state;
        self.state_hint.store(state.to_u8(), Ordering::Release);
    }

    fn open_error(&self) -> AgentError {
        AgentError::CircuitOpen {
            dependency: self.name.clone(),
        }
    }
}

/// 调用许可：必须以 success / failure 结算；未结算即被丢弃（如调用方 future 被取消）按失败处理
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl CallPermit<'_> {
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_failure(self.trial);
        }
    }
}

/// 按依赖名惰性创建熔断器
pub struct CircuitRegistry {
    config: CircuitConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitRegistry {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn breaker(&self, dependency: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .lock()
            .entry(dependency.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(dependency, self.config.clone())))
            .clone()
    }

    /// 未调用过的依赖视为 closed
    pub fn state(&self, dependency: &str) -> CircuitState {
        self.breakers
            .lock()
            .get(dependency)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.lock().values().cloned().collect();
        let mut out: Vec<CircuitSnapshot> = breakers.iter().map(|b| b.snapshot()).collect();
        out.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        out
    }

    pub fn reset(&self, dependency: &str) -> bool {
        match self.breakers.lock().get(dependency) {
            Some(b) => {
                b.reset();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "llm:costly",
            CircuitConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_secs(60),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let cb = breaker(3);
        for _ in 0..2 {
            cb.acquire().unwrap().failure();
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        cb.acquire().unwrap().failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(cb.acquire(), Err(AgentError::CircuitOpen { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let cb = breaker(2);
        cb.acquire().unwrap().failure();
        cb.acquire().unwrap().success();
        cb.acquire().unwrap().failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_allows_exactly_one_trial() {
        let cb = breaker(1);
        cb.acquire().unwrap().failure();
        tokio::time::advance(Duration::from_secs(61)).await;

        let trial = cb.acquire().unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.acquire().is_err(), "second caller must fail fast");
        trial.success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_restarts_cooldown() {
        let cb = breaker(1);
        cb.acquire().unwrap().failure();
        tokio::time::advance(Duration::from_secs(61)).await;
        cb.acquire().unwrap().failure();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cb.acquire().is_err());
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cb.acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_permit_counts_as_failure() {
        let cb = breaker(1);
        drop(cb.acquire().unwrap());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_registry_snapshot_sorted() {
        let reg = CircuitRegistry::new(CircuitConfig::default());
        reg.breaker("tool:search");
        reg.breaker("llm:cheap");
        let names: Vec<String> = reg.snapshot().into_iter().map(|s| s.dependency).collect();
        assert_eq!(names, vec!["llm:cheap", "tool:search"]);
        assert_eq!(reg.state("unknown"), CircuitState::Closed);
    }
}
