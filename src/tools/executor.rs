//! 工具执行器
//!
//! 持有 ToolRegistry 与超时，invoke(capability, args) 按能力查表调用工具：
//! 网络能力（search / fetch）经弹性层（熔断 + 重试 + 超时），本地能力仅加超时；
//! 工具上报的成本记入账本；每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::time::timeout;

use crate::budget::BudgetLedger;
use crate::core::AgentError;
use crate::resilience::Resilience;
use crate::tools::{Capability, Tool, ToolOutput, ToolRegistry};

/// 工具执行器：对每次调用施加超时，并将结果映射为 AgentError
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
    resilience: Arc<Resilience>,
    ledger: Arc<BudgetLedger>,
}

impl ToolExecutor {
    pub fn new(
        registry: ToolRegistry,
        timeout_secs: u64,
        resilience: Arc<Resilience>,
        ledger: Arc<BudgetLedger>,
    ) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs.max(1)),
            resilience,
            ledger,
        }
    }

    /// 执行指定能力；未注册返回 NotFound，超时返回 Timeout；输出 JSON 审计日志
    pub async fn invoke(&self, capability: Capability, args: Value) -> Result<ToolOutput, AgentError> {
        let tool = self
            .registry
            .get(capability)
            .ok_or_else(|| AgentError::NotFound(format!("No tool for capability {capability}")))?;
        let start = Instant::now();
        let args_preview = args_preview(&args);

        let result = if capability.is_remote() {
            let dependency = format!("tool:{capability}");
            self.resilience
                .call(&dependency, || self.run_once(tool.as_ref(), capability, args.clone()))
                .await
        } else {
            self.run_once(tool.as_ref(), capability, args).await
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(AgentError::Timeout(_)) => "timeout",
            Err(_) => "error",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": capability.as_str(),
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        let output = result?;
        if output.cost > 0.0 {
            self.ledger
                .record(output.cost, &format!("tool:{capability}"), Utc::now());
        }
        Ok(output)
    }

    async fn run_once(
        &self,
        tool: &dyn Tool,
        capability: Capability,
        args: Value,
    ) -> Result<ToolOutput, AgentError> {
        match timeout(self.timeout, tool.execute(args)).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout(format!(
                "{capability} exceeded {}s",
                self.timeout.as_secs()
            ))),
        }
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        self.registry.capabilities()
    }

    pub fn descriptions(&self) -> Vec<(Capability, String)> {
        self.registry.descriptions()
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetPeriod;
    use crate::config::{BudgetSection, ResilienceSection};
    use crate::store::Store;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Tool for Flaky {
        fn capability(&self) -> Capability {
            Capability::Search
        }

        fn description(&self) -> &str {
            "flaky search"
        }

        async fn execute(&self, _args: Value) -> Result<ToolOutput, AgentError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(AgentError::Network("reset".into()));
            }
            Ok(ToolOutput {
                artifact: "results".into(),
                cost: 0.02,
                written: None,
            })
        }
    }

    struct Slow;

    #[async_trait]
    impl Tool for Slow {
        fn capability(&self) -> Capability {
            Capability::Command
        }

        fn description(&self) -> &str {
            "never finishes"
        }

        async fn execute(&self, _args: Value) -> Result<ToolOutput, AgentError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ToolOutput::default())
        }
    }

    fn executor(registry: ToolRegistry) -> (ToolExecutor, Arc<BudgetLedger>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let ledger = Arc::new(BudgetLedger::open(store, BudgetSection::default()).unwrap());
        let resilience = Arc::new(Resilience::from_config(&ResilienceSection {
            base_delay_ms: 1,
            ..ResilienceSection::default()
        }));
        (ToolExecutor::new(registry, 2, resilience, ledger.clone()), ledger)
    }

    #[tokio::test]
    async fn test_remote_tool_retried_and_cost_recorded() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut reg = ToolRegistry::new();
        reg.register(Flaky {
            calls: calls.clone(),
        });
        let (exec, ledger) = executor(reg);
        let out = exec.invoke(Capability::Search, json!({"query": "x"})).await.unwrap();
        assert_eq!(out.artifact, "results");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let spent = ledger.summary(BudgetPeriod::Today).unwrap().spent;
        assert!((spent - 0.02).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_tool_times_out() {
        let mut reg = ToolRegistry::new();
        reg.register(Slow);
        let (exec, _) = executor(reg);
        let err = exec.invoke(Capability::Command, json!({})).await.unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_unregistered_capability() {
        let (exec, _) = executor(ToolRegistry::new());
        let err = exec.invoke(Capability::Fetch, json!({})).await.unwrap_err();
        assert!(matches!(err, AgentError::NotFound(_)));
    }
}
