//! 工具注册表
//!
//! 所有工具实现 Tool trait（capability / description / execute），由 ToolRegistry 按能力注册与查找，
//! ToolExecutor 在调用时加超时并统一转 AgentError。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;

/// 工具能力：计划步骤按能力查表分发
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Search,
    Fetch,
    ReadFile,
    WriteFile,
    AppendFile,
    ListFiles,
    Command,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Search => "search",
            Capability::Fetch => "fetch",
            Capability::ReadFile => "read_file",
            Capability::WriteFile => "write_file",
            Capability::AppendFile => "append_file",
            Capability::ListFiles => "list_files",
            Capability::Command => "run_command",
        }
    }

    /// 走网络的能力需要经过弹性层（熔断 + 重试）
    pub fn is_remote(&self) -> bool {
        matches!(self, Capability::Search | Capability::Fetch)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次工具调用的产出
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub artifact: String,
    pub cost: f64,
    /// 写入的工作区相对路径（供验证阶段回读）
    pub written: Option<String>,
}

impl ToolOutput {
    pub fn text(artifact: impl Into<String>) -> Self {
        Self {
            artifact: artifact.into(),
            ..Default::default()
        }
    }
}

/// 工具 trait：能力、描述（供 LLM 理解）、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    fn capability(&self) -> Capability;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    async fn execute(&self, args: Value) -> Result<ToolOutput, AgentError>;
}

/// 工具注册表：按能力存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<Capability, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.capability(), Arc::new(tool));
    }

    pub fn get(&self, capability: Capability) -> Option<Arc<dyn Tool>> {
        self.tools.get(&capability).cloned()
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps: Vec<_> = self.tools.keys().copied().collect();
        caps.sort_by_key(|c| c.as_str());
        caps
    }

    /// 返回 (能力, 描述) 列表，用于生成 prompt 中的 Available actions 段落
    pub fn descriptions(&self) -> Vec<(Capability, String)> {
        self.capabilities()
            .into_iter()
            .filter_map(|c| self.tools.get(&c).map(|t| (c, t.description().to_string())))
            .collect()
    }
}
