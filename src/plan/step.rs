//! 计划步骤：固定词汇表的标签联合
//!
//! 模型每次返回一个 `{"action": "...", ...}` 对象，反序列化为 Step；
//! 需要外部能力的步骤通过 capability() 查表交给工具执行器。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::extract::extract_json_object;
use crate::core::AgentError;
use crate::tools::Capability;

fn default_dir() -> String {
    ".".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    /// 纯推理，不调用外部能力
    Think {
        #[serde(default)]
        note: String,
    },
    #[serde(alias = "web_search")]
    Search { query: String },
    #[serde(alias = "fetch_webpage")]
    Fetch { url: String },
    ReadFile { path: String },
    #[serde(alias = "create_file")]
    WriteFile { path: String, content: String },
    AppendFile { path: String, content: String },
    ListFiles {
        #[serde(default = "default_dir")]
        path: String,
    },
    RunCommand { command: String },
    Done {
        #[serde(default)]
        summary: String,
    },
}

impl Step {
    pub fn kind(&self) -> &'static str {
        match self {
            Step::Think { .. } => "think",
            Step::Search { .. } => "search",
            Step::Fetch { .. } => "fetch",
            Step::ReadFile { .. } => "read_file",
            Step::WriteFile { .. } => "write_file",
            Step::AppendFile { .. } => "append_file",
            Step::ListFiles { .. } => "list_files",
            Step::RunCommand { .. } => "run_command",
            Step::Done { .. } => "done",
        }
    }

    /// think / done 不需要外部能力
    pub fn capability(&self) -> Option<Capability> {
        match self {
            Step::Think { .. } | Step::Done { .. } => None,
            Step::Search { .. } => Some(Capability::Search),
            Step::Fetch { .. } => Some(Capability::Fetch),
            Step::ReadFile { .. } => Some(Capability::ReadFile),
            Step::WriteFile { .. } => Some(Capability::WriteFile),
            Step::AppendFile { .. } => Some(Capability::AppendFile),
            Step::ListFiles { .. } => Some(Capability::ListFiles),
            Step::RunCommand { .. } => Some(Capability::Command),
        }
    }

    /// 去掉 action 标签后的参数对象，直接作为工具参数
    pub fn params(&self) -> Value {
        let mut v = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut v {
            map.remove("action");
        }
        v
    }

    /// 供历史摘要使用的一行描述
    pub fn label(&self) -> String {
        match self {
            Step::Think { .. } => "think".to_string(),
            Step::Search { query } => format!("search \"{query}\""),
            Step::Fetch { url } => format!("fetch {url}"),
            Step::ReadFile { path } => format!("read_file {path}"),
            Step::WriteFile { path, .. } => format!("write_file {path}"),
            Step::AppendFile { path, .. } => format!("append_file {path}"),
            Step::ListFiles { path } => format!("list_files {path}"),
            Step::RunCommand { command } => format!("run_command {command}"),
            Step::Done { .. } => "done".to_string(),
        }
    }

    /// 从模型输出中取出第一个 JSON 对象并解析
    pub fn parse(text: &str) -> Result<Step, AgentError> {
        let json = extract_json_object(text)
            .ok_or_else(|| AgentError::JsonParse("no JSON object in response".into()))?;
        serde_json::from_str(&json).map_err(|e| AgentError::JsonParse(e.to_string()))
    }
}
