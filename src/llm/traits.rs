//! 推理客户端抽象
//!
//! 廉价（本地）与昂贵（远程）两条路径都实现 LlmClient：infer 返回文本、自评置信度与本次花费。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::AgentError;

/// 调用方声明的模式：interactive 对延迟敏感，只走廉价路径；background 允许升级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Interactive,
    Background,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Inference {
    pub text: String,
    /// 0.0 - 1.0
    pub confidence: f64,
    pub cost: f64,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 用作熔断依赖名与账本路径的后缀
    fn name(&self) -> &str;

    async fn infer(&self, prompt: &str, mode: Mode) -> Result<Inference, AgentError>;

    /// 调用前的成本估算（供账本授权）；本地模型默认 0
    fn estimate_cost(&self, _prompt: &str) -> f64 {
        0.0
    }

    /// 累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

const HEDGES: &[&str] = &[
    "i'm not sure",
    "i am not sure",
    "i don't know",
    "i do not know",
    "not certain",
    "unclear",
    "might be",
    "possibly",
    "i think",
    "i cannot",
    "i can't",
];

/// 不自报置信度的后端使用的启发式估计
///
/// 基准 0.7；短回答 +0.1，超长回答 -0.1；含犹豫措辞 -0.2；空回答 0.3
pub fn estimate_confidence(text: &str) -> f64 {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0.3;
    }
    let words = trimmed.split_whitespace().count();
    let mut confidence: f64 = 0.7;
    if words < 20 {
        confidence += 0.1;
    } else if words > 100 {
        confidence -= 0.1;
    }
    let lower = trimmed.to_lowercase();
    if HEDGES.iter().any(|h| lower.contains(h)) {
        confidence -= 0.2;
    }
    confidence.clamp(0.0, 1.0)
}
