//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；既可指向本地推理服务作为廉价路径，
//! 也可指向远程服务作为昂贵路径。成本由 token 用量与每百万 token 价格计算。

use std::sync::atomic::{AtomicU64, Ordering};

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::config::LlmEndpoint;
use crate::core::AgentError;
use crate::llm::{estimate_confidence, Inference, LlmClient, Mode};

/// Token 使用统计（累计值）
#[derive(Debug, Default)]
pub struct TokenUsage {
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
}

impl TokenUsage {
    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        let p = self.prompt_tokens.load(Ordering::Relaxed);
        let c = self.completion_tokens.load(Ordering::Relaxed);
        (p, c, p + c)
    }
}

/// 每百万 token 的价格
#[derive(Debug, Clone, Copy, Default)]
pub struct Pricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl Pricing {
    pub fn cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        (prompt_tokens as f64 * self.input_per_million
            + completion_tokens as f64 * self.output_per_million)
            / 1_000_000.0
    }
}

pub struct OpenAiClient {
    name: String,
    client: Client<OpenAIConfig>,
    model: String,
    pricing: Pricing,
    expected_output_tokens: u64,
    usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(
        name: impl Into<String>,
        base_url: Option<&str>,
        model: &str,
        api_key: Option<String>,
        pricing: Pricing,
    ) -> Self {
        let api_key = api_key.unwrap_or_else(|| "sk-placeholder".to_string());
        let config = match base_url {
            Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };
        Self {
            name: name.into(),
            client: Client::with_config(config),
            model: model.to_string(),
            pricing,
            expected_output_tokens: 800,
            usage: TokenUsage::default(),
        }
    }

    /// 从 [llm.cheap] / [llm.costly] 构造；API Key 取自 endpoint.api_key_env 指定的环境变量
    pub fn from_endpoint(name: &str, endpoint: &LlmEndpoint, expected_output_tokens: u64) -> Self {
        let api_key = std::env::var(&endpoint.api_key_env).ok();
        let mut client = Self::new(
            name,
            endpoint.base_url.as_deref(),
            &endpoint.model,
            api_key,
            Pricing {
                input_per_million: endpoint.input_price_per_million,
                output_per_million: endpoint.output_price_per_million,
            },
        );
        client.expected_output_tokens = expected_output_tokens;
        client
    }
}

/// async_openai 的错误统一转为 AgentError，按文本区分瞬时 / 授权 / 其他
fn classify_error(name: &str, err: impl std::fmt::Display) -> AgentError {
    let msg = err.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("rate limit") || lower.contains("429") {
        AgentError::RateLimited {
            dependency: name.to_string(),
            retry_after_ms: None,
        }
    } else if lower.contains("timed out") || lower.contains("timeout") {
        AgentError::Timeout(msg)
    } else if lower.contains("401")
        || lower.contains("403")
        || lower.contains("api key")
        || lower.contains("unauthorized")
    {
        AgentError::Authorization(msg)
    } else if lower.contains("error sending request")
        || lower.contains("connection")
        || lower.contains("dns")
    {
        AgentError::Network(msg)
    } else {
        AgentError::Inference(msg)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn infer(&self, prompt: &str, _mode: Mode) -> Result<Inference, AgentError> {
        let user = ChatCompletionRequestUserMessageArgs::default()
            .content(prompt.to_string())
            .build()
            .map_err(|e| AgentError::Inference(e.to_string()))?;
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(vec![ChatCompletionRequestMessage::User(user)])
            .build()
            .map_err(|e| AgentError::Inference(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| classify_error(&self.name, e))?;

        let (prompt_tokens, completion_tokens) = response
            .usage
            .as_ref()
            .map(|u| (u.prompt_tokens as u64, u.completion_tokens as u64))
            .unwrap_or((0, 0));
        self.usage.add(prompt_tokens, completion_tokens);

        let text = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(Inference {
            confidence: estimate_confidence(&text),
            cost: self.pricing.cost(prompt_tokens, completion_tokens),
            text,
        })
    }

    /// 约 4 字符 / token 估算输入，加上预期输出
    fn estimate_cost(&self, prompt: &str) -> f64 {
        let prompt_tokens = (prompt.chars().count() as u64 / 4).max(1);
        self.pricing.cost(prompt_tokens, self.expected_output_tokens)
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pricing_cost() {
        let p = Pricing {
            input_per_million: 2.0,
            output_per_million: 8.0,
        };
        assert!((p.cost(500_000, 100_000) - 1.8).abs() < 1e-9);
    }

    #[test]
    fn test_estimate_cost_uses_expected_output() {
        let client = OpenAiClient::new(
            "costly",
            Some("http://localhost:1"),
            "m",
            None,
            Pricing {
                input_per_million: 0.0,
                output_per_million: 10.0,
            },
        );
        // 800 输出 token * 10 / 1e6
        assert!((client.estimate_cost("hello") - 0.008).abs() < 1e-9);
    }

    #[test]
    fn test_error_classification() {
        assert!(matches!(
            classify_error("x", "HTTP 429 rate limit reached"),
            AgentError::RateLimited { .. }
        ));
        assert!(classify_error("x", "operation timed out").is_transient());
        assert!(matches!(
            classify_error("x", "Incorrect API key provided"),
            AgentError::Authorization(_)
        ));
        assert!(matches!(
            classify_error("x", "model not found"),
            AgentError::Inference(_)
        ));
    }
}
