//! Mock 推理客户端（用于测试与离线运行，无需 API）
//!
//! 按脚本顺序返回预设回复或失败；脚本耗尽后回显最后一行输入。也可以传入按 prompt 计算回复的闭包。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::AgentError;
use crate::llm::{Inference, LlmClient, Mode};

/// 可脚本化的失败类型（AgentError 不可 Clone，这里存种类）
#[derive(Debug, Clone, Copy)]
pub enum MockFailure {
    Timeout,
    Network,
    RateLimited,
    Unauthorized,
    Invalid,
}

#[derive(Debug, Clone)]
pub enum MockReply {
    Text {
        text: String,
        confidence: f64,
        cost: f64,
    },
    Fail(MockFailure),
}

type Responder = dyn Fn(&str, Mode) -> Result<Inference, AgentError> + Send + Sync;

pub struct MockLlmClient {
    name: String,
    script: Mutex<VecDeque<MockReply>>,
    responder: Option<Box<Responder>>,
    estimate: f64,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl MockLlmClient {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            responder: None,
            estimate: 0.0,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// 每次调用由闭包根据 prompt 生成结果
    pub fn from_fn(
        name: impl Into<String>,
        f: impl Fn(&str, Mode) -> Result<Inference, AgentError> + Send + Sync + 'static,
    ) -> Self {
        let mut client = Self::new(name);
        client.responder = Some(Box::new(f));
        client
    }

    pub fn with_reply(self, text: impl Into<String>, confidence: f64, cost: f64) -> Self {
        self.script.lock().push_back(MockReply::Text {
            text: text.into(),
            confidence,
            cost,
        });
        self
    }

    pub fn with_failure(self, failure: MockFailure) -> Self {
        self.script.lock().push_back(MockReply::Fail(failure));
        self
    }

    pub fn with_estimate(mut self, estimate: f64) -> Self {
        self.estimate = estimate;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    fn failure(&self, kind: MockFailure) -> AgentError {
        match kind {
            MockFailure::Timeout => AgentError::Timeout(format!("{} timed out", self.name)),
            MockFailure::Network => AgentError::Network(format!("{} unreachable", self.name)),
            MockFailure::RateLimited => AgentError::RateLimited {
                dependency: self.name.clone(),
                retry_after_ms: Some(10),
            },
            MockFailure::Unauthorized => AgentError::Authorization(format!("{} rejected key", self.name)),
            MockFailure::Invalid => AgentError::Inference(format!("{} returned garbage", self.name)),
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn infer(&self, prompt: &str, mode: Mode) -> Result<Inference, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(prompt.to_string());

        let scripted = self.script.lock().pop_front();
        match scripted {
            Some(MockReply::Text {
                text,
                confidence,
                cost,
            }) => Ok(Inference {
                text,
                confidence,
                cost,
            }),
            Some(MockReply::Fail(kind)) => Err(self.failure(kind)),
            None => match &self.responder {
                Some(f) => f(prompt, mode),
                None => {
                    let last_line = prompt.lines().last().unwrap_or("(no input)");
                    Ok(Inference {
                        text: format!("Echo from {}: {}", self.name, last_line),
                        confidence: 0.9,
                        cost: 0.0,
                    })
                }
            },
        }
    }

    fn estimate_cost(&self, _prompt: &str) -> f64 {
        self.estimate
    }
}
