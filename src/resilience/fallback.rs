//! 回退链与降级响应

use futures_util::future::BoxFuture;
use serde::Serialize;

use crate::core::AgentError;

/// 回退链中的一个策略：名称 + 惰性 future（仅在轮到它时才被 poll）
pub type Strategy<'a, T> = (String, BoxFuture<'a, Result<T, AgentError>>);

/// 回退链成功结果：值、生效的策略名、之前失败的策略记录
#[derive(Debug)]
pub struct FallbackSuccess<T> {
    pub value: T,
    pub strategy: String,
    pub failures: Vec<String>,
}

/// 依次尝试，返回第一个成功；全部失败时返回最后一个错误并附带完整尝试记录
pub async fn fallback_chain<T>(
    strategies: Vec<Strategy<'_, T>>,
) -> Result<FallbackSuccess<T>, AgentError> {
    let mut failures = Vec::with_capacity(strategies.len());
    let mut last = None;
    for (name, fut) in strategies {
        match fut.await {
            Ok(value) => {
                return Ok(FallbackSuccess {
                    value,
                    strategy: name,
                    failures,
                })
            }
            Err(err) => {
                tracing::debug!(strategy = %name, error = %err, "fallback strategy failed");
                failures.push(format!("{name}: {err}"));
                last = Some(err);
            }
        }
    }
    let last = last.unwrap_or_else(|| AgentError::Config("empty fallback chain".into()));
    Err(AgentError::AllPathsFailed {
        last: Box::new(last),
        attempts: failures,
    })
}

/// 降级响应的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedSource {
    Cached,
    Template,
    Canned,
}

#[derive(Debug, Clone)]
pub struct DegradedResponse {
    pub text: String,
    pub source: DegradedSource,
}

/// 所有路径耗尽时的兜底：缓存（可过期） > 关键词模板 > 固定文案
#[derive(Debug, Clone)]
pub struct Degradation {
    templates: Vec<(Vec<String>, String)>,
    canned: String,
}

impl Default for Degradation {
    fn default() -> Self {
        Self::new(
            "I'm running in a limited mode right now and can't reach my reasoning backends. \
             Your message was received; please try again in a few minutes.",
        )
        .with_template(
            &["hello", "hi", "hey"],
            "Hello! I'm in a limited mode at the moment, but I'm still here.",
        )
        .with_template(
            &["status", "are you there", "alive"],
            "I'm up, but my inference backends are temporarily unavailable.",
        )
    }
}

impl Degradation {
    pub fn new(canned: impl Into<String>) -> Self {
        Self {
            templates: Vec::new(),
            canned: canned.into(),
        }
    }

    pub fn with_template(mut self, keywords: &[&str], response: impl Into<String>) -> Self {
        self.templates.push((
            keywords.iter().map(|k| k.to_lowercase()).collect(),
            response.into(),
        ));
        self
    }

    pub fn respond(&self, prompt: &str, cached: Option<String>) -> DegradedResponse {
        if let Some(text) = cached {
            return DegradedResponse {
                text,
                source: DegradedSource::Cached,
            };
        }
        let lower = prompt.to_lowercase();
        let words: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric() && c != '\'')
            .filter(|w| !w.is_empty())
            .collect();
        for (keywords, response) in &self.templates {
            let hit = keywords.iter().any(|k| {
                if k.contains(' ') {
                    lower.contains(k.as_str())
                } else {
                    words.iter().any(|w| w == k)
                }
            });
            if hit {
                return DegradedResponse {
                    text: response.clone(),
                    source: DegradedSource::Template,
                };
            }
        }
        DegradedResponse {
            text: self.canned.clone(),
            source: DegradedSource::Canned,
        }
    }
}
