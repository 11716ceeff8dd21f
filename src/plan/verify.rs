//! 产物自检：回读写过的文件，请调度器给出 1-10 分的质量评分
//!
//! 评分只作为结果的一部分记录；读不到文件、调度失败或评分无法解析时视为通过。

use serde::Serialize;
use serde_json::{json, Value};

use crate::config::ExecutorSection;
use crate::core::extract::{extract_json_object, truncate_chars};
use crate::goals::{Goal, Task};
use crate::router::{Dispatch, WorkRequest};
use crate::tools::{Capability, ToolExecutor};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Verification {
    pub score: Option<u8>,
    pub passed: bool,
    pub issues: Vec<String>,
    /// 实际读到并送审的文件
    pub files: Vec<String>,
    pub cost: f64,
}

impl Verification {
    fn passed_without_judgment(files: Vec<String>, cost: f64) -> Self {
        Self {
            score: None,
            passed: true,
            issues: Vec::new(),
            files,
            cost,
        }
    }
}

pub async fn verify_artifacts(
    dispatcher: &dyn Dispatch,
    tools: &ToolExecutor,
    task: &Task,
    goal: &Goal,
    artifacts: &[String],
    config: &ExecutorSection,
) -> Verification {
    let mut files = Vec::new();
    let mut block = String::new();
    for path in artifacts.iter().take(config.verify_max_files) {
        match tools.invoke(Capability::ReadFile, json!({ "path": path })).await {
            Ok(out) => {
                block.push_str(&format!(
                    "\n--- {path} ---\n{}\n",
                    truncate_chars(&out.artifact, config.verify_max_chars)
                ));
                files.push(path.clone());
            }
            Err(e) => tracing::debug!(path = %path, error = %e, "artifact not readable for verification"),
        }
    }
    if files.is_empty() {
        return Verification::passed_without_judgment(files, 0.0);
    }
    tracing::info!(task_id = %task.id, files = files.len(), "verifying artifacts");

    let prompt = format!(
        r#"You are reviewing work done by an autonomous agent.

Task: {task}
Goal: {goal}

Files produced:
{block}
Rate the quality of this work on a scale of 1-10:
1-3 = poor (generic filler, placeholder text)
4-5 = thin (some useful content, clear gaps)
6-7 = good (substantive and specific)
8-10 = excellent (comprehensive and actionable)

Return ONLY a JSON object: {{"score": <1-10>, "issues": ["problem", ...]}}"#,
        task = task.description,
        goal = goal.description,
    );

    let outcome = match dispatcher.dispatch(WorkRequest::background(prompt).strict()).await {
        Ok(o) => o,
        Err(e) => {
            tracing::warn!(task_id = %task.id, error = %e, "verification dispatch failed, treating as passed");
            return Verification::passed_without_judgment(files, 0.0);
        }
    };
    let Some((score, issues)) = parse_judgment(&outcome.text) else {
        return Verification::passed_without_judgment(files, outcome.cost);
    };
    tracing::info!(task_id = %task.id, score, issues = issues.len(), "verification judged");
    Verification {
        score: Some(score),
        passed: score >= config.verify_pass_score,
        issues,
        files,
        cost: outcome.cost,
    }
}

/// 解析 `{"score"|"quality": n, "issues": [..] | ".."}`
pub fn parse_judgment(text: &str) -> Option<(u8, Vec<String>)> {
    let json = extract_json_object(text)?;
    let v: Value = serde_json::from_str(&json).ok()?;
    let raw = v.get("score").or_else(|| v.get("quality"))?;
    let score = raw
        .as_f64()
        .or_else(|| raw.as_str().and_then(|s| s.trim().parse().ok()))?;
    let score = score.round().clamp(1.0, 10.0) as u8;
    let issues = match v.get("issues") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|i| i.as_str())
            .map(str::to_string)
            .filter(|s| !s.trim().is_empty())
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.clone()],
        _ => Vec::new(),
    };
    Some((score, issues))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_judgment_shapes() {
        assert_eq!(
            parse_judgment(r#"{"score": 7, "issues": ["no sources"]}"#),
            Some((7, vec!["no sources".to_string()]))
        );
        assert_eq!(
            parse_judgment("```json\n{\"quality\": \"4\", \"issues\": \"too short\"}\n```"),
            Some((4, vec!["too short".to_string()]))
        );
        assert_eq!(parse_judgment(r#"{"score": 42}"#), Some((10, vec![])));
        assert_eq!(parse_judgment("looks fine to me"), None);
        assert_eq!(parse_judgment(r#"{"issues": []}"#), None);
    }
}
