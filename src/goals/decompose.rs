//! 目标分解：构造提示词、解析模型返回的任务列表
//!
//! 模型应返回 JSON 数组，元素可以是字符串或 `{description, estimated_minutes, dependencies, priority}` 对象；
//! 依赖为更早任务的下标，前向与自引用被丢弃。数量超过上限时截断，低于下限视为分解失败。

use serde::Deserialize;
use serde_json::Value;

use crate::core::extract::extract_json_array;
use crate::goals::types::{Goal, DEFAULT_PRIORITY, MAX_PRIORITY, MIN_PRIORITY};

const DEFAULT_ESTIMATE_MINUTES: u32 = 30;

/// 解析后的任务草稿（尚未分配 id）
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDraft {
    pub description: String,
    pub estimated_minutes: u32,
    /// 指向本批次中更早任务的下标
    pub dependencies: Vec<usize>,
    pub priority: u8,
}

#[derive(Debug, Deserialize)]
struct RawTask {
    #[serde(default)]
    description: String,
    #[serde(default, alias = "estimated_duration_minutes")]
    estimated_minutes: Option<u32>,
    #[serde(default)]
    dependencies: Vec<Value>,
    #[serde(default)]
    priority: Option<i64>,
}

pub fn build_prompt(goal: &Goal, min_tasks: usize, max_tasks: usize) -> String {
    format!(
        r#"Break down this goal into specific, actionable tasks.

Goal: {description}
User Intent: {intent}

Create between {min_tasks} and {max_tasks} tasks with:
1. Clear, specific task descriptions
2. Estimated duration in minutes
3. Dependencies (indices of earlier tasks that must complete first, 0 is the first task)
4. Priority (1-10)

Return ONLY a JSON array of tasks:
[
  {{"description": "Task description", "estimated_minutes": 30, "dependencies": [], "priority": 5}}
]

Each task should be something that can be completed in one work session."#,
        description = goal.description,
        intent = goal.intent,
    )
}

/// 依赖既可以是数字，也可以是 "1" 这样的字符串
fn dependency_index(v: &Value) -> Option<usize> {
    match v {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// 解析模型输出；返回 Err(原因) 时由调用方转为 Decomposition 错误
pub fn parse_tasks(text: &str, min_tasks: usize, max_tasks: usize) -> Result<Vec<TaskDraft>, String> {
    let json = extract_json_array(text).ok_or_else(|| "response contains no JSON array".to_string())?;
    let items: Vec<Value> = serde_json::from_str(&json).map_err(|e| format!("invalid task array: {e}"))?;

    let mut drafts = Vec::new();
    for item in items {
        let raw = match item {
            Value::String(s) => RawTask {
                description: s,
                estimated_minutes: None,
                dependencies: Vec::new(),
                priority: None,
            },
            Value::Object(_) => match serde_json::from_value::<RawTask>(item) {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping malformed task entry");
                    continue;
                }
            },
            _ => continue,
        };
        let description = raw.description.trim().to_string();
        if description.is_empty() {
            continue;
        }
        let idx = drafts.len();
        let mut dependencies: Vec<usize> = raw
            .dependencies
            .iter()
            .filter_map(dependency_index)
            .filter(|d| *d < idx)
            .collect();
        dependencies.sort_unstable();
        dependencies.dedup();
        let priority = raw
            .priority
            .map(|p| p.clamp(MIN_PRIORITY as i64, MAX_PRIORITY as i64) as u8)
            .unwrap_or(DEFAULT_PRIORITY);
        drafts.push(TaskDraft {
            description,
            estimated_minutes: raw.estimated_minutes.unwrap_or(DEFAULT_ESTIMATE_MINUTES),
            dependencies,
            priority,
        });
    }

    if drafts.len() > max_tasks {
        tracing::debug!(proposed = drafts.len(), max_tasks, "truncating decomposition");
        drafts.truncate(max_tasks);
    }
    if drafts.len() < min_tasks {
        return Err(format!(
            "expected at least {min_tasks} tasks, got {}",
            drafts.len()
        ));
    }
    Ok(drafts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_objects_inside_fence() {
        let text = r#"Here you go:
```json
[
  {"description": "Collect sources", "estimated_duration_minutes": 20, "dependencies": [], "priority": 7},
  {"description": "Write summary", "dependencies": [0, "0", 5, 1], "priority": 42}
]
```"#;
        let drafts = parse_tasks(text, 2, 6).unwrap();
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].estimated_minutes, 20);
        assert_eq!(drafts[0].priority, 7);
        assert_eq!(drafts[1].dependencies, vec![0]);
        assert_eq!(drafts[1].priority, 10);
        assert_eq!(drafts[1].estimated_minutes, 30);
    }

    #[test]
    fn test_accepts_plain_strings() {
        let drafts = parse_tasks(r#"["a", "b", "c"]"#, 2, 6).unwrap();
        assert_eq!(drafts.len(), 3);
        assert!(drafts.iter().all(|d| d.dependencies.is_empty()));
    }

    #[test]
    fn test_bounds() {
        assert!(parse_tasks("[]", 2, 6).is_err());
        assert!(parse_tasks(r#"["only one"]"#, 2, 6).is_err());
        assert!(parse_tasks("no json here", 2, 6).is_err());
        let many = serde_json::to_string(&(0..9).map(|i| format!("t{i}")).collect::<Vec<_>>()).unwrap();
        assert_eq!(parse_tasks(&many, 2, 6).unwrap().len(), 6);
    }
}
