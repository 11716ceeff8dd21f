//! 从模型输出中提取 JSON
//!
//! 模型经常在 JSON 外包裹 ```json 代码块、<think> 推理段或解释性文字；这里统一剥离后取出第一个对象 / 数组。

use std::sync::OnceLock;

use regex::Regex;

fn think_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid regex"))
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("valid regex"))
}

/// 去除推理段与代码块围栏，返回可能包含 JSON 的正文
pub fn strip_wrappers(text: &str) -> String {
    let without_think = think_re().replace_all(text, "");
    match fence_re().captures(&without_think) {
        Some(caps) => caps
            .get(1)
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default(),
        None => without_think.trim().to_string(),
    }
}

/// 取出第一个平衡的 `{...}`
pub fn extract_json_object(text: &str) -> Option<String> {
    extract_balanced(&strip_wrappers(text), '{', '}')
}

/// 取出第一个平衡的 `[...]`
pub fn extract_json_array(text: &str) -> Option<String> {
    extract_balanced(&strip_wrappers(text), '[', ']')
}

/// 按括号深度扫描，忽略字符串字面量中的括号
fn extract_balanced(text: &str, open: char, close: char) -> Option<String> {
    let start = text.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + c.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// 按字符截断（不切断 UTF-8），超长时追加省略标记
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars).collect();
    out.push_str("...[truncated]");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_object_from_fenced_reply() {
        let reply = "Sure, here it is:\n```json\n{\"action\": \"think\", \"thought\": \"a {b}\"}\n```\nDone.";
        let json = extract_json_object(reply).unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["thought"], "a {b}");
    }

    #[test]
    fn test_extract_array_skips_think_block() {
        let reply = "<think>maybe [not this]</think>[{\"description\": \"x\"}]";
        assert_eq!(extract_json_array(reply).unwrap(), "[{\"description\": \"x\"}]");
    }

    #[test]
    fn test_extract_handles_escaped_quotes() {
        let reply = r#"{"content": "say \"}\" please"} trailing"#;
        assert_eq!(
            extract_json_object(reply).unwrap(),
            r#"{"content": "say \"}\" please"}"#
        );
    }

    #[test]
    fn test_unbalanced_returns_none() {
        assert!(extract_json_object("{\"a\": 1").is_none());
        assert!(extract_json_array("no json here").is_none());
    }

    #[test]
    fn test_truncate_chars_is_utf8_safe() {
        assert_eq!(truncate_chars("你好世界", 2), "你好...[truncated]");
        assert_eq!(truncate_chars("short", 10), "short");
    }
}
