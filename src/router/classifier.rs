//! 请求复杂度分类器
//!
//! 基于词数与关键词的有界启发式评分（0-100），与廉价路径的置信度合成升级判断。

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

impl Complexity {
    /// 从廉价路径置信度中扣除的量：越复杂越不信任本地模型
    pub fn confidence_penalty(self) -> f64 {
        match self {
            Complexity::Simple => 0.0,
            Complexity::Medium => 0.05,
            Complexity::Complex => 0.15,
        }
    }
}

const COMPLEX_KEYWORDS: &[&str] = &[
    "analyze",
    "analyse",
    "research",
    "compare",
    "design",
    "architecture",
    "strategy",
    "evaluate",
    "implement",
    "optimize",
    "investigate",
    "step by step",
    "trade-off",
    "tradeoff",
    "prove",
];

const MEDIUM_KEYWORDS: &[&str] = &[
    "explain",
    "summarize",
    "summarise",
    "describe",
    "write",
    "list",
    "how",
    "why",
];

pub struct ComplexityClassifier;

impl ComplexityClassifier {
    pub fn score(prompt: &str) -> u8 {
        let lower = prompt.to_lowercase();
        let words = lower.split_whitespace().count();
        let length_points: u32 = if words < 10 {
            0
        } else if words <= 50 {
            20
        } else {
            45
        };
        let complex_hits = COMPLEX_KEYWORDS
            .iter()
            .filter(|k| lower.contains(*k))
            .count()
            .min(2) as u32;
        let medium_hits = MEDIUM_KEYWORDS
            .iter()
            .filter(|k| contains_word(&lower, k))
            .count()
            .min(2) as u32;
        (length_points + complex_hits * 20 + medium_hits * 10).min(100) as u8
    }

    pub fn classify(prompt: &str) -> Complexity {
        match Self::score(prompt) {
            0..=19 => Complexity::Simple,
            20..=49 => Complexity::Medium,
            _ => Complexity::Complex,
        }
    }
}

fn contains_word(haystack: &str, word: &str) -> bool {
    haystack
        .split(|c: char| !c.is_alphanumeric())
        .any(|w| w == word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_greeting_is_simple() {
        assert_eq!(ComplexityClassifier::classify("hi there"), Complexity::Simple);
        assert_eq!(ComplexityClassifier::score("hi there"), 0);
    }

    #[test]
    fn test_keywords_raise_score() {
        // 8 词，两个复杂关键词
        let p = "analyze and compare these two caching systems please";
        assert_eq!(ComplexityClassifier::score(p), 40);
        assert_eq!(ComplexityClassifier::classify(p), Complexity::Medium);
    }

    #[test]
    fn test_long_research_prompt_is_complex() {
        let p = format!("research {}", "the history of distributed consensus ".repeat(12));
        assert_eq!(ComplexityClassifier::classify(&p), Complexity::Complex);
    }

    #[test]
    fn test_score_is_bounded() {
        let p = format!(
            "analyze compare design evaluate explain why how {}",
            "word ".repeat(200)
        );
        assert!(ComplexityClassifier::score(&p) <= 100);
    }
}
