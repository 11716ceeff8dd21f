//! 网络工具：网页搜索与 URL 抓取
//!
//! WebSearchTool 请求 DuckDuckGo HTML 端点（无需 API Key）并用正则解析结果块；
//! FetchTool 抓取 URL，可选域名白名单，对 HTML 响应使用 html2text 提取可读文本，
//! 超过 max_result_chars 时截断并追加 ...[truncated]。
//! reqwest 错误按超时 / 限流 / 授权 / 网络分类，供弹性层判断是否重试。

use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use html2text::from_read;
use regex::Regex;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;

use crate::config::SearchSection;
use crate::core::extract::truncate_chars;
use crate::core::AgentError;
use crate::tools::{Capability, Tool, ToolOutput};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

fn build_client(timeout_secs: u64) -> Client {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .user_agent(USER_AGENT)
        .build()
        .unwrap_or_default()
}

fn classify_reqwest(dependency: &str, err: reqwest::Error) -> AgentError {
    if err.is_timeout() {
        AgentError::Timeout(format!("{dependency}: {err}"))
    } else if err.is_connect() || err.is_request() {
        AgentError::Network(format!("{dependency}: {err}"))
    } else {
        AgentError::Tool(format!("{dependency}: {err}"))
    }
}

fn check_status(dependency: &str, status: StatusCode) -> Result<(), AgentError> {
    if status.is_success() {
        return Ok(());
    }
    Err(match status {
        StatusCode::TOO_MANY_REQUESTS => AgentError::RateLimited {
            dependency: dependency.to_string(),
            retry_after_ms: None,
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            AgentError::Authorization(format!("{dependency}: HTTP {status}"))
        }
        s if s.is_server_error() => AgentError::Network(format!("{dependency}: HTTP {status}")),
        _ => AgentError::Tool(format!("{dependency}: HTTP {status}")),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub title: String,
    pub snippet: String,
    pub url: String,
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]+>").expect("static regex"))
}

fn link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)<a[^>]*class="result__a"[^>]*href="([^"]+)"[^>]*>(.*?)</a>"#)
            .expect("static regex")
    })
}

fn snippet_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)class="result__snippet"[^>]*>(.*?)</"#).expect("static regex")
    })
}

fn clean_text(fragment: &str) -> String {
    let stripped = tag_re().replace_all(fragment, "");
    stripped
        .replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// DuckDuckGo 结果链接常为 //duckduckgo.com/l/?uddg=<目标> 的跳转，取出真实地址
fn resolve_result_url(href: &str) -> Option<String> {
    let href = href.replace("&amp;", "&");
    let absolute = if href.starts_with("//") {
        format!("https:{href}")
    } else {
        href
    };
    let parsed = Url::parse(&absolute).ok()?;
    if let Some((_, target)) = parsed.query_pairs().find(|(k, _)| k == "uddg") {
        return Some(target.into_owned());
    }
    if parsed.host_str().is_some_and(|h| h.ends_with("duckduckgo.com")) {
        return None;
    }
    Some(absolute)
}

/// 解析 DuckDuckGo HTML 结果页
pub fn parse_results(html: &str, max_results: usize) -> Vec<SearchHit> {
    let mut hits = Vec::new();
    for block in html.split("class=\"result ").skip(1) {
        if hits.len() >= max_results {
            break;
        }
        let Some(link) = link_re().captures(block) else {
            continue;
        };
        let Some(url) = resolve_result_url(&link[1]) else {
            continue;
        };
        let snippet = snippet_re()
            .captures(block)
            .map(|c| clean_text(&c[1]))
            .unwrap_or_default();
        hits.push(SearchHit {
            title: clean_text(&link[2]),
            snippet,
            url,
        });
    }
    hits
}

pub fn format_results(hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return "No search results found.".to_string();
    }
    let mut out = String::from("Search Results:\n");
    for (i, h) in hits.iter().enumerate() {
        out.push_str(&format!("\n{}. {}\n   {}\n   Source: {}\n", i + 1, h.title, h.snippet, h.url));
    }
    out
}

pub struct WebSearchTool {
    client: Client,
    endpoint: String,
    max_results: usize,
}

impl WebSearchTool {
    pub fn new(cfg: &SearchSection, timeout_secs: u64) -> Self {
        Self {
            client: build_client(timeout_secs),
            endpoint: cfg.endpoint.clone(),
            max_results: cfg.max_results.max(1),
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn capability(&self) -> Capability {
        Capability::Search
    }

    fn description(&self) -> &str {
        "Search the web. Args: {\"query\": \"search terms\"}"
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, AgentError> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim();
        if query.is_empty() {
            return Err(AgentError::Tool("Missing query".into()));
        }
        tracing::info!(query = %query, "search tool execute");
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query)])
            .send()
            .await
            .map_err(|e| classify_reqwest("search", e))?;
        check_status("search", resp.status())?;
        let html = resp.text().await.map_err(|e| classify_reqwest("search", e))?;
        let hits = parse_results(&html, self.max_results);
        tracing::info!(query = %query, results = hits.len(), "search finished");
        Ok(ToolOutput::text(format_results(&hits)))
    }
}

/// 判断内容是否像 HTML（需提取可读文本）
fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start();
    s.starts_with("<!")
        || s.starts_with("<html")
        || s.starts_with("<HTML")
        || (s.len() > 20
            && s.contains('<')
            && (s.contains("</") || s.contains("<meta") || s.contains("<head") || s.contains("<title")))
}

fn html_to_text(html: &str) -> String {
    match from_read(html.as_bytes(), 120) {
        Ok(text) if !text.trim().is_empty() => text,
        _ => clean_text(html),
    }
}

pub struct FetchTool {
    client: Client,
    allowed_domains: HashSet<String>,
    max_result_chars: usize,
}

impl FetchTool {
    pub fn new(cfg: &SearchSection, timeout_secs: u64) -> Self {
        Self {
            client: build_client(timeout_secs),
            allowed_domains: cfg.allowed_domains.iter().map(|d| d.to_lowercase()).collect(),
            max_result_chars: cfg.max_result_chars,
        }
    }

    /// 白名单为空时不限制域名；否则允许列出的域名及其子域
    fn check_allowed(&self, url: &Url) -> Result<(), AgentError> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(AgentError::Tool(format!("Unsupported scheme: {}", url.scheme())));
        }
        if self.allowed_domains.is_empty() {
            return Ok(());
        }
        let host = url.host_str().unwrap_or("").to_lowercase();
        let allowed = self
            .allowed_domains
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{d}")));
        if allowed {
            Ok(())
        } else {
            Err(AgentError::Authorization(format!("Domain not in allowlist: {host}")))
        }
    }
}

#[async_trait]
impl Tool for FetchTool {
    fn capability(&self) -> Capability {
        Capability::Fetch
    }

    fn description(&self) -> &str {
        "Fetch a web page as readable text. Args: {\"url\": \"https://...\"}"
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, AgentError> {
        let raw = args.get("url").and_then(|v| v.as_str()).unwrap_or("").trim();
        if raw.is_empty() {
            return Err(AgentError::Tool("Missing url".into()));
        }
        let url = Url::parse(raw).map_err(|e| AgentError::Tool(format!("Invalid url {raw}: {e}")))?;
        self.check_allowed(&url)?;
        tracing::info!(url = %url, "fetch tool execute");

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify_reqwest("fetch", e))?;
        check_status("fetch", resp.status())?;
        let body = resp.text().await.map_err(|e| classify_reqwest("fetch", e))?;
        let body = body.trim_start_matches('\u{FEFF}');
        let text = if looks_like_html(body) {
            html_to_text(body)
        } else {
            body.to_string()
        };
        Ok(ToolOutput::text(truncate_chars(&text, self.max_result_chars)))
    }
}
