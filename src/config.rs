//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__BUDGET__DAILY_LIMIT=2.5`）。

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub dispatcher: DispatcherSection,
    pub budget: BudgetSection,
    pub resilience: ResilienceSection,
    pub goals: GoalsSection,
    pub executor: ExecutorSection,
    pub scheduler: SchedulerSection,
    pub tools: ToolsSection,
}

/// [app] 段：数据目录（SQLite）与工作区（文件类步骤的沙箱根）
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AppSection {
    pub data_dir: PathBuf,
    pub workspace_root: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            workspace_root: PathBuf::from("workspace"),
        }
    }
}

impl AppSection {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("hive.db")
    }
}

/// [llm] 段：廉价（本地）与昂贵（远程）两条推理路径
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmSection {
    /// 未配置时使用离线 Mock 回显
    pub cheap: Option<LlmEndpoint>,
    pub costly: Option<LlmEndpoint>,
}

/// OpenAI 兼容端点
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmEndpoint {
    pub base_url: Option<String>,
    pub model: String,
    /// 读取 API Key 的环境变量名
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// 每百万输入 token 价格
    #[serde(default)]
    pub input_price_per_million: f64,
    /// 每百万输出 token 价格
    #[serde(default)]
    pub output_price_per_million: f64,
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

/// [dispatcher] 段：升级阈值与结果缓存
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatcherSection {
    pub confidence_threshold: f64,
    pub cache_ttl_secs: u64,
    pub cache_max_entries: usize,
    /// 估算远程调用成本时假设的输出 token 数
    pub expected_output_tokens: u64,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.85,
            cache_ttl_secs: 3600,
            cache_max_entries: 512,
            expected_output_tokens: 800,
        }
    }
}

/// [budget] 段：日 / 月硬上限
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BudgetSection {
    pub daily_limit: f64,
    pub monthly_limit: f64,
    /// 使用率超过该比例时给出提醒
    pub warn_ratio: f64,
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            daily_limit: 10.0,
            monthly_limit: 100.0,
            warn_ratio: 0.8,
        }
    }
}

/// [resilience] 段：熔断、重试、调用超时
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResilienceSection {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub call_timeout_secs: u64,
}

impl Default for ResilienceSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 60,
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            call_timeout_secs: 60,
        }
    }
}

/// [goals] 段：分解数量上下限、过期阈值、失败复核
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GoalsSection {
    pub min_tasks: usize,
    pub max_tasks: usize,
    pub stale_after_hours: i64,
    /// 连续分解失败达到该次数后目标转人工复核
    pub max_decomposition_failures: u32,
    pub max_task_retries: u32,
    pub max_active_goals: usize,
}

impl Default for GoalsSection {
    fn default() -> Self {
        Self {
            min_tasks: 2,
            max_tasks: 6,
            stale_after_hours: 48,
            max_decomposition_failures: 3,
            max_task_retries: 2,
            max_active_goals: 25,
        }
    }
}

/// [executor] 段：单任务步数 / 成本上限、断点有效期、产物校验
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub max_steps: usize,
    pub task_cost_cap: f64,
    pub checkpoint_max_age_hours: i64,
    pub verify_max_files: usize,
    pub verify_max_chars: usize,
    /// 质量评分（1-10）不低于该值视为通过
    pub verify_pass_score: u8,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            max_steps: 20,
            task_cost_cap: 1.0,
            checkpoint_max_age_hours: 24,
            verify_max_files: 3,
            verify_max_chars: 2000,
            verify_pass_score: 6,
        }
    }
}

/// [scheduler] 段：空闲阈值、轮询间隔、单周期上限
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub idle_threshold_secs: u64,
    pub poll_interval_secs: u64,
    pub cycle_max_secs: u64,
    pub cycle_cost_cap: f64,
    pub cycle_max_tasks: usize,
    /// 每个周期最多分解的目标数
    pub goals_per_cycle: usize,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            idle_threshold_secs: 300,
            poll_interval_secs: 30,
            cycle_max_secs: 600,
            cycle_cost_cap: 0.5,
            cycle_max_tasks: 50,
            goals_per_cycle: 5,
        }
    }
}

/// [tools] 段：工具超时、Shell 白名单、Search / Fetch
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    pub shell: ShellSection,
    pub search: SearchSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            shell: ShellSection::default(),
            search: SearchSection::default(),
        }
    }
}

/// [tools.shell] 段：允许执行的命令名（仅首词，如 ls、grep、python3）
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShellSection {
    pub allowed_commands: Vec<String>,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            allowed_commands: vec![
                "ls".into(),
                "grep".into(),
                "cat".into(),
                "head".into(),
                "tail".into(),
                "wc".into(),
                "find".into(),
                "python3".into(),
            ],
        }
    }
}

/// [tools.search] 段：检索端点、抓取的最大字符数、允许抓取的域名（为空表示不限）
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SearchSection {
    pub endpoint: String,
    pub max_results: usize,
    pub max_result_chars: usize,
    pub allowed_domains: Vec<String>,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            endpoint: "https://html.duckduckgo.com/html/".to_string(),
            max_results: 5,
            max_result_chars: 8000,
            allowed_domains: Vec::new(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

/// 渲染为 TOML（hive init-config）
pub fn render_toml(config: &AppConfig) -> Result<String, toml::ser::Error> {
    toml::to_string_pretty(config)
}
