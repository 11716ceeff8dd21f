//! Hive - Rust 个人自主智能体运行时
//!
//! 模块划分：
//! - **agent**: 运行时装配（交互、目标控制、状态查询、启动恢复）
//! - **budget**: 日 / 月预算账本，授权 + 预留 + 记账
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复动作、状态投影、模型输出解析
//! - **goals**: 目标与任务的持久化、分解、优先级选择
//! - **llm**: 推理客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **observability**: tracing 初始化
//! - **plan**: 计划执行器（步骤、断点、自检）
//! - **resilience**: 熔断、重试、回退链与降级
//! - **router**: 廉价 / 昂贵路径调度、缓存、复杂度分类
//! - **scheduler**: 空闲调度器（Dream Cycle）
//! - **store**: SQLite 存储
//! - **tools**: 工具箱（文件、检索、抓取、命令）与执行器

pub mod agent;
pub mod budget;
pub mod config;
pub mod core;
pub mod goals;
pub mod llm;
pub mod observability;
pub mod plan;
pub mod resilience;
pub mod router;
pub mod scheduler;
pub mod store;
pub mod tools;

pub use agent::{RecoveryReport, Runtime, StatusReport};
