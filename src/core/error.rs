//! 运行时错误类型与恢复动作
//!
//! 所有组件共用一个 AgentError；`kind()` 给出错误所属类别（瞬时 / 授权 / 状态迁移 / 分解 / 熔断 / 预算），
//! `recovery_action()` 决定调用方是重试、走降级、令任务失败还是上报给操作员。

use std::fmt;

use thiserror::Error;

/// 运行过程中可能出现的错误（外部调用、状态迁移、持久化等）
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Rate limited by {dependency}")]
    RateLimited {
        dependency: String,
        /// 服务端建议的等待时间，缺省时按退避策略计算
        retry_after_ms: Option<u64>,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Authorization denied: {0}")]
    Authorization(String),

    #[error("Invalid {entity} transition for {id}: {from} -> {to}")]
    InvalidStateTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    #[error("Decomposition failed for goal {goal_id}: {reason}")]
    Decomposition { goal_id: String, reason: String },

    #[error("Circuit open for {dependency}")]
    CircuitOpen { dependency: String },

    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    #[error("Path escape attempt: {0}")]
    PathEscape(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Step panicked: {0}")]
    StepPanicked(String),

    /// fallback_chain 全部失败：保留最后一个错误与完整尝试记录
    #[error("All {} strategies failed, last: {last}", attempts.len())]
    AllPathsFailed {
        last: Box<AgentError>,
        attempts: Vec<String>,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 错误类别（对应运行时的错误分类表）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 网络 / 超时 / 限流，可重试
    Transient,
    /// 预算或权限被拒绝，不重试，上报
    Authorization,
    /// 编程错误或竞争，中止操作并记录
    InvalidStateTransition,
    /// 目标无法拆解，目标转人工复核
    Decomposition,
    /// 依赖已隔离，触发回退或降级
    CircuitOpen,
    /// 任务级上限触发，任务失败但周期继续
    BudgetExceeded,
    /// 其余不可重试的失败
    Permanent,
}

/// 根据错误类别给出的建议动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 退避后重试同一调用
    Retry,
    /// 换用回退路径或降级响应
    Fallback,
    /// 记录并令当前任务失败
    FailTask,
    /// 写入操作员可见的状态接口
    Surface,
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Timeout(_) | AgentError::RateLimited { .. } | AgentError::Network(_) => {
                ErrorKind::Transient
            }
            AgentError::Authorization(_) | AgentError::PathEscape(_) => ErrorKind::Authorization,
            AgentError::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
            AgentError::Decomposition { .. } => ErrorKind::Decomposition,
            AgentError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            AgentError::BudgetExceeded(_) => ErrorKind::BudgetExceeded,
            _ => ErrorKind::Permanent,
        }
    }

    /// 仅超时、限流、网络错误会被 retry_with_backoff 重试
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn recovery_action(&self) -> RecoveryAction {
        match self.kind() {
            ErrorKind::Transient => RecoveryAction::Retry,
            ErrorKind::CircuitOpen => RecoveryAction::Fallback,
            ErrorKind::Authorization
            | ErrorKind::InvalidStateTransition
            | ErrorKind::Decomposition => RecoveryAction::Surface,
            ErrorKind::BudgetExceeded | ErrorKind::Permanent => RecoveryAction::FailTask,
        }
    }

    /// 限流错误携带的等待时间
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            AgentError::RateLimited { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Authorization => "authorization",
            ErrorKind::InvalidStateTransition => "invalid_state_transition",
            ErrorKind::Decomposition => "decomposition",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::BudgetExceeded => "budget_exceeded",
            ErrorKind::Permanent => "permanent",
        };
        f.write_str(s)
    }
}
