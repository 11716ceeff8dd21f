//! 核心：错误与恢复动作、状态投影、模型输出解析

pub mod error;
pub mod extract;
pub mod state;

pub use error::{AgentError, ErrorKind, RecoveryAction};
pub use state::{Alert, AlertKind, AlertLog, CycleStats, SchedulerPhase};
