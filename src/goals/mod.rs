//! 目标存储：目标与任务的持久化、分解、优先级选择与生命周期

pub mod decompose;
pub mod store;
pub mod types;

pub use decompose::{build_prompt, parse_tasks, TaskDraft};
pub use store::GoalStore;
pub use types::{
    Goal, GoalId, GoalProgress, GoalStatus, Task, TaskId, TaskStatus, DEFAULT_PRIORITY, MAX_PRIORITY,
    MIN_PRIORITY,
};
