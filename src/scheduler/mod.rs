//! 空闲调度器：活动时钟、周期驱动与周期历史

pub mod cycle;
pub mod history;
pub mod idle;

pub use cycle::IdleScheduler;
pub use history::{CycleHistory, CycleSummary, StopReason};
pub use idle::ActivityMonitor;
