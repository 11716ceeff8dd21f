//! 计划执行器：步骤词汇表、执行断点、逐步执行与产物自检

pub mod checkpoint;
pub mod executor;
pub mod step;
pub mod verify;

pub use checkpoint::{Checkpoint, CheckpointStore, StepRecord};
pub use executor::{ExecutionReport, ExecutionState, PlanExecutor};
pub use step::Step;
pub use verify::{parse_judgment, Verification};
