//! Runtime wiring for recollect: configuration, per-turn maintenance,
//! the background worker pool and prompt memory planning

mod config;
mod maintainer;
mod planner;
mod pool;

pub use config::{
    CompactionConfig, EstimatorConfig, RecentCacheConfig, RecollectConfig, SummaryConfig,
    WindowConfig, WorkerConfig,
};
pub use maintainer::{MemoryMaintainer, TurnMaintenance};
pub use planner::{PromptMemoryPlan, PromptMemoryPlanner};
pub use pool::MaintenancePool;

pub use recollect_core::{MemoryError, Result};
