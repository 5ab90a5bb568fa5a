//! 核心层：数据模型、错误与恢复、运行上下文、状态机、会话监管、工作池

pub mod context;
pub mod error;
pub mod recovery;
pub mod session_supervisor;
pub mod state;
pub mod step;
pub mod task_scheduler;

pub use context::{confirmation_key, RunContext, RunHandle, SharedContext, WaitOutcome};
pub use error::{AgentError, RecoveryAction};
pub use recovery::RecoveryEngine;
pub use session_supervisor::SessionSupervisor;
pub use state::{RunState, StepState, StepTracker};
pub use step::{Step, StepResult, TaskResult};
pub use task_scheduler::{PoolError, TaskKind, TaskScheduler};
