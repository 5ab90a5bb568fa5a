//! 任务运行时：意图快速通道、规划、计划执行状态机、反思与进度事件
//!
//! - **events**: 进度事件与按运行传递的 Emitter
//! - **intent**: 嵌入相似度意图路由与单步快速通道
//! - **placeholder**: `{{stepN.path}}` 引用解析
//! - **planner**: LLM 生成计划、解析、校验与敏感标记
//! - **plan_executor**: 顺序执行、确认门、重试预算与反思
//! - **reflector**: 失败诊断（含截图）与修正

pub mod events;
pub mod intent;
pub mod placeholder;
pub mod plan_executor;
pub mod planner;
pub mod reflector;

pub use events::{Emitter, ProgressEvent};
pub use intent::{builtin_intents, fast_path_step, IntentDef, IntentMatch, IntentRouter};
pub use placeholder::{find_unresolved, resolve_params, UNRESOLVED_MARKER};
pub use plan_executor::{PlanExecutor, PlanOutcome};
pub use planner::{mark_sensitive, parse_plan, validate_plan, Planner};
pub use reflector::{ReflectionOutcome, ReflectionRequest, Reflector};
