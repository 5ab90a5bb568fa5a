//! 能力执行器：浏览器、文件、生成脚本、系统控制，以及注册表、派发器与脚本安全审计

pub mod browser;
pub mod executor;
pub mod filesystem;
pub mod registry;
pub mod schema;
pub mod script;
pub mod security;
pub mod system;

pub use browser::{BrowserDriver, BrowserExecutor, DriverError, OcrEngine, Target, TesseractOcr};
pub use executor::StepDispatcher;
pub use filesystem::{FileExecutor, PathGuard};
pub use registry::{normalize_legacy, ExecutorRegistry, StepExecutor};
pub use schema::plan_schema_json;
pub use script::{PythonRunner, ScriptExecutor, ScriptRunner};
pub use security::{AuditVerdict, SecurityAuditor};
pub use system::{CommandSystemControl, SystemControl, SystemExecutor};
