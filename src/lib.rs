//! DeskPilot - Rust 桌面任务编排器
//!
//! 一条自然语言指令 → 意图快速通道或 LLM 规划 → 按序执行（浏览器 / 文件 / 生成脚本 / 系统控制）
//! → 失败时带诊断反思修正 → 结果写回记忆。
//!
//! 模块划分：
//! - **agent**: 编排器门面（Agent / AgentBuilder / TaskRun）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 数据模型、错误与恢复、运行上下文、状态机、会话监管、工作池
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）、调用网关、嵌入
//! - **memory**: 任务记忆（SQLite）与串行写队列
//! - **observability**: 日志初始化
//! - **runtime**: 意图路由、Planner、Plan Executor、Reflector、进度事件
//! - **tools**: 能力执行器、注册表、派发器与脚本安全审计

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod runtime;
pub mod tools;

pub use agent::{Agent, AgentBuilder, TaskRun};
