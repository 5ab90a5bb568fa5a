//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction，供计划执行器决定是反思、原样重试、重新规划还是终止。

use crate::core::{AgentError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// 根据错误类型与剩余预算返回建议的恢复动作
    pub fn handle(&self, err: &AgentError, remaining_budget: u32) -> RecoveryAction {
        if err.is_terminal() {
            return RecoveryAction::Abort;
        }
        if remaining_budget == 0 {
            return RecoveryAction::Abort;
        }
        match err {
            AgentError::UnresolvedReference { .. } => RecoveryAction::Reflect,
            AgentError::Planning(_) => RecoveryAction::RegeneratePlan,
            // LLM 本身出错时再问一次 LLM 没有意义
            AgentError::Llm(_) => RecoveryAction::RetryAsIs,
            e if e.is_retryable() => RecoveryAction::Reflect,
            _ => RecoveryAction::Abort,
        }
    }
}
