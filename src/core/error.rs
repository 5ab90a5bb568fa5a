//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定 Reflect / RetryAsIs / RegeneratePlan / Abort。

use thiserror::Error;

/// 任务运行过程中可能出现的错误（规划、引用解析、执行、安全审计、确认、超时等）
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    /// 计划格式错误或逻辑不完整（如 click 缺少目标），需要重新生成计划
    #[error("Planning error: {0}")]
    Planning(String),

    /// Placeholder 无法解析为具体值；直接进入反思，不交给执行器
    #[error("Unresolved reference: {}", placeholders.join(", "))]
    UnresolvedReference { placeholders: Vec<String> },

    #[error("Execution failed: {0}")]
    Execution(String),

    /// 生成脚本未通过静态审计；按执行错误处理（可用修正后的脚本重试）
    #[error("Security audit rejected: {0}")]
    SecurityRejected(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("User denied sensitive step: {0}")]
    UserDenied(String),

    #[error("Confirmation timed out: {0}")]
    ConfirmationTimeout(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("LLM error: {0}")]
    Llm(String),

    /// 缺少凭据、二进制或需要用户手动处理，重试没有意义
    #[error("Config error: {0}")]
    Config(String),

    #[error("Path escape attempt: {0}")]
    PathEscape(String),

    /// 期望应用名却收到了文件路径
    #[error("Type confusion: {0}")]
    TypeConfusion(String),

    #[error("Memory error: {0}")]
    Memory(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Fatal: {0}")]
    Fatal(String),
}

impl AgentError {
    /// 能否进入重试 / 反思流程
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::UnresolvedReference { .. }
                | AgentError::Execution(_)
                | AgentError::SecurityRejected(_)
                | AgentError::Timeout(_)
                | AgentError::Llm(_)
                | AgentError::PathEscape(_)
                | AgentError::TypeConfusion(_)
                | AgentError::Io(_)
        )
    }

    /// 根因在规划层：不能盲目重试同一步，必须经过反思
    pub fn requires_reflection_only(&self) -> bool {
        matches!(self, AgentError::UnresolvedReference { .. })
    }

    /// 用户拒绝、确认超时、取消、配置错误：直接终止
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentError::UserDenied(_)
                | AgentError::ConfirmationTimeout(_)
                | AgentError::Cancelled
                | AgentError::Config(_)
                | AgentError::Fatal(_)
        )
    }

    /// 交互类失败（点击、填写、定位），反思时值得附带截图
    pub fn is_interaction_failure(&self) -> bool {
        match self {
            AgentError::Execution(msg) => {
                let m = msg.to_lowercase();
                ["click", "element", "selector", "not found", "fill", "obscured", "ocr"]
                    .iter()
                    .any(|k| m.contains(k))
            }
            AgentError::Timeout(_) => true,
            _ => false,
        }
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::Io(e.to_string())
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 交给 Reflector 生成修正步骤或新计划
    Reflect,
    /// 原样重试（不消耗 LLM）
    RetryAsIs,
    /// 重新调用 Planner
    RegeneratePlan,
    /// 终止当前任务
    Abort,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_flags() {
        let unresolved = AgentError::UnresolvedReference {
            placeholders: vec!["{{step1.result.id}}".into()],
        };
        assert!(unresolved.is_retryable());
        assert!(unresolved.requires_reflection_only());
        assert!(unresolved.to_string().contains("step1.result.id"));

        assert!(AgentError::SecurityRejected("import os".into()).is_retryable());
        assert!(AgentError::Timeout("script".into()).is_retryable());
        assert!(AgentError::UserDenied("s1".into()).is_terminal());
        assert!(!AgentError::ConfirmationTimeout("s1".into()).is_retryable());
        assert!(AgentError::Config("no key".into()).is_terminal());
    }

    #[test]
    fn test_interaction_failure_detection() {
        assert!(AgentError::Execution("Element not found: #submit".into()).is_interaction_failure());
        assert!(!AgentError::Execution("disk full".into()).is_interaction_failure());
        assert!(!AgentError::SecurityRejected("eval".into()).is_interaction_failure());
    }
}
