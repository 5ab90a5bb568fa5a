//! 状态定义：单步状态机与运行终态
//!
//! 单步：pending → dispatched → {succeeded | failed}；failed 在预算内可回到 pending（反思修正后的新步骤）。
//! 运行：running → {completed | error | cancelled}。

use serde::Serialize;

/// 单步状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Dispatched,
    Succeeded,
    Failed,
    Skipped,
}

impl StepState {
    /// 合法迁移；其它组合视为实现错误
    pub fn can_transition(self, to: StepState) -> bool {
        use StepState::*;
        matches!(
            (self, to),
            (Pending, Dispatched)
                | (Pending, Failed)
                | (Pending, Skipped)
                | (Dispatched, Succeeded)
                | (Dispatched, Failed)
                | (Failed, Pending)
        )
    }

    pub fn is_done(self) -> bool {
        matches!(self, StepState::Succeeded | StepState::Skipped)
    }
}

/// 运行终态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Completed,
    Error,
    Cancelled,
}

/// 单步状态追踪：记录迁移次数，供日志与测试断言
#[derive(Clone, Debug)]
pub struct StepTracker {
    state: StepState,
    attempts: u32,
}

impl StepTracker {
    pub fn new() -> Self {
        Self {
            state: StepState::Pending,
            attempts: 0,
        }
    }

    pub fn state(&self) -> StepState {
        self.state
    }

    /// 已派发次数（不含在派发前就失败的尝试）
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn transition(&mut self, to: StepState) -> bool {
        if !self.state.can_transition(to) {
            tracing::warn!(from = ?self.state, to = ?to, "illegal step transition ignored");
            return false;
        }
        if to == StepState::Dispatched {
            self.attempts += 1;
        }
        self.state = to;
        true
    }
}

impl Default for StepTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_transitions() {
        let mut t = StepTracker::new();
        assert!(t.transition(StepState::Dispatched));
        assert!(t.transition(StepState::Failed));
        assert!(t.transition(StepState::Pending));
        assert!(t.transition(StepState::Dispatched));
        assert!(t.transition(StepState::Succeeded));
        assert_eq!(t.attempts(), 2);
        assert!(t.state().is_done());
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut t = StepTracker::new();
        assert!(!t.transition(StepState::Succeeded));
        assert_eq!(t.state(), StepState::Pending);
        // 派发前失败（引用未解析）是合法的
        assert!(t.transition(StepState::Failed));
        assert_eq!(t.attempts(), 0);
    }
}
