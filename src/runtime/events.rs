//! 进度事件：思考、计划、步骤开始 / 完成 / 失败、敏感操作确认、错误与最终结果
//!
//! 序列化形如 `{"type": "step_started", "data": {...}}`，供 UI 层逐条消费。
//! Emitter 按运行创建并随 RunContext 逐层传递，长生命周期组件不持有任何发送端。

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use crate::core::{Step, StepResult, TaskResult};

/// 单条进度事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// 正在思考（意图识别、规划、反思）
    Thinking { content: String, phase: String },
    /// 规划完成
    PlanReady { steps: Vec<Step> },
    StepStarted {
        step_index: usize,
        total_steps: usize,
        step: Step,
        attempt: u32,
    },
    StepCompleted {
        step_index: usize,
        total_steps: usize,
        step: Step,
        result: StepResult,
    },
    /// 单次尝试失败（后续可能重试或反思）
    StepFailed {
        step_index: usize,
        step: Step,
        error: String,
        attempt: u32,
    },
    /// 敏感步骤等待宿主确认；宿主需以 step_id 写回布尔值
    SensitiveOperationDetected {
        step_index: usize,
        step_id: String,
        description: String,
        timeout_secs: u64,
    },
    Error { message: String },
    TaskResult { result: TaskResult },
}

impl ProgressEvent {
    pub fn thinking(phase: &str, content: impl Into<String>) -> Self {
        ProgressEvent::Thinking {
            content: content.into(),
            phase: phase.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProgressEvent::Thinking { .. } => "thinking",
            ProgressEvent::PlanReady { .. } => "plan_ready",
            ProgressEvent::StepStarted { .. } => "step_started",
            ProgressEvent::StepCompleted { .. } => "step_completed",
            ProgressEvent::StepFailed { .. } => "step_failed",
            ProgressEvent::SensitiveOperationDetected { .. } => "sensitive_operation_detected",
            ProgressEvent::Error { .. } => "error",
            ProgressEvent::TaskResult { .. } => "task_result",
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// 请求级事件发送端：每次运行一个，克隆廉价
#[derive(Debug, Clone, Default)]
pub struct Emitter {
    tx: Option<UnboundedSender<ProgressEvent>>,
}

impl Emitter {
    pub fn new(tx: UnboundedSender<ProgressEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// 不发送任何事件（后台任务、测试）
    pub fn noop() -> Self {
        Self { tx: None }
    }

    /// 接收端已关闭时静默丢弃：UI 断开不影响任务本身
    pub fn emit(&self, ev: ProgressEvent) {
        if let Some(t) = &self.tx {
            let _ = t.send(ev);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_envelope() {
        let ev = ProgressEvent::SensitiveOperationDetected {
            step_index: 2,
            step_id: "step-abc".into(),
            description: "delete folder".into(),
            timeout_secs: 30,
        };
        let v = ev.to_json();
        assert_eq!(v["type"], "sensitive_operation_detected");
        assert_eq!(v["data"]["step_id"], "step-abc");
        assert_eq!(ev.kind(), "sensitive_operation_detected");
    }

    #[test]
    fn test_emitters_are_isolated() {
        let (tx_a, mut rx_a) = tokio::sync::mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = tokio::sync::mpsc::unbounded_channel();
        let a = Emitter::new(tx_a);
        let b = Emitter::new(tx_b);
        a.emit(ProgressEvent::thinking("plan", "run a"));
        b.emit(ProgressEvent::Error { message: "run b".into() });
        assert_eq!(rx_a.try_recv().unwrap().kind(), "thinking");
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap().kind(), "error");
    }
}
