//! 数据模型：Step / StepResult / TaskResult
//!
//! Step 派发后不可变：重试与反思总是产生新的 Step 值（`with_params` / `patched`），从不原地修改。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn new_step_id() -> String {
    format!("step-{}", uuid::Uuid::new_v4().simple())
}

/// 计划中的一步
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// 确认事件与共享上下文中的键
    #[serde(default = "new_step_id")]
    pub id: String,
    /// 选择执行器的类型名，如 browser_click、file_write、python_script
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_state: Option<String>,
    /// 由 Planner 标记：派发前需要外部确认
    #[serde(default)]
    pub requires_confirmation: bool,
}

impl Step {
    pub fn new(step_type: impl Into<String>, action: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: new_step_id(),
            step_type: step_type.into(),
            action: action.into(),
            description: description.into(),
            params: Map::new(),
            expected_state: None,
            requires_confirmation: false,
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// 以新参数生成新的 Step（保留 id，用于 placeholder 替换后的派发值）
    pub fn with_params(&self, params: Map<String, Value>) -> Self {
        Self {
            params,
            ..self.clone()
        }
    }

    /// 用反思给出的修正步骤替换自身：沿用原 id 与确认标记，其余取修正值
    pub fn patched(&self, mut replacement: Step) -> Self {
        replacement.id = self.id.clone();
        replacement.requires_confirmation |= self.requires_confirmation;
        replacement
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    pub fn param_f64(&self, key: &str) -> Option<f64> {
        self.params.get(key).and_then(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }
}

/// 单步执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StepResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub installed_dependencies: Vec<String>,
}

impl StepResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn ok_with_data(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// 指令的最终结果：`{success, message, data?, steps_executed, duration}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub steps_executed: usize,
    /// 秒
    pub duration: f64,
}

impl TaskResult {
    pub fn failure(message: impl Into<String>, steps_executed: usize, duration: f64) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            steps_executed,
            duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_deserialize_defaults() {
        let step: Step = serde_json::from_str(
            r#"{"type": "browser_click", "action": "click", "params": {"text": "Login"}}"#,
        )
        .unwrap();
        assert_eq!(step.step_type, "browser_click");
        assert!(step.id.starts_with("step-"));
        assert!(!step.requires_confirmation);
        assert_eq!(step.param_str("text"), Some("Login"));
    }

    #[test]
    fn test_patched_keeps_identity_and_confirmation() {
        let mut original = Step::new("python_script", "run", "cleanup");
        original.requires_confirmation = true;
        let fix = Step::new("python_script", "run", "fixed").with_param("code", "print(1)");
        let patched = original.patched(fix);
        assert_eq!(patched.id, original.id);
        assert!(patched.requires_confirmation);
        assert_eq!(patched.description, "fixed");
        // 原值不变
        assert_eq!(original.description, "cleanup");
    }

    #[test]
    fn test_task_result_shape() {
        let r = TaskResult {
            success: true,
            message: "done".into(),
            data: None,
            steps_executed: 1,
            duration: 0.5,
        };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["steps_executed"], 1);
        assert!(v.get("data").is_none());
    }
}
