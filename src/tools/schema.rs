//! 计划 JSON Schema 生成（schemars），拼入 Planner 的 system prompt，减少 LLM 输出格式错误

use std::collections::HashMap;

use schemars::{schema_for, JsonSchema};

/// 计划中单步的输出格式（仅用于 Schema 生成；解析走 core::Step）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct StepFormat {
    /// 步骤类型，如 browser_navigate、browser_click、file_write、python_script、open_app
    #[serde(rename = "type")]
    pub step_type: String,
    /// 简短动作名
    pub action: String,
    /// 给用户看的步骤说明
    pub description: String,
    /// 参数；可用 {{stepN.path}} 引用第 N 步（从 1 开始）的结果数据
    pub params: HashMap<String, serde_json::Value>,
    /// 该步完成后预期的状态
    pub expected_state: Option<String>,
}

/// 返回计划（步骤数组）的 JSON Schema 字符串
pub fn plan_schema_json() -> String {
    let schema = schema_for!(Vec<StepFormat>);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}
