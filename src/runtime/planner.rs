//! Planner：指令 + 记忆上下文 → 步骤列表
//!
//! 解析分两层：先按 JSON 步骤数组解析（容忍代码围栏、`{"steps": [...]}` 包装与前后说明文字），
//! 失败时把编号 / 项目符号列表逐行映射成步骤（导航、点击、填写、文件）。
//! 解析后做闭包校验（点击必须有目标或坐标、不得前向引用），再扫描破坏性模式并标记需要确认。
//! 校验失败的计划不会派发，带着拒绝原因重新生成，最多 max_attempts 次。

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::core::{AgentError, RunContext, Step};
use crate::llm::{LlmGateway, Message};
use crate::runtime::events::ProgressEvent;
use crate::runtime::placeholder::referenced_steps;
use crate::tools::{normalize_legacy, plan_schema_json};

/// 规划描述里以此开头的步骤视为敏感
const SENSITIVE_PREFIX: &str = "[SENSITIVE]";

const CLICK_TYPES: &[&str] = &["browser_click", "click"];
const SCRIPT_TYPES: &[&str] = &["python_script", "python", "code_interpreter", "script"];

fn system_prompt(step_types: &[String]) -> String {
    let types = if step_types.is_empty() {
        "browser_navigate, browser_click, browser_fill, browser_scrape, browser_screenshot, \
         file_read, file_write, file_delete, file_list, python_script, open_app, close_app, \
         set_volume, get_system_info"
            .to_string()
    } else {
        step_types.join(", ")
    };
    format!(
        "You are a desktop automation planner. Break the user's instruction into an ordered list of steps.\n\
         Available step types: {types}\n\n\
         Rules:\n\
         - Reply with a JSON array of step objects only.\n\
         - browser_click needs params.selector, params.text or params.x/params.y.\n\
         - Reference an earlier step's result with {{{{stepN.path}}}} (N starts at 1), e.g. {{{{step1.result.emails[0].subject}}}}. Never reference a later step.\n\
         - Python scripts go in python_script params.code and must not import os, subprocess, shutil or sys.\n\
         - Prefix the description with {SENSITIVE_PREFIX} for anything destructive.\n\n\
         Step schema:\n{}",
        plan_schema_json()
    )
}

/// 去掉 Markdown 代码围栏
fn strip_fences(text: &str) -> &str {
    let t = text.trim();
    let Some(start) = t.find("```") else {
        return t;
    };
    let rest = &t[start + 3..];
    // 跳过语言标记行
    let rest = match rest.find('\n') {
        Some(nl) if !rest[..nl].trim().contains(['[', '{']) => &rest[nl + 1..],
        _ => rest,
    };
    rest.find("```").map_or(rest, |end| &rest[..end]).trim()
}

fn steps_from_value(value: Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(mut m) => match m.remove("steps").or_else(|| m.remove("plan")) {
            Some(Value::Array(items)) => Some(items),
            _ => None,
        },
        _ => None,
    }
}

pub(crate) fn step_from_value(mut v: Value) -> Result<Step, AgentError> {
    if let Value::Object(m) = &mut v {
        // 模型常给数字 id；id 由本地生成
        if m.get("id").is_some_and(|id| !id.is_string()) {
            m.remove("id");
        }
        if !m.contains_key("type") {
            if let Some(t) = m.remove("step_type").or_else(|| m.remove("tool")) {
                m.insert("type".into(), t);
            }
        }
    }
    let step: Step = serde_json::from_value(v)
        .map_err(|e| AgentError::Planning(format!("invalid step object: {e}")))?;
    if step.step_type.trim().is_empty() {
        return Err(AgentError::Planning("step without type".into()));
    }
    Ok(step)
}

/// 结构化解析；文本中找不到 JSON 数组时返回 None
fn parse_structured(text: &str) -> Option<Result<Vec<Step>, AgentError>> {
    let body = strip_fences(text);
    let items = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(steps_from_value)
        .or_else(|| {
            let start = body.find('[')?;
            let end = body.rfind(']')?;
            (end > start)
                .then(|| serde_json::from_str::<Value>(&body[start..=end]).ok())
                .flatten()
                .and_then(steps_from_value)
        })?;
    Some(items.into_iter().map(step_from_value).collect())
}

fn list_item_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?:\d+\s*[.)、:]|[-*•]|step\s*\d+\s*[:.)])\s*(.+?)\s*$").expect("list item regex")
    })
}

fn navigate_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(?:\b(?:go\s+to|navigate\s+to|open|visit|browse\s+to|load)\s+|访问|打开|前往)\s*(?:the\s+)?(?:page\s+|website\s+|site\s+)?<?((?:https?://|www\.)\S+|[a-z0-9-]+(?:\.[a-z0-9-]+)*\.(?:com|org|net|io|cn|dev|edu|gov)(?:/\S*)?)",
        )
        .expect("navigate regex")
    })
}

fn fill_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)(?:\b(?:fill|type|enter|input|write)\s+(?:in\s+)?|输入|填写)\s*["'“‘]?(.+?)["'”’]?\s+(?:in|into|to|在|到)\s+(?:the\s+)?["'“‘]?(.+?)["'”’]?(?:\s+(?:field|box|input))?(?:输入框|框)?$"#,
        )
        .expect("fill regex")
    })
}

fn click_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)(?:\b(?:click|press|tap|select)\s+(?:on\s+)?|点击|单击|点一下)\s*(?:the\s+)?["'“‘]?(.+?)["'”’]?(?:\s+(?:button|link|tab|icon))?(?:按钮|链接)?$"#,
        )
        .expect("click regex")
    })
}

fn file_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(?:\b(?:save|write|create|export|download)\b|保存|写入|创建|导出).*?((?:~|\.{1,2})?/?[\w./~-]*[\w-]+\.(?:txt|md|csv|json|html|pdf|py|log|xlsx|docx))",
        )
        .expect("file regex")
    })
}

fn prose_line_to_step(line: &str) -> Option<Step> {
    if let Some(c) = navigate_re().captures(line) {
        let raw = c[1].trim_end_matches(['.', ',', ')', '>', '。']);
        let url = if raw.starts_with("http") {
            raw.to_string()
        } else {
            format!("https://{raw}")
        };
        return Some(Step::new("browser_navigate", "navigate", line).with_param("url", url));
    }
    if let Some(c) = fill_re().captures(line) {
        return Some(
            Step::new("browser_fill", "fill", line)
                .with_param("text", c[2].trim())
                .with_param("value", c[1].trim()),
        );
    }
    if let Some(c) = file_re().captures(line) {
        return Some(
            Step::new("file_write", "write", line)
                .with_param("path", &c[1])
                .with_param("content", ""),
        );
    }
    if let Some(c) = click_re().captures(line) {
        let target = c[1].trim();
        if !target.is_empty() {
            return Some(Step::new("browser_click", "click", line).with_param("text", target));
        }
    }
    None
}

/// 把编号 / 项目符号列表映射成步骤；无法识别的行跳过
fn parse_prose(text: &str) -> Vec<Step> {
    text.lines()
        .filter_map(|l| list_item_re().captures(l))
        .filter_map(|c| prose_line_to_step(&c[1]))
        .collect()
}

/// 两层解析：结构化优先，其次散文列表
pub fn parse_plan(text: &str) -> Result<Vec<Step>, AgentError> {
    let steps = match parse_structured(text) {
        Some(Ok(steps)) => steps,
        Some(Err(e)) => {
            let prose = parse_prose(text);
            if prose.is_empty() {
                return Err(e);
            }
            prose
        }
        None => parse_prose(text),
    };
    if steps.is_empty() {
        return Err(AgentError::Planning("no executable steps in planner output".into()));
    }
    Ok(steps)
}

fn has_symbolic_target(step: &Step) -> bool {
    ["selector", "text", "target", "label"]
        .iter()
        .any(|k| step.param_str(k).is_some_and(|s| !s.trim().is_empty()))
}

fn has_coordinates(step: &Step) -> bool {
    step.param_f64("x").is_some() && step.param_f64("y").is_some()
}

/// 闭包校验：点击有目标、引用只指向之前的步骤
pub fn validate_plan(steps: &[Step]) -> Result<(), AgentError> {
    for (i, step) in steps.iter().enumerate() {
        if CLICK_TYPES.contains(&step.step_type.as_str())
            && !has_symbolic_target(step)
            && !has_coordinates(step)
        {
            return Err(AgentError::Planning(format!(
                "step {} ({}) has neither a target nor coordinates",
                i + 1,
                step.step_type
            )));
        }
        if let Some(bad) = referenced_steps(&step.params)
            .into_iter()
            .find(|n| *n == 0 || *n > i)
        {
            return Err(AgentError::Planning(format!(
                "step {} references step{bad}, only steps 1..{} are available",
                i + 1,
                i
            )));
        }
    }
    Ok(())
}

fn destructive_script_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?x)
            rm\s+-[a-zA-Z]*[rR][a-zA-Z]*\s+(?:/|~|\$HOME)
          | shutil\s*\.\s*rmtree\s*\(\s*(?:
                r?["'](?:/|~|/home|/Users|/etc|/usr|/var|/System|[A-Za-z]:\\{1,2})/?["']
              | os\.path\.expanduser\(\s*["']~/?["']\s*\)
              | (?:pathlib\.)?Path\.home\(\s*\)
              | os\.environ\[\s*["']HOME["']\s*\]
            )
          | os\s*\.\s*(?:remove|unlink|rmdir|removedirs)\s*\(\s*r?["']/(?:etc|usr|bin|sbin|System|Library|var)\b
          | \bmkfs(?:\.\w+)?\b
          | diskutil\s+erase
          | \bdd\s+if=\S+\s+of=/dev/
            "#,
        )
        .expect("destructive script regex")
    })
}

fn home_dir_string() -> Option<String> {
    dirs::home_dir().map(|h| h.to_string_lossy().trim_end_matches('/').to_string())
}

/// 根目录、家目录或它们的直接子目录
fn is_root_level(path: &str) -> bool {
    let p = path.trim().trim_end_matches(['/', '\\']);
    if p.is_empty() || p == "~" {
        return true;
    }
    if let Some(home) = home_dir_string() {
        if p == home {
            return true;
        }
        if let Some(rest) = p.strip_prefix(&home) {
            return rest.trim_start_matches('/').split('/').count() <= 1;
        }
    }
    if let Some(rest) = p.strip_prefix("~/") {
        return rest.split('/').count() <= 1;
    }
    if let Some(rest) = p.strip_prefix('/') {
        return rest.split('/').count() <= 1;
    }
    // C:\ 或 C:\Windows
    let win = p.replace('\\', "/");
    win.len() >= 2
        && win.as_bytes()[1] == b':'
        && win[2..].trim_matches('/').split('/').filter(|s| !s.is_empty()).count() <= 1
}

/// 步骤是否含破坏性操作；返回原因。按派发时的归一化类型判断，旧式写法同样受检
pub fn destructive_reason(step: &Step) -> Option<String> {
    if step.description.trim_start().starts_with(SENSITIVE_PREFIX) {
        return Some("marked sensitive by planner".into());
    }
    let step = &normalize_legacy(step);
    let t = step.step_type.as_str();
    if SCRIPT_TYPES.contains(&t) {
        let code = ["code", "script", "source"].iter().find_map(|k| step.param_str(k))?;
        return destructive_script_re()
            .find(code)
            .map(|m| format!("script contains destructive pattern `{}`", m.as_str().trim()));
    }
    if t == "file_delete" {
        let path = step.param_str("path").or_else(|| step.param_str("file_path"))?;
        if is_root_level(path) {
            return Some(format!("deletes root-level path {path}"));
        }
        if step.params.get("recursive").and_then(Value::as_bool) == Some(true) {
            return Some(format!("recursively deletes {path}"));
        }
    }
    None
}

/// 标记需要确认的步骤；返回被标记的数量
pub fn mark_sensitive(steps: &mut [Step]) -> usize {
    let mut marked = 0;
    for step in steps.iter_mut() {
        if let Some(reason) = destructive_reason(step) {
            tracing::warn!(step_type = %step.step_type, %reason, "step requires confirmation");
            step.requires_confirmation = true;
            marked += 1;
        }
    }
    marked
}

/// 规划器：经 LlmGateway 调用模型
pub struct Planner {
    gateway: LlmGateway,
    max_attempts: u32,
    step_types: Vec<String>,
}

impl Planner {
    pub fn new(gateway: LlmGateway, max_attempts: u32) -> Self {
        Self {
            gateway,
            max_attempts: max_attempts.max(1),
            step_types: Vec::new(),
        }
    }

    /// 写进 prompt 的可用步骤类型（通常取自执行器注册表）
    pub fn with_step_types(mut self, step_types: Vec<String>) -> Self {
        self.step_types = step_types;
        self
    }

    fn build_messages(
        &self,
        instruction: &str,
        memory: Option<&str>,
        prior_context: &Map<String, Value>,
    ) -> Vec<Message> {
        let mut user = String::new();
        if let Some(m) = memory.filter(|m| !m.trim().is_empty()) {
            user.push_str(m.trim());
            user.push_str("\n\n");
        }
        if !prior_context.is_empty() {
            user.push_str("## Context\n");
            user.push_str(&Value::Object(prior_context.clone()).to_string());
            user.push_str("\n\n");
        }
        user.push_str("## Instruction\n");
        user.push_str(instruction);
        vec![Message::system(system_prompt(&self.step_types)), Message::user(user)]
    }

    /// 生成并校验计划；校验失败时带反馈重新生成
    pub async fn plan(
        &self,
        instruction: &str,
        memory: Option<&str>,
        prior_context: &Map<String, Value>,
        ctx: &RunContext,
    ) -> Result<Vec<Step>, AgentError> {
        let mut messages = self.build_messages(instruction, memory, prior_context);
        let mut last_err = AgentError::Planning("planner produced no plan".into());

        for attempt in 1..=self.max_attempts {
            if ctx.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            ctx.emit(ProgressEvent::thinking(
                "planning",
                if attempt == 1 {
                    "Planning steps...".to_string()
                } else {
                    format!("Regenerating plan (attempt {attempt})")
                },
            ));
            let reply = self.gateway.complete(messages.clone(), ctx.cancel_token()).await?;
            let checked = parse_plan(&reply).and_then(|mut steps| {
                validate_plan(&steps)?;
                mark_sensitive(&mut steps);
                Ok(steps)
            });
            match checked {
                Ok(steps) => {
                    tracing::info!(run_id = %ctx.run_id, steps = steps.len(), attempt, "plan ready");
                    return Ok(steps);
                }
                Err(e) => {
                    tracing::warn!(run_id = %ctx.run_id, attempt, error = %e, "plan rejected");
                    messages.push(Message::assistant(reply));
                    messages.push(Message::user(format!(
                        "That plan was rejected: {e}. Reply with a corrected JSON array of steps."
                    )));
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}
