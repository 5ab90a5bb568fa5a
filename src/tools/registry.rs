//! 执行器注册表
//!
//! 所有能力执行器实现 StepExecutor（name / step_types / execute_step），启动时按类型名注册；
//! 派发逻辑只查表，新增执行器无需改动派发核心。查不到时走旧式类型映射（file_manager、app_control 等）。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{AgentError, RunContext, Step, StepResult};

/// 统一的单步执行契约；副作用限定在各自领域（浏览器、文件、进程、系统控制）
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// 执行器名（注册表键，如 browser、file_manager、script、system）
    fn name(&self) -> &str;

    /// 本执行器处理的 step type
    fn step_types(&self) -> &[&'static str];

    /// 执行一步。返回 `StepResult { success: false }` 与返回 Err 都视为执行失败；
    /// 进度事件通过 ctx 发出，执行器本身不持有发送端
    async fn execute_step(&self, step: &Step, ctx: &RunContext) -> Result<StepResult, AgentError>;

    /// 是否属于阻塞型操作（浏览器、子进程、系统命令），派发时先占用有界池许可
    fn is_blocking(&self) -> bool {
        false
    }
}

/// 名称 → 执行器注册表
#[derive(Default)]
pub struct ExecutorRegistry {
    by_type: HashMap<String, Arc<dyn StepExecutor>>,
    by_name: HashMap<String, Arc<dyn StepExecutor>>,
    fallback: Option<String>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: impl StepExecutor + 'static) {
        self.register_arc(Arc::new(executor));
    }

    pub fn register_arc(&mut self, executor: Arc<dyn StepExecutor>) {
        for t in executor.step_types() {
            self.by_type.insert((*t).to_string(), executor.clone());
        }
        self.by_name.insert(executor.name().to_string(), executor);
    }

    /// 额外把某个类型名指到已注册的执行器
    pub fn alias(&mut self, step_type: &str, executor_name: &str) -> bool {
        match self.by_name.get(executor_name).cloned() {
            Some(e) => {
                self.by_type.insert(step_type.to_string(), e);
                true
            }
            None => false,
        }
    }

    /// 未知类型最终落到的执行器
    pub fn set_fallback(&mut self, executor_name: &str) {
        self.fallback = Some(executor_name.to_string());
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StepExecutor>> {
        self.by_name.get(name).cloned()
    }

    pub fn executor_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn step_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.by_type.keys().cloned().collect();
        types.sort();
        types
    }

    /// 查找执行器；返回的 Step 可能经过旧式类型归一化
    pub fn resolve(&self, step: &Step) -> Option<(Arc<dyn StepExecutor>, Step)> {
        if let Some(e) = self.by_type.get(&step.step_type) {
            return Some((e.clone(), step.clone()));
        }
        let normalized = normalize_legacy(step);
        if let Some(e) = self.by_type.get(&normalized.step_type) {
            tracing::debug!(from = %step.step_type, to = %normalized.step_type, "legacy step type mapped");
            return Some((e.clone(), normalized));
        }
        let family = family_of(&normalized.step_type)
            .or(self.fallback.as_deref())
            .and_then(|name| self.by_name.get(name).cloned());
        family.map(|e| (e, normalized))
    }
}

/// 按前缀推断执行器家族
fn family_of(step_type: &str) -> Option<&'static str> {
    if step_type.starts_with("browser_") {
        Some("browser")
    } else if step_type.starts_with("file_") {
        Some("file_manager")
    } else {
        None
    }
}

/// 旧式类型映射：file_manager/file_operation + action → file_<action>；app_control + action → open_app/close_app
pub fn normalize_legacy(step: &Step) -> Step {
    let action = step.action.to_lowercase();
    let new_type = match step.step_type.as_str() {
        "file_manager" | "file_operation" | "file" => {
            let op = match action.as_str() {
                "read" | "write" | "create" | "delete" | "move" | "copy" | "list" => action.clone(),
                "rename" => "move".to_string(),
                "remove" => "delete".to_string(),
                "mkdir" | "create_folder" => return with_type(step, "create_folder"),
                _ => return step.clone(),
            };
            format!("file_{op}")
        }
        "app_control" | "app" => match action.as_str() {
            "open" | "launch" | "start" => "open_app".to_string(),
            "close" | "quit" | "exit" => "close_app".to_string(),
            _ => return step.clone(),
        },
        "python" | "code_interpreter" | "script" => "python_script".to_string(),
        _ => return step.clone(),
    };
    with_type(step, &new_type)
}

fn with_type(step: &Step, step_type: &str) -> Step {
    Step {
        step_type: step_type.to_string(),
        ..step.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo {
        name: &'static str,
        types: &'static [&'static str],
    }

    #[async_trait]
    impl StepExecutor for Echo {
        fn name(&self) -> &str {
            self.name
        }
        fn step_types(&self) -> &[&'static str] {
            self.types
        }
        async fn execute_step(&self, step: &Step, _ctx: &RunContext) -> Result<StepResult, AgentError> {
            Ok(StepResult::ok(format!("{}:{}", self.name, step.step_type)))
        }
    }

    fn registry() -> ExecutorRegistry {
        let mut r = ExecutorRegistry::new();
        r.register(Echo { name: "file_manager", types: &["file_read", "file_delete"] });
        r.register(Echo { name: "system", types: &["open_app", "close_app"] });
        r.register(Echo { name: "browser", types: &["browser_click"] });
        r.set_fallback("system");
        r
    }

    #[test]
    fn test_direct_lookup() {
        let r = registry();
        let (e, s) = r.resolve(&Step::new("file_read", "", "")).unwrap();
        assert_eq!(e.name(), "file_manager");
        assert_eq!(s.step_type, "file_read");
    }

    #[test]
    fn test_legacy_lookup() {
        let r = registry();
        let (e, s) = r.resolve(&Step::new("file_manager", "remove", "")).unwrap();
        assert_eq!(e.name(), "file_manager");
        assert_eq!(s.step_type, "file_delete");

        let (e, s) = r.resolve(&Step::new("app_control", "quit", "")).unwrap();
        assert_eq!(e.name(), "system");
        assert_eq!(s.step_type, "close_app");
    }

    #[test]
    fn test_family_and_fallback() {
        let r = registry();
        let (e, _) = r.resolve(&Step::new("browser_hover", "", "")).unwrap();
        assert_eq!(e.name(), "browser");
        let (e, _) = r.resolve(&Step::new("mystery", "", "")).unwrap();
        assert_eq!(e.name(), "system");
    }

    #[test]
    fn test_alias() {
        let mut r = registry();
        assert!(r.alias("click", "browser"));
        assert!(!r.alias("x", "nope"));
        assert_eq!(r.resolve(&Step::new("click", "", "")).unwrap().0.name(), "browser");
    }
}
