//! Plan Executor：带反思恢复的有界重试状态机
//!
//! 步骤严格按计划顺序执行。每一步：
//! 1. 敏感步骤先发 `sensitive_operation_detected`，在共享上下文里等 `confirm:<step_id>`，拒绝或超时直接终止；
//! 2. 解析 `{{stepN...}}` 引用，参数里残留未解析标记时不派发，直接进入反思；
//! 3. 经 StepDispatcher 派发（超时 + 取消）；
//! 4. 失败时由 RecoveryEngine 决定原样重试 / 反思 / 终止，每次失败消耗一次预算。
//!
//! 预算 N 表示首次之外最多再试 N 次：第 N+1 次失败时运行进入 error。

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::core::{
    confirmation_key, AgentError, RecoveryAction, RecoveryEngine, RunContext, RunState, Step,
    StepResult, StepState, StepTracker, WaitOutcome,
};
use crate::runtime::events::ProgressEvent;
use crate::runtime::placeholder::{find_unresolved, resolve_params};
use crate::runtime::planner::validate_plan;
use crate::runtime::reflector::{ReflectionOutcome, ReflectionRequest, Reflector};
use crate::tools::{BrowserExecutor, StepDispatcher};

/// 只读 / 低风险步骤，使用缩减后的重试预算
const SIMPLE_STEP_TYPES: &[&str] = &[
    "get_system_info",
    "screenshot_desktop",
    "browser_screenshot",
    "browser_wait",
    "file_read",
    "file_list",
];

pub fn is_simple_step(step: &Step) -> bool {
    SIMPLE_STEP_TYPES.contains(&step.step_type.as_str())
}

/// 执行器失败结果中的配置错误标记（缺凭据、缺依赖、需要用户操作）
fn is_config_failure(result: &StepResult) -> bool {
    result.data.as_ref().is_some_and(|d| {
        ["is_config_error", "requires_user_action"]
            .iter()
            .any(|k| d.get(k).and_then(Value::as_bool) == Some(true))
    })
}

fn is_approval(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(
            s.trim().to_lowercase().as_str(),
            "true" | "yes" | "y" | "approve" | "approved" | "confirm"
        ),
        _ => false,
    }
}

/// 确认所针对的步骤内容
fn approval_fingerprint(step: &Step) -> String {
    serde_json::json!([step.step_type, step.action, step.params]).to_string()
}

/// 一次计划执行的结果
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub state: RunState,
    /// 实际执行的计划（含反思后的修正）
    pub plan: Vec<Step>,
    /// 成功步骤的结果，按计划顺序
    pub results: Vec<StepResult>,
    /// 开始执行过的步骤数
    pub steps_executed: usize,
    pub error: Option<AgentError>,
}

impl PlanOutcome {
    pub fn success(&self) -> bool {
        self.state == RunState::Completed
    }

    pub fn message(&self) -> String {
        match (&self.error, self.results.last()) {
            (Some(e), _) => e.to_string(),
            (None, Some(last)) if !last.message.is_empty() => last.message.clone(),
            _ => format!("Completed {} steps", self.results.len()),
        }
    }
}

/// 单步失败：错误本身 + 执行器返回的失败结果（带截图等诊断）
struct StepFailure {
    error: AgentError,
    result: Option<StepResult>,
}

pub struct PlanExecutor {
    dispatcher: Arc<StepDispatcher>,
    reflector: Arc<Reflector>,
    recovery: RecoveryEngine,
    max_retries: u32,
    simple_step_retries: u32,
    confirmation_timeout: Duration,
    browser: Option<Arc<BrowserExecutor>>,
}

impl PlanExecutor {
    pub fn new(dispatcher: Arc<StepDispatcher>, reflector: Arc<Reflector>) -> Self {
        Self {
            dispatcher,
            reflector,
            recovery: RecoveryEngine::new(),
            max_retries: 3,
            simple_step_retries: 1,
            confirmation_timeout: Duration::from_secs(30),
            browser: None,
        }
    }

    pub fn with_budgets(mut self, max_retries: u32, simple_step_retries: u32) -> Self {
        self.max_retries = max_retries;
        self.simple_step_retries = simple_step_retries.min(max_retries);
        self
    }

    pub fn with_confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = timeout;
        self
    }

    /// 浏览器会话：反思时读取已缓存的设备像素比
    pub fn with_browser(mut self, browser: Arc<BrowserExecutor>) -> Self {
        self.browser = Some(browser);
        self
    }

    pub fn budget_for(&self, step: &Step) -> u32 {
        if is_simple_step(step) {
            self.simple_step_retries
        } else {
            self.max_retries
        }
    }

    /// 按顺序执行整个计划
    pub async fn execute(&self, instruction: &str, plan: Vec<Step>, ctx: &RunContext) -> PlanOutcome {
        let mut plan = plan;
        let mut results: Vec<StepResult> = Vec::with_capacity(plan.len());
        let mut index = 0;

        while index < plan.len() {
            if ctx.is_cancelled() {
                return PlanOutcome {
                    state: RunState::Cancelled,
                    plan,
                    results,
                    steps_executed: index,
                    error: Some(AgentError::Cancelled),
                };
            }
            match self.run_step(instruction, &mut plan, index, &results, ctx).await {
                Ok(result) => {
                    if let Ok(v) = serde_json::to_value(&result) {
                        ctx.shared().set(format!("step{}", index + 1), v);
                    }
                    results.push(result);
                    index += 1;
                }
                Err(error) => {
                    let state = if matches!(error, AgentError::Cancelled) {
                        RunState::Cancelled
                    } else {
                        RunState::Error
                    };
                    tracing::warn!(run_id = %ctx.run_id, step = index + 1, error = %error, "plan stopped");
                    return PlanOutcome {
                        state,
                        plan,
                        results,
                        steps_executed: index + 1,
                        error: Some(error),
                    };
                }
            }
        }

        PlanOutcome {
            state: RunState::Completed,
            steps_executed: plan.len(),
            plan,
            results,
            error: None,
        }
    }

    /// 敏感步骤确认：等宿主写入确认信号
    async fn confirm(&self, step: &Step, index: usize, ctx: &RunContext) -> Result<(), AgentError> {
        let description = if step.description.is_empty() {
            step.step_type.clone()
        } else {
            step.description.clone()
        };
        tracing::warn!(run_id = %ctx.run_id, step_id = %step.id, %description, "awaiting confirmation");
        ctx.emit(ProgressEvent::SensitiveOperationDetected {
            step_index: index,
            step_id: step.id.clone(),
            description: description.clone(),
            timeout_secs: self.confirmation_timeout.as_secs(),
        });
        let key = confirmation_key(&step.id);
        match ctx
            .shared()
            .wait_for(&key, self.confirmation_timeout, ctx.cancel_token())
            .await
        {
            WaitOutcome::Value(v) if is_approval(&v) => {
                tracing::info!(step_id = %step.id, "sensitive step approved");
                Ok(())
            }
            WaitOutcome::Value(_) => Err(AgentError::UserDenied(description)),
            WaitOutcome::TimedOut => Err(AgentError::ConfirmationTimeout(format!(
                "{description} (no answer within {}s)",
                self.confirmation_timeout.as_secs()
            ))),
            WaitOutcome::Cancelled => Err(AgentError::Cancelled),
        }
    }

    /// 解析引用并派发一次
    async fn attempt(
        &self,
        step: &Step,
        index: usize,
        results: &[StepResult],
        tracker: &mut StepTracker,
        ctx: &RunContext,
    ) -> Result<StepResult, StepFailure> {
        let (params, mut unresolved) = resolve_params(&step.params, results, index);
        if unresolved.is_empty() {
            unresolved = find_unresolved(&params);
        }
        if !unresolved.is_empty() {
            tracker.transition(StepState::Failed);
            return Err(StepFailure {
                error: AgentError::UnresolvedReference {
                    placeholders: unresolved,
                },
                result: None,
            });
        }

        tracker.transition(StepState::Dispatched);
        let dispatched = step.with_params(params);
        match self.dispatcher.dispatch(&dispatched, ctx).await {
            Ok(r) if r.success => {
                tracker.transition(StepState::Succeeded);
                Ok(r)
            }
            Ok(r) => {
                tracker.transition(StepState::Failed);
                let error = if is_config_failure(&r) {
                    AgentError::Config(r.message.clone())
                } else {
                    AgentError::Execution(r.message.clone())
                };
                Err(StepFailure {
                    error,
                    result: Some(r),
                })
            }
            Err(error) => {
                tracker.transition(StepState::Failed);
                Err(StepFailure {
                    error,
                    result: None,
                })
            }
        }
    }

    /// 单步的重试 / 反思循环
    async fn run_step(
        &self,
        instruction: &str,
        plan: &mut Vec<Step>,
        index: usize,
        results: &[StepResult],
        ctx: &RunContext,
    ) -> Result<StepResult, AgentError> {
        let mut step = plan[index].clone();
        let mut remaining = self.budget_for(&step);
        let mut tracker = StepTracker::new();
        // 已获批准的步骤内容；反思改动了类型 / 动作 / 参数后需重新确认
        let mut approved: Option<String> = None;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if ctx.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let fingerprint = approval_fingerprint(&step);
            if step.requires_confirmation && approved.as_deref() != Some(fingerprint.as_str()) {
                if approved.is_some() {
                    ctx.shared().remove(&confirmation_key(&step.id));
                }
                if let Err(e) = self.confirm(&step, index, ctx).await {
                    ctx.emit(ProgressEvent::StepFailed {
                        step_index: index,
                        step: step.clone(),
                        error: e.to_string(),
                        attempt,
                    });
                    return Err(e);
                }
                approved = Some(fingerprint);
            }

            ctx.emit(ProgressEvent::StepStarted {
                step_index: index,
                total_steps: plan.len(),
                step: step.clone(),
                attempt,
            });
            tracing::info!(
                run_id = %ctx.run_id,
                step = index + 1,
                step_type = %step.step_type,
                attempt,
                "step started"
            );

            let failure = match self.attempt(&step, index, results, &mut tracker, ctx).await {
                Ok(result) => {
                    ctx.emit(ProgressEvent::StepCompleted {
                        step_index: index,
                        total_steps: plan.len(),
                        step: step.clone(),
                        result: result.clone(),
                    });
                    plan[index] = step;
                    return Ok(result);
                }
                Err(f) => f,
            };

            tracing::warn!(
                run_id = %ctx.run_id,
                step = index + 1,
                step_type = %step.step_type,
                attempt,
                remaining,
                error = %failure.error,
                "step attempt failed"
            );
            ctx.emit(ProgressEvent::StepFailed {
                step_index: index,
                step: step.clone(),
                error: failure.error.to_string(),
                attempt,
            });

            match self.recovery.handle(&failure.error, remaining) {
                RecoveryAction::Abort => {
                    plan[index] = step;
                    if remaining == 0 && !failure.error.is_terminal() {
                        return Err(AgentError::Execution(format!(
                            "step {} failed after {attempt} attempts: {}",
                            index + 1,
                            failure.error
                        )));
                    }
                    return Err(failure.error);
                }
                RecoveryAction::RetryAsIs => {
                    remaining -= 1;
                }
                RecoveryAction::Reflect | RecoveryAction::RegeneratePlan => {
                    remaining -= 1;
                    let request = ReflectionRequest {
                        instruction,
                        plan: plan.as_slice(),
                        step_index: index,
                        failing_step: &step,
                        error: &failure.error,
                        failed_result: failure.result.as_ref(),
                        prior_results: results,
                        device_pixel_ratio: self
                            .browser
                            .as_ref()
                            .and_then(|b| b.cached_device_pixel_ratio()),
                    };
                    match self.reflector.reflect(request, ctx).await {
                        ReflectionOutcome::Patched(fixed) => step = fixed,
                        ReflectionOutcome::NewPlan(steps) => {
                            let mut candidate = plan[..index].to_vec();
                            candidate.extend(steps);
                            match validate_plan(&candidate) {
                                Ok(()) => {
                                    tracing::info!(
                                        run_id = %ctx.run_id,
                                        from_step = index + 1,
                                        len = candidate.len(),
                                        "remaining plan replaced"
                                    );
                                    *plan = candidate;
                                    step = plan[index].clone();
                                    ctx.emit(ProgressEvent::PlanReady { steps: plan.clone() });
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "replacement plan rejected, retrying step as-is");
                                }
                            }
                        }
                        ReflectionOutcome::RetryAsIs { .. } => {}
                        ReflectionOutcome::GiveUp { reason } => {
                            plan[index] = step;
                            return Err(AgentError::Execution(format!("{}; {reason}", failure.error)));
                        }
                    }
                }
            }
            tracker.transition(StepState::Pending);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RunHandle, TaskScheduler};
    use crate::llm::{LlmGateway, MockLlmClient};
    use crate::runtime::events::Emitter;
    use crate::tools::{ExecutorRegistry, StepExecutor};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    /// 记录收到的步骤，按队列返回结果；队列空时返回 fallback
    struct Scripted {
        calls: Mutex<Vec<Step>>,
        queue: Mutex<VecDeque<Result<StepResult, AgentError>>>,
        fallback: Result<StepResult, AgentError>,
    }

    impl Scripted {
        fn new(fallback: Result<StepResult, AgentError>) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                queue: Mutex::new(VecDeque::new()),
                fallback,
            })
        }

        fn push(&self, r: Result<StepResult, AgentError>) {
            self.queue.lock().unwrap().push_back(r);
        }

        fn calls(&self) -> Vec<Step> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StepExecutor for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn step_types(&self) -> &[&'static str] {
            &["create_item", "use_item", "file_read", "python_script"]
        }

        async fn execute_step(&self, step: &Step, _ctx: &RunContext) -> Result<StepResult, AgentError> {
            self.calls.lock().unwrap().push(step.clone());
            let next = self.queue.lock().unwrap().pop_front();
            next.unwrap_or_else(|| self.fallback.clone())
        }
    }

    fn executor(fake: Arc<Scripted>, llm: Arc<MockLlmClient>) -> PlanExecutor {
        let mut registry = ExecutorRegistry::new();
        registry.register_arc(fake);
        let dispatcher = Arc::new(StepDispatcher::new(Arc::new(registry), Duration::from_secs(2)));
        let gateway = LlmGateway::new(
            llm,
            Arc::new(TaskScheduler::default()),
            Duration::from_secs(2),
            Duration::from_millis(50),
        );
        PlanExecutor::new(dispatcher, Arc::new(Reflector::new(gateway)))
            .with_budgets(3, 1)
            .with_confirmation_timeout(Duration::from_millis(100))
    }

    fn ctx_with_events(dir: &std::path::Path) -> (RunContext, tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = RunContext::new("test", dir, Emitter::new(tx), CancellationToken::new());
        (ctx, rx)
    }

    fn kinds(rx: &mut tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<&'static str> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev.kind());
        }
        out
    }

    #[tokio::test]
    async fn test_placeholders_flow_between_steps() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Scripted::new(Ok(StepResult::ok("used")));
        fake.push(Ok(StepResult::ok_with_data("created", json!({"id": 42, "tags": ["a", "b"]}))));
        let exec = executor(fake.clone(), Arc::new(MockLlmClient::new()));
        let (ctx, mut rx) = ctx_with_events(dir.path());
        let plan = vec![
            Step::new("create_item", "create", "make"),
            Step::new("use_item", "use", "use")
                .with_param("id", "{{step1.result.id}}")
                .with_param("label", "tag {{step1.tags[1]}}"),
        ];
        let out = exec.execute("make and use", plan, &ctx).await;
        assert!(out.success());
        assert_eq!(out.steps_executed, 2);
        let calls = fake.calls();
        assert_eq!(calls[1].params["id"], json!(42));
        assert_eq!(calls[1].params["label"], json!("tag b"));
        assert_eq!(ctx.shared().get("step1").unwrap()["data"]["id"], json!(42));
        assert_eq!(
            kinds(&mut rx),
            ["step_started", "step_completed", "step_started", "step_completed"]
        );
    }

    #[tokio::test]
    async fn test_unresolved_reference_never_dispatched() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Scripted::new(Ok(StepResult::ok("done")));
        fake.push(Ok(StepResult::ok_with_data("created", json!({"name": "x"}))));
        let llm = Arc::new(MockLlmClient::with_replies([
            r#"{"is_retryable": true, "confidence": 0.9, "reason": "use name", "modified_step": {"params": {"id": "{{step1.result.name}}"}}}"#,
        ]));
        let exec = executor(fake.clone(), llm.clone());
        let (ctx, _rx) = ctx_with_events(dir.path());
        let plan = vec![
            Step::new("create_item", "create", ""),
            Step::new("use_item", "use", "").with_param("id", "{{step1.result.id}}"),
        ];
        let out = exec.execute("go", plan, &ctx).await;
        assert!(out.success());
        assert_eq!(llm.call_count(), 1);
        let calls = fake.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].params["id"], json!("x"));
        assert!(calls.iter().all(|s| find_unresolved(&s.params).is_empty()));
        assert_eq!(out.plan[1].param_str("id"), Some("{{step1.result.name}}"));
    }

    #[tokio::test]
    async fn test_retry_budget_respected_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Scripted::new(Err(AgentError::Execution("boom".into())));
        let llm = Arc::new(MockLlmClient::new().with_fallback("not json"));
        let exec = executor(fake.clone(), llm.clone());
        let (ctx, _rx) = ctx_with_events(dir.path());
        let out = exec
            .execute("x", vec![Step::new("use_item", "use", "")], &ctx)
            .await;
        assert_eq!(out.state, RunState::Error);
        assert_eq!(fake.calls().len(), 4);
        assert_eq!(llm.call_count(), 3);
        assert!(out.message().contains("after 4 attempts"));

        let simple = Scripted::new(Err(AgentError::Execution("nope".into())));
        let exec = executor(simple.clone(), Arc::new(MockLlmClient::new().with_fallback("{}")));
        let out = exec
            .execute("x", vec![Step::new("file_read", "read", "").with_param("path", "a")], &ctx)
            .await;
        assert_eq!(out.state, RunState::Error);
        assert_eq!(simple.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_result_converted_and_config_error_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Scripted::new(Ok(StepResult::failure("API key missing")
            .with_data(json!({"is_config_error": true}))));
        let llm = Arc::new(MockLlmClient::new());
        let exec = executor(fake.clone(), llm.clone());
        let (ctx, _rx) = ctx_with_events(dir.path());
        let out = exec.execute("x", vec![Step::new("use_item", "use", "")], &ctx).await;
        assert!(matches!(out.error, Some(AgentError::Config(_))));
        assert_eq!(fake.calls().len(), 1);
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_reflection_give_up_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Scripted::new(Err(AgentError::Execution("no such app".into())));
        let llm = Arc::new(MockLlmClient::with_replies([
            r#"{"is_retryable": false, "reason": "app name unknown"}"#,
        ]));
        let exec = executor(fake.clone(), llm);
        let (ctx, _rx) = ctx_with_events(dir.path());
        let out = exec.execute("x", vec![Step::new("use_item", "use", "")], &ctx).await;
        assert_eq!(out.state, RunState::Error);
        assert_eq!(fake.calls().len(), 1);
        assert!(out.message().contains("app name unknown"));
    }

    #[tokio::test]
    async fn test_new_plan_replaces_tail() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Scripted::new(Ok(StepResult::ok("ok")));
        fake.push(Ok(StepResult::ok("first")));
        fake.push(Err(AgentError::Execution("wrong approach".into())));
        let llm = Arc::new(MockLlmClient::with_replies([
            r#"{"is_retryable": true, "confidence": 0.8, "new_plan": [{"type": "create_item", "description": "alt a"}, {"type": "create_item", "description": "alt b"}]}"#,
        ]));
        let exec = executor(fake.clone(), llm);
        let (ctx, mut rx) = ctx_with_events(dir.path());
        let plan = vec![
            Step::new("create_item", "", "one"),
            Step::new("use_item", "", "two"),
            Step::new("use_item", "", "three"),
        ];
        let out = exec.execute("x", plan, &ctx).await;
        assert!(out.success());
        let descs: Vec<&str> = out.plan.iter().map(|s| s.description.as_str()).collect();
        assert_eq!(descs, ["one", "alt a", "alt b"]);
        assert_eq!(out.results.len(), 3);
        assert!(kinds(&mut rx).contains(&"plan_ready"));
    }

    #[tokio::test]
    async fn test_sensitive_step_denied_and_timed_out() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Scripted::new(Ok(StepResult::ok("deleted")));
        let exec = executor(fake.clone(), Arc::new(MockLlmClient::new()));

        let mut step = Step::new("python_script", "run", "wipe");
        step.requires_confirmation = true;

        let (ctx, mut rx) = ctx_with_events(dir.path());
        let handle = RunHandle::new(&ctx);
        let id = step.id.clone();
        let denier = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.confirm(&id, false);
        });
        let out = exec.execute("x", vec![step.clone()], &ctx).await;
        denier.await.unwrap();
        assert!(matches!(out.error, Some(AgentError::UserDenied(_))));
        assert!(fake.calls().is_empty());
        assert_eq!(kinds(&mut rx)[0], "sensitive_operation_detected");

        let (ctx, _rx) = ctx_with_events(dir.path());
        let out = exec.execute("x", vec![step.clone()], &ctx).await;
        assert!(matches!(out.error, Some(AgentError::ConfirmationTimeout(_))));
        assert!(fake.calls().is_empty());

        let (ctx, _rx) = ctx_with_events(dir.path());
        RunHandle::new(&ctx).confirm(&step.id, true);
        let out = exec.execute("x", vec![step], &ctx).await;
        assert!(out.success());
        assert_eq!(fake.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_patched_sensitive_step_confirmed_again() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Scripted::new(Ok(StepResult::ok("deleted")));
        fake.push(Err(AgentError::Execution("no such file".into())));
        let llm = Arc::new(MockLlmClient::with_replies([
            r#"{"is_retryable": true, "confidence": 0.9, "reason": "other file", "modified_step": {"params": {"code": "remove('b.txt')"}}}"#,
        ]));
        let exec = executor(fake.clone(), llm);

        let mut step = Step::new("python_script", "run", "wipe").with_param("code", "remove('a.txt')");
        step.requires_confirmation = true;

        let (ctx, mut rx) = ctx_with_events(dir.path());
        let handle = RunHandle::new(&ctx);
        let host = tokio::spawn(async move {
            let mut asked = 0;
            while let Some(ev) = rx.recv().await {
                if let ProgressEvent::SensitiveOperationDetected { step_id, .. } = ev {
                    asked += 1;
                    handle.confirm(&step_id, true);
                }
            }
            asked
        });
        let out = exec.execute("x", vec![step], &ctx).await;
        drop(ctx);
        assert!(out.success(), "{:?}", out.error);
        assert_eq!(host.await.unwrap(), 2);
        let calls = fake.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].param_str("code"), Some("remove('b.txt')"));
    }

    #[tokio::test]
    async fn test_retry_of_unchanged_step_not_confirmed_again() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Scripted::new(Ok(StepResult::ok("done")));
        fake.push(Err(AgentError::Execution("flaky".into())));
        let exec = executor(fake.clone(), Arc::new(MockLlmClient::new().with_fallback("not json")));
        let mut step = Step::new("python_script", "run", "wipe").with_param("code", "x = 1");
        step.requires_confirmation = true;

        let (ctx, mut rx) = ctx_with_events(dir.path());
        RunHandle::new(&ctx).confirm(&step.id, true);
        let out = exec.execute("x", vec![step], &ctx).await;
        assert!(out.success());
        assert_eq!(fake.calls().len(), 2);
        let asked = kinds(&mut rx)
            .into_iter()
            .filter(|k| *k == "sensitive_operation_detected")
            .count();
        assert_eq!(asked, 1);
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let plan = vec![
            Step::new("create_item", "", "").with_param("n", 1),
            Step::new("use_item", "", "").with_param("ref", "{{step1.v}}"),
        ];
        let mut outcomes = Vec::new();
        for _ in 0..2 {
            let fake = Scripted::new(Ok(StepResult::ok("used")));
            fake.push(Ok(StepResult::ok_with_data("made", json!({"v": "value"}))));
            let exec = executor(fake.clone(), Arc::new(MockLlmClient::new()));
            let (ctx, _rx) = ctx_with_events(dir.path());
            let out = exec.execute("x", plan.clone(), &ctx).await;
            outcomes.push((out.success(), out.message(), out.results, out.plan, fake.calls()));
        }
        assert_eq!(outcomes[0], outcomes[1]);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Scripted::new(Ok(StepResult::ok("x")));
        let exec = executor(fake.clone(), Arc::new(MockLlmClient::new()));
        let (ctx, _rx) = ctx_with_events(dir.path());
        ctx.cancel_token().cancel();
        let out = exec.execute("x", vec![Step::new("use_item", "", "")], &ctx).await;
        assert_eq!(out.state, RunState::Cancelled);
        assert!(fake.calls().is_empty());
    }
}
