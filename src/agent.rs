//! 任务编排器：意图快速通道 → 规划 → 执行（失败时反思）→ 记忆回写
//!
//! `AgentBuilder` 按配置装配各组件（LLM 网关、嵌入、执行器注册表、记忆），测试可逐个替换为假实现。
//! 每次运行有独立的 RunContext（事件发送端、共享上下文、取消 token），组件本身不保存任何运行状态，
//! 多个运行可以并发执行。运行中的 panic 与错误都在顶层转换为失败的 TaskResult，
//! 运行登记在所有退出路径上都会被清理。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::core::{
    AgentError, RunContext, RunHandle, SessionSupervisor, SharedContext, Step, TaskResult,
    TaskScheduler,
};
use crate::llm::{
    create_embedder_from_config, create_llm_from_config, LlmClient, LlmGateway, SharedEmbedder,
};
use crate::memory::{MemoryService, TaskRecord};
use crate::runtime::intent::fast_path_step;
use crate::runtime::{
    Emitter, IntentRouter, PlanExecutor, PlanOutcome, Planner, ProgressEvent, Reflector,
};
use crate::tools::{
    BrowserDriver, BrowserExecutor, CommandSystemControl, ExecutorRegistry, FileExecutor,
    OcrEngine, PathGuard, PythonRunner, ScriptExecutor, ScriptRunner, SecurityAuditor,
    StepDispatcher, SystemControl, SystemExecutor, TesseractOcr,
};

/// 并发阻塞型步骤（浏览器、脚本、系统命令）的上限
const BLOCKING_POOL_SIZE: usize = 4;

/// Agent 构建器：未显式提供的组件按配置创建
pub struct AgentBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    embedder: Option<SharedEmbedder>,
    system: Option<Arc<dyn SystemControl>>,
    script_runner: Option<Arc<dyn ScriptRunner>>,
    browser: Option<Arc<dyn BrowserDriver>>,
    ocr: Option<Arc<dyn OcrEngine>>,
    memory: Option<MemoryService>,
    home: Option<PathBuf>,
}

impl AgentBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            embedder: None,
            system: None,
            script_runner: None,
            browser: None,
            ocr: None,
            memory: None,
            home: dirs::home_dir(),
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_embedder(mut self, embedder: SharedEmbedder) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_system_control(mut self, control: Arc<dyn SystemControl>) -> Self {
        self.system = Some(control);
        self
    }

    pub fn with_script_runner(mut self, runner: Arc<dyn ScriptRunner>) -> Self {
        self.script_runner = Some(runner);
        self
    }

    pub fn with_browser_driver(mut self, driver: Arc<dyn BrowserDriver>) -> Self {
        self.browser = Some(driver);
        self
    }

    pub fn with_ocr(mut self, ocr: Arc<dyn OcrEngine>) -> Self {
        self.ocr = Some(ocr);
        self
    }

    pub fn with_memory(mut self, memory: MemoryService) -> Self {
        self.memory = Some(memory);
        self
    }

    /// 路径白名单中的用户主目录；None 表示只允许沙箱
    pub fn with_home(mut self, home: Option<PathBuf>) -> Self {
        self.home = home;
        self
    }

    /// 装配 Agent；嵌入与记忆存储在后台加载，需在 tokio 运行时内调用
    pub fn build(self) -> Agent {
        let cfg = self.config;
        let sandbox = cfg.app.sandbox_root();
        if let Err(e) = std::fs::create_dir_all(&sandbox) {
            tracing::warn!(path = %sandbox.display(), error = %e, "cannot create sandbox root");
        }

        let llm = self.llm.unwrap_or_else(|| create_llm_from_config(&cfg.llm));
        let scheduler = Arc::new(TaskScheduler::new(cfg.llm.pool_size, BLOCKING_POOL_SIZE));
        let gateway = LlmGateway::new(
            llm,
            scheduler.clone(),
            Duration::from_secs(cfg.llm.request_timeout_secs),
            Duration::from_millis(cfg.llm.pool_acquire_timeout_ms),
        );

        let guard = PathGuard::new(&sandbox, self.home);
        let mut registry = ExecutorRegistry::new();
        registry.register(FileExecutor::new(guard.clone()));
        registry.register(SystemExecutor::new(
            self.system.unwrap_or_else(|| Arc::new(CommandSystemControl)),
            guard.clone(),
        ));
        registry.register(
            ScriptExecutor::new(
                SecurityAuditor::new().with_path_guard(guard),
                self.script_runner
                    .unwrap_or_else(|| Arc::new(PythonRunner::new(cfg.tools.python_bin.clone()))),
                Duration::from_secs(cfg.tools.script_timeout_secs),
            )
            .with_auto_install(cfg.tools.auto_install_packages),
        );
        let browser = self.browser.or_else(|| default_browser_driver(&cfg)).map(|driver| {
            let ocr = self
                .ocr
                .unwrap_or_else(|| Arc::new(TesseractOcr::default()));
            Arc::new(BrowserExecutor::new(driver).with_ocr(ocr))
        });
        if let Some(b) = &browser {
            registry.register_arc(b.clone());
        }
        registry.set_fallback("system");
        let registry = Arc::new(registry);
        tracing::info!(executors = ?registry.executor_names(), "executor registry ready");

        let planner = Planner::new(gateway.clone(), cfg.executor.max_plan_attempts)
            .with_step_types(registry.step_types());
        let dispatcher = Arc::new(
            StepDispatcher::new(registry, Duration::from_secs(cfg.executor.step_timeout_secs))
                .with_pool(scheduler, Duration::from_millis(cfg.llm.pool_acquire_timeout_ms)),
        );
        let mut executor = PlanExecutor::new(dispatcher, Arc::new(Reflector::new(gateway.clone())))
            .with_budgets(cfg.executor.max_retries, cfg.executor.simple_step_retries)
            .with_confirmation_timeout(Duration::from_secs(cfg.executor.confirmation_timeout_secs));
        if let Some(b) = browser {
            executor = executor.with_browser(b);
        }

        let router = cfg.intent.enabled.then(|| {
            let embedder = self
                .embedder
                .unwrap_or_else(|| create_embedder_from_config(&cfg.embedding));
            IntentRouter::new(embedder, &cfg.intent)
        });

        let memory = match self.memory {
            Some(m) => Some(m),
            None if cfg.memory.enabled => Some(MemoryService::open(&cfg)),
            None => None,
        };

        Agent {
            sandbox,
            gateway,
            router,
            planner,
            executor,
            memory,
            supervisor: SessionSupervisor::new(),
            embedding_wait: Duration::from_secs(cfg.embedding.ready_timeout_secs),
            memory_wait: Duration::from_secs(cfg.memory.ready_timeout_secs),
        }
    }
}

#[cfg(feature = "browser")]
fn default_browser_driver(cfg: &AppConfig) -> Option<Arc<dyn BrowserDriver>> {
    Some(Arc::new(crate::tools::browser::ChromeDriver::new(
        cfg.browser_data_dir(),
        cfg.tools.browser.headless,
    )))
}

#[cfg(not(feature = "browser"))]
fn default_browser_driver(_cfg: &AppConfig) -> Option<Arc<dyn BrowserDriver>> {
    tracing::debug!("built without the browser feature, browser steps are unavailable");
    None
}

/// 后台运行的句柄：事件流、确认 / 取消、最终结果
pub struct TaskRun {
    pub run_id: String,
    pub events: mpsc::UnboundedReceiver<ProgressEvent>,
    pub handle: RunHandle,
    pub join: JoinHandle<TaskResult>,
}

/// 编排器门面
pub struct Agent {
    sandbox: PathBuf,
    gateway: LlmGateway,
    router: Option<IntentRouter>,
    planner: Planner,
    executor: PlanExecutor,
    memory: Option<MemoryService>,
    supervisor: SessionSupervisor,
    embedding_wait: Duration,
    memory_wait: Duration,
}

impl Agent {
    pub fn builder(config: AppConfig) -> AgentBuilder {
        AgentBuilder::new(config)
    }

    pub fn router(&self) -> Option<&IntentRouter> {
        self.router.as_ref()
    }

    pub fn memory(&self) -> Option<&MemoryService> {
        self.memory.as_ref()
    }

    pub fn active_runs(&self) -> usize {
        self.supervisor.active_runs()
    }

    /// 为一条指令创建运行上下文并登记到监管器
    fn new_run(&self, instruction: &str, prior_context: Map<String, Value>, emitter: Emitter) -> RunContext {
        let run_id = uuid::Uuid::new_v4().to_string();
        let cancel = self.supervisor.register_run(&run_id);
        RunContext::new(instruction, &self.sandbox, emitter, cancel)
            .with_run_id(run_id)
            .with_shared(SharedContext::from_map(prior_context))
    }

    /// 在当前任务内执行一条指令，事件发往 emitter
    pub async fn execute(
        &self,
        instruction: &str,
        prior_context: Map<String, Value>,
        emitter: Emitter,
    ) -> TaskResult {
        let ctx = self.new_run(instruction, prior_context, emitter);
        self.run(ctx).await
    }

    /// 后台执行；调用方通过 TaskRun 订阅事件、确认敏感步骤或取消
    pub fn start(self: &Arc<Self>, instruction: &str, prior_context: Map<String, Value>) -> TaskRun {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = self.new_run(instruction, prior_context, Emitter::new(tx));
        let handle = RunHandle::new(&ctx);
        let agent = self.clone();
        let join = tokio::spawn(async move { agent.run(ctx).await });
        TaskRun {
            run_id: handle.run_id.clone(),
            events: rx,
            handle,
            join,
        }
    }

    /// 取消指定运行
    pub fn cancel(&self, run_id: &str) -> bool {
        self.supervisor.cancel_run(run_id)
    }

    /// 取消所有运行并等待记忆写队列排空
    pub async fn shutdown(&self) {
        self.supervisor.cancel_all();
        if let Some(m) = &self.memory {
            m.shutdown(true).await;
        }
    }

    async fn run(&self, ctx: RunContext) -> TaskResult {
        let started = Instant::now();
        tracing::info!(run_id = %ctx.run_id, instruction = %ctx.instruction, "task started");

        let outcome = std::panic::AssertUnwindSafe(self.run_inner(&ctx, started))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::error!(run_id = %ctx.run_id, error = ?e, "task failed before execution");
                ctx.emit(ProgressEvent::Error {
                    message: e.to_string(),
                });
                self.remember(&ctx.instruction, false, &e.to_string(), &[], started);
                TaskResult::failure(e.to_string(), 0, started.elapsed().as_secs_f64())
            }
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<String>()
                    .cloned()
                    .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                    .unwrap_or_else(|| "unknown panic".to_string());
                let err = AgentError::Fatal(detail);
                tracing::error!(run_id = %ctx.run_id, error = ?err, "task panicked");
                ctx.emit(ProgressEvent::Error {
                    message: err.to_string(),
                });
                TaskResult::failure(err.to_string(), 0, started.elapsed().as_secs_f64())
            }
        };

        self.supervisor.finish_run(&ctx.run_id);
        let (_, _, total_tokens) = self.gateway.token_usage();
        tracing::info!(
            run_id = %ctx.run_id,
            success = result.success,
            steps = result.steps_executed,
            duration = result.duration,
            total_tokens,
            "task finished"
        );
        ctx.emit(ProgressEvent::TaskResult {
            result: result.clone(),
        });
        result
    }

    async fn run_inner(&self, ctx: &RunContext, started: Instant) -> Result<TaskResult, AgentError> {
        let instruction = ctx.instruction.clone();

        let plan = match self.fast_path(&instruction, ctx).await {
            Some(step) => vec![step],
            None => {
                let memory = match &self.memory {
                    Some(m) => m.context_for(&instruction, self.memory_wait).await,
                    None => None,
                };
                self.planner
                    .plan(&instruction, memory.as_deref(), &ctx.shared().snapshot(), ctx)
                    .await?
            }
        };
        ctx.emit(ProgressEvent::PlanReady {
            steps: plan.clone(),
        });

        let outcome = self.executor.execute(&instruction, plan, ctx).await;
        let duration = started.elapsed().as_secs_f64();
        if let Some(e) = &outcome.error {
            ctx.emit(ProgressEvent::Error {
                message: e.to_string(),
            });
        }
        let message = outcome.message();
        self.remember(&instruction, outcome.success(), &message, &outcome.plan, started);
        Ok(task_result(&outcome, message, duration))
    }

    /// 意图快速通道：嵌入未在时限内就绪、未命中或不在白名单时返回 None
    async fn fast_path(&self, instruction: &str, ctx: &RunContext) -> Option<Step> {
        let router = self.router.as_ref()?;
        if !router.embedder().wait_until_ready(self.embedding_wait).await {
            tracing::debug!(run_id = %ctx.run_id, "embedding not ready, skipping intent routing");
            return None;
        }
        let matched = router.detect(instruction).await?;
        if !router.is_fast_path(&matched.intent).await {
            return None;
        }
        let step = fast_path_step(&matched.intent, instruction)?;
        tracing::info!(
            run_id = %ctx.run_id,
            intent = %matched.intent,
            confidence = matched.confidence,
            step_type = %step.step_type,
            "intent fast path"
        );
        ctx.emit(ProgressEvent::thinking(
            "intent",
            format!(
                "Matched intent '{}' ({:.2}), running {} directly",
                matched.intent, matched.confidence, step.step_type
            ),
        ));
        Some(step)
    }

    fn remember(&self, instruction: &str, success: bool, message: &str, plan: &[Step], started: Instant) {
        let Some(memory) = &self.memory else {
            return;
        };
        let record = TaskRecord::new(instruction, success, message).with_steps(
            plan.iter().map(|s| s.step_type.clone()).collect(),
            started.elapsed().as_secs_f64(),
        );
        if !memory.record(record) {
            tracing::warn!("memory write queue closed, task result not recorded");
        }
    }
}

fn task_result(outcome: &PlanOutcome, message: String, duration: f64) -> TaskResult {
    TaskResult {
        success: outcome.success(),
        message,
        data: outcome.results.last().and_then(|r| r.data.clone()),
        steps_executed: outcome.steps_executed,
        duration,
    }
}
