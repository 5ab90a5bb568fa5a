//! 步骤派发器
//!
//! 持有 ExecutorRegistry 与单步超时，dispatch(step, ctx) 在超时内调用对应执行器，同时响应运行取消；
//! 超时或取消时直接丢弃执行 future（子进程以 kill_on_drop 启动，随之被强制终止）。
//! 阻塞型执行器先从 TaskScheduler 的 Blocking 池取许可；池满或已关闭时记录告警后直接执行。
//! 每次派发输出一条结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::{AgentError, RunContext, Step, StepResult, TaskKind, TaskScheduler};
use crate::tools::ExecutorRegistry;

/// 派发器：对每次执行施加超时，并将失败映射为 AgentError
pub struct StepDispatcher {
    registry: Arc<ExecutorRegistry>,
    timeout: Duration,
    pool: Option<(Arc<TaskScheduler>, Duration)>,
}

impl StepDispatcher {
    pub fn new(registry: Arc<ExecutorRegistry>, timeout: Duration) -> Self {
        Self {
            registry,
            timeout,
            pool: None,
        }
    }

    /// 阻塞型步骤经有界池派发；acquire_timeout 内拿不到许可则降级直接执行
    pub fn with_pool(mut self, scheduler: Arc<TaskScheduler>, acquire_timeout: Duration) -> Self {
        self.pool = Some((scheduler, acquire_timeout));
        self
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    /// 派发一步。Ok 中的 StepResult 可能是 success=false（执行器报告的失败，附带截图等诊断）
    pub async fn dispatch(&self, step: &Step, ctx: &RunContext) -> Result<StepResult, AgentError> {
        let (executor, step) = self.registry.resolve(step).ok_or_else(|| {
            AgentError::Execution(format!("No executor registered for step type '{}'", step.step_type))
        })?;

        let _permit = match &self.pool {
            Some((scheduler, wait)) if executor.is_blocking() => {
                match scheduler.acquire(TaskKind::Blocking, *wait).await {
                    Ok(permit) => Some(permit),
                    Err(e) => {
                        tracing::warn!(step_type = %step.step_type, error = ?e, "blocking pool unavailable, dispatching directly");
                        None
                    }
                }
            }
            _ => None,
        };

        let start = Instant::now();
        let result = tokio::select! {
            r = tokio::time::timeout(self.timeout, executor.execute_step(&step, ctx)) => match r {
                Ok(inner) => inner,
                Err(_) => Err(AgentError::Timeout(format!(
                    "{} exceeded {}s",
                    step.step_type,
                    self.timeout.as_secs()
                ))),
            },
            _ = ctx.cancel_token().cancelled() => Err(AgentError::Cancelled),
        };

        let outcome = match &result {
            Ok(r) if r.success => "ok",
            Ok(_) => "failed",
            Err(AgentError::Timeout(_)) => "timeout",
            Err(AgentError::Cancelled) => "cancelled",
            Err(_) => "error",
        };
        let audit = serde_json::json!({
            "event": "step_audit",
            "run_id": ctx.run_id,
            "executor": executor.name(),
            "step_type": step.step_type,
            "action": step.action,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "params_preview": params_preview(&step),
        });
        tracing::info!(audit = %audit.to_string(), "step");

        result
    }
}

fn params_preview(step: &Step) -> String {
    let s = serde_json::Value::Object(step.params.clone()).to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::StepExecutor;
    use async_trait::async_trait;

    struct Sleepy;

    #[async_trait]
    impl StepExecutor for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }
        fn step_types(&self) -> &[&'static str] {
            &["sleep"]
        }
        async fn execute_step(&self, _step: &Step, _ctx: &RunContext) -> Result<StepResult, AgentError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(StepResult::ok("woke"))
        }
    }

    fn dispatcher(timeout_ms: u64) -> StepDispatcher {
        let mut r = ExecutorRegistry::new();
        r.register(Sleepy);
        StepDispatcher::new(Arc::new(r), Duration::from_millis(timeout_ms))
    }

    #[tokio::test]
    async fn test_dispatch_timeout() {
        let d = dispatcher(20);
        let ctx = RunContext::detached("/tmp");
        let err = d.dispatch(&Step::new("sleep", "", ""), &ctx).await.unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_dispatch_cancelled() {
        let d = dispatcher(10_000);
        let ctx = RunContext::detached("/tmp");
        ctx.cancel_token().cancel();
        let err = d.dispatch(&Step::new("sleep", "", ""), &ctx).await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }

    /// 执行时记录 Blocking 池剩余许可
    struct PoolProbe {
        scheduler: Arc<TaskScheduler>,
        seen: std::sync::Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl StepExecutor for PoolProbe {
        fn name(&self) -> &str {
            "pooled"
        }
        fn step_types(&self) -> &[&'static str] {
            &["pooled"]
        }
        async fn execute_step(&self, _step: &Step, _ctx: &RunContext) -> Result<StepResult, AgentError> {
            self.seen
                .lock()
                .unwrap()
                .push(self.scheduler.available(TaskKind::Blocking));
            Ok(StepResult::ok("ran"))
        }
        fn is_blocking(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_blocking_step_holds_pool_permit() {
        let scheduler = Arc::new(TaskScheduler::new(1, 2));
        let probe = Arc::new(PoolProbe {
            scheduler: scheduler.clone(),
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let mut r = ExecutorRegistry::new();
        r.register_arc(probe.clone());
        let d = StepDispatcher::new(Arc::new(r), Duration::from_secs(1))
            .with_pool(scheduler.clone(), Duration::from_millis(20));
        let ctx = RunContext::detached("/tmp");

        assert!(d.dispatch(&Step::new("pooled", "", ""), &ctx).await.unwrap().success);
        assert_eq!(scheduler.available(TaskKind::Blocking), 2);

        // 池被占满时降级为直接执行
        let _a = scheduler.acquire(TaskKind::Blocking, Duration::from_millis(10)).await.unwrap();
        let _b = scheduler.acquire(TaskKind::Blocking, Duration::from_millis(10)).await.unwrap();
        assert!(d.dispatch(&Step::new("pooled", "", ""), &ctx).await.unwrap().success);
        assert_eq!(*probe.seen.lock().unwrap(), [1, 0]);
    }

    #[tokio::test]
    async fn test_unknown_type() {
        let d = dispatcher(20);
        let ctx = RunContext::detached("/tmp");
        let err = d.dispatch(&Step::new("nope", "", ""), &ctx).await.unwrap_err();
        assert!(matches!(err, AgentError::Execution(_)));
    }
}
