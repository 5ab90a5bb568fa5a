//! 运行上下文：一次指令执行独占一个 RunContext
//!
//! - 事件发送端（请求级，不与其它运行共享）
//! - 共享上下文 map（placeholder 解析之外的跨步状态、宿主写入的确认信号）
//! - 取消令牌（编排器根 token 的子 token）

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::runtime::events::{Emitter, ProgressEvent};

/// 敏感步骤确认信号在共享上下文中的键
pub fn confirmation_key(step_id: &str) -> String {
    format!("confirm:{step_id}")
}

/// 等待共享上下文键的结果
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Value(Value),
    TimedOut,
    Cancelled,
}

/// 可跨任务克隆的共享 map；写入时唤醒所有等待者
#[derive(Debug, Clone, Default)]
pub struct SharedContext {
    inner: Arc<RwLock<Map<String, Value>>>,
    changed: Arc<Notify>,
}

impl SharedContext {
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(map)),
            changed: Arc::new(Notify::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().ok().and_then(|m| m.get(key).cloned())
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        if let Ok(mut m) = self.inner.write() {
            m.insert(key.into(), value);
        }
        self.changed.notify_waiters();
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.write().ok().and_then(|mut m| m.remove(key))
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.inner.read().map(|m| m.clone()).unwrap_or_default()
    }

    /// 等待某个键出现；先注册唤醒再检查，避免写入发生在两者之间时漏掉
    pub async fn wait_for(
        &self,
        key: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> WaitOutcome {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(v) = self.get(key) {
                return WaitOutcome::Value(v);
            }
            tokio::select! {
                _ = notified => continue,
                _ = tokio::time::sleep_until(deadline) => return WaitOutcome::TimedOut,
                _ = cancel.cancelled() => return WaitOutcome::Cancelled,
            }
        }
    }
}

/// 单次运行的上下文，按引用传给 Plan Executor、各执行器与其子组件
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub instruction: String,
    pub sandbox_root: PathBuf,
    emitter: Emitter,
    shared: SharedContext,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn new(
        instruction: impl Into<String>,
        sandbox_root: impl Into<PathBuf>,
        emitter: Emitter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            instruction: instruction.into(),
            sandbox_root: sandbox_root.into(),
            emitter,
            shared: SharedContext::default(),
            cancel,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_shared(mut self, shared: SharedContext) -> Self {
        self.shared = shared;
        self
    }

    /// 测试与后台任务用：无事件、不可取消、沙箱为给定目录
    pub fn detached(sandbox_root: impl AsRef<Path>) -> Self {
        Self::new(
            "",
            sandbox_root.as_ref(),
            Emitter::noop(),
            CancellationToken::new(),
        )
    }

    pub fn emit(&self, ev: ProgressEvent) {
        self.emitter.emit(ev);
    }

    pub fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    pub fn shared(&self) -> &SharedContext {
        &self.shared
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 本次运行的产物目录：<sandbox>/outputs/<run_id>
    pub fn output_dir(&self) -> PathBuf {
        self.sandbox_root.join("outputs").join(&self.run_id)
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.sandbox_root.join("downloads")
    }
}

/// 交给宿主的运行句柄：写入确认、取消运行
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub run_id: String,
    shared: SharedContext,
    cancel: CancellationToken,
}

impl RunHandle {
    pub fn new(ctx: &RunContext) -> Self {
        Self {
            run_id: ctx.run_id.clone(),
            shared: ctx.shared.clone(),
            cancel: ctx.cancel.clone(),
        }
    }

    /// 对 sensitive_operation_detected 事件中的 step_id 给出确认或拒绝
    pub fn confirm(&self, step_id: &str, approved: bool) {
        self.shared.set(confirmation_key(step_id), Value::Bool(approved));
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_for_confirmation_written_later() {
        let ctx = RunContext::detached("/tmp");
        let handle = RunHandle::new(&ctx);
        let key = confirmation_key("s1");
        let waiter = {
            let shared = ctx.shared().clone();
            let cancel = ctx.cancel_token().clone();
            tokio::spawn(async move { shared.wait_for(&key, Duration::from_secs(2), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.confirm("s1", true);
        assert_eq!(waiter.await.unwrap(), WaitOutcome::Value(Value::Bool(true)));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let ctx = RunContext::detached("/tmp");
        let r = ctx
            .shared()
            .wait_for("confirm:none", Duration::from_millis(30), ctx.cancel_token())
            .await;
        assert_eq!(r, WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_wait_observes_cancel() {
        let ctx = RunContext::detached("/tmp");
        RunHandle::new(&ctx).cancel();
        let r = ctx
            .shared()
            .wait_for("confirm:x", Duration::from_secs(5), ctx.cancel_token())
            .await;
        assert_eq!(r, WaitOutcome::Cancelled);
    }

    #[test]
    fn test_output_dir_scoped_by_run() {
        let ctx = RunContext::detached("/sandbox").with_run_id("r1");
        assert_eq!(ctx.output_dir(), PathBuf::from("/sandbox/outputs/r1"));
    }
}
