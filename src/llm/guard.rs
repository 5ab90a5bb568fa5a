//! LLM 调用网关：有界池 + 超时 + 直接调用降级
//!
//! 规划与反思都经由这里调用 LLM：
//! 1. 在等待上限内从 TaskScheduler 拿到 LlmCall 许可，在独立任务中执行，受请求超时约束；
//! 2. 池耗尽或包装层自身出错（任务 panic / 被中止）时，降级为当前任务内直接调用，同样受超时约束；
//! 3. 请求超时本身是真实失败，不降级，按 Timeout 上报；
//! 4. 整个调用与运行的取消令牌竞争，取消时丢弃调用并中止池内任务。

use std::sync::Arc;
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, PoolError, TaskKind, TaskScheduler};
use crate::llm::traits::Message;
use crate::llm::LlmClient;

/// 包装层错误：只用于决定是否降级
#[derive(Debug)]
enum WrapperError {
    Pool(PoolError),
    Join(String),
}

impl std::fmt::Display for WrapperError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WrapperError::Pool(e) => write!(f, "pool unavailable: {:?}", e),
            WrapperError::Join(e) => write!(f, "worker failed: {}", e),
        }
    }
}

/// 调用方 future 被丢弃（运行取消）时中止池内任务，不让请求在后台跑完
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn call_with_timeout(
    llm: &dyn LlmClient,
    messages: &[Message],
    limit: Duration,
) -> Result<String, AgentError> {
    match tokio::time::timeout(limit, llm.complete(messages)).await {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(e)) => Err(AgentError::Llm(e)),
        Err(_) => Err(AgentError::Timeout(format!(
            "LLM request exceeded {}s",
            limit.as_secs_f32()
        ))),
    }
}

/// LLM 网关：Planner 与 Reflector 共用
#[derive(Clone)]
pub struct LlmGateway {
    llm: Arc<dyn LlmClient>,
    scheduler: Arc<TaskScheduler>,
    request_timeout: Duration,
    acquire_timeout: Duration,
}

impl LlmGateway {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        scheduler: Arc<TaskScheduler>,
        request_timeout: Duration,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            llm,
            scheduler,
            request_timeout,
            acquire_timeout,
        }
    }

    /// 底层客户端累计的 (prompt, completion, total) token
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    pub fn supports_vision(&self) -> bool {
        self.llm.supports_vision()
    }

    pub async fn complete(
        &self,
        messages: Vec<Message>,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        tokio::select! {
            r = self.complete_uncancelled(messages) => r,
            _ = cancel.cancelled() => {
                tracing::info!("llm call abandoned: run cancelled");
                Err(AgentError::Cancelled)
            }
        }
    }

    async fn complete_uncancelled(&self, messages: Vec<Message>) -> Result<String, AgentError> {
        match self.pooled(messages.clone()).await {
            Ok(result) => result,
            Err(wrapper) => {
                tracing::warn!(error = %wrapper, "llm pool wrapper failed, calling directly");
                call_with_timeout(self.llm.as_ref(), &messages, self.request_timeout).await
            }
        }
    }

    async fn pooled(
        &self,
        messages: Vec<Message>,
    ) -> Result<Result<String, AgentError>, WrapperError> {
        let permit = self
            .scheduler
            .acquire(TaskKind::LlmCall, self.acquire_timeout)
            .await
            .map_err(WrapperError::Pool)?;
        let llm = self.llm.clone();
        let limit = self.request_timeout;
        let handle = tokio::spawn(async move {
            let _permit = permit;
            call_with_timeout(llm.as_ref(), &messages, limit).await
        });
        let _guard = AbortOnDrop(handle.abort_handle());
        handle.await.map_err(|e| WrapperError::Join(e.to_string()))
    }
}
