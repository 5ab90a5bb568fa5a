//! 任务调度：有界工作池
//!
//! LLM 调用与浏览器 / 网络等阻塞操作都要先拿到池许可；池满时调用方按超时放弃排队，
//! 由上层决定降级为直接调用。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// 任务类型
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TaskKind {
    /// LLM 请求（规划、反思）
    LlmCall,
    /// 浏览器 / 网络 / 子进程等阻塞操作
    Blocking,
}

/// 获取许可失败的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// 在等待上限内没有空闲许可
    Exhausted,
    /// 池已关闭
    Closed,
}

/// 任务调度器：每种任务一个信号量
#[derive(Debug)]
pub struct TaskScheduler {
    llm_semaphore: Arc<Semaphore>,
    blocking_semaphore: Arc<Semaphore>,
}

impl TaskScheduler {
    pub fn new(max_concurrent_llm: usize, max_concurrent_blocking: usize) -> Self {
        Self {
            llm_semaphore: Arc::new(Semaphore::new(max_concurrent_llm.max(1))),
            blocking_semaphore: Arc::new(Semaphore::new(max_concurrent_blocking.max(1))),
        }
    }

    fn semaphore(&self, kind: TaskKind) -> Arc<Semaphore> {
        match kind {
            TaskKind::LlmCall => self.llm_semaphore.clone(),
            TaskKind::Blocking => self.blocking_semaphore.clone(),
        }
    }

    /// 在 wait 内获取许可；超时返回 Exhausted
    pub async fn acquire(
        &self,
        kind: TaskKind,
        wait: Duration,
    ) -> Result<OwnedSemaphorePermit, PoolError> {
        match tokio::time::timeout(wait, self.semaphore(kind).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(PoolError::Closed),
            Err(_) => Err(PoolError::Exhausted),
        }
    }

    pub fn available(&self, kind: TaskKind) -> usize {
        self.semaphore(kind).available_permits()
    }

    /// 关闭所有池：后续 acquire 立即返回 Closed
    pub fn close(&self) {
        self.llm_semaphore.close();
        self.blocking_semaphore.close();
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(3, 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_exhausted_after_wait() {
        let scheduler = TaskScheduler::new(1, 1);
        let _held = scheduler
            .acquire(TaskKind::LlmCall, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(scheduler.available(TaskKind::LlmCall), 0);
        let second = scheduler
            .acquire(TaskKind::LlmCall, Duration::from_millis(20))
            .await;
        assert_eq!(second.unwrap_err(), PoolError::Exhausted);
        // 另一类池不受影响
        assert!(scheduler
            .acquire(TaskKind::Blocking, Duration::from_millis(10))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_closed_pool() {
        let scheduler = TaskScheduler::default();
        scheduler.close();
        let r = scheduler
            .acquire(TaskKind::LlmCall, Duration::from_millis(10))
            .await;
        assert_eq!(r.unwrap_err(), PoolError::Closed);
    }
}
