//! 记忆层：规划上下文的读取与任务结果的串行持久化
//!
//! - **store**: SQLite 存储（任务、偏好）与 MemoryContext
//! - **write_queue**: 单消费者写队列 + 跨进程文件锁
//! - **tokenizer**: 中英文分词与 Jaccard 相似度
//!
//! MemoryService 在后台打开存储；读上下文时只做短超时的就绪检查，未就绪即跳过。

pub mod file_lock;
pub mod store;
pub mod tokenizer;
pub mod write_queue;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

pub use store::{MemoryContext, MemoryStore, SqliteMemoryStore, TaskRecord};
pub use write_queue::{MemoryWrite, MemoryWriteQueue};

use crate::config::AppConfig;

/// 存储加载状态
#[derive(Clone)]
pub enum StoreState {
    Loading,
    Ready(Arc<dyn MemoryStore>),
    Failed,
}

pub struct MemoryService {
    state: watch::Receiver<StoreState>,
    queue: MemoryWriteQueue,
    recent_limit: usize,
    similar_limit: usize,
    max_chars: usize,
}

impl MemoryService {
    /// 后台打开 SQLite 存储并启动写队列；需在 tokio 运行时内调用
    pub fn open(config: &AppConfig) -> Self {
        let (tx, rx) = watch::channel(StoreState::Loading);
        let db_path = config.memory_db_path();
        tokio::spawn(async move {
            let opened =
                tokio::task::spawn_blocking(move || SqliteMemoryStore::open(&db_path)).await;
            let state = match opened {
                Ok(Ok(store)) => StoreState::Ready(Arc::new(store)),
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "memory store failed to open");
                    StoreState::Failed
                }
                Err(e) => {
                    tracing::warn!(error = %e, "memory store open task failed");
                    StoreState::Failed
                }
            };
            let _ = tx.send(state);
        });
        Self::from_state(rx, config.memory_lock_path(), config)
    }

    /// 使用已就绪的存储（测试、嵌入式使用）
    pub fn with_store(store: Arc<dyn MemoryStore>, lock_path: PathBuf, config: &AppConfig) -> Self {
        let (_tx, rx) = watch::channel(StoreState::Ready(store));
        Self::from_state(rx, lock_path, config)
    }

    fn from_state(state: watch::Receiver<StoreState>, lock_path: PathBuf, config: &AppConfig) -> Self {
        Self {
            queue: MemoryWriteQueue::start(state.clone(), lock_path),
            state,
            recent_limit: config.memory.recent_limit,
            similar_limit: config.memory.similar_limit,
            max_chars: config.memory.context_max_chars,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.state.borrow(), StoreState::Ready(_))
    }

    async fn ready_store(&self, timeout: Duration) -> Option<Arc<dyn MemoryStore>> {
        let mut rx = self.state.clone();
        let store = match tokio::time::timeout(timeout, rx.wait_for(|s| !matches!(s, StoreState::Loading))).await {
            Ok(Ok(state)) => match &*state {
                StoreState::Ready(store) => Some(store.clone()),
                _ => None,
            },
            _ => None,
        };
        store
    }

    /// 规划用的记忆段落；存储未在 timeout 内就绪或查询失败时返回 None
    pub async fn context_for(&self, instruction: &str, timeout: Duration) -> Option<String> {
        let store = self.ready_store(timeout).await?;
        let instruction = instruction.to_string();
        let (recent, similar) = (self.recent_limit, self.similar_limit);
        let query = tokio::task::spawn_blocking(move || store.context_for(&instruction, recent, similar));
        match tokio::time::timeout(timeout, query).await {
            Ok(Ok(Ok(ctx))) => {
                let section = ctx.to_prompt_section(self.max_chars);
                (!section.is_empty()).then_some(section)
            }
            Ok(Ok(Err(e))) => {
                tracing::warn!(error = %e, "memory context query failed");
                None
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "memory context task failed");
                None
            }
            Err(_) => {
                tracing::warn!("memory context query timed out");
                None
            }
        }
    }

    /// 非阻塞记录任务结果
    pub fn record(&self, record: TaskRecord) -> bool {
        self.queue.enqueue(MemoryWrite::Task(record))
    }

    pub fn set_preference(&self, key: impl Into<String>, value: impl Into<String>) -> bool {
        self.queue.enqueue(MemoryWrite::Preference {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn written(&self) -> usize {
        self.queue.written()
    }

    pub async fn shutdown(&self, wait: bool) {
        self.queue.shutdown(wait).await;
    }
}
