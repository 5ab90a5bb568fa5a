//! 记忆写队列：生产者非阻塞入队，单个消费者任务按序落盘
//!
//! 每条写入在阻塞线程中先拿跨进程文件锁再写存储，多个进程 / 多个运行的写入不会交错。
//! 存储尚未就绪时消费者先等待就绪，入队不受影响；存储加载失败则丢弃后续写入并记录日志。

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::core::AgentError;
use crate::memory::file_lock;
use crate::memory::store::{MemoryStore, TaskRecord};
use crate::memory::StoreState;

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// 一条待写入的记忆
#[derive(Debug, Clone)]
pub enum MemoryWrite {
    Task(TaskRecord),
    Preference { key: String, value: String },
}

fn apply(store: &dyn MemoryStore, write: &MemoryWrite) -> Result<(), AgentError> {
    match write {
        MemoryWrite::Task(record) => store.record_task(record),
        MemoryWrite::Preference { key, value } => store.set_preference(key, value),
    }
}

pub struct MemoryWriteQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<MemoryWrite>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    written: Arc<AtomicUsize>,
}

impl MemoryWriteQueue {
    /// 启动消费者任务；需在 tokio 运行时内调用
    pub fn start(state: watch::Receiver<StoreState>, lock_path: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<MemoryWrite>();
        let written = Arc::new(AtomicUsize::new(0));
        let counter = written.clone();

        let worker = tokio::spawn(async move {
            let mut state = state;
            let store = match state.wait_for(|s| !matches!(s, StoreState::Loading)).await {
                Ok(s) => match &*s {
                    StoreState::Ready(store) => Some(store.clone()),
                    _ => None,
                },
                Err(_) => None,
            };
            let Some(store) = store else {
                tracing::warn!("memory store unavailable, dropping queued writes");
                while rx.recv().await.is_some() {}
                return;
            };

            while let Some(write) = rx.recv().await {
                let store = store.clone();
                let lock_path = lock_path.clone();
                let result = tokio::task::spawn_blocking(move || {
                    let _guard = file_lock::acquire(&lock_path, LOCK_TIMEOUT)?;
                    apply(store.as_ref(), &write)
                })
                .await;
                match result {
                    Ok(Ok(())) => {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(Err(e)) => tracing::warn!(error = %e, "memory write failed"),
                    Err(e) => tracing::warn!(error = %e, "memory write task panicked"),
                }
            }
            tracing::debug!("memory write queue drained");
        });

        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            written,
        }
    }

    /// 非阻塞入队；队列已关闭时返回 false
    pub fn enqueue(&self, write: MemoryWrite) -> bool {
        match self.tx.lock() {
            Ok(guard) => guard.as_ref().map_or(false, |tx| tx.send(write).is_ok()),
            Err(_) => false,
        }
    }

    /// 已成功落盘的条数
    pub fn written(&self) -> usize {
        self.written.load(Ordering::SeqCst)
    }

    /// 关闭队列。wait=true 时等消费者写完已入队的全部条目，否则直接中止
    pub async fn shutdown(&self, wait: bool) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            if wait {
                if let Err(e) = worker.await {
                    tracing::warn!(error = %e, "memory write worker ended abnormally");
                }
            } else {
                worker.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::store::SqliteMemoryStore;

    #[tokio::test]
    async fn test_writes_drain_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn MemoryStore> = Arc::new(SqliteMemoryStore::open_in_memory().unwrap());
        let (_tx, rx) = watch::channel(StoreState::Ready(store.clone()));
        let queue = MemoryWriteQueue::start(rx, dir.path().join("memory.lock"));

        for i in 0..10 {
            assert!(queue.enqueue(MemoryWrite::Task(TaskRecord::new(
                format!("task number {i}"),
                true,
                "done"
            ))));
        }
        queue.enqueue(MemoryWrite::Preference {
            key: "lang".into(),
            value: "zh".into(),
        });
        queue.shutdown(true).await;

        assert_eq!(queue.written(), 11);
        assert!(!queue.enqueue(MemoryWrite::Task(TaskRecord::new("late", true, ""))));
        let ctx = store.context_for("task number", 20, 0).unwrap();
        assert_eq!(ctx.recent_tasks.len(), 10);
        assert_eq!(ctx.preferences.get("lang").map(String::as_str), Some("zh"));
    }

    #[tokio::test]
    async fn test_enqueue_before_store_ready() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = watch::channel(StoreState::Loading);
        let queue = MemoryWriteQueue::start(rx, dir.path().join("memory.lock"));
        assert!(queue.enqueue(MemoryWrite::Task(TaskRecord::new("early", true, "ok"))));

        let store: Arc<dyn MemoryStore> = Arc::new(SqliteMemoryStore::open_in_memory().unwrap());
        tx.send(StoreState::Ready(store.clone())).unwrap();
        queue.shutdown(true).await;
        assert_eq!(queue.written(), 1);
    }
}
