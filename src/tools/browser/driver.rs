//! 浏览器驱动契约：BrowserExecutor 只依赖这里的 trait，具体实现见 chrome.rs（feature = "browser"）

use std::time::Duration;

use async_trait::async_trait;

/// 驱动层错误；NotFound / Obscured 决定点击时走哪条回退路径
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DriverError {
    #[error("element not found: {0}")]
    NotFound(String),
    #[error("element obscured: {0}")]
    Obscured(String),
    #[error("{0}")]
    Other(String),
}

/// 页面元素定位方式
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// CSS 选择器
    Selector(String),
    /// 可见文本
    Text(String),
}

impl Target {
    pub fn describe(&self) -> String {
        match self {
            Target::Selector(s) => format!("selector '{s}'"),
            Target::Text(t) => format!("text '{t}'"),
        }
    }
}

/// 阻塞操作的放弃守卫：调用方 future 在操作完成前被丢弃（派发超时、运行取消）时执行 teardown，
/// 正常完成后 `disarm`
pub struct AbandonGuard<F: FnOnce()> {
    teardown: Option<F>,
}

impl<F: FnOnce()> AbandonGuard<F> {
    pub fn new(teardown: F) -> Self {
        Self {
            teardown: Some(teardown),
        }
    }

    pub fn disarm(mut self) {
        self.teardown = None;
    }
}

impl<F: FnOnce()> Drop for AbandonGuard<F> {
    fn drop(&mut self) {
        if let Some(f) = self.teardown.take() {
            f();
        }
    }
}

/// 一个长期存活的浏览器会话（cookie / 登录态在 user_data_dir 中持久化）
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// 打开 URL，返回页面标题
    async fn navigate(&self, url: &str) -> Result<String, DriverError>;

    async fn current_url(&self) -> Result<String, DriverError>;

    /// force=true 时跳过可见性 / 遮挡检查直接派发点击
    async fn click(&self, target: &Target, force: bool) -> Result<(), DriverError>;

    async fn fill(&self, target: &Target, value: &str) -> Result<(), DriverError>;

    /// 逻辑坐标（CSS 像素）点击
    async fn click_at(&self, x: f64, y: f64) -> Result<(), DriverError>;

    async fn press_key(&self, key: &str) -> Result<(), DriverError>;

    async fn wait_for(&self, target: &Target, timeout: Duration) -> Result<(), DriverError>;

    /// PNG 字节；full_page 为整页截图（物理像素）
    async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>, DriverError>;

    async fn device_pixel_ratio(&self) -> Result<f64, DriverError>;

    async fn content_html(&self) -> Result<String, DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn guarded_op(torn_down: Arc<AtomicUsize>, work: Duration) {
        let guard = AbandonGuard::new(move || {
            torn_down.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(work).await;
        guard.disarm();
    }

    #[tokio::test]
    async fn test_abandoned_operation_tears_down() {
        let torn_down = Arc::new(AtomicUsize::new(0));
        let r = tokio::time::timeout(
            Duration::from_millis(10),
            guarded_op(torn_down.clone(), Duration::from_secs(5)),
        )
        .await;
        assert!(r.is_err());
        assert_eq!(torn_down.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_completed_operation_keeps_session() {
        let torn_down = Arc::new(AtomicUsize::new(0));
        guarded_op(torn_down.clone(), Duration::from_millis(1)).await;
        assert_eq!(torn_down.load(Ordering::SeqCst), 0);
    }
}
