//! 浏览器执行器
//!
//! 一个编排器实例共用一个浏览器会话（单写者）：所有步骤在 `session` 锁内执行，跨运行串行。
//!
//! 点击的回退链：
//! 1. DOM 点击（选择器或可见文本）
//! 2. 找不到元素且给了目标文字：整页截图 → OCR 找包围盒 → 中心点按设备像素比折算 → 坐标点击
//! 3. 关闭可能的遮罩（常见关闭按钮、Escape、空白处点击）后强制点击一次
//! 4. 仍失败：保存错误截图，返回失败结果（交给反思）
//!
//! 设备像素比每个会话只查询一次。

pub mod coords;
pub mod driver;
pub mod ocr;

#[cfg(feature = "browser")]
pub mod chrome;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{Mutex, OnceCell};

use crate::core::{AgentError, RunContext, Step, StepResult};
use crate::tools::StepExecutor;

pub use coords::{correct_coordinates, CoordinateSpace};
pub use driver::{BrowserDriver, DriverError, Target};
pub use ocr::{OcrEngine, OcrMatch, TesseractOcr};

#[cfg(feature = "browser")]
pub use chrome::ChromeDriver;

/// 常见的弹窗 / cookie 横幅关闭按钮
const OVERLAY_CLOSE_SELECTORS: &[&str] = &[
    "[aria-label='Close']",
    "[aria-label='close']",
    "[aria-label='关闭']",
    "button.close",
    ".modal-close",
    "[data-dismiss='modal']",
    "#onetrust-accept-btn-handler",
    ".cookie-banner button",
];

const DEFAULT_SCRAPE_CHARS: usize = 8000;

pub struct BrowserExecutor {
    driver: Arc<dyn BrowserDriver>,
    ocr: Option<Arc<dyn OcrEngine>>,
    session: Mutex<()>,
    dpr: OnceCell<f64>,
}

impl BrowserExecutor {
    pub fn new(driver: Arc<dyn BrowserDriver>) -> Self {
        Self {
            driver,
            ocr: None,
            session: Mutex::new(()),
            dpr: OnceCell::new(),
        }
    }

    pub fn with_ocr(mut self, ocr: Arc<dyn OcrEngine>) -> Self {
        self.ocr = Some(ocr);
        self
    }

    /// 会话内缓存的设备像素比；查询失败按 1.0 处理且不缓存
    pub async fn device_pixel_ratio(&self) -> f64 {
        if let Some(r) = self.dpr.get() {
            return *r;
        }
        match self.driver.device_pixel_ratio().await {
            Ok(r) if r.is_finite() && r > 0.0 => *self.dpr.get_or_init(|| async { r }).await,
            Ok(r) => {
                tracing::warn!(ratio = r, "ignoring bogus device pixel ratio");
                1.0
            }
            Err(e) => {
                tracing::warn!(error = %e, "device pixel ratio unavailable, assuming 1.0");
                1.0
            }
        }
    }

    /// 已缓存的比值（不触发查询），供反思截图的坐标提示用
    pub fn cached_device_pixel_ratio(&self) -> Option<f64> {
        self.dpr.get().copied()
    }

    fn click_target(step: &Step) -> Option<Target> {
        if let Some(sel) = step.param_str("selector").filter(|s| !s.trim().is_empty()) {
            return Some(Target::Selector(sel.to_string()));
        }
        ["text", "target", "label"]
            .iter()
            .find_map(|k| step.param_str(k))
            .filter(|s| !s.trim().is_empty())
            .map(|t| Target::Text(t.to_string()))
    }

    /// OCR 使用的目标短语：优先显式的 text / target，其次文本型 Target
    fn target_phrase(step: &Step, target: Option<&Target>) -> Option<String> {
        ["text", "target", "label"]
            .iter()
            .find_map(|k| step.param_str(k))
            .map(str::to_string)
            .or_else(|| match target {
                Some(Target::Text(t)) => Some(t.clone()),
                _ => None,
            })
            .filter(|s| !s.trim().is_empty())
    }

    async fn dismiss_overlays(&self) {
        for sel in OVERLAY_CLOSE_SELECTORS {
            if self
                .driver
                .click(&Target::Selector((*sel).to_string()), false)
                .await
                .is_ok()
            {
                tracing::debug!(selector = sel, "overlay dismissed");
                break;
            }
        }
        if let Err(e) = self.driver.press_key("Escape").await {
            tracing::debug!(error = %e, "escape during overlay recovery failed");
        }
        if let Err(e) = self.driver.click_at(5.0, 5.0).await {
            tracing::debug!(error = %e, "neutral click during overlay recovery failed");
        }
    }

    /// 整页截图上做 OCR，命中后按 DPR 折算并点击；返回点击的逻辑坐标
    async fn ocr_click(&self, phrase: &str) -> Result<Option<(f64, f64)>, String> {
        let Some(ocr) = &self.ocr else {
            return Ok(None);
        };
        let png = self.driver.screenshot(true).await.map_err(|e| e.to_string())?;
        let Some(hit) = ocr.find_text(&png, phrase).await? else {
            return Ok(None);
        };
        let (px, py) = hit.center();
        let ratio = self.device_pixel_ratio().await;
        let (x, y) = correct_coordinates(px, py, ratio);
        tracing::info!(phrase, px, py, ratio, x, y, "ocr fallback click");
        self.driver.click_at(x, y).await.map_err(|e| e.to_string())?;
        Ok(Some((x, y)))
    }

    /// 保存失败截图到 downloads，文件名带 error_ 供反思查找
    async fn capture_error_screenshot(&self, ctx: &RunContext) -> Option<String> {
        let png = match self.driver.screenshot(false).await {
            Ok(png) => png,
            Err(e) => {
                tracing::warn!(error = %e, "error screenshot failed");
                return None;
            }
        };
        let ts = chrono::Local::now().format("%Y%m%d_%H%M%S_%3f");
        let path = ctx.downloads_dir().join(format!("browser_error_{ts}.png"));
        self.write_png(&path, &png).await.ok()
    }

    async fn write_png(&self, path: &Path, png: &[u8]) -> Result<String, AgentError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, png).await?;
        Ok(path.to_string_lossy().to_string())
    }

    async fn failure_with_screenshot(&self, message: String, ctx: &RunContext) -> StepResult {
        let images = self.capture_error_screenshot(ctx).await.into_iter().collect();
        StepResult::failure(message).with_images(images)
    }

    async fn navigate(&self, step: &Step) -> Result<StepResult, AgentError> {
        let raw = step
            .param_str("url")
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| AgentError::Execution("Missing parameter: url".into()))?;
        let url = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("https://{raw}")
        };
        let title = self
            .driver
            .navigate(&url)
            .await
            .map_err(|e| AgentError::Execution(format!("Navigate to {url} failed: {e}")))?;
        Ok(StepResult::ok_with_data(
            format!("Opened {url}"),
            json!({ "url": url, "title": title }),
        ))
    }

    async fn click(&self, step: &Step, ctx: &RunContext) -> Result<StepResult, AgentError> {
        if let (Some(x), Some(y)) = (step.param_f64("x"), step.param_f64("y")) {
            let space = CoordinateSpace::from_param(step.param_str("coordinate_space"));
            let ratio = self.device_pixel_ratio().await;
            let (lx, ly) = coords::to_logical(x, y, space, ratio);
            return match self.driver.click_at(lx, ly).await {
                Ok(()) => Ok(StepResult::ok_with_data(
                    format!("Clicked at ({lx:.0}, {ly:.0})"),
                    json!({ "x": lx, "y": ly, "method": "coordinates" }),
                )),
                Err(e) => Ok(self
                    .failure_with_screenshot(format!("Click at ({lx}, {ly}) failed: {e}"), ctx)
                    .await),
            };
        }

        let target = Self::click_target(step);
        let phrase = Self::target_phrase(step, target.as_ref());
        let Some(target) = target else {
            return Err(AgentError::Execution(
                "Missing click target (selector, text or x/y)".into(),
            ));
        };

        let first = match self.driver.click(&target, false).await {
            Ok(()) => {
                return Ok(StepResult::ok_with_data(
                    format!("Clicked {}", target.describe()),
                    json!({ "method": "dom" }),
                ))
            }
            Err(e) => e,
        };
        tracing::info!(target = %target.describe(), error = %first, "dom click failed");

        if let (DriverError::NotFound(_), Some(phrase)) = (&first, phrase.as_deref()) {
            match self.ocr_click(phrase).await {
                Ok(Some((x, y))) => {
                    return Ok(StepResult::ok_with_data(
                        format!("Clicked '{phrase}' via OCR at ({x:.0}, {y:.0})"),
                        json!({ "x": x, "y": y, "method": "ocr" }),
                    ))
                }
                Ok(None) => tracing::info!(phrase, "ocr found no match"),
                Err(e) => tracing::warn!(phrase, error = %e, "ocr fallback failed"),
            }
        }

        self.dismiss_overlays().await;
        match self.driver.click(&target, true).await {
            Ok(()) => Ok(StepResult::ok_with_data(
                format!("Clicked {} after overlay recovery", target.describe()),
                json!({ "method": "forced" }),
            )),
            Err(e) => Ok(self
                .failure_with_screenshot(
                    format!("Click on {} failed: {first}; forced retry: {e}", target.describe()),
                    ctx,
                )
                .await),
        }
    }

    async fn fill(&self, step: &Step, ctx: &RunContext) -> Result<StepResult, AgentError> {
        let target = step
            .param_str("selector")
            .map(|s| Target::Selector(s.to_string()))
            .or_else(|| {
                ["target", "label", "placeholder"]
                    .iter()
                    .find_map(|k| step.param_str(k))
                    .map(|t| Target::Text(t.to_string()))
            })
            .ok_or_else(|| AgentError::Execution("Missing parameter: selector".into()))?;
        let value = ["value", "text", "content"]
            .iter()
            .find_map(|k| step.params.get(*k))
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .ok_or_else(|| AgentError::Execution("Missing parameter: value".into()))?;

        match self.driver.fill(&target, &value).await {
            Ok(()) => Ok(StepResult::ok(format!("Filled {}", target.describe()))),
            Err(first) => {
                self.dismiss_overlays().await;
                match self.driver.fill(&target, &value).await {
                    Ok(()) => Ok(StepResult::ok(format!(
                        "Filled {} after overlay recovery",
                        target.describe()
                    ))),
                    Err(e) => Ok(self
                        .failure_with_screenshot(
                            format!("Fill {} failed: {first}; retry: {e}", target.describe()),
                            ctx,
                        )
                        .await),
                }
            }
        }
    }

    async fn wait(&self, step: &Step, ctx: &RunContext) -> Result<StepResult, AgentError> {
        let timeout = Duration::from_millis(step.param_f64("timeout_ms").unwrap_or(5000.0).max(0.0) as u64);
        match Self::click_target(step) {
            Some(target) => match self.driver.wait_for(&target, timeout).await {
                Ok(()) => Ok(StepResult::ok(format!("{} appeared", target.describe()))),
                Err(e) => Ok(self
                    .failure_with_screenshot(format!("Waiting for {} failed: {e}", target.describe()), ctx)
                    .await),
            },
            None => {
                let secs = step.param_f64("seconds").unwrap_or(1.0).clamp(0.0, 60.0);
                tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                Ok(StepResult::ok(format!("Waited {secs}s")))
            }
        }
    }

    async fn screenshot(&self, step: &Step, ctx: &RunContext) -> Result<StepResult, AgentError> {
        let full_page = step
            .params
            .get("full_page")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let png = self
            .driver
            .screenshot(full_page)
            .await
            .map_err(|e| AgentError::Execution(format!("Screenshot failed: {e}")))?;
        let ts = chrono::Local::now().format("%Y%m%d_%H%M%S_%3f");
        let path = self
            .write_png(&ctx.downloads_dir().join(format!("browser_{ts}.png")), &png)
            .await?;
        Ok(
            StepResult::ok_with_data(format!("Screenshot saved to {path}"), json!({ "path": path }))
                .with_images(vec![path]),
        )
    }

    async fn scrape(&self, step: &Step) -> Result<StepResult, AgentError> {
        if step.param_str("url").is_some() {
            self.navigate(step).await?;
        }
        let html = self
            .driver
            .content_html()
            .await
            .map_err(|e| AgentError::Execution(format!("Reading page failed: {e}")))?;
        let text = html2text::from_read(html.as_bytes(), 120).unwrap_or_else(|_| html.clone());
        let max_chars = step
            .param_f64("max_chars")
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_SCRAPE_CHARS);
        let truncated = text.chars().count() > max_chars;
        let text: String = text.chars().take(max_chars).collect();
        let url = self.driver.current_url().await.unwrap_or_default();
        Ok(StepResult::ok_with_data(
            format!("Extracted {} chars from {url}", text.chars().count()),
            json!({ "url": url, "text": text, "truncated": truncated }),
        ))
    }
}

#[async_trait]
impl StepExecutor for BrowserExecutor {
    fn name(&self) -> &str {
        "browser"
    }

    fn is_blocking(&self) -> bool {
        true
    }

    fn step_types(&self) -> &[&'static str] {
        &[
            "browser_navigate",
            "open_url",
            "browser_click",
            "click",
            "browser_fill",
            "browser_type",
            "type",
            "browser_wait",
            "browser_screenshot",
            "browser_scrape",
            "scrape",
            "browser_press_key",
        ]
    }

    async fn execute_step(&self, step: &Step, ctx: &RunContext) -> Result<StepResult, AgentError> {
        let _session = self.session.lock().await;
        match step.step_type.as_str() {
            "browser_navigate" | "open_url" => self.navigate(step).await,
            "browser_click" | "click" => self.click(step, ctx).await,
            "browser_fill" | "browser_type" | "type" => self.fill(step, ctx).await,
            "browser_wait" => self.wait(step, ctx).await,
            "browser_screenshot" => self.screenshot(step, ctx).await,
            "browser_scrape" | "scrape" => self.scrape(step).await,
            "browser_press_key" => {
                let key = step
                    .param_str("key")
                    .ok_or_else(|| AgentError::Execution("Missing parameter: key".into()))?;
                self.driver
                    .press_key(key)
                    .await
                    .map_err(|e| AgentError::Execution(format!("Key press failed: {e}")))?;
                Ok(StepResult::ok(format!("Pressed {key}")))
            }
            other => Err(AgentError::Execution(format!("Unsupported browser step: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// 可编排的假驱动：按目标返回预设点击结果，记录坐标点击
    #[derive(Default)]
    struct FakeDriver {
        click_errors: StdMutex<Vec<DriverError>>,
        clicks_at: StdMutex<Vec<(f64, f64)>>,
        dpr_queries: AtomicUsize,
        ratio: f64,
    }

    impl FakeDriver {
        fn with_ratio(ratio: f64) -> Self {
            Self {
                ratio,
                ..Default::default()
            }
        }

        fn fail_clicks(self, errors: Vec<DriverError>) -> Self {
            *self.click_errors.lock().unwrap() = errors;
            self
        }
    }

    #[async_trait]
    impl BrowserDriver for FakeDriver {
        async fn navigate(&self, _url: &str) -> Result<String, DriverError> {
            Ok("Example".into())
        }
        async fn current_url(&self) -> Result<String, DriverError> {
            Ok("https://example.com".into())
        }
        async fn click(&self, target: &Target, _force: bool) -> Result<(), DriverError> {
            if let Target::Selector(s) = target {
                if OVERLAY_CLOSE_SELECTORS.contains(&s.as_str()) {
                    return Err(DriverError::NotFound(s.clone()));
                }
            }
            let mut errs = self.click_errors.lock().unwrap();
            if errs.is_empty() {
                Ok(())
            } else {
                Err(errs.remove(0))
            }
        }
        async fn fill(&self, _target: &Target, _value: &str) -> Result<(), DriverError> {
            Ok(())
        }
        async fn click_at(&self, x: f64, y: f64) -> Result<(), DriverError> {
            self.clicks_at.lock().unwrap().push((x, y));
            Ok(())
        }
        async fn press_key(&self, _key: &str) -> Result<(), DriverError> {
            Ok(())
        }
        async fn wait_for(&self, _target: &Target, _timeout: Duration) -> Result<(), DriverError> {
            Ok(())
        }
        async fn screenshot(&self, _full_page: bool) -> Result<Vec<u8>, DriverError> {
            Ok(vec![0x89, b'P', b'N', b'G'])
        }
        async fn device_pixel_ratio(&self) -> Result<f64, DriverError> {
            self.dpr_queries.fetch_add(1, Ordering::SeqCst);
            Ok(self.ratio)
        }
        async fn content_html(&self) -> Result<String, DriverError> {
            Ok("<html><body><h1>Hello</h1><p>World</p></body></html>".into())
        }
    }

    struct FixedOcr(Option<OcrMatch>);

    #[async_trait]
    impl OcrEngine for FixedOcr {
        async fn find_text(&self, _png: &[u8], _needle: &str) -> Result<Option<OcrMatch>, String> {
            Ok(self.0.clone())
        }
    }

    fn hit() -> OcrMatch {
        OcrMatch {
            text: "Checkout".into(),
            left: 180.0,
            top: 90.0,
            width: 40.0,
            height: 20.0,
            confidence: 90.0,
        }
    }

    #[tokio::test]
    async fn test_ocr_fallback_applies_dpr() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(
            FakeDriver::with_ratio(2.0).fail_clicks(vec![DriverError::NotFound("Checkout".into())]),
        );
        let exec = BrowserExecutor::new(driver.clone()).with_ocr(Arc::new(FixedOcr(Some(hit()))));
        let step = Step::new("browser_click", "click", "").with_param("text", "Checkout");
        let r = exec.execute_step(&step, &RunContext::detached(dir.path())).await.unwrap();
        assert!(r.success, "{}", r.message);
        assert_eq!(*driver.clicks_at.lock().unwrap(), vec![(100.0, 50.0)]);
        assert_eq!(r.data.unwrap()["method"], "ocr");
    }

    #[tokio::test]
    async fn test_ocr_miss_fails_with_screenshot() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(FakeDriver::with_ratio(1.0).fail_clicks(vec![
            DriverError::NotFound("Checkout".into()),
            DriverError::NotFound("Checkout".into()),
        ]));
        let exec = BrowserExecutor::new(driver.clone()).with_ocr(Arc::new(FixedOcr(None)));
        let step = Step::new("browser_click", "click", "").with_param("text", "Checkout");
        let r = exec.execute_step(&step, &RunContext::detached(dir.path())).await.unwrap();
        assert!(!r.success);
        assert_eq!(r.images.len(), 1);
        assert!(r.images[0].contains("error_"));
        assert!(std::path::Path::new(&r.images[0]).exists());
    }

    #[tokio::test]
    async fn test_obscured_click_recovers_with_force() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(
            FakeDriver::with_ratio(1.0).fail_clicks(vec![DriverError::Obscured("#buy".into())]),
        );
        let exec = BrowserExecutor::new(driver.clone());
        let step = Step::new("browser_click", "click", "").with_param("selector", "#buy");
        let r = exec.execute_step(&step, &RunContext::detached(dir.path())).await.unwrap();
        assert!(r.success);
        assert_eq!(r.data.unwrap()["method"], "forced");
        // 遮罩恢复中的空白处点击
        assert_eq!(*driver.clicks_at.lock().unwrap(), vec![(5.0, 5.0)]);
    }

    #[tokio::test]
    async fn test_dpr_cached_per_session() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(FakeDriver::with_ratio(2.0));
        let exec = BrowserExecutor::new(driver.clone());
        let ctx = RunContext::detached(dir.path());
        for _ in 0..3 {
            let step = Step::new("browser_click", "click", "")
                .with_param("x", 400)
                .with_param("y", 300);
            exec.execute_step(&step, &ctx).await.unwrap();
        }
        assert_eq!(driver.dpr_queries.load(Ordering::SeqCst), 1);
        assert_eq!(driver.clicks_at.lock().unwrap()[0], (200.0, 150.0));
    }

    #[tokio::test]
    async fn test_logical_coordinates_not_scaled() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(FakeDriver::with_ratio(2.0));
        let exec = BrowserExecutor::new(driver.clone());
        let step = Step::new("browser_click", "click", "")
            .with_param("x", 40)
            .with_param("y", 30)
            .with_param("coordinate_space", "logical");
        exec.execute_step(&step, &RunContext::detached(dir.path())).await.unwrap();
        assert_eq!(*driver.clicks_at.lock().unwrap(), vec![(40.0, 30.0)]);
    }

    #[tokio::test]
    async fn test_scrape_returns_text() {
        let dir = tempfile::tempdir().unwrap();
        let exec = BrowserExecutor::new(Arc::new(FakeDriver::with_ratio(1.0)));
        let r = exec
            .execute_step(&Step::new("browser_scrape", "scrape", ""), &RunContext::detached(dir.path()))
            .await
            .unwrap();
        let text = r.data.unwrap()["text"].as_str().unwrap().to_string();
        assert!(text.contains("Hello"));
        assert!(text.contains("World"));
    }
}
