//! headless_chrome 实现的 BrowserDriver
//!
//! 需启用 feature "browser" 且系统已安装 Chrome/Chromium。headless_chrome 是同步 API，
//! 所有调用都放进 spawn_blocking。浏览器与标签页懒启动、整个会话复用，
//! cookie 与登录态保存在 user_data_dir。
//! 会话锁只在取得 / 启动会话时持有；操作被放弃（超时、取消）时强制结束 Chrome 进程并清空会话，
//! 卡住的阻塞调用随连接断开返回，下一步重新启动浏览器。

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::{CaptureScreenshotFormatOption, Viewport};
use headless_chrome::{Browser, LaunchOptions, Tab};

use super::driver::{AbandonGuard, BrowserDriver, DriverError, Target};

struct Session {
    browser: Browser,
    tab: Arc<Tab>,
}

type SharedSession = Arc<Mutex<Option<Arc<Session>>>>;

pub struct ChromeDriver {
    user_data_dir: PathBuf,
    headless: bool,
    session: SharedSession,
}

fn kill_browser(browser: &Browser) {
    let Some(pid) = browser.get_process_id() else { return };
    tracing::warn!(pid, "killing abandoned browser process");
    // 只向自己启动的 Chrome 进程发信号
    #[cfg(unix)]
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
    #[cfg(not(unix))]
    {
        let _ = std::process::Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .status();
    }
}

/// 清空会话并结束进程；在独立线程里做，避免在异步线程上等会话锁
fn teardown_session(session: SharedSession) {
    std::thread::spawn(move || {
        let taken = match session.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(s) = taken {
            kill_browser(&s.browser);
        }
    });
}

fn launch(user_data_dir: PathBuf, headless: bool) -> Result<Session, DriverError> {
    std::fs::create_dir_all(&user_data_dir)
        .map_err(|e| DriverError::Other(format!("user data dir: {e}")))?;
    let options = LaunchOptions::default_builder()
        .headless(headless)
        .user_data_dir(Some(user_data_dir))
        .build()
        .map_err(|e| DriverError::Other(format!("launch options: {e}")))?;
    let browser = Browser::new(options)
        .map_err(|e| DriverError::Other(format!("Chrome launch failed: {e}. Install Chrome/Chromium.")))?;
    let tab = browser
        .new_tab()
        .map_err(|e| DriverError::Other(format!("Browser tab failed: {e}")))?;
    Ok(Session { browser, tab })
}

/// JS 字符串字面量转义
fn js_str(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

/// 返回页面中定位元素的 JS 表达式（找不到为 null）
fn locate_js(target: &Target) -> String {
    match target {
        Target::Selector(sel) => format!("document.querySelector({})", js_str(sel)),
        Target::Text(text) => format!(
            r#"(function() {{
                const needle = {}.toLowerCase();
                const candidates = document.querySelectorAll('a, button, input[type=submit], input[type=button], [role=button], [role=link], label, span, div');
                let best = null;
                for (const el of candidates) {{
                    const t = (el.innerText || el.value || '').trim().toLowerCase();
                    if (t && t.includes(needle) && (!best || t.length < (best.innerText || best.value || '').length)) {{
                        best = el;
                    }}
                }}
                return best;
            }})()"#,
            js_str(text)
        ),
    }
}

impl ChromeDriver {
    pub fn new(user_data_dir: impl Into<PathBuf>, headless: bool) -> Self {
        Self {
            user_data_dir: user_data_dir.into(),
            headless,
            session: Arc::new(Mutex::new(None)),
        }
    }

    /// 在阻塞线程里取得（必要时启动）会话标签页后执行 f
    async fn with_tab<T, F>(&self, f: F) -> Result<T, DriverError>
    where
        T: Send + 'static,
        F: FnOnce(&Arc<Tab>) -> Result<T, DriverError> + Send + 'static,
    {
        let session = Arc::clone(&self.session);
        let user_data_dir = self.user_data_dir.clone();
        let headless = self.headless;
        let abandon = {
            let session = Arc::clone(&self.session);
            AbandonGuard::new(move || teardown_session(session))
        };
        let result = tokio::task::spawn_blocking(move || {
            let current = {
                let mut guard = session
                    .lock()
                    .map_err(|e| DriverError::Other(format!("browser session poisoned: {e}")))?;
                match guard.as_ref() {
                    Some(s) => Arc::clone(s),
                    None => {
                        let s = Arc::new(launch(user_data_dir, headless)?);
                        *guard = Some(Arc::clone(&s));
                        s
                    }
                }
            };
            f(&current.tab)
        })
        .await;
        abandon.disarm();
        result.map_err(|e| DriverError::Other(format!("Task join: {e}")))?
    }
}

fn eval_string(tab: &Arc<Tab>, js: &str) -> Result<String, DriverError> {
    let result = tab
        .evaluate(js, true)
        .map_err(|e| DriverError::Other(format!("evaluate failed: {e}")))?;
    Ok(result
        .value
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default())
}

#[async_trait]
impl BrowserDriver for ChromeDriver {
    async fn navigate(&self, url: &str) -> Result<String, DriverError> {
        let url = url.to_string();
        self.with_tab(move |tab| {
            tab.navigate_to(&url)
                .map_err(|e| DriverError::Other(format!("Navigate failed: {e}")))?;
            tab.wait_until_navigated()
                .map_err(|e| DriverError::Other(format!("Page load failed: {e}")))?;
            tab.get_title()
                .map_err(|e| DriverError::Other(format!("Get title failed: {e}")))
        })
        .await
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        self.with_tab(|tab| Ok(tab.get_url())).await
    }

    async fn click(&self, target: &Target, force: bool) -> Result<(), DriverError> {
        let locate = locate_js(target);
        let described = target.describe();
        self.with_tab(move |tab| {
            let js = format!(
                r#"(function() {{
                    const el = {locate};
                    if (!el) return 'not_found';
                    el.scrollIntoView({{ behavior: 'instant', block: 'center' }});
                    if (!{force}) {{
                        const r = el.getBoundingClientRect();
                        const top = document.elementFromPoint(r.left + r.width / 2, r.top + r.height / 2);
                        if (top && top !== el && !el.contains(top)) return 'obscured';
                    }}
                    el.click();
                    return 'ok';
                }})()"#
            );
            match eval_string(tab, &js)?.as_str() {
                "ok" => Ok(()),
                "not_found" => Err(DriverError::NotFound(described)),
                "obscured" => Err(DriverError::Obscured(described)),
                other => Err(DriverError::Other(format!("click returned {other}"))),
            }
        })
        .await
    }

    async fn fill(&self, target: &Target, value: &str) -> Result<(), DriverError> {
        let locate = locate_js(target);
        let described = target.describe();
        let value = js_str(value);
        self.with_tab(move |tab| {
            let js = format!(
                r#"(function() {{
                    const el = {locate};
                    if (!el) return 'not_found';
                    el.scrollIntoView({{ behavior: 'instant', block: 'center' }});
                    el.focus();
                    if (el.tagName === 'INPUT' || el.tagName === 'TEXTAREA') {{
                        el.value = {value};
                    }} else {{
                        el.textContent = {value};
                    }}
                    el.dispatchEvent(new Event('input', {{ bubbles: true }}));
                    el.dispatchEvent(new Event('change', {{ bubbles: true }}));
                    return 'ok';
                }})()"#
            );
            match eval_string(tab, &js)?.as_str() {
                "ok" => Ok(()),
                "not_found" => Err(DriverError::NotFound(described)),
                other => Err(DriverError::Other(format!("fill returned {other}"))),
            }
        })
        .await
    }

    async fn click_at(&self, x: f64, y: f64) -> Result<(), DriverError> {
        self.with_tab(move |tab| {
            let js = format!(
                r#"(function() {{
                    const el = document.elementFromPoint({x}, {y});
                    if (!el) return 'not_found';
                    for (const type of ['mousedown', 'mouseup', 'click']) {{
                        el.dispatchEvent(new MouseEvent(type, {{ bubbles: true, clientX: {x}, clientY: {y} }}));
                    }}
                    return 'ok';
                }})()"#
            );
            match eval_string(tab, &js)?.as_str() {
                "ok" => Ok(()),
                _ => Err(DriverError::NotFound(format!("nothing at ({x}, {y})"))),
            }
        })
        .await
    }

    async fn press_key(&self, key: &str) -> Result<(), DriverError> {
        let key = key.to_string();
        self.with_tab(move |tab| {
            tab.press_key(&key)
                .map(|_| ())
                .map_err(|e| DriverError::Other(format!("press {key}: {e}")))
        })
        .await
    }

    async fn wait_for(&self, target: &Target, timeout: Duration) -> Result<(), DriverError> {
        let described = target.describe();
        match target {
            Target::Selector(sel) => {
                let sel = sel.clone();
                self.with_tab(move |tab| {
                    tab.wait_for_element_with_custom_timeout(&sel, timeout)
                        .map(|_| ())
                        .map_err(|_| DriverError::NotFound(described))
                })
                .await
            }
            Target::Text(_) => {
                let js = format!("({}) ? 'ok' : 'no'", locate_js(target));
                let deadline = tokio::time::Instant::now() + timeout;
                loop {
                    let js = js.clone();
                    let found = self.with_tab(move |tab| eval_string(tab, &js)).await?;
                    if found == "ok" {
                        return Ok(());
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(DriverError::NotFound(described));
                    }
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            }
        }
    }

    async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>, DriverError> {
        self.with_tab(move |tab| {
            let clip = if full_page {
                let dims = tab
                    .evaluate(
                        "JSON.stringify([document.documentElement.scrollWidth, document.documentElement.scrollHeight])",
                        false,
                    )
                    .ok()
                    .and_then(|r| r.value)
                    .and_then(|v| v.as_str().and_then(|s| serde_json::from_str::<Vec<f64>>(s).ok()));
                dims.filter(|d| d.len() == 2).map(|d| Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: d[0],
                    height: d[1],
                    scale: 1.0,
                })
            } else {
                None
            };
            tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, clip, true)
                .map_err(|e| DriverError::Other(format!("screenshot failed: {e}")))
        })
        .await
    }

    async fn device_pixel_ratio(&self) -> Result<f64, DriverError> {
        self.with_tab(|tab| {
            tab.evaluate("window.devicePixelRatio", false)
                .map_err(|e| DriverError::Other(format!("evaluate failed: {e}")))?
                .value
                .and_then(|v| v.as_f64())
                .ok_or_else(|| DriverError::Other("devicePixelRatio unavailable".into()))
        })
        .await
    }

    async fn content_html(&self) -> Result<String, DriverError> {
        self.with_tab(|tab| {
            tab.get_content()
                .map_err(|e| DriverError::Other(format!("Get content failed: {e}")))
        })
        .await
    }
}
