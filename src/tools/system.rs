//! 系统控制执行器：打开 / 关闭应用、音量、亮度、系统信息、桌面截图、打开文件或目录
//!
//! 具体 OS 命令藏在 SystemControl 后面（CommandSystemControl 按平台调用 open / osascript / xdg-open …）。
//! 期望应用名的操作先过类型混淆检查：参数像文件路径（含路径分隔符或常见文件扩展名）一律拒绝，
//! 不依赖上游路由是否已经拦截。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::core::{AgentError, RunContext, Step, StepResult};
use crate::tools::filesystem::PathGuard;
use crate::tools::StepExecutor;

/// 出现在应用名里即视为文件的扩展名
const FILE_EXTENSIONS: &[&str] = &[
    "txt", "md", "pdf", "doc", "docx", "xls", "xlsx", "csv", "ppt", "pptx", "json", "xml", "yaml",
    "yml", "png", "jpg", "jpeg", "gif", "svg", "mp3", "mp4", "mov", "zip", "tar", "gz", "py", "rs",
    "js", "html", "log",
];

/// 看起来像文件路径而不是应用名
pub fn looks_like_path(arg: &str) -> bool {
    let arg = arg.trim();
    if arg.contains('/') || arg.contains('\\') || arg.starts_with('~') {
        return true;
    }
    match arg.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            FILE_EXTENSIONS.contains(&ext.to_lowercase().as_str())
        }
        _ => false,
    }
}

/// 平台相关的系统操作
#[async_trait]
pub trait SystemControl: Send + Sync {
    async fn open_app(&self, name: &str) -> Result<(), AgentError>;
    async fn close_app(&self, name: &str) -> Result<(), AgentError>;
    async fn set_volume(&self, level: u8) -> Result<(), AgentError>;
    async fn set_brightness(&self, level: u8) -> Result<(), AgentError>;
    async fn system_info(&self) -> Result<Value, AgentError>;
    async fn screenshot(&self, path: &Path) -> Result<(), AgentError>;
    async fn open_path(&self, path: &Path) -> Result<(), AgentError>;
}

/// 通过外部命令实现的系统操作（macOS / Linux）
#[derive(Debug, Default)]
pub struct CommandSystemControl;

async fn run_command(program: &str, args: &[&str]) -> Result<String, AgentError> {
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                AgentError::Config(format!("'{program}' is not installed"))
            }
            _ => AgentError::Execution(format!("{program}: {e}")),
        })?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(AgentError::Execution(format!(
            "{} {:?} failed: {}",
            program,
            args,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

#[async_trait]
impl SystemControl for CommandSystemControl {
    async fn open_app(&self, name: &str) -> Result<(), AgentError> {
        if cfg!(target_os = "macos") {
            run_command("open", &["-a", name]).await.map(|_| ())
        } else {
            let bin = name.to_lowercase().replace(' ', "-");
            Command::new(&bin)
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .spawn()
                .map(|_| ())
                .map_err(|e| AgentError::Execution(format!("cannot launch {bin}: {e}")))
        }
    }

    async fn close_app(&self, name: &str) -> Result<(), AgentError> {
        if cfg!(target_os = "macos") {
            let script = format!("tell application \"{}\" to quit", name.replace('"', ""));
            run_command("osascript", &["-e", &script]).await.map(|_| ())
        } else {
            let bin = name.to_lowercase().replace(' ', "-");
            run_command("pkill", &["-x", &bin]).await.map(|_| ())
        }
    }

    async fn set_volume(&self, level: u8) -> Result<(), AgentError> {
        if cfg!(target_os = "macos") {
            let script = format!("set volume output volume {level}");
            run_command("osascript", &["-e", &script]).await.map(|_| ())
        } else {
            run_command("amixer", &["-q", "set", "Master", &format!("{level}%")])
                .await
                .map(|_| ())
        }
    }

    async fn set_brightness(&self, level: u8) -> Result<(), AgentError> {
        if cfg!(target_os = "macos") {
            let value = format!("{:.2}", level as f32 / 100.0);
            run_command("brightness", &[&value]).await.map(|_| ())
        } else {
            run_command("brightnessctl", &["-q", "set", &format!("{level}%")])
                .await
                .map(|_| ())
        }
    }

    async fn system_info(&self) -> Result<Value, AgentError> {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let hostname = run_command("hostname", &[]).await.unwrap_or_default();
        let uptime_secs = tokio::fs::read_to_string("/proc/uptime")
            .await
            .ok()
            .and_then(|s| s.split_whitespace().next().and_then(|v| v.parse::<f64>().ok()));
        Ok(json!({
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "family": std::env::consts::FAMILY,
            "cpus": cpus,
            "hostname": hostname,
            "uptime_secs": uptime_secs,
        }))
    }

    async fn screenshot(&self, path: &Path) -> Result<(), AgentError> {
        let p = path.to_string_lossy();
        if cfg!(target_os = "macos") {
            run_command("screencapture", &["-x", &p]).await.map(|_| ())
        } else {
            run_command("import", &["-window", "root", &p]).await.map(|_| ())
        }
    }

    async fn open_path(&self, path: &Path) -> Result<(), AgentError> {
        let p = path.to_string_lossy();
        let opener = if cfg!(target_os = "macos") { "open" } else { "xdg-open" };
        run_command(opener, &[&p]).await.map(|_| ())
    }
}

/// 系统控制执行器
pub struct SystemExecutor {
    control: Arc<dyn SystemControl>,
    guard: PathGuard,
}

impl SystemExecutor {
    pub fn new(control: Arc<dyn SystemControl>, guard: PathGuard) -> Self {
        Self { control, guard }
    }

    fn app_name(step: &Step) -> Result<String, AgentError> {
        let name = ["app_name", "name", "app", "application"]
            .iter()
            .find_map(|k| step.param_str(k))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AgentError::Execution("Missing parameter: app_name".into()))?;
        if looks_like_path(name) {
            return Err(AgentError::TypeConfusion(format!(
                "'{name}' looks like a file path, not an application name"
            )));
        }
        Ok(name.to_string())
    }

    /// 0-100；action 为 mute / max 时取端点
    fn level(step: &Step) -> Result<u8, AgentError> {
        match step.action.to_lowercase().as_str() {
            "mute" => return Ok(0),
            "max" | "maximum" => return Ok(100),
            _ => {}
        }
        let v = ["level", "volume", "brightness", "value"]
            .iter()
            .find_map(|k| step.param_f64(k))
            .ok_or_else(|| AgentError::Execution("Missing parameter: level".into()))?;
        Ok(v.clamp(0.0, 100.0).round() as u8)
    }

    fn screenshot_path(&self, step: &Step, ctx: &RunContext) -> Result<PathBuf, AgentError> {
        match step.param_str("path") {
            Some(p) => self.guard.resolve(p),
            None => {
                let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
                Ok(ctx.downloads_dir().join(format!("desktop_{ts}.png")))
            }
        }
    }
}

#[async_trait]
impl StepExecutor for SystemExecutor {
    fn name(&self) -> &str {
        "system"
    }

    fn is_blocking(&self) -> bool {
        true
    }

    fn step_types(&self) -> &[&'static str] {
        &[
            "open_app",
            "close_app",
            "set_volume",
            "set_brightness",
            "get_system_info",
            "screenshot_desktop",
            "open_folder",
            "open_file",
        ]
    }

    async fn execute_step(&self, step: &Step, ctx: &RunContext) -> Result<StepResult, AgentError> {
        match step.step_type.as_str() {
            "open_app" => {
                let name = Self::app_name(step)?;
                self.control.open_app(&name).await?;
                Ok(StepResult::ok_with_data(format!("Opened {name}"), json!({ "app_name": name })))
            }
            "close_app" => {
                let name = Self::app_name(step)?;
                self.control.close_app(&name).await?;
                Ok(StepResult::ok_with_data(format!("Closed {name}"), json!({ "app_name": name })))
            }
            "set_volume" => {
                let level = Self::level(step)?;
                self.control.set_volume(level).await?;
                Ok(StepResult::ok_with_data(format!("Volume set to {level}%"), json!({ "level": level })))
            }
            "set_brightness" => {
                let level = Self::level(step)?;
                self.control.set_brightness(level).await?;
                Ok(StepResult::ok_with_data(
                    format!("Brightness set to {level}%"),
                    json!({ "level": level }),
                ))
            }
            "get_system_info" => {
                let info = self.control.system_info().await?;
                Ok(StepResult::ok_with_data("System information collected", info))
            }
            "screenshot_desktop" => {
                let path = self.screenshot_path(step, ctx)?;
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                self.control.screenshot(&path).await?;
                let p = path.to_string_lossy().to_string();
                Ok(StepResult::ok_with_data(format!("Screenshot saved to {p}"), json!({ "path": p }))
                    .with_images(vec![p]))
            }
            "open_folder" | "open_file" => {
                let raw = step
                    .param_str("path")
                    .ok_or_else(|| AgentError::Execution("Missing parameter: path".into()))?;
                let path = self.guard.resolve(raw)?;
                self.control.open_path(&path).await?;
                Ok(StepResult::ok_with_data(
                    format!("Opened {}", path.display()),
                    json!({ "path": path.to_string_lossy() }),
                ))
            }
            other => Err(AgentError::Execution(format!("Unsupported system step: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SystemControl for Recorder {
        async fn open_app(&self, name: &str) -> Result<(), AgentError> {
            self.calls.lock().unwrap().push(format!("open:{name}"));
            Ok(())
        }
        async fn close_app(&self, name: &str) -> Result<(), AgentError> {
            self.calls.lock().unwrap().push(format!("close:{name}"));
            Ok(())
        }
        async fn set_volume(&self, level: u8) -> Result<(), AgentError> {
            self.calls.lock().unwrap().push(format!("volume:{level}"));
            Ok(())
        }
        async fn set_brightness(&self, level: u8) -> Result<(), AgentError> {
            self.calls.lock().unwrap().push(format!("brightness:{level}"));
            Ok(())
        }
        async fn system_info(&self) -> Result<Value, AgentError> {
            Ok(json!({"os": "test"}))
        }
        async fn screenshot(&self, path: &Path) -> Result<(), AgentError> {
            self.calls.lock().unwrap().push(format!("shot:{}", path.display()));
            Ok(())
        }
        async fn open_path(&self, path: &Path) -> Result<(), AgentError> {
            self.calls.lock().unwrap().push(format!("path:{}", path.display()));
            Ok(())
        }
    }

    fn executor(sandbox: &Path) -> (Arc<Recorder>, SystemExecutor) {
        let rec = Arc::new(Recorder::default());
        let exec = SystemExecutor::new(rec.clone(), PathGuard::new(sandbox, None));
        (rec, exec)
    }

    #[test]
    fn test_looks_like_path() {
        assert!(looks_like_path("report.pdf"));
        assert!(looks_like_path("~/Desktop/x"));
        assert!(looks_like_path("C:\\Users\\me"));
        assert!(!looks_like_path("Calculator"));
        assert!(!looks_like_path("Visual Studio Code"));
        assert!(!looks_like_path("Safari.app"));
    }

    #[tokio::test]
    async fn test_type_confusion_guard() {
        let dir = tempfile::tempdir().unwrap();
        let (rec, exec) = executor(dir.path());
        let step = Step::new("close_app", "close", "").with_param("app_name", "notes.txt");
        let err = exec.execute_step(&step, &RunContext::detached(dir.path())).await.unwrap_err();
        assert!(matches!(err, AgentError::TypeConfusion(_)));
        assert!(rec.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_app_and_volume() {
        let dir = tempfile::tempdir().unwrap();
        let (rec, exec) = executor(dir.path());
        let ctx = RunContext::detached(dir.path());
        let open = Step::new("open_app", "open", "").with_param("app_name", "Calculator");
        assert!(exec.execute_step(&open, &ctx).await.unwrap().success);
        let vol = Step::new("set_volume", "set", "").with_param("level", "135");
        exec.execute_step(&vol, &ctx).await.unwrap();
        let mute = Step::new("set_volume", "mute", "");
        exec.execute_step(&mute, &ctx).await.unwrap();
        assert_eq!(
            *rec.calls.lock().unwrap(),
            vec!["open:Calculator", "volume:100", "volume:0"]
        );
    }

    #[tokio::test]
    async fn test_screenshot_lands_in_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let (_rec, exec) = executor(dir.path());
        let ctx = RunContext::detached(dir.path());
        let r = exec
            .execute_step(&Step::new("screenshot_desktop", "capture", ""), &ctx)
            .await
            .unwrap();
        assert_eq!(r.images.len(), 1);
        assert!(r.images[0].contains("downloads"));
    }
}
