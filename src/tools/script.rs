//! 生成脚本执行器
//!
//! 执行顺序固定：先 SecurityAuditor 审计，通过后才交给 ScriptRunner。
//! PythonRunner 把脚本写入 `<sandbox>/scripts/`，在 `<sandbox>/outputs/<run_id>` 下以硬超时运行
//! （kill_on_drop，超时即强制终止），收集输出目录中新产生的文件作为产物。
//! 脚本最后一行 stdout 若为 JSON 对象，作为步骤的 data（供后续步骤 placeholder 引用）。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use tokio::process::Command;
use walkdir::WalkDir;

use crate::core::{AgentError, RunContext, Step, StepResult};
use crate::tools::security::SecurityAuditor;
use crate::tools::StepExecutor;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "svg", "webp"];

/// 单次脚本执行请求
#[derive(Debug, Clone)]
pub struct ScriptRequest {
    pub source: String,
    pub sandbox_root: PathBuf,
    pub output_dir: PathBuf,
    pub timeout: Duration,
}

/// 执行结果：标准输出、错误、退出码与产物
#[derive(Debug, Clone, Default)]
pub struct ScriptOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub artifacts: Vec<PathBuf>,
}

impl ScriptOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// 脚本执行协作方
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run(&self, request: &ScriptRequest) -> Result<ScriptOutput, AgentError>;

    /// 安装缺失的包；默认不支持
    async fn install_package(&self, package: &str) -> Result<(), AgentError> {
        Err(AgentError::Config(format!("package installation not supported: {package}")))
    }
}

/// 本机 python 解释器
pub struct PythonRunner {
    python_bin: String,
}

impl PythonRunner {
    pub fn new(python_bin: impl Into<String>) -> Self {
        Self {
            python_bin: python_bin.into(),
        }
    }
}

fn snapshot_files(dir: &Path) -> HashMap<PathBuf, Option<SystemTime>> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let modified = e.metadata().ok().and_then(|m| m.modified().ok());
            (e.into_path(), modified)
        })
        .collect()
}

/// 运行前后对比：新出现或被改写的文件即为产物
fn collect_artifacts(dir: &Path, before: &HashMap<PathBuf, Option<SystemTime>>) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = snapshot_files(dir)
        .into_iter()
        .filter(|(path, modified)| before.get(path) != Some(modified))
        .map(|(path, _)| path)
        .collect();
    files.sort();
    files
}

#[async_trait]
impl ScriptRunner for PythonRunner {
    async fn run(&self, request: &ScriptRequest) -> Result<ScriptOutput, AgentError> {
        let scripts_dir = request.sandbox_root.join("scripts");
        tokio::fs::create_dir_all(&scripts_dir).await?;
        tokio::fs::create_dir_all(&request.output_dir).await?;
        let script_path = scripts_dir.join(format!("script_{}.py", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&script_path, &request.source).await?;

        let before = snapshot_files(&request.output_dir);
        let child = Command::new(&self.python_bin)
            .arg(&script_path)
            .current_dir(&request.output_dir)
            .env("DESKPILOT_OUTPUT_DIR", &request.output_dir)
            .env("DESKPILOT_SANDBOX", &request.sandbox_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Config(format!("cannot start {}: {}", self.python_bin, e)))?;

        let output = tokio::time::timeout(request.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                AgentError::Timeout(format!(
                    "script exceeded {}s and was killed",
                    request.timeout.as_secs()
                ))
            })??;

        Ok(ScriptOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
            artifacts: collect_artifacts(&request.output_dir, &before),
        })
    }

    async fn install_package(&self, package: &str) -> Result<(), AgentError> {
        tracing::info!(package = %package, "installing missing python package");
        let output = tokio::time::timeout(
            Duration::from_secs(120),
            Command::new(&self.python_bin)
                .args(["-m", "pip", "install", "--quiet", package])
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| AgentError::Timeout(format!("pip install {package}")))??;
        if output.status.success() {
            Ok(())
        } else {
            Err(AgentError::Execution(format!(
                "pip install {} failed: {}",
                package,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

/// import 名与 pip 包名不一致的常见情况
fn package_for_module(module: &str) -> String {
    match module {
        "cv2" => "opencv-python",
        "PIL" => "pillow",
        "sklearn" => "scikit-learn",
        "yaml" => "pyyaml",
        "bs4" => "beautifulsoup4",
        "docx" => "python-docx",
        "pptx" => "python-pptx",
        "fitz" => "pymupdf",
        other => other,
    }
    .to_string()
}

/// 从 stderr 中提取缺失的模块名（只取顶层包）
pub fn missing_module(stderr: &str) -> Option<String> {
    let re = Regex::new(r"No module named '([A-Za-z0-9_\.]+)'").ok()?;
    re.captures(stderr)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().split('.').next().unwrap_or_default().to_string())
        .filter(|m| !m.is_empty())
}

/// 脚本执行器：审计 → 执行 → （可选）补装依赖后重跑一次
pub struct ScriptExecutor {
    auditor: SecurityAuditor,
    runner: Arc<dyn ScriptRunner>,
    timeout: Duration,
    auto_install: bool,
}

impl ScriptExecutor {
    pub fn new(auditor: SecurityAuditor, runner: Arc<dyn ScriptRunner>, timeout: Duration) -> Self {
        Self {
            auditor,
            runner,
            timeout,
            auto_install: false,
        }
    }

    pub fn with_auto_install(mut self, enabled: bool) -> Self {
        self.auto_install = enabled;
        self
    }

    fn to_result(output: &ScriptOutput, installed: Vec<String>) -> StepResult {
        let images: Vec<String> = output
            .artifacts
            .iter()
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .map(|p| p.to_string_lossy().to_string())
            .collect();
        let artifacts: Vec<String> = output
            .artifacts
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect();

        let reported = output
            .stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .and_then(|l| serde_json::from_str::<Value>(l.trim()).ok())
            .filter(|v| v.is_object());

        let mut data = json!({
            "stdout": output.stdout,
            "stderr": output.stderr,
            "exit_code": output.exit_code,
            "artifacts": artifacts,
        });
        let mut success = output.succeeded();
        let mut message = if success {
            "Script finished".to_string()
        } else {
            format!(
                "Script exited with {:?}: {}",
                output.exit_code,
                output.stderr.lines().last().unwrap_or("").trim()
            )
        };
        if let Some(Value::Object(obj)) = reported {
            if let Some(false) = obj.get("success").and_then(|v| v.as_bool()) {
                success = false;
            }
            if let Some(m) = obj.get("message").and_then(|v| v.as_str()) {
                message = m.to_string();
            }
            if let Value::Object(d) = &mut data {
                for (k, v) in obj {
                    d.entry(k).or_insert(v);
                }
            }
        }

        StepResult {
            success,
            message,
            data: Some(data),
            images,
            installed_dependencies: installed,
        }
    }
}

#[async_trait]
impl StepExecutor for ScriptExecutor {
    fn name(&self) -> &str {
        "script"
    }

    fn is_blocking(&self) -> bool {
        true
    }

    fn step_types(&self) -> &[&'static str] {
        &["python_script", "python", "code_interpreter"]
    }

    async fn execute_step(&self, step: &Step, ctx: &RunContext) -> Result<StepResult, AgentError> {
        let source = ["code", "script", "source"]
            .iter()
            .find_map(|k| step.param_str(k))
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| AgentError::Execution("Missing script source (params.code)".into()))?;

        let verdict = self.auditor.audit(source);
        if !verdict.is_safe {
            tracing::warn!(reason = %verdict.reason, "script rejected by security audit");
            return Err(AgentError::SecurityRejected(verdict.reason));
        }

        let request = ScriptRequest {
            source: source.to_string(),
            sandbox_root: ctx.sandbox_root.clone(),
            output_dir: ctx.output_dir(),
            timeout: self.timeout,
        };
        let mut output = self.runner.run(&request).await?;
        let mut installed = Vec::new();

        if !output.succeeded() && self.auto_install {
            if let Some(module) = missing_module(&output.stderr) {
                let package = package_for_module(&module);
                self.runner.install_package(&package).await?;
                installed.push(package);
                output = self.runner.run(&request).await?;
            }
        }

        Ok(Self::to_result(&output, installed))
    }
}
