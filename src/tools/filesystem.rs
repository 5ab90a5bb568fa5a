//! 路径约束与文件执行器
//!
//! PathGuard 把任意输入路径解析为绝对路径（`~` 展开、相对路径落到沙箱根、`..` 词法归约、
//! 已存在的最深祖先做 canonicalize 以穿透符号链接），只放行沙箱根或用户主目录下的路径，
//! 主目录中的凭据目录（.ssh / .aws / .gnupg）除外。
//! FileExecutor 基于 PathGuard 提供 读 / 写 / 删 / 移动 / 复制 / 列目录 / 建目录。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::json;

use crate::core::{AgentError, RunContext, Step, StepResult};
use crate::tools::StepExecutor;

/// 主目录下禁止访问的子目录
const FORBIDDEN_HOME_DIRS: &[&str] = &[".ssh", ".aws", ".gnupg", ".kube", ".docker"];

/// 路径约束：沙箱根 + 主目录白名单
#[derive(Debug, Clone)]
pub struct PathGuard {
    sandbox_root: PathBuf,
    home: Option<PathBuf>,
}

fn canonical_or_self(p: &Path) -> PathBuf {
    p.canonicalize().unwrap_or_else(|_| p.to_path_buf())
}

/// 词法归约：去掉 `.`，`..` 回退一级（不越过根）
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// 对最深的已存在祖先 canonicalize，再拼回不存在的剩余部分（目标文件可能尚未创建）
fn canonicalize_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut rest: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                rest.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => break,
        }
    }
    let mut out = canonical_or_self(&existing);
    for name in rest.into_iter().rev() {
        out.push(name);
    }
    out
}

impl PathGuard {
    pub fn new(sandbox_root: impl AsRef<Path>, home: Option<PathBuf>) -> Self {
        Self {
            sandbox_root: canonical_or_self(sandbox_root.as_ref()),
            home: home.map(|h| canonical_or_self(&h)),
        }
    }

    pub fn sandbox_root(&self) -> &Path {
        &self.sandbox_root
    }

    /// 沙箱根或主目录本身（整体删除这两者一律拒绝）
    pub fn is_protected_root(&self, resolved: &Path) -> bool {
        resolved == self.sandbox_root || self.home.as_deref() == Some(resolved)
    }

    /// 解析并校验路径；不在白名单内返回 PathEscape
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, AgentError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(AgentError::Execution("Empty path".to_string()));
        }
        let expanded = if raw == "~" {
            self.home.clone().ok_or_else(|| AgentError::PathEscape(raw.to_string()))?
        } else if let Some(rest) = raw.strip_prefix("~/") {
            self.home
                .as_ref()
                .map(|h| h.join(rest))
                .ok_or_else(|| AgentError::PathEscape(raw.to_string()))?
        } else {
            let p = PathBuf::from(raw);
            if p.is_absolute() {
                p
            } else {
                self.sandbox_root.join(p)
            }
        };
        let resolved = canonicalize_existing_prefix(&normalize_lexically(&expanded));
        if self.is_allowed(&resolved) {
            Ok(resolved)
        } else {
            Err(AgentError::PathEscape(raw.to_string()))
        }
    }

    /// 已解析的绝对路径是否允许访问
    pub fn is_allowed(&self, resolved: &Path) -> bool {
        if resolved.starts_with(&self.sandbox_root) {
            return true;
        }
        match &self.home {
            Some(home) if resolved.starts_with(home) && resolved != Path::new("/") => {
                let rel = resolved.strip_prefix(home).unwrap_or(resolved);
                let first = rel
                    .components()
                    .next()
                    .map(|c| c.as_os_str().to_string_lossy().to_string());
                !matches!(first, Some(ref d) if FORBIDDEN_HOME_DIRS.contains(&d.as_str()))
            }
            _ => false,
        }
    }
}

/// 文件执行器
pub struct FileExecutor {
    guard: PathGuard,
}

impl FileExecutor {
    pub fn new(guard: PathGuard) -> Self {
        Self { guard }
    }

    fn path_param(&self, step: &Step, keys: &[&str]) -> Result<PathBuf, AgentError> {
        let raw = keys
            .iter()
            .find_map(|k| step.param_str(k))
            .ok_or_else(|| AgentError::Execution(format!("Missing parameter: {}", keys[0])))?;
        self.guard.resolve(raw)
    }

    async fn list(&self, path: &Path) -> Result<StepResult, AgentError> {
        let mut entries = Vec::new();
        let mut rd = tokio::fs::read_dir(path).await?;
        while let Some(e) = rd.next_entry().await? {
            let name = e.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let is_dir = e.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            entries.push(json!({
                "name": name,
                "path": e.path().to_string_lossy(),
                "is_dir": is_dir,
            }));
        }
        entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        let count = entries.len();
        Ok(StepResult::ok_with_data(
            format!("Listed {} entries in {}", count, path.display()),
            json!({ "path": path.to_string_lossy(), "files": entries, "count": count }),
        ))
    }
}

#[async_trait]
impl StepExecutor for FileExecutor {
    fn name(&self) -> &str {
        "file_manager"
    }

    fn step_types(&self) -> &[&'static str] {
        &[
            "file_read",
            "file_write",
            "file_create",
            "file_delete",
            "file_move",
            "file_copy",
            "file_list",
            "create_folder",
        ]
    }

    async fn execute_step(&self, step: &Step, _ctx: &RunContext) -> Result<StepResult, AgentError> {
        match step.step_type.as_str() {
            "file_read" => {
                let path = self.path_param(step, &["path", "file_path"])?;
                let content = tokio::fs::read_to_string(&path).await?;
                Ok(StepResult::ok_with_data(
                    format!("Read {} ({} chars)", path.display(), content.chars().count()),
                    json!({ "path": path.to_string_lossy(), "content": content }),
                ))
            }
            "file_write" | "file_create" => {
                let path = self.path_param(step, &["path", "file_path"])?;
                let content = step.param_str("content").unwrap_or_default();
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, content).await?;
                Ok(StepResult::ok_with_data(
                    format!("Wrote {}", path.display()),
                    json!({ "path": path.to_string_lossy(), "bytes": content.len() }),
                ))
            }
            "file_delete" => {
                let path = self.path_param(step, &["path", "file_path"])?;
                if self.guard.is_protected_root(&path) {
                    return Err(AgentError::PathEscape(format!(
                        "refusing to delete {} (sandbox or home root)",
                        path.display()
                    )));
                }
                let meta = tokio::fs::metadata(&path).await?;
                if meta.is_dir() {
                    let recursive = step.params.get("recursive").and_then(|v| v.as_bool()).unwrap_or(false);
                    if recursive {
                        tokio::fs::remove_dir_all(&path).await?;
                    } else {
                        tokio::fs::remove_dir(&path).await?;
                    }
                } else {
                    tokio::fs::remove_file(&path).await?;
                }
                Ok(StepResult::ok_with_data(
                    format!("Deleted {}", path.display()),
                    json!({ "path": path.to_string_lossy() }),
                ))
            }
            "file_move" | "file_copy" => {
                let src = self.path_param(step, &["source", "from", "path"])?;
                let dst = self.path_param(step, &["destination", "to", "target"])?;
                if let Some(parent) = dst.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                if step.step_type == "file_move" {
                    tokio::fs::rename(&src, &dst).await?;
                } else {
                    tokio::fs::copy(&src, &dst).await?;
                }
                Ok(StepResult::ok_with_data(
                    format!("{} {} -> {}", step.step_type, src.display(), dst.display()),
                    json!({ "source": src.to_string_lossy(), "destination": dst.to_string_lossy() }),
                ))
            }
            "file_list" => {
                let path = match step.param_str("path") {
                    Some(p) => self.guard.resolve(p)?,
                    None => self.guard.sandbox_root().to_path_buf(),
                };
                self.list(&path).await
            }
            "create_folder" => {
                let path = self.path_param(step, &["path", "folder"])?;
                tokio::fs::create_dir_all(&path).await?;
                Ok(StepResult::ok_with_data(
                    format!("Created {}", path.display()),
                    json!({ "path": path.to_string_lossy() }),
                ))
            }
            other => Err(AgentError::Execution(format!("Unsupported file step: {other}"))),
        }
    }
}
