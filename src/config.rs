//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DESKPILOT__*` 覆盖（双下划线表示嵌套，如 `DESKPILOT__LLM__MODEL=gpt-4o`）。
//! 所有字段都有默认值，没有任何配置文件也能启动。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub embedding: EmbeddingSection,
    pub intent: IntentSection,
    pub executor: ExecutorSection,
    pub tools: ToolsSection,
    pub memory: MemorySection,
}

/// [app] 段：数据目录与沙箱根
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    /// 沙箱根目录，未设置时用 ~/.deskpilot/sandbox
    pub sandbox_root: Option<PathBuf>,
    /// 数据目录（记忆库、锁文件、浏览器配置），未设置时用 ~/.deskpilot
    pub data_dir: Option<PathBuf>,
}

impl AppSection {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".deskpilot")
        })
    }

    pub fn sandbox_root(&self) -> PathBuf {
        self.sandbox_root
            .clone()
            .unwrap_or_else(|| self.data_dir().join("sandbox"))
    }
}

/// [llm] 段：后端选择、超时与调用池
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / deepseek / mock；无 API Key 时回退 mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 模型是否支持图片输入（反思时附带截图）
    #[serde(default)]
    pub vision: bool,
    /// 单次请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// 调用池并发上限
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// 等待调用池许可的上限（毫秒），超过则降级为直接调用
    #[serde(default = "default_pool_acquire_timeout_ms")]
    pub pool_acquire_timeout_ms: u64,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_pool_size() -> usize {
    3
}

fn default_pool_acquire_timeout_ms() -> u64 {
    2000
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            vision: false,
            request_timeout_secs: default_request_timeout(),
            pool_size: default_pool_size(),
            pool_acquire_timeout_ms: default_pool_acquire_timeout_ms(),
        }
    }
}

/// [embedding] 段：嵌入后端与就绪等待
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingSection {
    /// openai / local；local 为离线哈希嵌入
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 意图路由前等待嵌入就绪的上限（秒）
    #[serde(default = "default_embedding_ready_timeout")]
    pub ready_timeout_secs: u64,
}

fn default_embedding_provider() -> String {
    "local".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_ready_timeout() -> u64 {
    3
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            base_url: None,
            ready_timeout_secs: default_embedding_ready_timeout(),
        }
    }
}

/// [intent] 段：意图快速通道
#[derive(Debug, Clone, Deserialize)]
pub struct IntentSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 按意图名覆盖阈值，如 `app_close = 0.9`
    #[serde(default)]
    pub thresholds: HashMap<String, f32>,
    /// 生命周期意图遇到文件特征时扣减的分数
    #[serde(default = "default_conflict_penalty")]
    pub conflict_penalty: f32,
}

fn default_true() -> bool {
    true
}

fn default_conflict_penalty() -> f32 {
    0.15
}

impl Default for IntentSection {
    fn default() -> Self {
        Self {
            enabled: true,
            thresholds: HashMap::new(),
            conflict_penalty: default_conflict_penalty(),
        }
    }
}

/// [executor] 段：重试预算、超时、确认等待
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSection {
    /// 普通步骤的重试次数（不含首次执行）
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 只读 / 简单步骤的重试次数
    #[serde(default = "default_simple_step_retries")]
    pub simple_step_retries: u32,
    /// 单步执行超时（秒）
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,
    /// 敏感步骤等待确认的上限（秒）
    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout_secs: u64,
    /// 计划校验失败时最多重新生成几次
    #[serde(default = "default_max_plan_attempts")]
    pub max_plan_attempts: u32,
}

fn default_max_retries() -> u32 {
    3
}

fn default_simple_step_retries() -> u32 {
    1
}

fn default_step_timeout() -> u64 {
    120
}

fn default_confirmation_timeout() -> u64 {
    30
}

fn default_max_plan_attempts() -> u32 {
    3
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            simple_step_retries: default_simple_step_retries(),
            step_timeout_secs: default_step_timeout(),
            confirmation_timeout_secs: default_confirmation_timeout(),
            max_plan_attempts: default_max_plan_attempts(),
        }
    }
}

/// [tools] 段：脚本与浏览器
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 生成脚本的硬超时（秒）
    #[serde(default = "default_script_timeout")]
    pub script_timeout_secs: u64,
    #[serde(default = "default_python_bin")]
    pub python_bin: String,
    /// 缺少模块时是否尝试 pip install 一次
    #[serde(default)]
    pub auto_install_packages: bool,
    #[serde(default)]
    pub browser: BrowserSection,
}

fn default_script_timeout() -> u64 {
    30
}

fn default_python_bin() -> String {
    "python3".to_string()
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            script_timeout_secs: default_script_timeout(),
            python_bin: default_python_bin(),
            auto_install_packages: false,
            browser: BrowserSection::default(),
        }
    }
}

/// [tools.browser] 段：会话持久化目录与无头模式
#[derive(Debug, Clone, Deserialize)]
pub struct BrowserSection {
    /// Cookie / 登录态保存目录，未设置时用 <data_dir>/browser
    pub user_data_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub headless: bool,
}

impl Default for BrowserSection {
    fn default() -> Self {
        Self {
            user_data_dir: None,
            headless: true,
        }
    }
}

/// [memory] 段：记忆库与写入锁
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// SQLite 文件，未设置时用 <data_dir>/memory.db
    pub db_path: Option<PathBuf>,
    /// 跨进程写锁，未设置时用 <data_dir>/.memory_lock
    pub lock_path: Option<PathBuf>,
    /// 注入规划提示词的记忆上下文最大字符数
    #[serde(default = "default_context_max_chars")]
    pub context_max_chars: usize,
    /// 读取记忆上下文的超时（秒）
    #[serde(default = "default_memory_ready_timeout")]
    pub ready_timeout_secs: u64,
    #[serde(default = "default_recent_limit")]
    pub recent_limit: usize,
    #[serde(default = "default_similar_limit")]
    pub similar_limit: usize,
}

fn default_context_max_chars() -> usize {
    1000
}

fn default_memory_ready_timeout() -> u64 {
    2
}

fn default_recent_limit() -> usize {
    5
}

fn default_similar_limit() -> usize {
    3
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: None,
            lock_path: None,
            context_max_chars: default_context_max_chars(),
            ready_timeout_secs: default_memory_ready_timeout(),
            recent_limit: default_recent_limit(),
            similar_limit: default_similar_limit(),
        }
    }
}

impl AppConfig {
    pub fn memory_db_path(&self) -> PathBuf {
        self.memory
            .db_path
            .clone()
            .unwrap_or_else(|| self.app.data_dir().join("memory.db"))
    }

    pub fn memory_lock_path(&self) -> PathBuf {
        self.memory
            .lock_path
            .clone()
            .unwrap_or_else(|| self.app.data_dir().join(".memory_lock"))
    }

    pub fn browser_data_dir(&self) -> PathBuf {
        self.tools
            .browser
            .user_data_dir
            .clone()
            .unwrap_or_else(|| self.app.data_dir().join("browser"))
    }
}

/// 从 config 目录加载配置，环境变量 DESKPILOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 DESKPILOT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DESKPILOT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
