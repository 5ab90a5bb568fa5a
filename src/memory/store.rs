//! 持久化记忆：任务结果与用户偏好（SQLite）
//!
//! 读路径给 Planner 提供上下文（最近任务、相似任务、偏好），写路径只由写队列的消费者调用。
//! 相似任务按分词后的 Jaccard 相似度排序。

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::memory::tokenizer::{jaccard_similarity, tokenize_to_set, truncate_chars};

/// 相似任务的最低相似度
const SIMILARITY_FLOOR: f32 = 0.2;
/// 相似度检索扫描的最近任务数
const SIMILARITY_SCAN: usize = 200;

/// 一次已完成指令的记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub instruction: String,
    pub success: bool,
    pub message: String,
    /// 按执行顺序的步骤类型
    pub step_types: Vec<String>,
    pub duration: f64,
    pub created_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(instruction: impl Into<String>, success: bool, message: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            success,
            message: message.into(),
            step_types: Vec::new(),
            duration: 0.0,
            created_at: Utc::now(),
        }
    }

    pub fn with_steps(mut self, step_types: Vec<String>, duration: f64) -> Self {
        self.step_types = step_types;
        self.duration = duration;
        self
    }

    fn summary_line(&self) -> String {
        let status = if self.success { "ok" } else { "failed" };
        let steps = if self.step_types.is_empty() {
            String::new()
        } else {
            format!(" [steps: {}]", self.step_types.join(" -> "))
        };
        format!(
            "- ({status}) {}{steps}: {}",
            truncate_chars(&self.instruction, 120),
            truncate_chars(&self.message, 120)
        )
    }
}

/// 规划前注入的记忆上下文
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryContext {
    pub similar_tasks: Vec<TaskRecord>,
    pub recent_tasks: Vec<TaskRecord>,
    pub preferences: BTreeMap<String, String>,
}

impl MemoryContext {
    pub fn is_empty(&self) -> bool {
        self.similar_tasks.is_empty() && self.recent_tasks.is_empty() && self.preferences.is_empty()
    }

    /// 拼成 prompt 段落，总长不超过 max_chars；空上下文返回空串
    pub fn to_prompt_section(&self, max_chars: usize) -> String {
        if self.is_empty() {
            return String::new();
        }
        let mut out = String::from("## Memory\n");
        if !self.preferences.is_empty() {
            out.push_str("User preferences:\n");
            for (k, v) in &self.preferences {
                out.push_str(&format!("- {k}: {v}\n"));
            }
        }
        if !self.similar_tasks.is_empty() {
            out.push_str("Similar past tasks:\n");
            for t in &self.similar_tasks {
                out.push_str(&t.summary_line());
                out.push('\n');
            }
        }
        if !self.recent_tasks.is_empty() {
            out.push_str("Recent tasks:\n");
            for t in &self.recent_tasks {
                out.push_str(&t.summary_line());
                out.push('\n');
            }
        }
        truncate_chars(&out, max_chars)
    }
}

/// 记忆存储。方法是阻塞的，调用方放在 spawn_blocking 中
pub trait MemoryStore: Send + Sync {
    fn context_for(
        &self,
        instruction: &str,
        recent_limit: usize,
        similar_limit: usize,
    ) -> Result<MemoryContext, AgentError>;

    fn record_task(&self, record: &TaskRecord) -> Result<(), AgentError>;

    fn set_preference(&self, key: &str, value: &str) -> Result<(), AgentError>;
}

fn db_err(e: rusqlite::Error) -> AgentError {
    AgentError::Memory(e.to_string())
}

/// SQLite 实现
pub struct SqliteMemoryStore {
    conn: Mutex<Connection>,
}

impl SqliteMemoryStore {
    pub fn open(path: &Path) -> Result<Self, AgentError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, AgentError> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> Result<Self, AgentError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instruction TEXT NOT NULL,
                success INTEGER NOT NULL,
                message TEXT NOT NULL,
                step_types TEXT NOT NULL,
                duration REAL NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks(created_at DESC);
            CREATE TABLE IF NOT EXISTS preferences (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )
        .map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, AgentError> {
        self.conn
            .lock()
            .map_err(|e| AgentError::Memory(format!("connection poisoned: {e}")))
    }

    fn load_tasks(conn: &Connection, limit: usize) -> Result<Vec<TaskRecord>, AgentError> {
        let mut stmt = conn
            .prepare(
                "SELECT instruction, success, message, step_types, duration, created_at
                 FROM tasks ORDER BY id DESC LIMIT ?1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let steps: String = row.get(3)?;
                Ok(TaskRecord {
                    instruction: row.get(0)?,
                    success: row.get::<_, i64>(1)? != 0,
                    message: row.get(2)?,
                    step_types: serde_json::from_str(&steps).unwrap_or_default(),
                    duration: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }
}

impl MemoryStore for SqliteMemoryStore {
    fn context_for(
        &self,
        instruction: &str,
        recent_limit: usize,
        similar_limit: usize,
    ) -> Result<MemoryContext, AgentError> {
        let conn = self.lock()?;
        let scanned = Self::load_tasks(&conn, SIMILARITY_SCAN.max(recent_limit))?;

        let query = tokenize_to_set(instruction);
        let mut scored: Vec<(f32, &TaskRecord)> = scanned
            .iter()
            .map(|t| (jaccard_similarity(&query, &tokenize_to_set(&t.instruction)), t))
            .filter(|(s, _)| *s >= SIMILARITY_FLOOR)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        let similar_tasks: Vec<TaskRecord> = scored
            .into_iter()
            .take(similar_limit)
            .map(|(_, t)| t.clone())
            .collect();

        let recent_tasks = scanned
            .iter()
            .filter(|t| !similar_tasks.contains(t))
            .take(recent_limit)
            .cloned()
            .collect();

        let mut stmt = conn
            .prepare("SELECT key, value FROM preferences ORDER BY key")
            .map_err(db_err)?;
        let preferences = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(db_err)?
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map_err(db_err)?;

        Ok(MemoryContext {
            similar_tasks,
            recent_tasks,
            preferences,
        })
    }

    fn record_task(&self, record: &TaskRecord) -> Result<(), AgentError> {
        let steps = serde_json::to_string(&record.step_types)
            .map_err(|e| AgentError::Memory(e.to_string()))?;
        self.lock()?
            .execute(
                "INSERT INTO tasks (instruction, success, message, step_types, duration, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.instruction,
                    record.success as i64,
                    record.message,
                    steps,
                    record.duration,
                    record.created_at
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn set_preference(&self, key: &str, value: &str) -> Result<(), AgentError> {
        self.lock()?
            .execute(
                "INSERT INTO preferences (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, Utc::now()],
            )
            .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> SqliteMemoryStore {
        let store = SqliteMemoryStore::open_in_memory().unwrap();
        store
            .record_task(
                &TaskRecord::new("download the quarterly sales report", true, "saved report.pdf")
                    .with_steps(vec!["browser_navigate".into(), "browser_click".into()], 4.2),
            )
            .unwrap();
        store
            .record_task(&TaskRecord::new("set volume to 30", true, "Volume set to 30%"))
            .unwrap();
        store
    }

    #[test]
    fn test_task_record_json_timestamp() {
        let record = TaskRecord::new("open calculator", true, "Opened");
        let v = serde_json::to_value(&record).unwrap();
        assert!(v["created_at"].as_str().is_some_and(|t| t.contains('T')));
        let back: TaskRecord = serde_json::from_value(v).unwrap();
        assert_eq!(back.created_at, record.created_at);
    }

    #[test]
    fn test_similar_and_recent_split() {
        let store = seeded();
        let ctx = store.context_for("download the sales report for march", 5, 3).unwrap();
        assert_eq!(ctx.similar_tasks.len(), 1);
        assert_eq!(
            ctx.similar_tasks[0].step_types,
            vec!["browser_navigate".to_string(), "browser_click".to_string()]
        );
        assert_eq!(ctx.recent_tasks.len(), 1);
        assert_eq!(ctx.recent_tasks[0].instruction, "set volume to 30");
    }

    #[test]
    fn test_preferences_upsert() {
        let store = SqliteMemoryStore::open_in_memory().unwrap();
        store.set_preference("browser", "firefox").unwrap();
        store.set_preference("browser", "chrome").unwrap();
        let ctx = store.context_for("anything", 5, 3).unwrap();
        assert_eq!(ctx.preferences.get("browser").map(String::as_str), Some("chrome"));
    }

    #[test]
    fn test_prompt_section_truncated() {
        let store = seeded();
        let ctx = store.context_for("download the sales report", 5, 3).unwrap();
        let full = ctx.to_prompt_section(10_000);
        assert!(full.contains("Similar past tasks"));
        assert!(full.contains("browser_navigate -> browser_click"));
        let short = ctx.to_prompt_section(40);
        assert!(short.chars().count() <= 40);
        assert!(MemoryContext::default().to_prompt_section(100).is_empty());
    }

    #[test]
    fn test_reopen_file_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");
        SqliteMemoryStore::open(&path)
            .unwrap()
            .record_task(&TaskRecord::new("open calculator", true, "Opened Calculator"))
            .unwrap();
        let ctx = SqliteMemoryStore::open(&path)
            .unwrap()
            .context_for("open calculator", 5, 3)
            .unwrap();
        assert_eq!(ctx.similar_tasks.len(), 1);
    }
}
