//! 意图路由：规划之前的语义快速通道
//!
//! 每个意图有若干示例短语，首次使用时批量嵌入并缓存；识别时取各意图示例的最大余弦相似度，
//! 再取全局最优，与该意图自己的阈值比较（破坏性意图阈值更高）。
//! 应用生命周期意图遇到文件特征（扩展名、路径分隔符、file / 文件等）时扣减 conflict_penalty，
//! 避免“删除这个文件”被路由到“关闭应用”。只有白名单内的意图走快速通道，其余即使命中也交给 Planner。

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::IntentSection;
use crate::core::Step;
use crate::llm::{cosine_similarity, SharedEmbedder};

/// 一个意图的定义
#[derive(Debug, Clone)]
pub struct IntentDef {
    pub name: String,
    pub examples: Vec<String>,
    pub threshold: f32,
    /// 允许跳过规划直接执行
    pub fast_path: bool,
    /// 应用生命周期意图（打开 / 关闭应用），受文件特征惩罚
    pub lifecycle: bool,
}

impl IntentDef {
    pub fn new(name: &str, threshold: f32, examples: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            examples: examples.iter().map(|s| s.to_string()).collect(),
            threshold,
            fast_path: false,
            lifecycle: false,
        }
    }

    pub fn fast_path(mut self) -> Self {
        self.fast_path = true;
        self
    }

    pub fn lifecycle(mut self) -> Self {
        self.lifecycle = true;
        self
    }
}

/// 识别结果（不持久化，立即消费）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntentMatch {
    pub intent: String,
    pub confidence: f32,
    pub matched_example: String,
}

struct IntentEntry {
    def: IntentDef,
    /// 与 def.examples 对应的向量；None 表示尚未嵌入
    vectors: Vec<Option<Vec<f32>>>,
}

/// 内置意图库：文本类（不走快速通道）与系统控制类
pub fn builtin_intents() -> Vec<IntentDef> {
    vec![
        IntentDef::new(
            "translate",
            0.75,
            &["translate this into english", "translate the text to chinese", "翻译这段话", "把这句话翻译成英文"],
        ),
        IntentDef::new(
            "summarize",
            0.75,
            &["summarize this article", "give me a summary of the text", "总结一下这篇文章", "概括这段内容"],
        ),
        IntentDef::new(
            "polish",
            0.75,
            &["polish this paragraph", "improve the wording of this text", "润色这段文字", "帮我改写得更通顺"],
        ),
        IntentDef::new(
            "screenshot",
            0.65,
            &["take a screenshot", "capture the screen", "screenshot my desktop", "截屏", "截个图"],
        )
        .fast_path(),
        IntentDef::new(
            "volume_control",
            0.70,
            &["set the volume to 50", "turn the volume up", "mute the sound", "调大音量", "把音量调到50"],
        )
        .fast_path(),
        IntentDef::new(
            "brightness_control",
            0.70,
            &["set the brightness to 80", "make the screen brighter", "dim the display", "调高亮度", "把屏幕亮度调到50"],
        )
        .fast_path(),
        IntentDef::new(
            "system_info",
            0.60,
            &["show system information", "how much memory is free", "what is my cpu usage", "查看系统信息", "电脑配置是什么"],
        )
        .fast_path(),
        IntentDef::new(
            "app_open",
            0.70,
            &["open the calculator", "launch safari", "start the music app", "打开计算器", "启动微信"],
        )
        .fast_path()
        .lifecycle(),
        IntentDef::new(
            "app_close",
            0.85,
            &["close the calculator", "quit safari", "exit the music app", "关闭计算器", "退出微信"],
        )
        .fast_path()
        .lifecycle(),
    ]
}

fn file_indicator_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(\b[\w-]+\.(txt|md|pdf|docx?|xlsx?|csv|pptx?|json|xml|png|jpe?g|gif|zip|py|log)\b|[/\\]|~/|\b[a-z]:\\|\b(files?|folders?|director(y|ies))\b|文件|目录)",
        )
        .expect("file indicator regex")
    })
}

/// 文本是否带有文件系统特征
pub fn has_file_indicators(text: &str) -> bool {
    file_indicator_re().is_match(text)
}

fn app_verb_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(?:\b(?:open|launch|start|run|close|quit|exit|kill)\s+(?:up\s+)?|打开|启动|运行|关闭|关掉|退出)\s*(.+)$",
        )
        .expect("app verb regex")
    })
}

fn clause_split_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\s+(?:then|and)\s+|[,，;；。!！?？]|然后|并且|并").expect("clause regex")
    })
}

/// 从“打开 / 关闭 xxx”中提取应用名；冠词与结尾的 app / application 去掉，后续子句丢弃
pub fn extract_app_name(text: &str) -> Option<String> {
    let caps = app_verb_re().captures(text.trim())?;
    let rest = caps.get(1)?.as_str();
    let clause = clause_split_re().split(rest).next().unwrap_or(rest).trim();

    let mut words: Vec<&str> = clause.split_whitespace().collect();
    while let Some(first) = words.first() {
        if matches!(first.to_lowercase().as_str(), "the" | "a" | "an" | "my") {
            words.remove(0);
        } else {
            break;
        }
    }
    while let Some(last) = words.last() {
        if matches!(last.to_lowercase().as_str(), "app" | "application" | "program") {
            words.pop();
        } else {
            break;
        }
    }
    let mut name = words.join(" ");
    for suffix in ["应用程序", "应用", "程序", "软件"] {
        if let Some(stripped) = name.strip_suffix(suffix) {
            name = stripped.trim().to_string();
        }
    }
    let name = name
        .trim_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace())
        .to_string();
    (!name.is_empty()).then_some(name)
}

/// 音量 / 亮度目标：百分比，或 mute / max
pub fn extract_level(text: &str) -> Option<u8> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let lower = text.to_lowercase();
    if lower.contains("mute") || lower.contains("静音") {
        return Some(0);
    }
    if lower.contains("max") || lower.contains("最大") {
        return Some(100);
    }
    let re = RE.get_or_init(|| Regex::new(r"(\d{1,3})\s*%?").expect("level regex"));
    let n: u32 = re.captures(text)?.get(1)?.as_str().parse().ok()?;
    Some(n.min(100) as u8)
}

/// 快速通道意图对应的单个步骤；缺少必需参数时返回 None（交给 Planner）
pub fn fast_path_step(intent: &str, text: &str) -> Option<Step> {
    let step = match intent {
        "screenshot" => Step::new("screenshot_desktop", "capture", "Take a desktop screenshot"),
        "system_info" => Step::new("get_system_info", "read", "Collect system information"),
        "volume_control" => Step::new("set_volume", "set", "Adjust the output volume")
            .with_param("level", extract_level(text)?),
        "brightness_control" => Step::new("set_brightness", "set", "Adjust the display brightness")
            .with_param("level", extract_level(text)?),
        "app_open" => {
            let name = extract_app_name(text)?;
            Step::new("open_app", "open", format!("Open {name}")).with_param("app_name", name)
        }
        "app_close" => {
            let name = extract_app_name(text)?;
            Step::new("close_app", "close", format!("Close {name}")).with_param("app_name", name)
        }
        _ => return None,
    };
    Some(step)
}

/// 语义意图路由器
pub struct IntentRouter {
    embedder: SharedEmbedder,
    entries: RwLock<Vec<IntentEntry>>,
    conflict_penalty: f32,
}

impl IntentRouter {
    /// 内置意图库，按配置覆盖阈值
    pub fn new(embedder: SharedEmbedder, cfg: &IntentSection) -> Self {
        let defs = builtin_intents()
            .into_iter()
            .map(|mut d| {
                if let Some(t) = cfg.thresholds.get(&d.name) {
                    d.threshold = *t;
                }
                d
            })
            .collect();
        Self::with_intents(embedder, defs, cfg.conflict_penalty)
    }

    pub fn with_intents(embedder: SharedEmbedder, defs: Vec<IntentDef>, conflict_penalty: f32) -> Self {
        let entries = defs
            .into_iter()
            .map(|def| IntentEntry {
                vectors: vec![None; def.examples.len()],
                def,
            })
            .collect();
        Self {
            embedder,
            entries: RwLock::new(entries),
            conflict_penalty,
        }
    }

    pub fn embedder(&self) -> &SharedEmbedder {
        &self.embedder
    }

    pub async fn threshold(&self, intent: &str) -> Option<f32> {
        self.entries
            .read()
            .await
            .iter()
            .find(|e| e.def.name == intent)
            .map(|e| e.def.threshold)
    }

    pub async fn is_fast_path(&self, intent: &str) -> bool {
        self.entries
            .read()
            .await
            .iter()
            .any(|e| e.def.name == intent && e.def.fast_path)
    }

    /// 嵌入所有尚未嵌入的示例（首次使用与热添加后）
    async fn ensure_embedded(&self) -> Result<(), String> {
        let missing: Vec<(usize, usize, String)> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .enumerate()
                .flat_map(|(i, e)| {
                    e.vectors
                        .iter()
                        .enumerate()
                        .filter(|(_, v)| v.is_none())
                        .map(move |(j, _)| (i, j, e.def.examples[j].clone()))
                })
                .collect()
        };
        if missing.is_empty() {
            return Ok(());
        }
        let texts: Vec<String> = missing.iter().map(|(_, _, t)| t.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;
        if vectors.len() != texts.len() {
            return Err(format!("expected {} embeddings, got {}", texts.len(), vectors.len()));
        }
        let mut entries = self.entries.write().await;
        for ((i, j, text), v) in missing.into_iter().zip(vectors) {
            // 等待期间列表可能被热添加改动，按文本核对
            if let Some(slot) = entries
                .get_mut(i)
                .filter(|e| e.def.examples.get(j) == Some(&text))
                .and_then(|e| e.vectors.get_mut(j))
            {
                *slot = Some(v);
            }
        }
        tracing::debug!(count = texts.len(), "intent examples embedded");
        Ok(())
    }

    /// 给已有意图热添加示例短语，只嵌入新增部分；返回新增条数
    pub async fn add_examples(&self, intent: &str, examples: &[&str]) -> Result<usize, String> {
        let added = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .iter_mut()
                .find(|e| e.def.name == intent)
                .ok_or_else(|| format!("unknown intent: {intent}"))?;
            let mut added = 0;
            for ex in examples {
                let ex = ex.trim();
                if ex.is_empty() || entry.def.examples.iter().any(|e| e == ex) {
                    continue;
                }
                entry.def.examples.push(ex.to_string());
                entry.vectors.push(None);
                added += 1;
            }
            added
        };
        if added > 0 && self.embedder.is_ready() {
            self.ensure_embedded().await?;
        }
        Ok(added)
    }

    /// 识别意图；全局最优低于其阈值、嵌入未就绪或出错时返回 None
    pub async fn detect(&self, text: &str) -> Option<IntentMatch> {
        let text = text.trim();
        if text.is_empty() || !self.embedder.is_ready() {
            return None;
        }
        if let Err(e) = self.ensure_embedded().await {
            tracing::warn!(error = %e, "intent examples could not be embedded");
            return None;
        }
        let query = match self.embedder.embed(&[text.to_string()]).await {
            Ok(mut v) if !v.is_empty() => v.remove(0),
            Ok(_) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "instruction embedding failed");
                return None;
            }
        };

        let file_like = has_file_indicators(text);
        let entries = self.entries.read().await;
        let mut best: Option<(f32, &IntentEntry, usize)> = None;
        for entry in entries.iter() {
            let mut top: Option<(f32, usize)> = None;
            for (j, v) in entry.vectors.iter().enumerate() {
                if let Some(v) = v {
                    let s = cosine_similarity(&query, v);
                    if top.map_or(true, |(t, _)| s > t) {
                        top = Some((s, j));
                    }
                }
            }
            let Some((mut score, j)) = top else { continue };
            if entry.def.lifecycle && file_like {
                score -= self.conflict_penalty;
            }
            if best.map_or(true, |(b, _, _)| score > b) {
                best = Some((score, entry, j));
            }
        }

        let (score, entry, j) = best?;
        tracing::debug!(
            intent = %entry.def.name,
            score,
            threshold = entry.def.threshold,
            "intent best match"
        );
        if score < entry.def.threshold {
            return None;
        }
        Some(IntentMatch {
            intent: entry.def.name.clone(),
            confidence: score,
            matched_example: entry.def.examples[j].clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Embedder;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// 预设向量表；未登记的文本落到 fallback
    struct TableEmbedder {
        table: HashMap<String, Vec<f32>>,
        fallback: Vec<f32>,
        embedded: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for TableEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, String> {
            self.embedded.fetch_add(texts.len(), Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| self.table.get(t).cloned().unwrap_or_else(|| self.fallback.clone()))
                .collect())
        }
    }

    /// 二维向量：与 (1,0) 的余弦恰为 x / |v|
    fn unit(cos: f32) -> Vec<f32> {
        vec![cos, (1.0 - cos * cos).max(0.0).sqrt()]
    }

    fn router(entries: &[(&str, Vec<f32>)], defs: Vec<IntentDef>) -> (Arc<TableEmbedder>, IntentRouter) {
        let embedder = Arc::new(TableEmbedder {
            table: entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            fallback: vec![0.0, 1.0],
            embedded: AtomicUsize::new(0),
        });
        let shared = SharedEmbedder::ready(embedder.clone());
        (embedder, IntentRouter::with_intents(shared, defs, 0.15))
    }

    fn close_and_info() -> Vec<IntentDef> {
        vec![
            IntentDef::new("system_info", 0.60, &["system info example"]).fast_path(),
            IntentDef::new("app_close", 0.85, &["close app example"]).fast_path().lifecycle(),
        ]
    }

    #[tokio::test]
    async fn test_destructive_threshold_boundary() {
        // 与 app_close 示例相似度 0.75：高于信息类阈值 0.60，低于破坏性阈值 0.85
        let (_, r) = router(
            &[
                ("close app example", vec![1.0, 0.0]),
                ("system info example", vec![0.0, 1.0]),
                ("shut it down", unit(0.75)),
            ],
            close_and_info(),
        );
        assert!(r.detect("shut it down").await.is_none());
    }

    #[tokio::test]
    async fn test_match_above_threshold() {
        let (_, r) = router(
            &[
                ("close app example", vec![1.0, 0.0]),
                ("system info example", vec![0.0, 1.0]),
                ("close the music player", unit(0.95)),
            ],
            close_and_info(),
        );
        let m = r.detect("close the music player").await.unwrap();
        assert_eq!(m.intent, "app_close");
        assert_eq!(m.matched_example, "close app example");
        assert!(m.confidence > 0.85);
    }

    #[tokio::test]
    async fn test_conflict_penalty_for_file_text() {
        let (_, r) = router(
            &[
                ("close app example", vec![1.0, 0.0]),
                ("system info example", vec![0.0, 1.0]),
                ("close report.pdf", unit(0.95)),
            ],
            close_and_info(),
        );
        // 0.95 - 0.15 < 0.85
        assert!(r.detect("close report.pdf").await.is_none());
    }

    #[tokio::test]
    async fn test_examples_embedded_once_and_hot_added_incrementally() {
        let (e, r) = router(&[], close_and_info());
        r.detect("anything").await;
        // 两条示例 + 一条查询
        assert_eq!(e.embedded.load(Ordering::SeqCst), 3);
        r.detect("anything").await;
        assert_eq!(e.embedded.load(Ordering::SeqCst), 4);

        let added = r
            .add_examples("app_close", &["close app example", "terminate the app"])
            .await
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(e.embedded.load(Ordering::SeqCst), 5);
        assert!(r.add_examples("nope", &["x"]).await.is_err());
    }

    #[tokio::test]
    async fn test_not_ready_embedder_skips() {
        let shared = SharedEmbedder::spawn_loading(
            std::future::pending::<Result<Arc<dyn Embedder>, String>>(),
        );
        let r = IntentRouter::with_intents(shared, close_and_info(), 0.15);
        assert!(r.detect("open the calculator").await.is_none());
    }

    #[test]
    fn test_extract_app_name() {
        assert_eq!(extract_app_name("open the calculator application").as_deref(), Some("calculator"));
        assert_eq!(extract_app_name("Launch Safari then search for rust").as_deref(), Some("Safari"));
        assert_eq!(extract_app_name("please close Visual Studio Code").as_deref(), Some("Visual Studio Code"));
        assert_eq!(extract_app_name("打开计算器应用").as_deref(), Some("计算器"));
        assert_eq!(extract_app_name("打开微信然后发消息").as_deref(), Some("微信"));
        assert_eq!(extract_app_name("open the app"), None);
        assert_eq!(extract_app_name("what time is it"), None);
    }

    #[test]
    fn test_extract_level_and_file_indicators() {
        assert_eq!(extract_level("set volume to 35%"), Some(35));
        assert_eq!(extract_level("mute the sound"), Some(0));
        assert_eq!(extract_level("volume 250"), Some(100));
        assert_eq!(extract_level("louder please"), None);
        assert!(has_file_indicators("delete this file"));
        assert!(has_file_indicators("close notes.txt"));
        assert!(has_file_indicators("open ~/Documents"));
        assert!(!has_file_indicators("close the calculator"));
    }

    #[test]
    fn test_fast_path_steps() {
        let s = fast_path_step("app_open", "open the calculator application").unwrap();
        assert_eq!(s.step_type, "open_app");
        assert_eq!(s.param_str("app_name"), Some("calculator"));
        assert!(fast_path_step("volume_control", "louder please").is_none());
        assert!(fast_path_step("translate", "translate this").is_none());
    }
}
