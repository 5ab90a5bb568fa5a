//! 嵌入提供方：文本 → 定长向量
//!
//! - `OpenAiEmbedder`：调用 OpenAI 兼容的 /embeddings 端点
//! - `HashEmbedder`：离线哈希嵌入（分词 + 字符二元组，L2 归一化），无 Key 时使用
//! - `SharedEmbedder`：后台加载，`wait_until_ready(timeout)` 探测就绪；加载失败则永久不可用

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::embeddings::{CreateEmbeddingRequestArgs, EmbeddingInput};
use async_openai::Client;
use async_trait::async_trait;
use tokio::sync::watch;

use crate::config::EmbeddingSection;
use crate::memory::tokenizer::tokenize;

/// 嵌入 trait：批量编码
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, String>;
}

/// 余弦相似度；任一向量为零或长度不一致时返回 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// 使用 async-openai 调用 OpenAI 兼容的 embeddings API
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiEmbedder {
    /// 与 LLM 共用 OPENAI_API_KEY / base_url
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, String> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(EmbeddingInput::StringArray(texts.to_vec()))
            .build()
            .map_err(|e| e.to_string())?;
        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| e.to_string())?;
        let mut data = response.data;
        data.sort_by_key(|e| e.index);
        Ok(data.into_iter().map(|e| e.embedding).collect())
    }
}

/// 离线哈希嵌入
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dims: usize,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self { dims: 256 }
    }
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(8) }
    }

    fn bucket(&self, feature: &str) -> usize {
        let mut h = DefaultHasher::new();
        feature.hash(&mut h);
        (h.finish() as usize) % self.dims
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let token: String = token.chars().filter(|c| c.is_alphanumeric()).collect();
            if token.is_empty() {
                continue;
            }
            v[self.bucket(&token)] += 1.0;
            let chars: Vec<char> = token.chars().collect();
            for pair in chars.windows(2) {
                let gram: String = pair.iter().collect();
                v[self.bucket(&format!("#{gram}"))] += 0.3;
            }
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, String> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadState {
    Loading,
    Ready,
    Failed,
}

/// 后台加载的嵌入提供方；克隆共享同一加载状态
#[derive(Clone)]
pub struct SharedEmbedder {
    slot: Arc<RwLock<Option<Arc<dyn Embedder>>>>,
    state: watch::Receiver<LoadState>,
}

impl SharedEmbedder {
    /// 已就绪的提供方（测试、本地嵌入）
    pub fn ready(embedder: Arc<dyn Embedder>) -> Self {
        let (_tx, rx) = watch::channel(LoadState::Ready);
        Self {
            slot: Arc::new(RwLock::new(Some(embedder))),
            state: rx,
        }
    }

    /// 在后台执行 loader；完成前 `is_ready()` 为 false
    pub fn spawn_loading<F>(loader: F) -> Self
    where
        F: Future<Output = Result<Arc<dyn Embedder>, String>> + Send + 'static,
    {
        let (tx, rx) = watch::channel(LoadState::Loading);
        let slot: Arc<RwLock<Option<Arc<dyn Embedder>>>> = Arc::new(RwLock::new(None));
        let target = slot.clone();
        tokio::spawn(async move {
            match loader.await {
                Ok(embedder) => {
                    if let Ok(mut s) = target.write() {
                        *s = Some(embedder);
                    }
                    tracing::info!("embedding provider ready");
                    let _ = tx.send(LoadState::Ready);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "embedding provider failed to load");
                    let _ = tx.send(LoadState::Failed);
                }
            }
        });
        Self { slot, state: rx }
    }

    pub fn is_ready(&self) -> bool {
        *self.state.borrow() == LoadState::Ready
    }

    /// 最多等待 timeout；超时或加载失败返回 false
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.state.clone();
        let ready = match tokio::time::timeout(timeout, rx.wait_for(|s| *s != LoadState::Loading)).await {
            Ok(Ok(state)) => *state == LoadState::Ready,
            _ => false,
        };
        ready
    }

    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, String> {
        let embedder = self
            .slot
            .read()
            .ok()
            .and_then(|s| s.clone())
            .ok_or_else(|| "embedding provider not ready".to_string())?;
        embedder.embed(texts).await
    }
}

/// 按配置创建嵌入提供方：openai 且有 Key 时后台探测端点，否则用本地哈希嵌入
pub fn create_embedder_from_config(cfg: &EmbeddingSection) -> SharedEmbedder {
    let key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty());
    if cfg.provider.eq_ignore_ascii_case("openai") {
        if let Some(key) = key {
            let embedder = OpenAiEmbedder::new(cfg.base_url.as_deref(), &cfg.model, Some(&key));
            return SharedEmbedder::spawn_loading(async move {
                embedder.embed(&["ping".to_string()]).await?;
                Ok(Arc::new(embedder) as Arc<dyn Embedder>)
            });
        }
        tracing::debug!("embedding falls back to local: no OPENAI_API_KEY");
    }
    SharedEmbedder::spawn_loading(async {
        Ok(Arc::new(HashEmbedder::default()) as Arc<dyn Embedder>)
    })
}
