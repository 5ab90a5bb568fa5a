//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）、调用网关、嵌入

pub mod deepseek;
pub mod embedding;
pub mod guard;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use deepseek::{create_deepseek_client, DEEPSEEK_CHAT};
pub use embedding::{
    cosine_similarity, create_embedder_from_config, Embedder, HashEmbedder, OpenAiEmbedder,
    SharedEmbedder,
};
pub use guard::LlmGateway;
pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{ImageAttachment, LlmClient, Message, Role};

use crate::config::LlmSection;

/// 根据配置与环境变量选择 LLM 后端（DeepSeek / OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &LlmSection) -> Arc<dyn LlmClient> {
    let provider = cfg.provider.to_lowercase();
    let use_deepseek = provider == "deepseek"
        && (std::env::var("DEEPSEEK_API_KEY").is_ok() || std::env::var("OPENAI_API_KEY").is_ok());
    let use_openai = provider == "openai" && std::env::var("OPENAI_API_KEY").is_ok();

    if use_deepseek {
        tracing::info!("Using DeepSeek LLM ({})", cfg.model);
        Arc::new(create_deepseek_client(Some(&cfg.model)))
    } else if use_openai {
        tracing::info!("Using OpenAI LLM ({})", cfg.model);
        Arc::new(
            OpenAiClient::new(
                cfg.base_url.as_deref(),
                &cfg.model,
                std::env::var("OPENAI_API_KEY").ok().as_deref(),
            )
            .with_vision(cfg.vision),
        )
    } else {
        tracing::warn!("No API key set or provider is mock, using Mock LLM");
        Arc::new(MockLlmClient::new())
    }
}
