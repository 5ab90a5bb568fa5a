//! Mock LLM 客户端（用于测试与无 API Key 时的离线运行）
//!
//! 按顺序吐出预设回复；用完后返回 fallback。记录每次收到的消息，便于断言规划 / 反思是否被调用。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::traits::Message;
use crate::llm::LlmClient;

/// 脚本化客户端：回复队列 + 调用记录
#[derive(Debug)]
pub struct MockLlmClient {
    replies: Mutex<VecDeque<Result<String, String>>>,
    fallback: String,
    delay: Option<Duration>,
    vision: bool,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: "[]".to_string(),
            delay: None,
            vision: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = Self::new();
        if let Ok(mut q) = client.replies.lock() {
            q.extend(replies.into_iter().map(|s| Ok(s.into())));
        }
        client
    }

    pub fn push_error(&self, err: impl Into<String>) {
        if let Ok(mut q) = self.replies.lock() {
            q.push_back(Err(err.into()));
        }
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = fallback.into();
        self
    }

    /// 每次调用前等待，用于超时测试
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_vision(mut self, vision: bool) -> Self {
        self.vision = vision;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        if let Ok(mut c) = self.calls.lock() {
            c.push(messages.to_vec());
        }
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        let next = self.replies.lock().ok().and_then(|mut q| q.pop_front());
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }

    fn supports_vision(&self) -> bool {
        self.vision
    }
}
