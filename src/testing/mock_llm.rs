//! 脚本化的聊天模型
//!
//! 记忆压缩、记忆提取和聊天会话都只通过 [`LlmClient`] 访问模型。本 Mock 按顺序
//! 返回预设的回复，同时支持 `chat_simple` 与 `chat_stream` 两条路径：
//!
//! - 普通回复：`chat_simple` 直接返回；`chat_stream` 作为单个 chunk 返回
//! - 分段回复（[`with_stream`](MockLlmClient::with_stream)）：`chat_stream` 逐段产出，
//!   `chat_simple` 返回拼接后的全文
//! - 首包即失败的流（[`with_broken_stream`](MockLlmClient::with_broken_stream)）：
//!   用于测试会话退回非流式请求
//! - 错误：两条路径都返回该错误
//!
//! 两条路径共用同一个队列，每次调用消费一项；队列耗尽后返回 `EmptyResponse`。
//!
//! ```rust
//! use tera_chat::testing::MockLlmClient;
//! use tera_chat::llm::LlmClient;
//! use tera_chat::llm::types::Message;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mock = MockLlmClient::new().with_response("- 用户喜欢猫");
//! let summary = mock.chat_simple(vec![Message::user("压缩这些记忆")]).await.unwrap();
//! assert_eq!(summary, "- 用户喜欢猫");
//! assert_eq!(mock.call_count(), 1);
//! # }
//! ```

use crate::error::{LlmError, Result, TeraError};
use crate::llm::types::Message;
use crate::llm::{LlmClient, TextStream};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

enum Scripted {
    Text(String),
    Chunks(Vec<String>),
    BrokenStream,
    Fail(TeraError),
}

#[derive(Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Scripted>>,
    /// 每次调用收到的 messages，按时序
    calls: Mutex<Vec<Vec<Message>>>,
    /// 每次调用返回前的等待（超时与并发测试用）
    delay: Option<Duration>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, item: Scripted) -> Self {
        self.script.lock().unwrap().push_back(item);
        self
    }

    pub fn with_response(self, text: impl Into<String>) -> Self {
        self.push(Scripted::Text(text.into()))
    }

    pub fn with_responses(self, texts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        texts
            .into_iter()
            .fold(self, |mock, text| mock.with_response(text))
    }

    /// 一次分段到达的回复
    pub fn with_stream(self, chunks: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.push(Scripted::Chunks(chunks.into_iter().map(Into::into).collect()))
    }

    /// 流建立成功，但第一个 chunk 就是错误
    pub fn with_broken_stream(self) -> Self {
        self.push(Scripted::BrokenStream)
    }

    pub fn with_error(self, err: TeraError) -> Self {
        self.push(Scripted::Fail(err))
    }

    pub fn with_network_error(self, msg: impl Into<String>) -> Self {
        self.with_error(TeraError::Llm(LlmError::NetworkError(msg.into())))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn last_messages(&self) -> Option<Vec<Message>> {
        self.calls.lock().unwrap().last().cloned()
    }

    pub fn all_calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().unwrap().clone()
    }

    /// 记录调用、等待，然后取出下一项脚本
    async fn next(&self, messages: Vec<Message>) -> Option<Scripted> {
        self.calls.lock().unwrap().push(messages);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.script.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn chat_simple(&self, messages: Vec<Message>) -> Result<String> {
        match self.next(messages).await {
            Some(Scripted::Text(text)) => Ok(text),
            Some(Scripted::Chunks(chunks)) => Ok(chunks.concat()),
            Some(Scripted::BrokenStream) => {
                Err(LlmError::NetworkError("stream interrupted".into()).into())
            }
            Some(Scripted::Fail(e)) => Err(e),
            None => Err(LlmError::EmptyResponse.into()),
        }
    }

    async fn chat_stream(&self, messages: Vec<Message>) -> Result<TextStream> {
        let items: Vec<Result<String>> = match self.next(messages).await {
            Some(Scripted::Text(text)) => vec![Ok(text)],
            Some(Scripted::Chunks(chunks)) => chunks.into_iter().map(Ok).collect(),
            Some(Scripted::BrokenStream) => {
                vec![Err(LlmError::NetworkError("stream interrupted".into()).into())]
            }
            Some(Scripted::Fail(e)) => return Err(e),
            None => return Err(LlmError::EmptyResponse.into()),
        };
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_stream_and_simple_share_one_queue() {
        let mock = MockLlmClient::new()
            .with_stream(["你", "好"])
            .with_response("整段")
            .with_stream(["a", "b"]);

        let chunks: Vec<String> = mock
            .chat_stream(vec![Message::user("1")])
            .await
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks, vec!["你", "好"]);
        assert_eq!(mock.chat_simple(vec![Message::user("2")]).await.unwrap(), "整段");
        assert_eq!(mock.chat_simple(vec![Message::user("3")]).await.unwrap(), "ab");
        assert!(mock.chat_simple(vec![Message::user("4")]).await.is_err());
        assert_eq!(mock.call_count(), 4);
        assert_eq!(mock.last_messages().unwrap()[0].content, "4");
    }

    #[tokio::test]
    async fn test_broken_stream_fails_on_first_chunk() {
        let mock = MockLlmClient::new().with_broken_stream();
        let mut stream = mock.chat_stream(vec![Message::user("hi")]).await.unwrap();
        assert!(matches!(stream.next().await, Some(Err(_))));
    }
}
