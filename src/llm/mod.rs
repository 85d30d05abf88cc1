mod client;
pub mod types;

use crate::config::SourceConfig;
use crate::error::{LlmError, Result, TeraError};
use crate::llm::client::{post, post_embeddings, post_stream};
use crate::llm::types::{ChatCompletionRequest, EmbeddingRequest, EmbeddingResponse, Message};
use async_trait::async_trait;
use futures::Stream;
use reqwest::Client;
use reqwest::header::HeaderMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// 增量文本流（流式对话）
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// HTTP 传输层超时，覆盖所有模型调用
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(120);

/// 构建共享的 HTTP 客户端
pub fn build_http_client(timeout: Duration) -> Result<Arc<Client>> {
    let client = Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| TeraError::Other(format!("Failed to build HTTP client: {}", e)))?;
    Ok(Arc::new(client))
}

pub fn assemble_req_header(api_key: &str) -> Result<HeaderMap> {
    let mut header_map = HeaderMap::new();

    header_map.insert(
        "Authorization",
        format!("Bearer {}", api_key)
            .parse()
            .map_err(|e| TeraError::Other(format!("Invalid Authorization header: {}", e)))?,
    );
    header_map.insert(
        "Content-Type",
        "application/json"
            .parse()
            .map_err(|e| TeraError::Other(format!("Invalid Content-Type header: {}", e)))?,
    );
    Ok(header_map)
}

/// 拼接 OpenAI 兼容接口地址，容忍末尾斜杠
pub fn endpoint_url(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// 外部补全调用的统一接口，记忆压缩与提取只依赖该 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 发起一次非流式对话，返回模型的文本内容
    async fn chat_simple(&self, messages: Vec<Message>) -> Result<String>;

    /// 流式对话；默认实现把 `chat_simple` 的结果作为单个 chunk 返回
    async fn chat_stream(&self, messages: Vec<Message>) -> Result<TextStream> {
        let text = self.chat_simple(messages).await?;
        Ok(Box::pin(futures::stream::once(async move { Ok(text) })))
    }
}

/// 基于 OpenAI 兼容接口的默认实现
pub struct DefaultLlmClient {
    client: Arc<Client>,
    source: SourceConfig,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl DefaultLlmClient {
    pub fn new(client: Arc<Client>, source: SourceConfig) -> Self {
        Self {
            client,
            source,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn model(&self) -> &str {
        &self.source.model
    }

    fn request(&self, messages: Vec<Message>, stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.source.model.clone(),
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: Some(stream),
        }
    }

    fn url(&self) -> String {
        endpoint_url(&self.source.base_url, "chat/completions")
    }
}

#[async_trait]
impl LlmClient for DefaultLlmClient {
    async fn chat_simple(&self, messages: Vec<Message>) -> Result<String> {
        let request_body = self.request(messages, false);
        let header_map = assemble_req_header(&self.source.api_key)?;
        let response = post(self.client.clone(), &request_body, header_map, &self.url()).await?;

        response
            .first_content()
            .map(|c| c.trim().to_string())
            .ok_or_else(|| LlmError::EmptyResponse.into())
    }

    async fn chat_stream(&self, messages: Vec<Message>) -> Result<TextStream> {
        let request_body = self.request(messages, true);
        let header_map = assemble_req_header(&self.source.api_key)?;
        post_stream(self.client.clone(), &request_body, header_map, &self.url()).await
    }
}

/// 调用 OpenAI 兼容 `/embeddings` 接口
pub async fn embeddings(
    client: Arc<Client>,
    base_url: &str,
    api_key: &str,
    model: &str,
    input: &[String],
) -> Result<EmbeddingResponse> {
    let request_body = EmbeddingRequest { model, input };
    let header_map = assemble_req_header(api_key)?;
    post_embeddings(
        client,
        &request_body,
        header_map,
        &endpoint_url(base_url, "embeddings"),
    )
    .await
}
