use crate::error::{LlmError, Result, TeraError};
use crate::llm::types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, EmbeddingRequest,
    EmbeddingResponse,
};
use crate::llm::TextStream;
use futures::{Stream, StreamExt};
use reqwest::header::HeaderMap;
use reqwest::{Client, Response};
use std::sync::Arc;
use tracing::debug;

/// 单行 SSE 事件
#[derive(Debug, PartialEq)]
pub(crate) enum SseEvent {
    /// `data: {...}` 负载
    Data(String),
    /// `data: [DONE]`
    Done,
}

/// 解析一行 SSE 文本；空行、注释行和非 data 字段返回 `None`
pub(crate) fn parse_sse_line(line: &str) -> Option<SseEvent> {
    let payload = line.trim_end_matches('\r').strip_prefix("data:")?.trim();
    if payload.is_empty() {
        return None;
    }
    if payload == "[DONE]" {
        return Some(SseEvent::Done);
    }
    Some(SseEvent::Data(payload.to_string()))
}

/// 从一个 chunk 中取出增量文本
pub(crate) fn chunk_text(payload: &str) -> Result<Option<String>> {
    let chunk: ChatCompletionChunk = serde_json::from_str(payload)?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|c| !c.is_empty()))
}

async fn send_json<T: serde::Serialize + ?Sized>(
    client: &Client,
    url: &str,
    header_map: HeaderMap,
    body: &T,
) -> Result<Response> {
    let response = client
        .post(url)
        .headers(header_map)
        .json(body)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(LlmError::ApiError {
            status,
            message: error_text,
        }
        .into());
    }
    Ok(response)
}

pub async fn post(
    client: Arc<Client>,
    request_body: &ChatCompletionRequest,
    header_map: HeaderMap,
    url: &str,
) -> Result<ChatCompletionResponse> {
    let response = send_json(&client, url, header_map, request_body).await?;

    let completion_response = response
        .json::<ChatCompletionResponse>()
        .await
        .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

    debug!(id = ?completion_response.id, usage = ?completion_response.usage, "Post completion response");

    Ok(completion_response)
}

/// 以 SSE 方式请求，返回增量文本流
pub async fn post_stream(
    client: Arc<Client>,
    request_body: &ChatCompletionRequest,
    header_map: HeaderMap,
    url: &str,
) -> Result<TextStream> {
    let response = send_json(&client, url, header_map, request_body).await?;
    let bytes = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(TeraError::from));
    Ok(sse_text_stream(bytes))
}

/// 把原始字节流解码为增量文本流
///
/// 按字节缓冲，遇到 `\n` 才把整行解码为 UTF-8，因此被网络分包切开的多字节字符
/// 不会被损坏。
pub(crate) fn sse_text_stream<S, B>(bytes: S) -> TextStream
where
    S: Stream<Item = Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let stream = async_stream::try_stream! {
        let mut bytes = Box::pin(bytes);
        let mut buffer: Vec<u8> = Vec::new();
        'outer: while let Some(chunk) = bytes.next().await {
            buffer.extend_from_slice(chunk?.as_ref());
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                match parse_sse_line(&decode_line(line)?) {
                    Some(SseEvent::Done) => {
                        buffer.clear();
                        break 'outer;
                    }
                    Some(SseEvent::Data(payload)) => {
                        if let Some(text) = chunk_text(&payload)? {
                            yield text;
                        }
                    }
                    None => {}
                }
            }
        }
        // 最后一行可能没有换行符
        if !buffer.is_empty() {
            let line = decode_line(buffer)?;
            if let Some(SseEvent::Data(payload)) = parse_sse_line(&line) {
                if let Some(text) = chunk_text(&payload)? {
                    yield text;
                }
            }
        }
    };
    Box::pin(stream)
}

fn decode_line(line: Vec<u8>) -> Result<String> {
    String::from_utf8(line)
        .map_err(|e| LlmError::InvalidResponse(format!("SSE 行不是合法 UTF-8: {e}")).into())
}

pub async fn post_embeddings(
    client: Arc<Client>,
    request_body: &EmbeddingRequest<'_>,
    header_map: HeaderMap,
    url: &str,
) -> Result<EmbeddingResponse> {
    let response = send_json(&client, url, header_map, request_body).await?;
    response
        .json::<EmbeddingResponse>()
        .await
        .map_err(|e| LlmError::InvalidResponse(e.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sse_line() {
        assert_eq!(
            parse_sse_line("data: {\"a\":1}\r\n".trim_end_matches('\n')),
            Some(SseEvent::Data("{\"a\":1}".to_string()))
        );
        assert_eq!(parse_sse_line("data: [DONE]"), Some(SseEvent::Done));
        assert_eq!(parse_sse_line(": keep-alive"), None);
        assert_eq!(parse_sse_line(""), None);
        assert_eq!(parse_sse_line("event: ping"), None);
    }

    #[test]
    fn test_chunk_text() {
        let payload = r#"{"choices":[{"delta":{"content":"你好"},"finish_reason":null}]}"#;
        assert_eq!(chunk_text(payload).unwrap(), Some("你好".to_string()));

        let role_only = r#"{"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(chunk_text(role_only).unwrap(), None);

        assert!(chunk_text("not json").is_err());
    }

    fn sse_frame(content: &str) -> String {
        format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"{content}\"}}}}]}}\n\n")
    }

    async fn collect(chunks: Vec<Vec<u8>>) -> Vec<String> {
        let source = futures::stream::iter(chunks.into_iter().map(Ok::<_, TeraError>));
        sse_text_stream(source)
            .map(|item| item.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_stream_keeps_multibyte_char_split_across_chunks() {
        let body = format!("{}{}data: [DONE]\n\n", sse_frame("你好"), sse_frame("世界"));
        let bytes = body.into_bytes();
        // 切在"你"的第二个字节之后
        let split = bytes.windows(3).position(|w| w == "你".as_bytes()).unwrap() + 2;
        let chunks = vec![bytes[..split].to_vec(), bytes[split..].to_vec()];

        assert_eq!(collect(chunks).await, vec!["你好", "世界"]);
    }

    #[tokio::test]
    async fn test_stream_byte_by_byte_and_stops_at_done() {
        let body = format!(
            ": keep-alive\n\n{}data: [DONE]\n\n{}",
            sse_frame("记忆"),
            sse_frame("之后的内容")
        );
        let chunks = body.into_bytes().into_iter().map(|b| vec![b]).collect();
        assert_eq!(collect(chunks).await, vec!["记忆"]);
    }

    #[tokio::test]
    async fn test_stream_trailing_line_without_newline() {
        let body = sse_frame("尾行");
        let chunks = vec![body.trim_end().as_bytes().to_vec()];
        assert_eq!(collect(chunks).await, vec!["尾行"]);
    }

    #[tokio::test]
    async fn test_stream_invalid_utf8_is_an_error() {
        let source = futures::stream::iter(vec![Ok::<_, TeraError>(b"data: \xff\xfe\n".to_vec())]);
        let items: Vec<Result<String>> = sse_text_stream(source).collect().await;
        assert!(matches!(
            items.as_slice(),
            [Err(TeraError::Llm(LlmError::InvalidResponse(_)))]
        ));
    }
}
