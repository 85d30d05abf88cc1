//! 会话记忆提取
//!
//! 会话开始时把上一次会话的聊天日志交给模型，提炼出值得长期保存的事实与偏好，逐条写入
//! 记忆库。整个过程在后台任务中进行，不阻塞问候语和对话；任何失败都只记录日志。

use crate::error::{MemoryError, Result};
use crate::llm::LlmClient;
use crate::llm::types::Message;
use crate::memory::EXTRACTION_WINDOW;
use crate::memory::chat_log::ChatLogEntry;
use crate::memory::compactor::parse_summary_lines;
use crate::memory::store::MemoryStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

const EXTRACTION_PROMPT: &str = "你是助手，任务：从用户和助手的对话中提炼值得长期记忆的事实或偏好。\
每条不超过50字，使用与对话相同的语言，每行一条，不要编号或解释。若无可记忆信息，输出空。";

#[derive(Clone)]
pub struct MemoryExtractor {
    llm: Arc<dyn LlmClient>,
    store: Arc<MemoryStore>,
    /// 最多发送的历史条数（取最近的）
    window: usize,
    timeout: Duration,
    tracker: TaskTracker,
}

impl MemoryExtractor {
    pub fn new(llm: Arc<dyn LlmClient>, store: Arc<MemoryStore>) -> Self {
        Self {
            llm,
            store,
            window: EXTRACTION_WINDOW,
            timeout: Duration::from_secs(60),
            tracker: TaskTracker::new(),
        }
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build_messages(&self, entries: &[ChatLogEntry]) -> Vec<Message> {
        let start = entries.len().saturating_sub(self.window);
        let transcript = entries[start..]
            .iter()
            .map(ChatLogEntry::format_line)
            .collect::<Vec<_>>()
            .join("\n");
        vec![
            Message::system(format!("{}\n对话:\n{}", EXTRACTION_PROMPT, transcript)),
            Message::user("记忆提取"),
        ]
    }

    /// 提取并写入，返回实际写入的条数
    pub async fn extract(&self, identity: &str, entries: &[ChatLogEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let call = self.llm.chat_simple(self.build_messages(entries));
        let response = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| MemoryError::Timeout(self.timeout.as_secs()))??;

        let lines = parse_summary_lines(&response);
        debug!(identity = %identity, candidates = lines.len(), "提炼出候选记忆");

        let mut added = 0;
        for line in &lines {
            match self.store.add(identity, line).await {
                Ok(()) => added += 1,
                Err(e) if e.is_model_unavailable() => return Err(e),
                Err(e) => warn!(identity = %identity, error = %e, "⚠️ 写入提取的记忆失败"),
            }
        }
        Ok(added)
    }

    /// 在后台执行提取，立即返回
    pub fn spawn(&self, identity: impl Into<String>, entries: Vec<ChatLogEntry>) {
        if entries.is_empty() {
            return;
        }
        let identity = identity.into();
        let this = self.clone();
        self.tracker.spawn(async move {
            match this.extract(&identity, &entries).await {
                Ok(added) => info!(identity = %identity, added, "🧠 会话记忆提取完成"),
                Err(e) => warn!(identity = %identity, error = %e, "⚠️ 会话记忆提取失败"),
            }
        });
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// 等待所有已派发的后台提取结束
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}
