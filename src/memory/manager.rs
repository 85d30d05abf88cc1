//! 对话会话使用的记忆门面
//!
//! 把记忆库、聊天日志和后台提取组合在一起，对外只暴露会话需要的三个动作：
//! 会话开始、记录一轮对话、按输入检索相关记忆。记忆相关的失败在这里被吞掉并记录，
//! 不会打断对话。

use crate::config::AppConfig;
use crate::error::Result;
use crate::llm::LlmClient;
use crate::llm::types::Role;
use crate::memory::chat_log::ChatLog;
use crate::memory::compactor::{CompactionPolicy, Compactor};
use crate::memory::embedding::EmbeddingProvider;
use crate::memory::extraction::MemoryExtractor;
use crate::memory::store::MemoryStore;
use reqwest::Client;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 记忆与聊天日志所在的子目录
pub const MEMORY_DIR: &str = "memory";

pub fn memory_dir(config: &AppConfig) -> PathBuf {
    config.data_dir.join(MEMORY_DIR)
}

pub struct MemoryManager {
    chat_log: ChatLog,
    store: Option<Arc<MemoryStore>>,
    extractor: Option<MemoryExtractor>,
    top_k: usize,
    /// 配置开启但嵌入模型不可用时的原因
    unavailable: Option<String>,
}

impl MemoryManager {
    /// 按配置打开记忆库；`llm` 为空时不做自动压缩
    pub fn open_store(
        config: &AppConfig,
        llm: Option<Arc<dyn LlmClient>>,
        http: Arc<Client>,
    ) -> Result<Arc<MemoryStore>> {
        let settings = &config.memory;
        let source = config.active_source().ok().map(|(_, s)| s);
        let provider =
            EmbeddingProvider::from_settings(&settings.embedding, source, http, &config.data_dir)?;
        let mut store = MemoryStore::new(memory_dir(config), Arc::new(provider))?;
        if let Some(llm) = llm {
            store = store.with_compactor(Compactor::new(llm, CompactionPolicy::from(settings)));
        }
        Ok(Arc::new(store))
    }

    /// 构建会话用的记忆门面
    ///
    /// 记忆关闭时只保留聊天日志（用于会话开始时清空）；嵌入模型不可用时记忆在本次会话中
    /// 被禁用，原因可通过 [`unavailable_reason`](Self::unavailable_reason) 取得。
    pub fn from_config(
        config: &AppConfig,
        llm: Arc<dyn LlmClient>,
        http: Arc<Client>,
    ) -> Result<Self> {
        let chat_log = ChatLog::new(memory_dir(config))?;
        let top_k = config.memory.top_k;
        if !config.memory.enabled {
            return Ok(Self::disabled(chat_log, top_k, None));
        }

        match Self::open_store(config, Some(llm.clone()), http) {
            Ok(store) => {
                let extractor = MemoryExtractor::new(llm, store.clone())
                    .with_window(config.memory.extraction_window)
                    .with_timeout(Duration::from_secs(config.memory.llm_timeout_secs));
                info!(top_k, "🧠 长期记忆已启用");
                Ok(Self {
                    chat_log,
                    store: Some(store),
                    extractor: Some(extractor),
                    top_k,
                    unavailable: None,
                })
            }
            Err(e) if e.is_model_unavailable() => {
                warn!(error = %e, "❌ 嵌入模型不可用，本次会话禁用记忆");
                Ok(Self::disabled(chat_log, top_k, Some(e.to_string())))
            }
            Err(e) => Err(e),
        }
    }

    /// 直接由组件构造
    pub fn new(chat_log: ChatLog, store: Arc<MemoryStore>, extractor: MemoryExtractor, top_k: usize) -> Self {
        Self {
            chat_log,
            store: Some(store),
            extractor: Some(extractor),
            top_k,
            unavailable: None,
        }
    }

    fn disabled(chat_log: ChatLog, top_k: usize, unavailable: Option<String>) -> Self {
        Self {
            chat_log,
            store: None,
            extractor: None,
            top_k,
            unavailable,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn unavailable_reason(&self) -> Option<&str> {
        self.unavailable.as_deref()
    }

    pub fn store(&self) -> Option<&Arc<MemoryStore>> {
        self.store.as_ref()
    }

    pub fn chat_log(&self) -> &ChatLog {
        &self.chat_log
    }

    /// 会话开始：取出并清空上次的聊天日志，记忆开启时在后台提炼
    pub async fn begin_session(&self, identity: &str) {
        let entries = match self.chat_log.take(identity).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(identity = %identity, error = %e, "⚠️ 读取上次会话日志失败");
                return;
            }
        };
        match &self.extractor {
            Some(extractor) if !entries.is_empty() => extractor.spawn(identity, entries),
            _ => debug!(identity = %identity, entries = entries.len(), "无需提取记忆"),
        }
    }

    /// 记录一轮对话（仅在记忆开启时）
    pub async fn record_turn(&self, identity: &str, role: Role, content: &str) {
        if !self.is_enabled() {
            return;
        }
        if let Err(e) = self.chat_log.append(identity, role, content).await {
            warn!(identity = %identity, error = %e, "⚠️ 写入聊天日志失败");
        }
    }

    /// 与输入最相关的记忆；失败或未开启时返回空
    pub async fn recall(&self, identity: &str, query: &str) -> Vec<String> {
        let Some(store) = &self.store else {
            return Vec::new();
        };
        match store.retrieve(identity, query, self.top_k).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(identity = %identity, error = %e, "⚠️ 记忆检索失败");
                Vec::new()
            }
        }
    }

    /// 等待后台提取任务（退出前可选调用）
    pub async fn wait_background(&self) {
        if let Some(extractor) = &self.extractor {
            extractor.wait().await;
        }
    }
}

/// 把检索到的记忆拼成注入对话的 system 消息内容
pub fn format_recall(memories: &[String]) -> Option<String> {
    if memories.is_empty() {
        return None;
    }
    let lines = memories
        .iter()
        .map(|m| format!("- {}", m))
        .collect::<Vec<_>>()
        .join("\n");
    Some(format!("以下是与你的个人记忆相关的信息，请参考：\n{}", lines))
}
