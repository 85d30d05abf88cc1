//! 原始聊天日志
//!
//! 与记忆库相互独立：每轮对话追加一行 `{role, content, ts}`，下次会话开始时被整体取出
//! 并清空，交给 [`MemoryExtractor`](super::MemoryExtractor) 提炼。无论记忆功能是否开启，
//! 会话开始时都会清空日志，避免文件无限增长。

use crate::error::{MemoryError, Result};
use crate::llm::types::Role;
use crate::memory::file_stem;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatLogEntry {
    pub role: Role,
    pub content: String,
    /// 本地时间，缺失时按空串排序（排在最前）
    #[serde(default, rename = "ts", alias = "timestamp")]
    pub timestamp: String,
}

impl ChatLogEntry {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: chrono::Local::now().format(TIMESTAMP_FORMAT).to_string(),
        }
    }

    /// `[ts] role: content`
    pub fn format_line(&self) -> String {
        format!("[{}] {}: {}", self.timestamp, self.role, self.content)
    }
}

pub struct ChatLog {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl ChatLog {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = crate::config::expand_tilde(dir.as_ref());
        std::fs::create_dir_all(&dir)
            .map_err(|e| MemoryError::IoError(format!("创建目录失败: {e}")))?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    pub fn log_path(&self, identity: &str) -> PathBuf {
        self.dir.join(format!("chatlog_{}.jsonl", file_stem(identity)))
    }

    pub async fn append(&self, identity: &str, role: Role, content: &str) -> Result<()> {
        self.append_entry(identity, &ChatLogEntry::new(role, content))
            .await
    }

    pub async fn append_entry(&self, identity: &str, entry: &ChatLogEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry)
            .map_err(|e| MemoryError::SerializationError(e.to_string()))?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(identity))
            .await
            .map_err(|e| MemoryError::IoError(format!("打开聊天日志失败: {e}")))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| MemoryError::IoError(format!("写入聊天日志失败: {e}")))?;
        Ok(())
    }

    /// 读取全部条目，按时间戳升序（稳定排序）
    pub async fn read(&self, identity: &str) -> Result<Vec<ChatLogEntry>> {
        let raw = match tokio::fs::read_to_string(self.log_path(identity)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(MemoryError::IoError(format!("读取聊天日志失败: {e}")).into());
            }
        };

        let mut entries: Vec<ChatLogEntry> = raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| match serde_json::from_str(l) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(identity = %identity, error = %e, "跳过损坏的聊天日志行");
                    None
                }
            })
            .collect();
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(entries)
    }

    /// 截断为空文件
    pub async fn clear(&self, identity: &str) -> Result<()> {
        let path = self.log_path(identity);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tokio::fs::write(&path, b"")
                .await
                .map_err(|e| MemoryError::IoError(format!("清空聊天日志失败: {e}")))?;
        }
        Ok(())
    }

    /// 取出全部条目并清空；读取失败时也会尝试清空
    pub async fn take(&self, identity: &str) -> Result<Vec<ChatLogEntry>> {
        let _guard = self.lock.lock().await;
        let entries = self.read(identity).await;
        self.clear(identity).await?;
        let entries = entries?;
        debug!(identity = %identity, entries = entries.len(), "📜 取出上次会话日志");
        Ok(entries)
    }
}
