//! 长期记忆子系统
//!
//! 按角色（identity）隔离，每个角色拥有两份独立的数据文件：
//!
//! | 组件 | 实现 | 文件 |
//! |------|------|------|
//! | 记忆库 | [`MemoryStore`] | `memory_<角色>.jsonl`，每行一条 `{text, embedding}` |
//! | 聊天日志 | [`ChatLog`] | `chatlog_<角色>.jsonl`，每行一轮 `{role, content, ts}` |
//!
//! 写入路径：
//!
//! ```text
//! ChatLog ──(会话开始时取出并清空)──► MemoryExtractor ──► MemoryStore::add ──► Compactor
//!                                                              ▲
//!                                       前台会话 / CLI ─────────┘
//! ```
//!
//! 检索路径：[`MemoryStore::retrieve`] 对所有记录做线性余弦相似度扫描。记录数由
//! [`Compactor`] 控制在数百条以内，因此无需额外的向量索引。
//!
//! ## 快速上手
//!
//! ```rust,no_run
//! use tera_chat::memory::{MemoryStore, EmbeddingProvider};
//! use tera_chat::testing::MockEmbedder;
//! use std::sync::Arc;
//!
//! # async fn example() -> tera_chat::error::Result<()> {
//! let provider = Arc::new(EmbeddingProvider::ready(Arc::new(MockEmbedder::new(32))));
//! let store = MemoryStore::new("/tmp/tera-demo", provider)?;
//! store.add("小雪", "用户喜欢深色主题").await?;
//! let hits = store.retrieve("小雪", "主题偏好", 5).await?;
//! # Ok(())
//! # }
//! ```

pub mod chat_log;
pub mod compactor;
pub mod embedding;
pub mod extraction;
pub mod manager;
pub mod retriever;
pub mod store;

pub use chat_log::{ChatLog, ChatLogEntry};
pub use compactor::{CompactionPolicy, Compactor, DefaultCompactionPrompt, SummaryPromptBuilder};
pub use embedding::{Embedder, EmbeddingProvider, HttpEmbedder};
pub use extraction::MemoryExtractor;
pub use manager::{MemoryManager, format_recall};
pub use store::{CompactionOutcome, MemoryStore};

use serde::{Deserialize, Serialize};

/// 记录数超过该值时触发压缩
pub const MAX_MEMORY_ITEMS: usize = 500;
/// 每次压缩取出的最旧记录数
pub const SUMMARY_BATCH: usize = 100;
/// 压缩摘要最多保留的行数
pub const SUMMARY_MAX_LINES: usize = 20;
/// 每轮对话注入的相关记忆条数
pub const DEFAULT_TOP_K: usize = 5;
/// 记忆提取时最多发送的历史轮数
pub const EXTRACTION_WINDOW: usize = 100;

/// 模型常用来表示"没有内容"的占位词（比较前先 trim + 小写）
const PLACEHOLDERS: [&str; 4] = ["空", "无", "none", "null"];

/// 记忆库中的单条记录。本 crate 写入的 `embedding` 均已归一化为单位长度
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryRecord {
    pub text: String,
    pub embedding: Vec<f32>,
}

/// 空串或占位词
pub fn is_placeholder(text: &str) -> bool {
    let clean = text.trim();
    if clean.is_empty() {
        return true;
    }
    let lower = clean.to_lowercase();
    PLACEHOLDERS.contains(&lower.as_str())
}

/// 原地归一化为单位长度；零向量保持不变
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

pub fn normalized(mut vector: Vec<f32>) -> Vec<f32> {
    normalize(&mut vector);
    vector
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// 角色名转文件名片段
///
/// 路径分隔符、文件系统保留字符、控制字符以及 `%` 本身按 UTF-8 字节写成 `%XX`，
/// 其余字符原样保留。编码是单射的：不同角色名总是得到不同的文件名。
/// 普通角色名（如 `小雪`）不受影响。
pub(crate) fn file_stem(identity: &str) -> String {
    let mut stem = String::with_capacity(identity.len());
    for c in identity.chars() {
        if c.is_control() || matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '%')
        {
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).bytes() {
                stem.push_str(&format!("%{:02X}", b));
            }
        } else {
            stem.push(c);
        }
    }
    stem
}
