//! 记忆压缩
//!
//! 记录数超过阈值时，把最旧的一批记录交给模型提炼成若干条摘要，再以新记录的身份
//! 追加到末尾：
//!
//! ```text
//! 压缩前: [r0 .. r99][r100 .. r500]
//! 压缩后:            [r100 .. r500][s0 .. s19]
//! ```
//!
//! 所以压缩之后存储顺序不再严格按时间排列：摘要比它们概括的内容"更新"。
//!
//! [`Compactor::compact`] 只计算新的记录列表，不触碰文件；落盘由
//! [`MemoryStore`](super::MemoryStore) 以"临时文件 + rename"的方式一次完成。
//! 模型调用或嵌入失败时直接返回错误，调用方据此跳过本轮压缩，原有数据不受影响。

use crate::config::MemorySettings;
use crate::error::{MemoryError, Result};
use crate::llm::LlmClient;
use crate::llm::types::Message;
use crate::memory::embedding::EmbeddingProvider;
use crate::memory::{
    MAX_MEMORY_ITEMS, MemoryRecord, SUMMARY_BATCH, SUMMARY_MAX_LINES, is_placeholder, normalized,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// 摘要提示词构建接口，支持自定义压缩策略
pub trait SummaryPromptBuilder: Send + Sync {
    fn build(&self, texts: &[String], max_lines: usize) -> String;
}

/// 默认提示词：逐行列出待压缩的记忆，要求模型合并为不超过 `max_lines` 行的事实清单
pub struct DefaultCompactionPrompt;

impl SummaryPromptBuilder for DefaultCompactionPrompt {
    fn build(&self, texts: &[String], max_lines: usize) -> String {
        let listing = texts
            .iter()
            .map(|t| format!("- {}", t))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "以下是关于用户的若干条长期记忆。请将它们合并、去重、压缩为不超过 {} 行的要点。\n\
             要求：\n\
             1. 每行只写一条事实或偏好，不超过 50 个字\n\
             2. 使用与原始记忆相同的语言\n\
             3. 只输出要点本身，不要编号、标题或解释\n\n\
             记忆：\n{}",
            max_lines, listing
        )
    }
}

/// 用闭包自定义提示词的便捷包装
///
/// # 示例
///
/// ```rust
/// use tera_chat::memory::compactor::FnSummaryPrompt;
///
/// let prompt = FnSummaryPrompt(|texts: &[String], n: usize| {
///     format!("Summarize into at most {} lines:\n{}", n, texts.join("\n"))
/// });
/// ```
pub struct FnSummaryPrompt<F>(pub F)
where
    F: Fn(&[String], usize) -> String + Send + Sync;

impl<F> SummaryPromptBuilder for FnSummaryPrompt<F>
where
    F: Fn(&[String], usize) -> String + Send + Sync,
{
    fn build(&self, texts: &[String], max_lines: usize) -> String {
        (self.0)(texts, max_lines)
    }
}

/// 压缩阈值与批量参数
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionPolicy {
    /// 记录数严格大于该值时压缩
    pub max_items: usize,
    /// 每次取出的最旧记录数
    pub batch: usize,
    /// 摘要最多保留的行数，多出的行被丢弃
    pub max_summary_lines: usize,
    /// 等待模型的上限
    pub timeout: Duration,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            max_items: MAX_MEMORY_ITEMS,
            batch: SUMMARY_BATCH,
            max_summary_lines: SUMMARY_MAX_LINES,
            timeout: Duration::from_secs(60),
        }
    }
}

impl From<&MemorySettings> for CompactionPolicy {
    fn from(settings: &MemorySettings) -> Self {
        Self {
            max_items: settings.max_items,
            batch: settings.summary_batch.max(1),
            max_summary_lines: settings.summary_max_lines,
            timeout: Duration::from_secs(settings.llm_timeout_secs),
        }
    }
}

pub struct Compactor {
    llm: Arc<dyn LlmClient>,
    policy: CompactionPolicy,
    prompt_builder: Box<dyn SummaryPromptBuilder>,
}

impl Compactor {
    pub fn new(llm: Arc<dyn LlmClient>, policy: CompactionPolicy) -> Self {
        Self {
            llm,
            policy,
            prompt_builder: Box::new(DefaultCompactionPrompt),
        }
    }

    pub fn with_prompt(mut self, prompt_builder: impl SummaryPromptBuilder + 'static) -> Self {
        self.prompt_builder = Box::new(prompt_builder);
        self
    }

    pub fn policy(&self) -> &CompactionPolicy {
        &self.policy
    }

    pub fn should_compact(&self, count: usize) -> bool {
        count > self.policy.max_items
    }

    /// 把一批记忆文本交给模型压缩，返回清洗后的摘要行
    pub async fn summarize(&self, texts: &[String]) -> Result<Vec<String>> {
        let prompt = self.prompt_builder.build(texts, self.policy.max_summary_lines);
        let call = self.llm.chat_simple(vec![Message::user(prompt)]);
        let response = tokio::time::timeout(self.policy.timeout, call)
            .await
            .map_err(|_| MemoryError::Timeout(self.policy.timeout.as_secs()))??;

        let mut lines = parse_summary_lines(&response);
        if lines.len() > self.policy.max_summary_lines {
            debug!(
                produced = lines.len(),
                kept = self.policy.max_summary_lines,
                "摘要行数超出上限，截断"
            );
            lines.truncate(self.policy.max_summary_lines);
        }
        Ok(lines)
    }

    /// 计算压缩后的完整记录列表：去掉最旧的一批，在末尾追加摘要记录
    pub async fn compact(
        &self,
        records: &[MemoryRecord],
        provider: &EmbeddingProvider,
    ) -> Result<Vec<MemoryRecord>> {
        let split_at = self.policy.batch.min(records.len());
        let (oldest, remainder) = records.split_at(split_at);
        let texts: Vec<String> = oldest.iter().map(|r| r.text.clone()).collect();

        let lines = self.summarize(&texts).await?;
        let vectors = provider.embed_batch(&lines).await?;

        let mut compacted = Vec::with_capacity(remainder.len() + lines.len());
        compacted.extend_from_slice(remainder);
        compacted.extend(
            lines
                .into_iter()
                .zip(vectors)
                .map(|(text, embedding)| MemoryRecord {
                    text,
                    embedding: normalized(embedding),
                }),
        );
        info!(
            summarized = oldest.len(),
            summary_lines = compacted.len() - remainder.len(),
            "🗜️ 记忆摘要完成"
        );
        Ok(compacted)
    }
}

/// 解析模型输出：去掉列表符号、编号和代码围栏，丢弃空行与占位词
pub fn parse_summary_lines(response: &str) -> Vec<String> {
    response
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with("```"))
        .map(strip_list_marker)
        .filter(|line| !is_placeholder(line))
        .map(str::to_string)
        .collect()
}

fn strip_list_marker(line: &str) -> &str {
    let line = line.trim_start_matches(['-', '*', '•', '·', '>', ' ', '\t']);
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        let rest = &line[digits..];
        for sep in ['.', ')', '、', '）', '．'] {
            if let Some(stripped) = rest.strip_prefix(sep) {
                return stripped.trim();
            }
        }
    }
    line.trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LlmError, TeraError};
    use crate::memory::MemoryStore;
    use crate::memory::store::CompactionOutcome;
    use crate::testing::{MockEmbedder, MockLlmClient};

    fn summary_of(n: usize) -> String {
        (0..n).map(|i| format!("- 摘要事实 {i}")).collect::<Vec<_>>().join("\n")
    }

    fn store_with_llm(dir: &std::path::Path, llm: Arc<MockLlmClient>) -> MemoryStore {
        let provider = Arc::new(EmbeddingProvider::ready(Arc::new(MockEmbedder::new(16))));
        MemoryStore::new(dir, provider)
            .unwrap()
            .with_compactor(Compactor::new(llm, CompactionPolicy::default()))
    }

    #[test]
    fn test_parse_summary_lines() {
        let response = "```\n- 用户喜欢猫\n2. 用户住在杭州\n3） 用户是程序员\n• 偏好深色主题\n\n无\n```";
        assert_eq!(
            parse_summary_lines(response),
            vec!["用户喜欢猫", "用户住在杭州", "用户是程序员", "偏好深色主题"]
        );
        assert!(parse_summary_lines("").is_empty());
        assert!(parse_summary_lines("空").is_empty());
        // 数字开头但不是编号的行原样保留
        assert_eq!(parse_summary_lines("2024 年去过东京"), vec!["2024 年去过东京"]);
    }

    #[test]
    fn test_default_prompt_lists_every_text() {
        let texts: Vec<String> = (0..3).map(|i| format!("fact {i}")).collect();
        let prompt = DefaultCompactionPrompt.build(&texts, 20);
        assert!(prompt.contains("不超过 20 行"));
        for t in &texts {
            assert!(prompt.contains(t.as_str()));
        }
    }

    #[tokio::test]
    async fn test_at_threshold_never_compacts() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Arc::new(MockLlmClient::new().with_response(summary_of(20)));
        let store = store_with_llm(dir.path(), llm.clone());

        for i in 0..MAX_MEMORY_ITEMS {
            store.add("A", &format!("memory {i}")).await.unwrap();
        }
        assert_eq!(store.len("A").await.unwrap(), MAX_MEMORY_ITEMS);
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_one_over_threshold_compacts() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Arc::new(MockLlmClient::new().with_response(summary_of(20)));
        let store = store_with_llm(dir.path(), llm.clone());

        for i in 0..=MAX_MEMORY_ITEMS {
            store.add("A", &format!("memory {i}")).await.unwrap();
        }
        assert_eq!(llm.call_count(), 1);

        let texts = store.list_texts("A").await.unwrap();
        assert_eq!(texts.len(), MAX_MEMORY_ITEMS - SUMMARY_BATCH + 20);
        assert_eq!(store.load_vectors("A").await.unwrap().len(), texts.len());
        // 最旧的一批被移除，剩余记录保持原序，摘要排在最后
        assert_eq!(texts[0], format!("memory {SUMMARY_BATCH}"));
        assert_eq!(texts[MAX_MEMORY_ITEMS - SUMMARY_BATCH], format!("memory {MAX_MEMORY_ITEMS}"));
        assert_eq!(texts.last().map(String::as_str), Some("摘要事实 19"));

        // 送给模型的恰好是最旧的那一批
        let prompt = &llm.last_messages().unwrap()[0].content;
        assert!(prompt.contains("- memory 0\n"));
        assert!(prompt.contains(&format!("- memory {}", SUMMARY_BATCH - 1)));
        assert!(!prompt.contains(&format!("- memory {}\n", SUMMARY_BATCH)));
    }

    #[tokio::test]
    async fn test_summary_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Arc::new(MockLlmClient::new().with_response(summary_of(35)));
        let store = store_with_llm(dir.path(), llm);
        for i in 0..=MAX_MEMORY_ITEMS {
            store.add("A", &format!("memory {i}")).await.unwrap();
        }
        assert_eq!(
            store.len("A").await.unwrap(),
            MAX_MEMORY_ITEMS - SUMMARY_BATCH + SUMMARY_MAX_LINES
        );
    }

    #[tokio::test]
    async fn test_failed_compaction_retries_later() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Arc::new(
            MockLlmClient::new()
                .with_network_error("connection reset")
                .with_response(summary_of(5)),
        );
        let store = store_with_llm(dir.path(), llm.clone());

        for i in 0..=MAX_MEMORY_ITEMS {
            store.add("A", &format!("memory {i}")).await.unwrap();
        }
        assert_eq!(llm.call_count(), 1);
        let path = store.record_path("A");
        let before = std::fs::read(&path).unwrap();

        let outcome = store.compact("A", false).await.unwrap();
        assert_eq!(
            outcome,
            CompactionOutcome::Compacted {
                before: MAX_MEMORY_ITEMS + 1,
                after: MAX_MEMORY_ITEMS + 1 - SUMMARY_BATCH + 5,
            }
        );
        assert_ne!(std::fs::read(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn test_failure_is_byte_for_byte_noop() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Arc::new(
            MockLlmClient::new().with_error(TeraError::Llm(LlmError::ApiError {
                status: 500,
                message: "boom".to_string(),
            })),
        );
        let provider = Arc::new(EmbeddingProvider::ready(Arc::new(MockEmbedder::new(16))));
        let policy = CompactionPolicy {
            max_items: 3,
            batch: 2,
            ..CompactionPolicy::default()
        };
        let store = MemoryStore::new(dir.path(), provider)
            .unwrap()
            .with_compactor(Compactor::new(llm, policy));

        for i in 0..3 {
            store.add("A", &format!("memory {i}")).await.unwrap();
        }
        let before = std::fs::read(store.record_path("A")).unwrap();

        let outcome = store.compact("A", true).await.unwrap();
        assert!(matches!(outcome, CompactionOutcome::Skipped(_)));
        assert_eq!(std::fs::read(store.record_path("A")).unwrap(), before);
        assert_eq!(store.len("A").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_summarize_times_out() {
        let llm = Arc::new(
            MockLlmClient::new()
                .with_response("late")
                .with_delay(Duration::from_millis(200)),
        );
        let policy = CompactionPolicy {
            timeout: Duration::from_millis(20),
            ..CompactionPolicy::default()
        };
        let compactor = Compactor::new(llm, policy);
        let err = compactor.summarize(&["x".to_string()]).await.unwrap_err();
        assert!(matches!(err, TeraError::Memory(MemoryError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_empty_summary_shrinks_store() {
        let provider = EmbeddingProvider::ready(Arc::new(MockEmbedder::new(4)));
        let llm = Arc::new(MockLlmClient::new().with_response("无"));
        let policy = CompactionPolicy {
            max_items: 2,
            batch: 2,
            ..CompactionPolicy::default()
        };
        let compactor = Compactor::new(llm, policy);
        let records: Vec<MemoryRecord> = (0..3)
            .map(|i| MemoryRecord {
                text: format!("r{i}"),
                embedding: vec![1.0, 0.0, 0.0, 0.0],
            })
            .collect();
        let compacted = compactor.compact(&records, &provider).await.unwrap();
        assert_eq!(compacted, records[2..].to_vec());
    }

    #[tokio::test]
    async fn test_custom_prompt() {
        let llm = Arc::new(MockLlmClient::new().with_response("one"));
        let compactor = Compactor::new(llm.clone(), CompactionPolicy::default())
            .with_prompt(FnSummaryPrompt(|texts: &[String], n: usize| {
                format!("{}|{}", n, texts.join(","))
            }));
        compactor
            .summarize(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(llm.last_messages().unwrap()[0].content, "20|a,b");
    }
}
