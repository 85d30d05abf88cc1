//! 按角色隔离的记忆库
//!
//! 每个角色一个 JSONL 文件，每行一条 [`MemoryRecord`]：
//!
//! ```json
//! {"text":"用户偏好深色主题","embedding":[0.013,-0.087,...]}
//! ```
//!
//! 文本与向量同处一行，因此"文本列表"与"向量矩阵"天然同序同长，读取时总是从同一份
//! 快照派生，不存在两份文件错位的问题。
//!
//! - 插入：只追加一行。进程崩溃最多丢失（或截断）最后一行，读取时坏行被跳过
//! - 压缩：整文件重写到临时文件后 `rename` 覆盖，读者看到的要么是旧文件要么是新文件
//! - 并发：同一角色的写操作（追加、压缩）由该角色专属的异步锁串行化；读操作不加锁

use crate::error::{MemoryError, Result};
use crate::memory::compactor::Compactor;
use crate::memory::embedding::EmbeddingProvider;
use crate::memory::{MemoryRecord, file_stem, is_placeholder, normalized};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// 压缩检查的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactionOutcome {
    /// 未超过阈值
    NotNeeded,
    /// 已压缩：`before` 条 → `after` 条
    Compacted { before: usize, after: usize },
    /// 外部调用失败，记忆库保持原样，下次插入时重试
    Skipped(String),
}

/// 一次完整读取得到的快照
struct Snapshot {
    records: Vec<MemoryRecord>,
    /// 文件非空且末尾缺少换行（上次写入被截断）
    needs_newline: bool,
}

pub struct MemoryStore {
    dir: PathBuf,
    provider: Arc<EmbeddingProvider>,
    compactor: Option<Compactor>,
    /// file_stem → 写锁
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MemoryStore {
    /// 打开（或创建）记忆目录
    pub fn new(dir: impl AsRef<Path>, provider: Arc<EmbeddingProvider>) -> Result<Self> {
        let dir = crate::config::expand_tilde(dir.as_ref());
        std::fs::create_dir_all(&dir)
            .map_err(|e| MemoryError::IoError(format!("创建目录失败: {e}")))?;
        info!(path = %dir.display(), "🧠 MemoryStore 初始化");
        Ok(Self {
            dir,
            provider,
            compactor: None,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// 启用插入后的自动压缩
    pub fn with_compactor(mut self, compactor: Compactor) -> Self {
        self.compactor = Some(compactor);
        self
    }

    pub fn provider(&self) -> &Arc<EmbeddingProvider> {
        &self.provider
    }

    pub fn compactor(&self) -> Option<&Compactor> {
        self.compactor.as_ref()
    }

    pub fn record_path(&self, identity: &str) -> PathBuf {
        self.dir.join(format!("memory_{}.jsonl", file_stem(identity)))
    }

    fn lock_for(&self, identity: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(file_stem(identity)).or_default().clone()
    }

    // ── 读取 ──────────────────────────────────────────────────────────────────

    async fn read_snapshot(&self, identity: &str) -> Result<Snapshot> {
        let path = self.record_path(identity);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Snapshot {
                    records: Vec::new(),
                    needs_newline: false,
                });
            }
            Err(e) => {
                return Err(MemoryError::IoError(format!("读取记忆文件失败: {e}")).into());
            }
        };

        let mut records: Vec<MemoryRecord> = Vec::new();
        let mut skipped = 0usize;
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<MemoryRecord>(line) {
                Ok(record) if !record.embedding.is_empty() => {
                    let dim = records.first().map(|r| r.embedding.len());
                    if dim.is_some_and(|d| d != record.embedding.len()) {
                        skipped += 1;
                        continue;
                    }
                    records.push(record);
                }
                _ => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!(identity = %identity, skipped, "跳过无法解析的记忆行");
        }
        Ok(Snapshot {
            records,
            needs_newline: !raw.is_empty() && !raw.ends_with('\n'),
        })
    }

    /// 全部记录（存储顺序）；从未写入过的角色返回空
    pub async fn load_records(&self, identity: &str) -> Result<Vec<MemoryRecord>> {
        Ok(self.read_snapshot(identity).await?.records)
    }

    /// 文本列表，与 [`load_vectors`](Self::load_vectors) 同序
    pub async fn list_texts(&self, identity: &str) -> Result<Vec<String>> {
        Ok(self
            .load_records(identity)
            .await?
            .into_iter()
            .map(|r| r.text)
            .collect())
    }

    /// 向量矩阵（每行一条记录）；尚无记录时为空
    pub async fn load_vectors(&self, identity: &str) -> Result<Vec<Vec<f32>>> {
        Ok(self
            .load_records(identity)
            .await?
            .into_iter()
            .map(|r| r.embedding)
            .collect())
    }

    pub async fn len(&self, identity: &str) -> Result<usize> {
        Ok(self.load_records(identity).await?.len())
    }

    pub async fn is_empty(&self, identity: &str) -> Result<bool> {
        Ok(self.len(identity).await? == 0)
    }

    // ── 写入 ──────────────────────────────────────────────────────────────────

    /// 写入一条记忆。空文本和占位词静默忽略；写入成功后做压缩检查。
    ///
    /// 压缩失败不影响本次插入的结果，只记录警告。
    pub async fn add(&self, identity: &str, text: &str) -> Result<()> {
        let clean = text.trim();
        if is_placeholder(clean) {
            debug!(identity = %identity, text = %clean, "跳过空记忆");
            return Ok(());
        }

        let embedding = normalized(self.provider.embed(clean).await?);
        let record = MemoryRecord {
            text: clean.to_string(),
            embedding,
        };

        let lock = self.lock_for(identity);
        let _guard = lock.lock().await;

        let snapshot = self.read_snapshot(identity).await?;
        if let Some(first) = snapshot.records.first()
            && first.embedding.len() != record.embedding.len()
        {
            return Err(MemoryError::DimensionMismatch {
                expected: first.embedding.len(),
                actual: record.embedding.len(),
            }
            .into());
        }

        self.append(identity, &record, snapshot.needs_newline).await?;
        debug!(identity = %identity, count = snapshot.records.len() + 1, "💡 写入记忆");

        let mut records = snapshot.records;
        records.push(record);
        match self.compact_locked(identity, records, false).await {
            CompactionOutcome::Skipped(reason) => {
                warn!(identity = %identity, reason = %reason, "⚠️ 记忆压缩跳过，下次写入时重试");
            }
            CompactionOutcome::Compacted { before, after } => {
                info!(identity = %identity, before, after, "🗜️ 记忆已压缩");
            }
            CompactionOutcome::NotNeeded => {}
        }
        Ok(())
    }

    /// 手动触发压缩；`force` 为真时忽略阈值
    pub async fn compact(&self, identity: &str, force: bool) -> Result<CompactionOutcome> {
        let lock = self.lock_for(identity);
        let _guard = lock.lock().await;
        let records = self.read_snapshot(identity).await?.records;
        Ok(self.compact_locked(identity, records, force).await)
    }

    /// 调用方必须持有该角色的写锁
    async fn compact_locked(
        &self,
        identity: &str,
        records: Vec<MemoryRecord>,
        force: bool,
    ) -> CompactionOutcome {
        let Some(compactor) = &self.compactor else {
            return CompactionOutcome::NotNeeded;
        };
        if records.is_empty() || !(force || compactor.should_compact(records.len())) {
            return CompactionOutcome::NotNeeded;
        }

        let before = records.len();
        let compacted = match compactor.compact(&records, &self.provider).await {
            Ok(compacted) => compacted,
            Err(e) => return CompactionOutcome::Skipped(e.to_string()),
        };
        if let Err(e) = self.rewrite(identity, &compacted).await {
            return CompactionOutcome::Skipped(e.to_string());
        }
        CompactionOutcome::Compacted {
            before,
            after: compacted.len(),
        }
    }

    async fn append(&self, identity: &str, record: &MemoryRecord, needs_newline: bool) -> Result<()> {
        let mut line = serde_json::to_string(record)
            .map_err(|e| MemoryError::SerializationError(e.to_string()))?;
        line.push('\n');
        if needs_newline {
            line.insert(0, '\n');
        }

        let path = self.record_path(identity);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| MemoryError::IoError(format!("打开记忆文件失败: {e}")))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| MemoryError::IoError(format!("写入记忆文件失败: {e}")))?;
        file.sync_data()
            .await
            .map_err(|e| MemoryError::IoError(format!("同步记忆文件失败: {e}")))?;
        Ok(())
    }

    /// 整体替换：写临时文件 → fsync → rename
    async fn rewrite(&self, identity: &str, records: &[MemoryRecord]) -> Result<()> {
        let mut body = String::new();
        for record in records {
            body.push_str(
                &serde_json::to_string(record)
                    .map_err(|e| MemoryError::SerializationError(e.to_string()))?,
            );
            body.push('\n');
        }

        let path = self.record_path(identity);
        let tmp = self.dir.join(format!(
            ".memory_{}.{}.tmp",
            file_stem(identity),
            uuid::Uuid::new_v4()
        ));

        let written = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(body.as_bytes()).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &path).await
        }
        .await;

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(MemoryError::IoError(format!("重写记忆文件失败: {e}")).into());
        }
        debug!(path = %path.display(), records = records.len(), "💾 记忆文件已重写");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TeraError;
    use crate::memory::dot;
    use crate::testing::MockEmbedder;

    fn store_in(dir: &Path) -> MemoryStore {
        let provider = Arc::new(EmbeddingProvider::ready(Arc::new(MockEmbedder::new(16))));
        MemoryStore::new(dir, provider).unwrap()
    }

    #[tokio::test]
    async fn test_add_appends_last_and_keeps_lockstep() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        store.add("A", "用户喜欢喝咖啡").await.unwrap();
        store.add("A", "  用户住在杭州  ").await.unwrap();

        let texts = store.list_texts("A").await.unwrap();
        assert_eq!(texts.last().map(String::as_str), Some("用户住在杭州"));
        let vectors = store.load_vectors("A").await.unwrap();
        assert_eq!(texts.len(), vectors.len());
        for v in &vectors {
            assert!((dot(v, v) - 1.0).abs() < 1e-5, "向量应已归一化");
        }
    }

    #[tokio::test]
    async fn test_placeholders_are_noops() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.add("A", "真实的记忆").await.unwrap();

        for text in ["空", "  None ", "NULL", "无", "", "   "] {
            store.add("A", text).await.unwrap();
        }
        assert_eq!(store.len("A").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unknown_identity_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(store.list_texts("nobody").await.unwrap().is_empty());
        assert!(store.load_vectors("nobody").await.unwrap().is_empty());
        assert!(store.is_empty("nobody").await.unwrap());
    }

    #[tokio::test]
    async fn test_identities_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.add("A", "alpha").await.unwrap();
        store.add("B", "beta").await.unwrap();
        assert_eq!(store.list_texts("A").await.unwrap(), vec!["alpha"]);
        assert_eq!(store.list_texts("B").await.unwrap(), vec!["beta"]);
    }

    #[tokio::test]
    async fn test_lookalike_identities_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let names = ["a/b", "a:b", "a_b"];
        for name in names {
            store.add(name, &format!("fact of {name}")).await.unwrap();
        }
        for name in names {
            assert_eq!(store.list_texts(name).await.unwrap(), vec![format!("fact of {name}")]);
        }
    }

    #[tokio::test]
    async fn test_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (texts, vectors) = {
            let store = store_in(dir.path());
            for t in ["one", "two", "three"] {
                store.add("A", t).await.unwrap();
            }
            (
                store.list_texts("A").await.unwrap(),
                store.load_vectors("A").await.unwrap(),
            )
        };

        let reopened = store_in(dir.path());
        assert_eq!(reopened.list_texts("A").await.unwrap(), texts);
        let reloaded = reopened.load_vectors("A").await.unwrap();
        assert_eq!(reloaded.len(), vectors.len());
        for (a, b) in reloaded.iter().zip(&vectors) {
            for (x, y) in a.iter().zip(b) {
                assert!((x - y).abs() < 1e-6);
            }
        }
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.add("A", "good one").await.unwrap();

        let path = store.record_path("A");
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("not json at all\n{\"text\":\"no vector\",\"embedding\":[]}\n");
        // 模拟崩溃导致的半行
        raw.push_str("{\"text\":\"trunc");
        std::fs::write(&path, raw).unwrap();

        assert_eq!(store.list_texts("A").await.unwrap(), vec!["good one"]);

        // 截断行之后的追加不能与之粘连
        store.add("A", "after crash").await.unwrap();
        assert_eq!(
            store.list_texts("A").await.unwrap(),
            vec!["good one", "after crash"]
        );
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        store_in(dir.path()).add("A", "sixteen dims").await.unwrap();

        let provider = Arc::new(EmbeddingProvider::ready(Arc::new(MockEmbedder::new(8))));
        let other = MemoryStore::new(dir.path(), provider).unwrap();
        let err = other.add("A", "eight dims").await.unwrap_err();
        assert!(matches!(
            err,
            TeraError::Memory(MemoryError::DimensionMismatch { expected: 16, actual: 8 })
        ));
        assert_eq!(other.len("A").await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_same_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store_in(dir.path()));

        let mut handles = Vec::new();
        for worker in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    store.add("A", &format!("worker {worker} fact {i}")).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let texts = store.list_texts("A").await.unwrap();
        assert_eq!(texts.len(), 100);
        assert_eq!(store.load_vectors("A").await.unwrap().len(), 100);
    }

    #[tokio::test]
    async fn test_identity_with_path_separators_stays_in_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.add("../evil/name", "x").await.unwrap();
        let path = store.record_path("../evil/name");
        assert_eq!(path.parent(), Some(dir.path()));
        assert!(path.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_compaction_never_interleaves_with_appends() {
        use crate::memory::compactor::CompactionPolicy;
        use crate::testing::MockLlmClient;
        use std::collections::HashMap;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let summaries: Vec<String> = (0..64).map(|k| format!("压缩摘要 {k}")).collect();
        let llm = Arc::new(
            MockLlmClient::new()
                .with_responses(summaries.clone())
                .with_delay(Duration::from_millis(10)),
        );
        let policy = CompactionPolicy {
            max_items: 5,
            batch: 3,
            ..CompactionPolicy::default()
        };
        let provider = Arc::new(EmbeddingProvider::ready(Arc::new(MockEmbedder::new(16))));
        let store = Arc::new(
            MemoryStore::new(dir.path(), provider)
                .unwrap()
                .with_compactor(Compactor::new(llm.clone(), policy)),
        );

        // 4 个后台任务加上前台各写 10 条
        let mut handles = Vec::new();
        for worker in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    store.add("A", &format!("worker {worker} fact {i}")).await.unwrap();
                }
            }));
        }
        for i in 0..10 {
            store.add("A", &format!("foreground fact {i}")).await.unwrap();
        }
        for h in handles {
            h.await.unwrap();
        }

        // 每次压缩: 6 条 → 3 条剩余 + 1 条摘要 = 4 条；50 次写入共压缩 (50 - 4) / 2 次
        let compactions = llm.call_count();
        assert_eq!(compactions, 23);
        let texts = store.list_texts("A").await.unwrap();
        assert_eq!(texts.len(), 50 - 2 * compactions);

        // 每条写入过的文本要么仍在库中，要么恰好被一次压缩取走
        let mut expected: HashMap<String, i32> = HashMap::new();
        for worker in 0..4 {
            for i in 0..10 {
                *expected.entry(format!("worker {worker} fact {i}")).or_default() += 1;
            }
        }
        for i in 0..10 {
            *expected.entry(format!("foreground fact {i}")).or_default() += 1;
        }
        for summary in &summaries[..compactions] {
            *expected.entry(summary.clone()).or_default() += 1;
        }
        for call in llm.all_calls() {
            let batch: Vec<&str> = call[0]
                .content
                .lines()
                .filter_map(|line| line.strip_prefix("- "))
                .collect();
            assert_eq!(batch.len(), 3);
            for text in batch {
                *expected.entry(text.to_string()).or_default() -= 1;
            }
        }
        let mut remaining: HashMap<String, i32> = HashMap::new();
        for text in texts {
            *remaining.entry(text).or_default() += 1;
        }
        expected.retain(|_, n| *n != 0);
        assert_eq!(remaining, expected);
    }
}
