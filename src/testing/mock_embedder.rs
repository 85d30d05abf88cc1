//! 确定性的 Mock 嵌入后端
//!
//! 把文本按字符与相邻字符对散列进固定维度的计数向量。共享字符越多的两段文本向量越接近，
//! 足以验证检索排序，又不需要加载任何模型。输出**不做**归一化，便于检验调用方的归一化逻辑。

use crate::error::{MemoryError, Result};
use crate::memory::Embedder;
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub struct MockEmbedder {
    dim: usize,
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl MockEmbedder {
    pub fn new(dim: usize) -> Self {
        Self {
            dim: dim.max(1),
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    /// 之后的每次调用都返回嵌入错误
    pub fn failing(self) -> Self {
        self.failing.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// `embed_batch` 被调用的次数
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 与 `embed` 相同的向量，但不计入调用次数
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];
        let chars: Vec<char> = text.to_lowercase().chars().filter(|c| !c.is_whitespace()).collect();
        for c in &chars {
            vector[self.bucket(c)] += 1.0;
        }
        for pair in chars.windows(2) {
            vector[self.bucket(&(pair[0], pair[1]))] += 0.5;
        }
        vector
    }

    fn bucket<T: Hash + ?Sized>(&self, value: &T) -> usize {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        (hasher.finish() % self.dim as u64) as usize
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(MemoryError::Embedding("mock embedder failure".to_string()).into());
        }
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn model_name(&self) -> &str {
        "mock-embedder"
    }
}
