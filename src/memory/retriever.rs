//! 相似度检索
//!
//! 线性扫描：查询向量与存储向量都先归一化为单位长度，点积即余弦相似度，
//! 按分数降序取前 K 条。分数相同时存储位置靠前的记录优先。
//!
//! 本 crate 写入的向量已经归一化，但旧版本或手工编辑过的记忆文件可能不是，
//! 所以检索时总是重新归一化。

use crate::error::{MemoryError, Result};
use crate::memory::store::MemoryStore;
use crate::memory::{dot, normalized};
use tracing::debug;

/// 对 `vectors` 按与 `query` 的相似度排序，返回前 `top_k` 个 `(下标, 分数)`
///
/// 排序稳定：分数相等的两条记录保持原有先后顺序。
pub fn rank_by_similarity(vectors: &[Vec<f32>], query: &[f32], top_k: usize) -> Vec<(usize, f32)> {
    let mut scored: Vec<(usize, f32)> = vectors
        .iter()
        .enumerate()
        .map(|(i, v)| (i, dot(v, query)))
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(top_k);
    scored
}

impl MemoryStore {
    /// 取与 `query` 最相关的至多 `top_k` 条记忆文本，最相关的在前
    pub async fn retrieve(&self, identity: &str, query: &str, top_k: usize) -> Result<Vec<String>> {
        Ok(self
            .retrieve_scored(identity, query, top_k)
            .await?
            .into_iter()
            .map(|(text, _)| text)
            .collect())
    }

    /// 同 [`retrieve`](Self::retrieve)，附带相似度分数
    ///
    /// 空白查询不调用嵌入模型，所有记录分数为 0，按存储顺序返回。
    pub async fn retrieve_scored(
        &self,
        identity: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<(String, f32)>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        // 文本与向量来自同一份快照
        let records = self.load_records(identity).await?;
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let dim = records[0].embedding.len();
        let query_vector = if query.trim().is_empty() {
            vec![0.0; dim]
        } else {
            normalized(self.provider().embed(query).await?)
        };
        if query_vector.len() != dim {
            return Err(MemoryError::DimensionMismatch {
                expected: dim,
                actual: query_vector.len(),
            }
            .into());
        }

        let vectors: Vec<Vec<f32>> = records
            .iter()
            .map(|r| normalized(r.embedding.clone()))
            .collect();
        let ranked = rank_by_similarity(&vectors, &query_vector, top_k);
        debug!(identity = %identity, candidates = records.len(), hits = ranked.len(), "🔍 记忆检索");

        Ok(ranked
            .into_iter()
            .map(|(i, score)| (records[i].text.clone(), score))
            .collect())
    }
}
