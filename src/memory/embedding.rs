//! 文本嵌入
//!
//! [`Embedder`] 是具体后端（远程 `/embeddings` 接口、本地 ONNX 模型、测试桩）的统一接口；
//! [`EmbeddingProvider`] 在其外包一层进程级的惰性初始化：
//!
//! - 构造时只做能力检查（后端是否编译进来、接口地址是否存在），缺失即返回
//!   [`MemoryError::ModelUnavailable`]
//! - 首次 `embed` 时才真正加载模型；并发的首批调用方等待同一次初始化
//! - 初始化失败的结果会被缓存，之后的调用直接返回同一错误，不再重试
//! - 首个向量确定维度 D，之后任何维度不同的输出都视为错误

use crate::config::{EmbeddingBackend, EmbeddingSettings, SourceConfig};
use crate::error::{MemoryError, Result, TeraError};
use crate::llm;
use async_trait::async_trait;
use futures::future::BoxFuture;
use reqwest::Client;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// 文本 → 定长向量
#[async_trait]
pub trait Embedder: Send + Sync {
    /// 批量嵌入，返回与输入一一对应的向量
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| MemoryError::Embedding("embedder returned no vector".to_string()).into())
    }

    fn model_name(&self) -> &str;
}

type EmbedderFactory = Box<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn Embedder>>> + Send + Sync>;

/// 进程内共享的嵌入提供者，构造一次后以 `Arc` 注入各组件
pub struct EmbeddingProvider {
    factory: EmbedderFactory,
    embedder: OnceCell<std::result::Result<Arc<dyn Embedder>, String>>,
    dimension: OnceLock<usize>,
}

impl EmbeddingProvider {
    /// 惰性构造：`factory` 只会在第一次使用时被调用一次
    pub fn lazy<F>(factory: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<Arc<dyn Embedder>>> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            embedder: OnceCell::new(),
            dimension: OnceLock::new(),
        }
    }

    /// 包装一个已构造好的后端
    pub fn ready(embedder: Arc<dyn Embedder>) -> Self {
        let cell = OnceCell::new_with(Some(Ok(embedder.clone())));
        Self {
            factory: Box::new(move || {
                let embedder = embedder.clone();
                Box::pin(async move { Ok::<_, TeraError>(embedder) })
            }),
            embedder: cell,
            dimension: OnceLock::new(),
        }
    }

    /// 按配置构造，并做能力检查
    pub fn from_settings(
        settings: &EmbeddingSettings,
        source: Option<&SourceConfig>,
        http: Arc<Client>,
        data_dir: &Path,
    ) -> Result<Self> {
        match settings.backend {
            EmbeddingBackend::Remote => {
                let (base_url, api_key) = settings.endpoint(source).ok_or_else(|| {
                    MemoryError::ModelUnavailable(
                        "no embedding endpoint: set memory.embedding.base_url or configure a source"
                            .to_string(),
                    )
                })?;
                info!(model = %settings.model, base_url = %base_url, "🧬 远程嵌入后端");
                Ok(Self::ready(Arc::new(HttpEmbedder::new(
                    http,
                    base_url,
                    api_key,
                    settings.model.clone(),
                ))))
            }
            EmbeddingBackend::Local => Self::local(&settings.model, data_dir),
        }
    }

    #[cfg(feature = "local-embeddings")]
    fn local(model: &str, data_dir: &Path) -> Result<Self> {
        let model = local::resolve_model(model)?;
        let cache_dir = data_dir.join("models");
        info!(model = ?model, cache = %cache_dir.display(), "🧬 本地嵌入后端（首次使用时加载）");
        Ok(Self::lazy(move || {
            let model = model.clone();
            let cache_dir = cache_dir.clone();
            Box::pin(async move {
                let loaded = tokio::task::spawn_blocking(move || {
                    local::FastEmbedder::try_new(model, cache_dir)
                })
                .await;
                let embedder: Result<Arc<dyn Embedder>> = match loaded {
                    Ok(Ok(embedder)) => Ok(Arc::new(embedder)),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(MemoryError::ModelUnavailable(e.to_string()).into()),
                };
                embedder
            })
        }))
    }

    #[cfg(not(feature = "local-embeddings"))]
    fn local(model: &str, _data_dir: &Path) -> Result<Self> {
        Err(MemoryError::ModelUnavailable(format!(
            "local embedding model '{}' requested but this build lacks the `local-embeddings` \
             feature; rebuild with `--features local-embeddings` or set memory.embedding.backend: remote",
            model
        ))
        .into())
    }

    async fn embedder(&self) -> Result<Arc<dyn Embedder>> {
        let slot = self
            .embedder
            .get_or_init(|| async {
                debug!("初始化嵌入模型");
                (self.factory)().await.map_err(|e| {
                    warn!(error = %e, "❌ 嵌入模型初始化失败");
                    e.to_string()
                })
            })
            .await;
        match slot {
            Ok(embedder) => Ok(embedder.clone()),
            Err(msg) => Err(TeraError::Memory(MemoryError::ModelUnavailable(msg.clone()))),
        }
    }

    /// 已确定的向量维度（尚未产生过向量时为 `None`）
    pub fn dimension(&self) -> Option<usize> {
        self.dimension.get().copied()
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.is_empty() {
            return Err(MemoryError::Embedding("empty embedding vector".to_string()).into());
        }
        let expected = *self.dimension.get_or_init(|| vector.len());
        if expected != vector.len() {
            return Err(MemoryError::DimensionMismatch {
                expected,
                actual: vector.len(),
            }
            .into());
        }
        Ok(())
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let vector = self.embedder().await?.embed(text).await?;
        self.check_dimension(&vector)?;
        Ok(vector)
    }

    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self.embedder().await?.embed_batch(texts).await?;
        if vectors.len() != texts.len() {
            return Err(MemoryError::Embedding(format!(
                "expected {} vectors, got {}",
                texts.len(),
                vectors.len()
            ))
            .into());
        }
        for v in &vectors {
            self.check_dimension(v)?;
        }
        Ok(vectors)
    }
}

// ── HttpEmbedder ─────────────────────────────────────────────────────────────

/// OpenAI 兼容 `/embeddings` 接口
pub struct HttpEmbedder {
    client: Arc<Client>,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpEmbedder {
    pub fn new(client: Arc<Client>, base_url: String, api_key: String, model: String) -> Self {
        Self {
            client,
            base_url,
            api_key,
            model,
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut response = llm::embeddings(
            self.client.clone(),
            &self.base_url,
            &self.api_key,
            &self.model,
            texts,
        )
        .await?;
        response.data.sort_by_key(|d| d.index);
        Ok(response.data.into_iter().map(|d| d.embedding).collect())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ── FastEmbedder ─────────────────────────────────────────────────────────────

#[cfg(feature = "local-embeddings")]
mod local {
    use super::Embedder;
    use crate::error::{MemoryError, Result};
    use async_trait::async_trait;
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    pub(super) fn resolve_model(name: &str) -> Result<EmbeddingModel> {
        let lower = name.to_ascii_lowercase();
        let short = lower.rsplit('/').next().unwrap_or(&lower);
        match short {
            "bge-small-zh-v1.5" => Ok(EmbeddingModel::BGESmallZHV15),
            "bge-small-en-v1.5" => Ok(EmbeddingModel::BGESmallENV15),
            "all-minilm-l6-v2" => Ok(EmbeddingModel::AllMiniLML6V2),
            "multilingual-e5-small" => Ok(EmbeddingModel::MultilingualE5Small),
            _ => Err(MemoryError::ModelUnavailable(format!(
                "unsupported local embedding model '{}' (supported: bge-small-zh-v1.5, \
                 bge-small-en-v1.5, all-minilm-l6-v2, multilingual-e5-small)",
                name
            ))
            .into()),
        }
    }

    /// fastembed ONNX 推理，CPU 密集调用放到 blocking 线程池
    pub(super) struct FastEmbedder {
        model: Arc<Mutex<TextEmbedding>>,
        name: String,
    }

    impl FastEmbedder {
        pub(super) fn try_new(model: EmbeddingModel, cache_dir: PathBuf) -> Result<Self> {
            let name = format!("{:?}", model);
            let options = InitOptions::new(model)
                .with_cache_dir(cache_dir)
                .with_show_download_progress(false);
            let embedding = TextEmbedding::try_new(options)
                .map_err(|e| MemoryError::ModelUnavailable(e.to_string()))?;
            Ok(Self {
                model: Arc::new(Mutex::new(embedding)),
                name,
            })
        }
    }

    #[async_trait]
    impl Embedder for FastEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let model = self.model.clone();
            let texts = texts.to_vec();
            tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
                let mut guard = model
                    .lock()
                    .map_err(|_| MemoryError::Embedding("embedding model lock poisoned".to_string()))?;
                guard
                    .embed(texts, None)
                    .map_err(|e| MemoryError::Embedding(e.to_string()).into())
            })
            .await
            .map_err(|e| MemoryError::Embedding(e.to_string()))?
        }

        fn model_name(&self) -> &str {
            &self.name
        }
    }
}
