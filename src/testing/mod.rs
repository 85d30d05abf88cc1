//! 测试基础设施
//!
//! 提供在不依赖真实 LLM / 嵌入模型的情况下测试 tera 各组件的工具集。
//!
//! | 类型 | 用途 |
//! |------|------|
//! | [`MockLlmClient`] | 替代真实 LLM，用于测试 `Compactor`、`MemoryExtractor` 等依赖 `LlmClient` 的组件 |
//! | [`MockEmbedder`] | 确定性的嵌入后端，用于测试记忆库与检索 |
//!
//! # 设计原则
//!
//! - **零网络请求**：所有 Mock 都完全在内存中运行
//! - **可脚本化**：通过 `with_response()` / `with_error()` 精确控制返回值
//! - **可观测**：通过 `call_count()` / `last_messages()` 检查调用情况
//!
//! # 使用示例
//!
//! ```rust,no_run
//! use tera_chat::testing::{MockEmbedder, MockLlmClient};
//! use tera_chat::memory::{CompactionPolicy, Compactor, EmbeddingProvider, MemoryStore};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> tera_chat::error::Result<()> {
//! let llm = Arc::new(MockLlmClient::new().with_response("- 用户喜欢猫\n- 用户住在杭州"));
//! let provider = Arc::new(EmbeddingProvider::ready(Arc::new(MockEmbedder::new(32))));
//! let store = MemoryStore::new("/tmp/tera-test", provider)?
//!     .with_compactor(Compactor::new(llm.clone(), CompactionPolicy::default()));
//!
//! store.add("小雪", "用户喜欢猫").await?;
//! assert_eq!(llm.call_count(), 0); // 未超过阈值，不压缩
//! # Ok(())
//! # }
//! ```

mod mock_embedder;
mod mock_llm;

pub use mock_embedder::MockEmbedder;
pub use mock_llm::MockLlmClient;
