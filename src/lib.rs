pub mod chat;
pub mod config;
pub mod error;
pub mod llm;
pub mod memory;
pub mod testing;

pub mod prelude {
    pub use crate::chat::{Character, ChatSession};
    pub use crate::config::AppConfig;
    pub use crate::error::{Result, TeraError};
    pub use crate::llm::{DefaultLlmClient, LlmClient};
    pub use crate::memory::{EmbeddingProvider, MemoryManager, MemoryStore};
}
