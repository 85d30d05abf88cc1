use std::fmt;

/// Tera 的统一错误类型
#[derive(Debug)]
pub enum TeraError {
    /// LLM 相关错误
    Llm(LlmError),
    /// 记忆子系统错误
    Memory(MemoryError),
    /// 配置错误
    Config(ConfigError),
    /// IO 错误
    Io(std::io::Error),
    /// 解析错误（JSON / SSE 帧等）
    Parse(String),
    /// 其他错误
    Other(String),
}

/// LLM 相关错误
#[derive(Debug)]
pub enum LlmError {
    /// 网络请求失败
    NetworkError(String),
    /// API 返回错误状态码
    ApiError { status: u16, message: String },
    /// 响应格式无效
    InvalidResponse(String),
    /// 没有返回内容
    EmptyResponse,
}

/// 记忆子系统错误
#[derive(Debug)]
pub enum MemoryError {
    /// 嵌入模型或其运行时不可用（致命配置错误，不重试）
    ModelUnavailable(String),
    /// 向量维度与该角色已有记录不一致
    DimensionMismatch { expected: usize, actual: usize },
    /// 外部模型调用超过等待上限（秒）
    Timeout(u64),
    /// 嵌入计算失败
    Embedding(String),
    /// 文件读写失败
    IoError(String),
    /// 序列化/反序列化失败
    SerializationError(String),
}

/// 配置错误
#[derive(Debug)]
pub enum ConfigError {
    /// 配置解析失败
    ParseFailed(String),
    /// 环境变量格式不符合 `TERA_SOURCE_<ID>_<KEY>`
    EnvFormatError(String),
    /// 环境变量中出现未知的配置项
    UnknownKey { key: String, var: String },
    /// 某个源缺少必需字段
    MissingField { source: String, field: String },
    /// 尚未配置任何可用源
    NoActiveSource,
    /// 指定的源不存在
    SourceNotFound(String),
    /// 指定的角色不存在
    CharacterNotFound(String),
}

impl fmt::Display for TeraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeraError::Llm(e) => write!(f, "LLM Error: {}", e),
            TeraError::Memory(e) => write!(f, "Memory Error: {}", e),
            TeraError::Config(e) => write!(f, "Config Error: {}", e),
            TeraError::Io(e) => write!(f, "IO Error: {}", e),
            TeraError::Parse(msg) => write!(f, "Parse Error: {}", msg),
            TeraError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            LlmError::ApiError { status, message } => {
                write!(f, "API error (status {}): {}", status, message)
            }
            LlmError::InvalidResponse(msg) => write!(f, "Invalid response: {}", msg),
            LlmError::EmptyResponse => write!(f, "Empty response from LLM"),
        }
    }
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::ModelUnavailable(msg) => {
                write!(f, "Embedding model unavailable: {}", msg)
            }
            MemoryError::DimensionMismatch { expected, actual } => write!(
                f,
                "Embedding dimension mismatch: store has {}, got {}",
                expected, actual
            ),
            MemoryError::Timeout(secs) => write!(f, "Model call timed out after {}s", secs),
            MemoryError::Embedding(msg) => write!(f, "Embedding failed: {}", msg),
            MemoryError::IoError(msg) => write!(f, "Memory IO error: {}", msg),
            MemoryError::SerializationError(msg) => {
                write!(f, "Memory serialization error: {}", msg)
            }
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ParseFailed(msg) => write!(f, "Failed to parse config: {}", msg),
            ConfigError::EnvFormatError(var) => {
                write!(f, "Malformed env var '{}', expected TERA_SOURCE_<ID>_<KEY>", var)
            }
            ConfigError::UnknownKey { key, var } => {
                write!(f, "Unknown source key '{}' in env var '{}'", key, var)
            }
            ConfigError::MissingField { source, field } => {
                write!(f, "Source '{}' is missing field '{}'", source, field)
            }
            ConfigError::NoActiveSource => {
                write!(f, "No active source configured, add one to config.yaml")
            }
            ConfigError::SourceNotFound(name) => write!(f, "Source '{}' not found", name),
            ConfigError::CharacterNotFound(name) => write!(f, "Character '{}' not found", name),
        }
    }
}

impl std::error::Error for TeraError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TeraError::Io(e) => Some(e),
            TeraError::Llm(e) => Some(e),
            TeraError::Memory(e) => Some(e),
            TeraError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl std::error::Error for LlmError {}
impl std::error::Error for MemoryError {}
impl std::error::Error for ConfigError {}

impl TeraError {
    /// 是否为致命的嵌入模型缺失错误
    pub fn is_model_unavailable(&self) -> bool {
        matches!(self, TeraError::Memory(MemoryError::ModelUnavailable(_)))
    }
}

// From 转换实现
impl From<std::io::Error> for TeraError {
    fn from(err: std::io::Error) -> Self {
        TeraError::Io(err)
    }
}

impl From<reqwest::Error> for TeraError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TeraError::Llm(LlmError::NetworkError("Request timeout".to_string()))
        } else if err.is_connect() {
            TeraError::Llm(LlmError::NetworkError(format!(
                "Connection failed: {}",
                err
            )))
        } else {
            TeraError::Llm(LlmError::NetworkError(err.to_string()))
        }
    }
}

impl From<serde_json::Error> for TeraError {
    fn from(err: serde_json::Error) -> Self {
        TeraError::Parse(err.to_string())
    }
}

impl From<serde_yaml::Error> for TeraError {
    fn from(err: serde_yaml::Error) -> Self {
        TeraError::Config(ConfigError::ParseFailed(err.to_string()))
    }
}

impl From<LlmError> for TeraError {
    fn from(err: LlmError) -> Self {
        TeraError::Llm(err)
    }
}

impl From<MemoryError> for TeraError {
    fn from(err: MemoryError) -> Self {
        TeraError::Memory(err)
    }
}

impl From<ConfigError> for TeraError {
    fn from(err: ConfigError) -> Self {
        TeraError::Config(err)
    }
}

// 便捷的 Result 类型别名
pub type Result<T> = std::result::Result<T, TeraError>;
