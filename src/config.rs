//! 配置加载
//!
//! 配置来自两处，后者覆盖前者：
//!
//! 1. `<data_dir>/config.yaml`（缺省字段全部有默认值，文件不存在时视为空配置）
//! 2. 环境变量（含 `.env`），格式：
//!
//! ```text
//! TERA_SOURCE_<ID>_MODEL=gpt-4o
//! TERA_SOURCE_<ID>_BASEURL=https://api.openai.com/v1
//! TERA_SOURCE_<ID>_APIKEY=sk-...
//! ```
//!
//! `<ID>` 为源名称，不区分大小写。数据目录由 `TERA_DATA_DIR` 指定，默认 `~/.tera`。

use crate::chat::Character;
use crate::error::{ConfigError, Result, TeraError};
use dotenv::dotenv;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const DEFAULT_CHARACTER: &str = "default";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const CONFIG_FILENAME: &str = "config.yaml";

const ENV_PREFIX: &str = "TERA_SOURCE_";
const DATA_DIR_ENV: &str = "TERA_DATA_DIR";

/// 单个 LLM API 源的连接配置
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SourceConfig {
    /// OpenAI 兼容接口根地址（如 `https://api.openai.com/v1`）
    pub base_url: String,
    pub api_key: String,
    /// 对话使用的模型名
    pub model: String,
}

/// 嵌入后端
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// OpenAI 兼容 `/embeddings` 接口
    #[default]
    Remote,
    /// 本地 ONNX 模型（需启用 `local-embeddings` feature）
    Local,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub backend: EmbeddingBackend,
    pub model: String,
    /// 为空时沿用当前对话源的地址
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// 为空时沿用当前对话源的密钥
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::Remote,
            model: "text-embedding-3-small".to_string(),
            base_url: None,
            api_key: None,
        }
    }
}

impl EmbeddingSettings {
    /// 解析远程嵌入接口的 (base_url, api_key)，未单独配置的部分取自对话源
    pub fn endpoint(&self, source: Option<&SourceConfig>) -> Option<(String, String)> {
        let base_url = self
            .base_url
            .clone()
            .or_else(|| source.map(|s| s.base_url.clone()))?;
        let api_key = self
            .api_key
            .clone()
            .or_else(|| source.map(|s| s.api_key.clone()))
            .unwrap_or_default();
        Some((base_url, api_key))
    }
}

/// 长期记忆相关设置
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MemorySettings {
    pub enabled: bool,
    /// 记录数超过该值时触发压缩
    pub max_items: usize,
    /// 每次压缩取出的最旧记录数
    pub summary_batch: usize,
    /// 压缩摘要最多保留的行数
    pub summary_max_lines: usize,
    /// 每轮对话注入的相关记忆条数
    pub top_k: usize,
    /// 记忆提取时最多发送的历史轮数
    pub extraction_window: usize,
    /// 压缩/提取时等待模型的上限（秒）
    pub llm_timeout_secs: u64,
    pub embedding: EmbeddingSettings,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_items: 500,
            summary_batch: 100,
            summary_max_lines: 20,
            top_k: 5,
            extraction_window: 100,
            llm_timeout_secs: 60,
            embedding: EmbeddingSettings::default(),
        }
    }
}

/// 应用配置
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    /// 数据目录（记忆、聊天日志、配置文件所在位置），不写入文件
    #[serde(skip)]
    pub data_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_source: Option<String>,
    pub sources: BTreeMap<String, SourceConfig>,
    pub active_character: String,
    /// 角色名 -> 角色设定
    pub characters: BTreeMap<String, String>,
    pub memory: MemorySettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut characters = BTreeMap::new();
        characters.insert(DEFAULT_CHARACTER.to_string(), String::new());
        Self {
            data_dir: PathBuf::new(),
            active_source: None,
            sources: BTreeMap::new(),
            active_character: DEFAULT_CHARACTER.to_string(),
            characters,
            memory: MemorySettings::default(),
        }
    }
}

impl AppConfig {
    /// 从默认数据目录加载配置，并叠加 `.env` 与环境变量中的源定义
    pub fn load_default() -> Result<Self> {
        dotenv().ok();
        let data_dir = default_data_dir();
        let mut config = Self::load(&data_dir)?;
        config.apply_env(std::env::vars())?;
        Ok(config)
    }

    /// 从指定数据目录加载 `config.yaml`（不读取环境变量）
    pub fn load(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = expand_tilde(data_dir.as_ref());
        std::fs::create_dir_all(&data_dir)?;
        let path = data_dir.join(CONFIG_FILENAME);
        let mut config: AppConfig = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                AppConfig::default()
            } else {
                serde_yaml::from_str(&raw)?
            }
        } else {
            AppConfig::default()
        };
        config
            .characters
            .entry(DEFAULT_CHARACTER.to_string())
            .or_default();
        config.data_dir = data_dir;
        info!(
            path = %path.display(),
            sources = config.sources.len(),
            memory = config.memory.enabled,
            "⚙️ 配置已加载"
        );
        Ok(config)
    }

    /// 将配置写回 `<data_dir>/config.yaml`
    pub fn save(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        let path = self.data_dir.join(CONFIG_FILENAME);
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(&path, yaml)?;
        debug!(path = %path.display(), "💾 配置已保存");
        Ok(())
    }

    /// 叠加 `TERA_SOURCE_<ID>_<KEY>` 形式的源定义
    pub fn apply_env(&mut self, vars: impl IntoIterator<Item = (String, String)>) -> Result<()> {
        let mut overrides: HashMap<String, HashMap<String, String>> = HashMap::new();
        for (key, value) in vars {
            let Some(suffix) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let parts: Vec<&str> = suffix.split('_').collect();
            if parts.len() != 2 || parts[0].is_empty() {
                return Err(TeraError::Config(ConfigError::EnvFormatError(key)));
            }
            let source_id = parts[0].to_lowercase();
            let field = parts[1].to_lowercase();
            match field.as_str() {
                "model" | "baseurl" | "apikey" => {}
                _ => {
                    return Err(TeraError::Config(ConfigError::UnknownKey { key: field, var: key }));
                }
            }
            overrides.entry(source_id).or_default().insert(field, value);
        }

        for (source_id, fields) in overrides {
            let source = match self.sources.get(&source_id) {
                Some(existing) => SourceConfig {
                    base_url: fields
                        .get("baseurl")
                        .cloned()
                        .unwrap_or_else(|| existing.base_url.clone()),
                    api_key: fields
                        .get("apikey")
                        .cloned()
                        .unwrap_or_else(|| existing.api_key.clone()),
                    model: fields
                        .get("model")
                        .cloned()
                        .unwrap_or_else(|| existing.model.clone()),
                },
                None => {
                    let api_key = fields.get("apikey").cloned().ok_or_else(|| {
                        ConfigError::MissingField {
                            source: source_id.clone(),
                            field: "apikey".to_string(),
                        }
                    })?;
                    SourceConfig {
                        base_url: fields
                            .get("baseurl")
                            .cloned()
                            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
                        api_key,
                        model: fields
                            .get("model")
                            .cloned()
                            .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
                    }
                }
            };
            debug!(source = %source_id, "环境变量覆盖源配置");
            self.sources.insert(source_id, source);
        }
        Ok(())
    }

    /// 当前激活的源：显式指定的源，或唯一配置的源
    pub fn active_source(&self) -> Result<(&str, &SourceConfig)> {
        match &self.active_source {
            Some(name) => self
                .sources
                .get_key_value(name)
                .map(|(k, v)| (k.as_str(), v))
                .ok_or_else(|| ConfigError::SourceNotFound(name.clone()).into()),
            None if self.sources.len() == 1 => self
                .sources
                .iter()
                .next()
                .map(|(k, v)| (k.as_str(), v))
                .ok_or_else(|| ConfigError::NoActiveSource.into()),
            None => Err(ConfigError::NoActiveSource.into()),
        }
    }

    /// 当前激活的角色，未知角色回退到 `default`
    pub fn active_character(&self) -> Character {
        match self.characters.get(&self.active_character) {
            Some(setting) => Character::new(&self.active_character, setting),
            None => {
                let setting = self
                    .characters
                    .get(DEFAULT_CHARACTER)
                    .cloned()
                    .unwrap_or_default();
                Character::new(DEFAULT_CHARACTER, &setting)
            }
        }
    }

    pub fn set_memory_enabled(&mut self, enabled: bool) {
        self.memory.enabled = enabled;
    }

    // ── 源与角色管理 ──────────────────────────────────────────────────────────

    /// 添加或覆盖一个源；尚无当前源时自动切换到它。源名统一小写，与环境变量一致
    pub fn add_source(&mut self, name: &str, source: SourceConfig) -> String {
        let name = name.trim().to_lowercase();
        self.sources.insert(name.clone(), source);
        if self.active_source.is_none() {
            self.active_source = Some(name.clone());
        }
        name
    }

    pub fn use_source(&mut self, name: &str) -> Result<()> {
        let name = name.trim().to_lowercase();
        if !self.sources.contains_key(&name) {
            return Err(ConfigError::SourceNotFound(name).into());
        }
        self.active_source = Some(name);
        Ok(())
    }

    /// 删除源；删除的是当前源时改用剩余的第一个源
    pub fn remove_source(&mut self, name: &str) -> bool {
        let name = name.trim().to_lowercase();
        if self.sources.remove(&name).is_none() {
            return false;
        }
        if self.active_source.as_deref() == Some(name.as_str()) {
            self.active_source = self.sources.keys().next().cloned();
        }
        true
    }

    /// 添加角色，同名角色的设定被覆盖；返回是否覆盖了旧设定
    pub fn add_character(&mut self, name: &str, setting: &str) -> bool {
        self.characters
            .insert(name.trim().to_string(), setting.to_string())
            .is_some()
    }

    pub fn use_character(&mut self, name: &str) -> Result<()> {
        let name = name.trim();
        if !self.characters.contains_key(name) {
            return Err(ConfigError::CharacterNotFound(name.to_string()).into());
        }
        self.active_character = name.to_string();
        Ok(())
    }

    /// 删除角色。`default` 不可删除；删除的是当前角色时回到 `default`。
    ///
    /// 角色的记忆库与聊天日志保留在磁盘上，重新添加同名角色即可继续使用。
    pub fn remove_character(&mut self, name: &str) -> bool {
        let name = name.trim();
        if name == DEFAULT_CHARACTER || self.characters.remove(name).is_none() {
            return false;
        }
        if self.active_character == name {
            self.active_character = DEFAULT_CHARACTER.to_string();
        }
        true
    }
}

/// `TERA_DATA_DIR` 或 `~/.tera`
pub fn default_data_dir() -> PathBuf {
    match std::env::var(DATA_DIR_ENV) {
        Ok(dir) if !dir.trim().is_empty() => expand_tilde(Path::new(&dir)),
        _ => expand_tilde(Path::new("~/.tera")),
    }
}

pub(crate) fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if s.starts_with("~/")
        && let Some(home) = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())
    {
        return PathBuf::from(home).join(&s[2..]);
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(dir.path()).unwrap();
        assert_eq!(config.active_character, DEFAULT_CHARACTER);
        assert!(config.characters.contains_key(DEFAULT_CHARACTER));
        assert_eq!(config.memory.max_items, 500);
        assert_eq!(config.memory.summary_batch, 100);
        assert!(!config.memory.enabled);
        assert!(config.active_source().is_err());
    }

    #[test]
    fn test_yaml_partial_fields() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILENAME),
            r#"
active_source: work
sources:
  work:
    base_url: http://localhost:8080/v1
    api_key: k
    model: qwen3-max
active_character: 小雪
characters:
  小雪: 温柔的助手
memory:
  enabled: true
  top_k: 3
"#,
        )
        .unwrap();
        let config = AppConfig::load(dir.path()).unwrap();
        let (name, source) = config.active_source().unwrap();
        assert_eq!(name, "work");
        assert_eq!(source.model, "qwen3-max");
        assert!(config.memory.enabled);
        assert_eq!(config.memory.top_k, 3);
        assert_eq!(config.memory.max_items, 500);
        assert_eq!(config.active_character().name, "小雪");
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::load(dir.path()).unwrap();
        config.set_memory_enabled(true);
        config.save().unwrap();
        let reloaded = AppConfig::load(dir.path()).unwrap();
        assert!(reloaded.memory.enabled);
    }

    #[test]
    fn test_env_defines_new_source() {
        let mut config = AppConfig::default();
        config
            .apply_env(vars(&[
                ("TERA_SOURCE_QWEN_APIKEY", "sk-1"),
                ("TERA_SOURCE_QWEN_MODEL", "qwen-plus"),
                ("PATH", "/usr/bin"),
            ]))
            .unwrap();
        let source = &config.sources["qwen"];
        assert_eq!(source.api_key, "sk-1");
        assert_eq!(source.model, "qwen-plus");
        assert_eq!(source.base_url, DEFAULT_BASE_URL);
        // 唯一的源自动成为当前源
        assert_eq!(config.active_source().unwrap().0, "qwen");
    }

    #[test]
    fn test_env_overrides_single_field() {
        let mut config = AppConfig::default();
        config.sources.insert(
            "main".to_string(),
            SourceConfig {
                base_url: "http://a/v1".to_string(),
                api_key: "old".to_string(),
                model: "m".to_string(),
            },
        );
        config
            .apply_env(vars(&[("TERA_SOURCE_MAIN_APIKEY", "new")]))
            .unwrap();
        assert_eq!(config.sources["main"].api_key, "new");
        assert_eq!(config.sources["main"].base_url, "http://a/v1");
    }

    #[test]
    fn test_env_errors() {
        let mut config = AppConfig::default();
        assert!(
            config
                .apply_env(vars(&[("TERA_SOURCE_BAD", "x")]))
                .is_err()
        );
        assert!(
            config
                .apply_env(vars(&[("TERA_SOURCE_A_TOKEN", "x")]))
                .is_err()
        );
        assert!(
            config
                .apply_env(vars(&[("TERA_SOURCE_NEW_MODEL", "x")]))
                .is_err()
        );
    }

    #[test]
    fn test_unknown_character_falls_back_to_default() {
        let config = AppConfig {
            active_character: "ghost".to_string(),
            ..AppConfig::default()
        };
        assert_eq!(config.active_character().name, DEFAULT_CHARACTER);
    }

    fn source(model: &str) -> SourceConfig {
        SourceConfig {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: "sk".to_string(),
            model: model.to_string(),
        }
    }

    #[test]
    fn test_source_add_use_remove_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::load(dir.path()).unwrap();

        // 第一个源自动成为当前源，名称小写
        assert_eq!(config.add_source("Work", source("gpt-4o")), "work");
        config.add_source("home", source("qwen-plus"));
        assert_eq!(config.active_source.as_deref(), Some("work"));

        config.use_source("HOME").unwrap();
        assert!(matches!(
            config.use_source("ghost"),
            Err(TeraError::Config(ConfigError::SourceNotFound(_)))
        ));
        config.save().unwrap();

        let mut reloaded = AppConfig::load(dir.path()).unwrap();
        assert_eq!(reloaded.active_source().unwrap().1.model, "qwen-plus");

        assert!(reloaded.remove_source("home"));
        assert!(!reloaded.remove_source("home"));
        assert_eq!(reloaded.active_source.as_deref(), Some("work"));
        assert!(reloaded.remove_source("work"));
        assert_eq!(reloaded.active_source, None);
    }

    #[test]
    fn test_character_add_use_remove_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::load(dir.path()).unwrap();

        assert!(!config.add_character("小雪", "温柔的助手"));
        assert!(config.add_character("小雪", "活泼的助手"));
        config.use_character("小雪").unwrap();
        assert!(matches!(
            config.use_character("ghost"),
            Err(TeraError::Config(ConfigError::CharacterNotFound(_)))
        ));
        config.save().unwrap();

        let mut reloaded = AppConfig::load(dir.path()).unwrap();
        let active = reloaded.active_character();
        assert_eq!(active.name, "小雪");
        assert_eq!(active.setting, "活泼的助手");

        assert!(!reloaded.remove_character(DEFAULT_CHARACTER));
        assert!(reloaded.remove_character("小雪"));
        assert_eq!(reloaded.active_character, DEFAULT_CHARACTER);
        assert!(!reloaded.characters.contains_key("小雪"));
    }

    #[test]
    fn test_embedding_endpoint_inherits_source() {
        let source = SourceConfig {
            base_url: "http://llm/v1".to_string(),
            api_key: "sk".to_string(),
            model: "m".to_string(),
        };
        let settings = EmbeddingSettings::default();
        assert_eq!(
            settings.endpoint(Some(&source)),
            Some(("http://llm/v1".to_string(), "sk".to_string()))
        );
        assert_eq!(settings.endpoint(None), None);
    }
}
