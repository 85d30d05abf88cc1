use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tera_chat::config::{AppConfig, DEFAULT_BASE_URL, DEFAULT_MODEL, SourceConfig};
use tera_chat::error::{ConfigError, Result, TeraError};
use tera_chat::llm::{self, DefaultLlmClient, LlmClient};
use tera_chat::memory::manager::memory_dir;
use tera_chat::memory::{CompactionOutcome, MemoryManager};
use tera_chat::prelude::ChatSession;

#[derive(Parser)]
#[command(name = "tera")]
#[command(about = "终端里的大模型聊天客户端，支持长期记忆", long_about = None)]
struct Cli {
    /// 数据目录（配置、记忆、聊天日志）
    #[arg(long, env = "TERA_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// 本次使用的角色（不修改配置文件）
    #[arg(short, long)]
    character: Option<String>,

    /// 本次使用的 API 源（不修改配置文件）
    #[arg(short, long)]
    source: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// 开始对话（默认）
    Chat,

    /// 长期记忆管理
    Memory {
        #[command(subcommand)]
        action: MemoryCommand,
    },

    /// 管理 LLM API 源
    Source {
        #[command(subcommand)]
        action: SourceCommand,
    },

    /// 管理角色设定
    Character {
        #[command(subcommand)]
        action: CharacterCommand,
    },
}

#[derive(Subcommand)]
enum SourceCommand {
    /// 添加（或覆盖）一个源
    Add {
        name: String,
        #[arg(long)]
        api_key: String,
        #[arg(long, default_value = DEFAULT_BASE_URL)]
        base_url: String,
        #[arg(long, default_value = DEFAULT_MODEL)]
        model: String,
        /// 添加后立即切换到该源
        #[arg(long = "use")]
        activate: bool,
    },
    /// 切换当前源
    Use { name: String },
    /// 列出所有源
    Show,
    /// 删除源
    Delete { name: String },
}

#[derive(Subcommand)]
enum CharacterCommand {
    /// 添加角色，同名角色的设定被覆盖
    Add {
        name: String,
        /// 角色设定，可留空
        #[arg(long, default_value = "")]
        setting: String,
        /// 添加后立即切换到该角色
        #[arg(long = "use")]
        activate: bool,
    },
    /// 切换当前角色
    Use { name: String },
    /// 列出角色；给出名称时显示该角色的完整设定
    Show { name: Option<String> },
    /// 删除角色（记忆文件保留）
    Delete { name: String },
}

#[derive(Subcommand)]
enum MemoryCommand {
    /// 查看记忆功能状态
    Status,
    /// 开启长期记忆
    Enable,
    /// 关闭长期记忆
    Disable,
    /// 列出当前角色的全部记忆
    List,
    /// 检索与查询最相关的记忆
    Recall {
        query: String,
        #[arg(short = 'k', long, default_value_t = tera_chat::memory::DEFAULT_TOP_K)]
        top_k: usize,
    },
    /// 手动写入一条记忆
    Add { text: String },
    /// 立即压缩当前角色的记忆
    Compact {
        /// 未超过阈值也压缩
        #[arg(long)]
        force: bool,
    },
}

// ── 入口 ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tera_chat=warn,tera=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        match e {
            TeraError::Config(ConfigError::NoActiveSource) => {
                eprintln!("尚未配置任何源，请在 config.yaml 中添加，或设置 TERA_SOURCE_<ID>_APIKEY。");
            }
            e => eprintln!("❌ {}", e),
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.data_dir {
        Some(dir) => {
            let mut config = AppConfig::load(dir)?;
            config.apply_env(std::env::vars())?;
            config
        }
        None => AppConfig::load_default()?,
    };
    if let Some(source) = cli.source {
        config.active_source = Some(source.to_lowercase());
    }
    if let Some(character) = cli.character {
        config.active_character = character;
    }

    match cli.command.unwrap_or(Commands::Chat) {
        Commands::Chat => chat(&config).await,
        Commands::Memory { action } => memory(&config, action).await,
        Commands::Source { action } => source(&config, action),
        Commands::Character { action } => character(&config, action),
    }
}

fn chat_client(config: &AppConfig, http: Arc<reqwest::Client>) -> Result<Arc<dyn LlmClient>> {
    let (_, source) = config.active_source()?;
    Ok(Arc::new(DefaultLlmClient::new(http, source.clone())))
}

async fn chat(config: &AppConfig) -> Result<()> {
    let http = llm::build_http_client(llm::DEFAULT_HTTP_TIMEOUT)?;
    let client = chat_client(config, http.clone())?;
    let memory = MemoryManager::from_config(config, client.clone(), http)?;
    let mut session = ChatSession::new(client, config.active_character(), memory);
    session.run().await
}

async fn memory(config: &AppConfig, action: MemoryCommand) -> Result<()> {
    let identity = config.active_character().name;
    let http = llm::build_http_client(llm::DEFAULT_HTTP_TIMEOUT)?;

    match action {
        MemoryCommand::Status => {
            let settings = &config.memory;
            println!("记忆功能: {}", if settings.enabled { "已开启" } else { "已关闭" });
            println!("嵌入后端: {:?} ({})", settings.embedding.backend, settings.embedding.model);
            println!("数据目录: {}", memory_dir(config).display());
            match MemoryManager::open_store(config, None, http) {
                Ok(store) => println!("角色 {} 的记忆条数: {}", identity, store.len(&identity).await?),
                Err(e) => println!("嵌入模型不可用: {}", e),
            }
        }
        MemoryCommand::Enable => set_memory_enabled(config, true)?,
        MemoryCommand::Disable => set_memory_enabled(config, false)?,
        MemoryCommand::List => {
            let store = MemoryManager::open_store(config, None, http)?;
            let texts = store.list_texts(&identity).await?;
            if texts.is_empty() {
                println!("角色 {} 暂无记忆。", identity);
            }
            for (i, text) in texts.iter().enumerate() {
                println!("{:>4}. {}", i + 1, text);
            }
        }
        MemoryCommand::Recall { query, top_k } => {
            let store = MemoryManager::open_store(config, None, http)?;
            for (text, score) in store.retrieve_scored(&identity, &query, top_k).await? {
                println!("{:.3}  {}", score, text);
            }
        }
        MemoryCommand::Add { text } => {
            let client = chat_client(config, http.clone())?;
            let store = MemoryManager::open_store(config, Some(client), http)?;
            store.add(&identity, &text).await?;
            println!("已写入，当前 {} 条。", store.len(&identity).await?);
        }
        MemoryCommand::Compact { force } => {
            let client = chat_client(config, http.clone())?;
            let store = MemoryManager::open_store(config, Some(client), http)?;
            match store.compact(&identity, force).await? {
                CompactionOutcome::NotNeeded => println!("记忆条数未超过阈值，无需压缩。"),
                CompactionOutcome::Compacted { before, after } => {
                    println!("压缩完成：{} → {} 条。", before, after)
                }
                CompactionOutcome::Skipped(reason) => println!("压缩失败，数据未改动：{}", reason),
            }
        }
    }
    Ok(())
}

/// 只改写磁盘上的配置，环境变量与命令行覆盖的内容不落盘
fn set_memory_enabled(config: &AppConfig, enabled: bool) -> Result<()> {
    let mut on_disk = AppConfig::load(&config.data_dir)?;
    on_disk.set_memory_enabled(enabled);
    on_disk.save()?;
    println!("长期记忆已{}", if enabled { "开启" } else { "关闭" });
    Ok(())
}

// ── 源与角色 ──────────────────────────────────────────────────────────────────
//
// 修改类命令同样只改写磁盘上的配置。

fn source(config: &AppConfig, action: SourceCommand) -> Result<()> {
    let mut on_disk = AppConfig::load(&config.data_dir)?;
    match action {
        SourceCommand::Add {
            name,
            api_key,
            base_url,
            model,
            activate,
        } => {
            let name = on_disk.add_source(
                &name,
                SourceConfig {
                    base_url,
                    api_key,
                    model,
                },
            );
            if activate {
                on_disk.use_source(&name)?;
            }
            on_disk.save()?;
            println!("已添加源 {}", name);
            if on_disk.active_source.as_deref() == Some(name.as_str()) {
                println!("当前源: {}", name);
            }
        }
        SourceCommand::Use { name } => {
            on_disk.use_source(&name)?;
            on_disk.save()?;
            println!("已切换到源 {}", name.to_lowercase());
        }
        SourceCommand::Show => {
            if config.sources.is_empty() {
                println!("暂无任何源，请先添加。");
            }
            let active = config.active_source().ok().map(|(name, _)| name);
            for (name, s) in &config.sources {
                let marker = if Some(name.as_str()) == active { "*" } else { " " };
                println!("{} {}  {}  {}", marker, name, s.model, s.base_url);
            }
        }
        SourceCommand::Delete { name } => {
            if on_disk.remove_source(&name) {
                on_disk.save()?;
                println!("已删除源 {}", name.to_lowercase());
            } else {
                println!("源 {} 不存在。", name);
            }
        }
    }
    Ok(())
}

fn character(config: &AppConfig, action: CharacterCommand) -> Result<()> {
    let mut on_disk = AppConfig::load(&config.data_dir)?;
    match action {
        CharacterCommand::Add {
            name,
            setting,
            activate,
        } => {
            if on_disk.add_character(&name, &setting) {
                println!("角色已存在，覆盖旧设定。");
            }
            if activate {
                on_disk.use_character(&name)?;
            }
            on_disk.save()?;
            println!("已添加角色 {}", name.trim());
        }
        CharacterCommand::Use { name } => {
            on_disk.use_character(&name)?;
            on_disk.save()?;
            println!("已切换到角色 {}", name.trim());
        }
        CharacterCommand::Show { name: Some(name) } => match config.characters.get(&name) {
            Some(setting) => println!("角色 {} 的完整设定:\n{}", name, setting),
            None => println!("角色 {} 不存在。", name),
        },
        CharacterCommand::Show { name: None } => {
            let active = config.active_character().name;
            for name in config.characters.keys() {
                let marker = if *name == active { "*" } else { " " };
                println!("{} {}", marker, name);
            }
        }
        CharacterCommand::Delete { name } => {
            if on_disk.remove_character(&name) {
                on_disk.save()?;
                println!("已删除角色 {}", name.trim());
            } else if name.trim() == tera_chat::config::DEFAULT_CHARACTER {
                println!("无法删除默认角色。");
            } else {
                println!("角色 {} 不存在。", name);
            }
        }
    }
    Ok(())
}
