use crate::chat::input::{InputEvent, LineReader};
use crate::chat::Character;
use crate::error::Result;
use crate::llm::LlmClient;
use crate::llm::types::{Message, Role};
use crate::memory::{MemoryManager, format_recall};
use futures::StreamExt;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, warn};

/// 单个角色的一次交互式会话
pub struct ChatSession {
    llm: Arc<dyn LlmClient>,
    character: Character,
    memory: MemoryManager,
    history: Vec<Message>,
    out: Box<dyn Write + Send>,
}

impl ChatSession {
    pub fn new(llm: Arc<dyn LlmClient>, character: Character, memory: MemoryManager) -> Self {
        let history = character
            .system_message()
            .map(Message::system)
            .into_iter()
            .collect();
        Self {
            llm,
            character,
            memory,
            history,
            out: Box::new(std::io::stdout()),
        }
    }

    /// 替换输出目标（默认 stdout）
    pub fn with_output(mut self, out: impl Write + Send + 'static) -> Self {
        self.out = Box::new(out);
        self
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    /// 会话主流程：处理上次日志 → 问候 → 对话循环
    pub async fn run(&mut self) -> Result<()> {
        if let Some(reason) = self.memory.unavailable_reason() {
            self.print(&format!("⚠️ 记忆功能不可用，本次会话已禁用：{}\n", reason));
        }
        self.begin().await;

        if let Err(e) = self.greet().await {
            self.print(&format!("生成问候失败: {}\n", e));
        }

        let mut input = LineReader::spawn("> ")?;
        loop {
            let line = match input.next().await {
                InputEvent::Line(line) => line,
                InputEvent::Interrupted | InputEvent::Eof => {
                    self.print("\n退出聊天。\n");
                    break;
                }
                InputEvent::Error(e) => {
                    warn!(error = %e, "读取输入失败");
                    self.print("\n退出聊天。\n");
                    break;
                }
            };
            let line = line.trim();
            if line.eq_ignore_ascii_case("exit") || line.eq_ignore_ascii_case("quit") {
                self.print("退出聊天。\n");
                break;
            }
            if line.is_empty() {
                continue;
            }
            if let Err(e) = self.respond(line).await {
                self.print(&format!("请求出错: {}\n", e));
            }
        }
        Ok(())
    }

    /// 取出上次会话的日志并在后台提炼记忆
    pub async fn begin(&self) {
        self.memory.begin_session(&self.character.name).await;
    }

    pub async fn greet(&mut self) -> Result<String> {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        self.history.push(Message::system(format!(
            "系统提示：当前日期和时间为 {}，请首先向用户进行友好的问候，然后等待用户提问。",
            now
        )));
        let reply = self.generate().await?;
        self.history.push(Message::assistant(reply.clone()));
        self.memory
            .record_turn(&self.character.name, Role::Assistant, &reply)
            .await;
        Ok(reply)
    }

    /// 处理一条用户输入并返回回复
    pub async fn respond(&mut self, user_input: &str) -> Result<String> {
        let name = self.character.name.clone();
        self.history.push(Message::user(user_input));
        self.memory.record_turn(&name, Role::User, user_input).await;

        let related = self.memory.recall(&name, user_input).await;
        if let Some(recall) = format_recall(&related) {
            debug!(hits = related.len(), "注入相关记忆");
            self.history.push(Message::system(recall));
        }

        let reply = self.generate().await?;
        self.history.push(Message::assistant(reply.clone()));
        self.memory.record_turn(&name, Role::Assistant, &reply).await;
        Ok(reply)
    }

    /// 优先流式输出；流建立失败或首个 chunk 之前出错时退回非流式
    async fn generate(&mut self) -> Result<String> {
        let header = format!("{}> ", self.character.name);
        let mut reply = String::new();

        match self.llm.chat_stream(self.history.clone()).await {
            Ok(mut stream) => {
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(text) => {
                            if reply.is_empty() {
                                self.print(&header);
                            }
                            self.print(&text);
                            reply.push_str(&text);
                        }
                        Err(e) if reply.is_empty() => {
                            warn!(error = %e, "流式响应失败，改用非流式");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "流式响应中断");
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "流式请求失败，改用非流式"),
        }

        if reply.is_empty() {
            reply = self.llm.chat_simple(self.history.clone()).await?;
            self.print(&header);
            self.print(&reply);
        }
        self.print("\n");
        Ok(reply.trim().to_string())
    }

    fn print(&mut self, text: &str) {
        let _ = self.out.write_all(text.as_bytes());
        let _ = self.out.flush();
    }
}
