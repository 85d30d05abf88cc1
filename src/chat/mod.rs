//! 交互式对话
//!
//! - [`Character`]：角色名与角色设定，角色名同时是记忆库的隔离键
//! - [`ChatSession`]：问候、读取输入、注入相关记忆、流式输出回复
//! - [`LineReader`]：在独立线程中运行 rustyline，向异步会话投递输入事件

mod input;
mod session;

pub use input::{InputEvent, LineReader};
pub use session::ChatSession;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub name: String,
    /// 角色设定，可为空
    pub setting: String,
}

impl Character {
    pub fn new(name: &str, setting: &str) -> Self {
        Self {
            name: name.to_string(),
            setting: setting.to_string(),
        }
    }

    /// 角色设定对应的 system 消息；设定为空时没有
    pub fn system_message(&self) -> Option<String> {
        if self.setting.trim().is_empty() {
            return None;
        }
        Some(format!(
            "你是{}，聊天过程中要遵循以下设定：\n{}\n\"系统提示：\"后不是用户输入，你需要遵循系统提示做出响应。",
            self.name, self.setting
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_message() {
        assert_eq!(Character::new("default", "").system_message(), None);
        let msg = Character::new("小雪", "温柔的助手").system_message().unwrap();
        assert!(msg.starts_with("你是小雪"));
        assert!(msg.contains("温柔的助手"));
    }
}
