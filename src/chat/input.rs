//! 行输入
//!
//! rustyline 的读取是阻塞的，放在专用线程里运行。会话每次需要输入时发一个请求，线程才会
//! 打印提示符并读取一行，因此提示符不会与正在流式输出的回复交错。

use crate::error::Result;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::sync::mpsc as std_mpsc;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    Line(String),
    /// Ctrl-C
    Interrupted,
    /// Ctrl-D 或输入流结束
    Eof,
    Error(String),
}

pub struct LineReader {
    requests: std_mpsc::Sender<()>,
    events: mpsc::Receiver<InputEvent>,
}

impl LineReader {
    pub fn spawn(prompt: &str) -> Result<Self> {
        let (req_tx, req_rx) = std_mpsc::channel::<()>();
        let (ev_tx, ev_rx) = mpsc::channel(1);
        let prompt = prompt.to_string();

        std::thread::Builder::new()
            .name("tera-readline".to_string())
            .spawn(move || {
                let mut editor = match DefaultEditor::new() {
                    Ok(editor) => editor,
                    Err(e) => {
                        let _ = ev_tx.blocking_send(InputEvent::Error(e.to_string()));
                        return;
                    }
                };
                while req_rx.recv().is_ok() {
                    let event = match editor.readline(&prompt) {
                        Ok(line) => {
                            if !line.trim().is_empty() {
                                let _ = editor.add_history_entry(line.as_str());
                            }
                            InputEvent::Line(line)
                        }
                        Err(ReadlineError::Interrupted) => InputEvent::Interrupted,
                        Err(ReadlineError::Eof) => InputEvent::Eof,
                        Err(e) => InputEvent::Error(e.to_string()),
                    };
                    if ev_tx.blocking_send(event).is_err() {
                        break;
                    }
                }
                debug!("输入线程退出");
            })?;

        Ok(Self {
            requests: req_tx,
            events: ev_rx,
        })
    }

    /// 读取下一行；线程已退出时视为 EOF
    pub async fn next(&mut self) -> InputEvent {
        if self.requests.send(()).is_err() {
            return InputEvent::Eof;
        }
        self.events.recv().await.unwrap_or(InputEvent::Eof)
    }
}
