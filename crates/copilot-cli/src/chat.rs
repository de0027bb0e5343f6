use anyhow::anyhow;
use copilot_client::RequestSpec;
use serde::{Deserialize, Serialize};

pub const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletion {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ReplyMessage,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    content: Option<String>,
}

impl ChatCompletion {
    pub fn reply(self) -> anyhow::Result<String> {
        self.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("Completion contained no message content"))
    }
}

/// Message history of one chat session.
#[derive(Debug, Clone)]
pub struct Conversation {
    model: String,
    messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: Vec::new(),
        }
    }

    /// Append the user's turn and build the completion request for the whole history.
    pub fn ask(&mut self, content: &str) -> RequestSpec {
        self.messages.push(ChatMessage::new("user", content));
        RequestSpec::post(
            CHAT_COMPLETIONS_PATH,
            serde_json::json!({
                "model": self.model,
                "messages": self.messages,
                "stream": false,
            }),
        )
    }

    pub fn record_reply(&mut self, content: &str) {
        self.messages.push(ChatMessage::new("assistant", content));
    }

    /// Drop the last user turn after a failed request.
    pub fn discard_last(&mut self) {
        if self.messages.last().is_some_and(|m| m.role == "user") {
            self.messages.pop();
        }
    }

    pub fn turns(&self) -> usize {
        self.messages.len()
    }
}
