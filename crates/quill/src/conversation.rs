//! Transcript state for one chat: the visible messages plus the system
//! preamble they are sent under.

use chrono::Utc;

use crate::provider::ChatMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    /// Surfaced to the user but never sent back to the model.
    Error,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// True until the first visible token of a reply arrives.
    pub loading: bool,
    /// True while the model is inside a reasoning segment.
    pub reasoning: bool,
    /// Names of the tools invoked while producing this message.
    pub tool_calls: Vec<String>,
    pub created: i64,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Message {
            role: Role::User,
            content: content.into(),
            loading: false,
            reasoning: false,
            tool_calls: Vec::new(),
            created: Utc::now().timestamp(),
        }
    }

    pub fn assistant() -> Self {
        Message {
            role: Role::Assistant,
            content: String::new(),
            loading: true,
            reasoning: false,
            tool_calls: Vec::new(),
            created: Utc::now().timestamp(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Message {
            role: Role::Error,
            content: content.into(),
            loading: false,
            reasoning: false,
            tool_calls: Vec::new(),
            created: Utc::now().timestamp(),
        }
    }

    /// Wire form of this message, or None for roles the model never sees.
    pub fn to_wire(&self) -> Option<ChatMessage> {
        match self.role {
            Role::User => Some(ChatMessage::user(self.content.clone())),
            Role::Assistant => Some(ChatMessage::assistant(self.content.clone())),
            Role::Error => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Conversation {
    preamble: String,
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new(preamble: String) -> Self {
        Conversation {
            preamble,
            messages: Vec::new(),
        }
    }

    pub fn preamble(&self) -> &str {
        &self.preamble
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn last_mut(&mut self) -> Option<&mut Message> {
        self.messages.last_mut()
    }

    pub fn remove_last(&mut self) -> Option<Message> {
        self.messages.pop()
    }

    /// Start over under a (possibly new) preamble.
    pub fn reset(&mut self, preamble: String) {
        self.preamble = preamble;
        self.messages.clear();
    }
}
