//! Conversation inputs accepted by [`Client`][crate::Client] and [`Session`][crate::Session].

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ImageEmbedding;

/// The author of a [`Message`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Instructions for the model.
    System,
    /// The user.
    User,
    /// The model.
    Assistant,
    /// The output of a tool call.
    Tool,
    /// Any other role the chat format understands.
    Custom(String),
}

impl Role {
    /// The role's name as written in chat templates.
    pub fn as_str(&self) -> &str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::Custom(name) => name,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-text content attached to a [`Message`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attachment {
    /// Additional text, decoded after the message content.
    Text(String),
    /// An encoded image (PNG, JPEG, ...), embedded by the backend before decoding.
    Image(Vec<u8>),
}

/// One entry of a conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The author.
    pub role: Role,
    /// The text content.
    pub content: String,
    /// Attachments, in the order they are presented to the model.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    /// For [`Role::Tool`] messages, the id of the tool call this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    /// Creates a message with no attachments.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            attachments: Vec::new(),
            tool_call_id: None,
        }
    }

    /// A system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// A user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// An assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// The output of the tool call `tool_call_id`.
    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }

    /// Replaces the message's attachments.
    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// A message in a provider-specific shape, rendered through the chat template as-is.
///
/// `value` must be a JSON object with at least a `role` and a `content`; `content` is either a
/// string or a list of `{"type": "text", "text": ...}` parts.
#[derive(Clone, Debug, PartialEq)]
pub struct TemplateMessage {
    /// The message object.
    pub value: serde_json::Value,
    /// Attachments, in the order they are presented to the model.
    pub attachments: Vec<Attachment>,
}

impl TemplateMessage {
    /// Creates a template message with no attachments.
    pub fn new(value: serde_json::Value) -> Self {
        Self {
            value,
            attachments: Vec::new(),
        }
    }
}

impl From<&Message> for TemplateMessage {
    fn from(message: &Message) -> Self {
        let mut value = serde_json::json!({
            "role": message.role.as_str(),
            "content": message.content,
        });
        if let Some(id) = &message.tool_call_id {
            value["tool_call_id"] = serde_json::Value::String(id.clone());
        }

        Self {
            value,
            attachments: message.attachments.clone(),
        }
    }
}

/// Content substituted for a marker in a [`Prompt`].
#[derive(Debug)]
pub enum PromptAttachment {
    /// Text, tokenized and decoded in place of the marker.
    Text(String),
    /// A pre-computed image embedding, decoded in place of the marker.
    Image(ImageEmbedding),
}

/// A raw prompt with attachments spliced in at marker strings.
///
/// Every key of `attachments` must occur in `text`. Each key is replaced by its attachment at
/// the key's first occurrence after the previously consumed marker.
#[derive(Debug, Default)]
pub struct Prompt {
    /// The prompt text, including markers.
    pub text: String,
    /// Whether control tokens written in `text` are parsed as control tokens; defaults to the
    /// client's [`parse_special`][crate::ClientParams::parse_special].
    pub parse_special: Option<bool>,
    /// Attachments, keyed by the marker they replace.
    pub attachments: HashMap<String, PromptAttachment>,
}

impl Prompt {
    /// A prompt without attachments.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    /// Adds an attachment replacing `marker`.
    pub fn with_attachment(mut self, marker: impl Into<String>, attachment: PromptAttachment) -> Self {
        self.attachments.insert(marker.into(), attachment);
        self
    }
}

/// The input of one generation.
#[derive(Debug)]
pub enum Conversation {
    /// A bare string, decoded verbatim.
    Plain(String),
    /// A raw prompt with attachments.
    Prompt(Prompt),
    /// Role-tagged messages, rendered through the chat format.
    Chat(Vec<Message>),
    /// Provider-specific messages, rendered through the chat format.
    Template(Vec<TemplateMessage>),
}

impl From<&str> for Conversation {
    fn from(value: &str) -> Self {
        Conversation::Plain(value.to_string())
    }
}

impl From<String> for Conversation {
    fn from(value: String) -> Self {
        Conversation::Plain(value)
    }
}

impl From<Prompt> for Conversation {
    fn from(value: Prompt) -> Self {
        Conversation::Prompt(value)
    }
}

impl From<Vec<Message>> for Conversation {
    fn from(value: Vec<Message>) -> Self {
        Conversation::Chat(value)
    }
}

impl From<Vec<TemplateMessage>> for Conversation {
    fn from(value: Vec<TemplateMessage>) -> Self {
        Conversation::Template(value)
    }
}
