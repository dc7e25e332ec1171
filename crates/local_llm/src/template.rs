//! Rendering of chat messages into a prompt string.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{Attachment, LlmError, TemplateMessage, ToolDeclaration};

const TOOL_INSTRUCTIONS: &str = "\
If you decide to invoke any of the function(s), you MUST put it in the format of
<tool_call>
{\"name\": function name, \"arguments\": dictionary of argument name and its value}
</tool_call>

You SHOULD NOT include any other text in the response if you call a function.
The available functions are:
";

/// A chat format: how roles, turns and images are written for a family of models.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatFormat {
    /// `<|im_start|>role ... <|im_end|>`, used by Qwen and many fine-tunes.
    #[default]
    ChatMl,
    /// `<|start_header_id|>role<|end_header_id|> ... <|eot_id|>`.
    Llama3,
    /// `<start_of_turn>role ... <end_of_turn>`, without a system role.
    Gemma,
}

/// A rendered prompt, with the markers its attachments have to be spliced in at.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RenderedPrompt {
    /// The prompt, ending with the assistant's generation prompt.
    pub text: String,
    /// The attachments, keyed by a marker that occurs exactly once in `text`.
    pub attachments: Vec<(String, Attachment)>,
}

struct Turn {
    role: String,
    text: String,
    attachments: Vec<Attachment>,
}

impl ChatFormat {
    /// Picks the format matching a model's embedded chat template, falling back to ChatML.
    pub fn detect(template: Option<&str>) -> Self {
        let format = match template {
            Some(t) if t.contains("<|start_header_id|>") => ChatFormat::Llama3,
            Some(t) if t.contains("<start_of_turn>") => ChatFormat::Gemma,
            _ => ChatFormat::ChatMl,
        };

        debug!("Using chat format {format:?}");
        format
    }

    fn image_tags(&self) -> (&'static str, &'static str) {
        match self {
            ChatFormat::ChatMl => ("<|vision_start|>", "<|vision_end|>"),
            ChatFormat::Llama3 => ("<|image|>", ""),
            ChatFormat::Gemma => ("<start_of_image>", "<end_of_image>"),
        }
    }

    fn role_name<'a>(&self, role: &'a str) -> &'a str {
        match (self, role) {
            (ChatFormat::Gemma, "assistant") => "model",
            // tool results are presented to the model as user turns
            (_, "tool") => "user",
            _ => role,
        }
    }

    fn write_turn(&self, out: &mut String, role: &str, content: &str) {
        let role = self.role_name(role);
        match self {
            ChatFormat::ChatMl => {
                out.push_str(&format!("<|im_start|>{role}\n{content}<|im_end|>\n"))
            }
            ChatFormat::Llama3 => out.push_str(&format!(
                "<|start_header_id|>{role}<|end_header_id|>\n\n{content}<|eot_id|>"
            )),
            ChatFormat::Gemma => {
                out.push_str(&format!("<start_of_turn>{role}\n{content}<end_of_turn>\n"))
            }
        }
    }

    fn generation_prompt(&self) -> &'static str {
        match self {
            ChatFormat::ChatMl => "<|im_start|>assistant\n",
            ChatFormat::Llama3 => "<|start_header_id|>assistant<|end_header_id|>\n\n",
            ChatFormat::Gemma => "<start_of_turn>model\n",
        }
    }

    /// Renders `messages`, followed by the assistant's generation prompt.
    ///
    /// If `tools` is not empty and the conversation does not end with a tool result, tool calling
    /// instructions and the tool declarations are appended to the system message.
    pub fn render(
        &self,
        messages: &[TemplateMessage],
        tools: &[ToolDeclaration],
    ) -> Result<RenderedPrompt, LlmError> {
        let mut turns = messages
            .iter()
            .map(Turn::from_message)
            .collect::<Result<Vec<_>, _>>()?;

        if !tools.is_empty() && turns.last().map_or(true, |t| t.role != "tool") {
            inject_tool_instructions(&mut turns, tools);
        }

        if *self == ChatFormat::Gemma {
            fold_system_turn(&mut turns);
        }

        let (image_start, image_end) = self.image_tags();
        let mut rendered = RenderedPrompt::default();

        for turn in turns {
            let mut content = if turn.role == "tool" {
                format!("<tool_response>\n{}\n</tool_response>", turn.text)
            } else {
                turn.text
            };

            for attachment in turn.attachments {
                let marker = format!("<__media_{}__>", rendered.attachments.len());
                match attachment {
                    Attachment::Image(_) => {
                        content.push_str(&format!("{image_start}{marker}{image_end}"))
                    }
                    Attachment::Text(_) => content.push_str(&format!("\n{marker}")),
                }
                rendered.attachments.push((marker, attachment));
            }

            self.write_turn(&mut rendered.text, &turn.role, &content);
        }

        rendered.text.push_str(self.generation_prompt());
        Ok(rendered)
    }
}

impl Turn {
    fn from_message(message: &TemplateMessage) -> Result<Self, LlmError> {
        let role = message
            .value
            .get("role")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                LlmError::InvalidParameter(format!("message has no role: {}", message.value))
            })?;

        let text = match message.value.get("content") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(text)) => text.clone(),
            Some(Value::Array(parts)) => parts
                .iter()
                .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            Some(other) => {
                return Err(LlmError::InvalidParameter(format!(
                    "unsupported message content: {other}"
                )))
            }
        };

        Ok(Self {
            role: role.to_string(),
            text,
            attachments: message.attachments.clone(),
        })
    }
}

fn inject_tool_instructions(turns: &mut Vec<Turn>, tools: &[ToolDeclaration]) {
    let declarations = tools
        .iter()
        .map(|tool| tool.to_function_json().to_string())
        .collect::<Vec<_>>()
        .join("\n");
    let instructions = format!("{TOOL_INSTRUCTIONS}{declarations}");

    match turns.iter_mut().find(|t| t.role == "system") {
        Some(system) => {
            system.text.push_str("\n\n");
            system.text.push_str(&instructions);
        }
        None => turns.insert(
            0,
            Turn {
                role: "system".to_string(),
                text: instructions,
                attachments: Vec::new(),
            },
        ),
    }
}

/// Prepends the system message to the first user turn, for formats without a system role.
fn fold_system_turn(turns: &mut Vec<Turn>) {
    let Some(index) = turns.iter().position(|t| t.role == "system") else {
        return;
    };

    let system = turns.remove(index);
    match turns.iter_mut().find(|t| t.role == "user") {
        Some(user) => user.text = format!("{}\n\n{}", system.text, user.text),
        None => turns.insert(
            index,
            Turn {
                role: "user".to_string(),
                ..system
            },
        ),
    }
}
