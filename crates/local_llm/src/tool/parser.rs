//! Extraction of `<tool_call>` blocks from generated text.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::warn;

use super::ToolCall;

/// The tag opening a tool call.
pub const TOOL_CALL_START: &str = "<tool_call>";

/// The tag closing a tool call.
pub const TOOL_CALL_END: &str = "</tool_call>";

fn tool_call_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)<tool_call>\s*(.*?)\s*</tool_call>").expect("tool call pattern is valid")
    })
}

/// Parses the JSON body of a tool call: `{"name": ..., "arguments": {...}, "id": ...}`.
///
/// `arguments` may also be a string containing JSON; it defaults to an empty object. Calls
/// without an `id` are given a fresh one. Malformed bodies are logged and skipped.
pub fn parse_tool_call(body: &str) -> Option<ToolCall> {
    match decode_tool_call(body) {
        Ok(call) => Some(call),
        Err(reason) => {
            warn!("Ignoring malformed tool call {body:?}: {reason}");
            None
        }
    }
}

fn decode_tool_call(body: &str) -> Result<ToolCall, String> {
    let value: Value = serde_json::from_str(body.trim()).map_err(|e| e.to_string())?;

    let name = value
        .get("name")
        .and_then(Value::as_str)
        .ok_or("missing `name`")?
        .to_string();
    let arguments = match value.get("arguments") {
        None | Some(Value::Null) => Value::Object(Default::default()),
        Some(Value::String(raw)) => serde_json::from_str(raw).unwrap_or(Value::String(raw.clone())),
        Some(other) => other.clone(),
    };

    Ok(match value.get("id").and_then(Value::as_str) {
        Some(id) => ToolCall::with_id(id, name, arguments),
        None => ToolCall::new(name, arguments),
    })
}

/// Extracts every well-formed tool call from `text`, in order.
pub fn parse_tool_calls(text: &str) -> Vec<ToolCall> {
    tool_call_pattern()
        .captures_iter(text)
        .filter_map(|captures| captures.get(1))
        .filter_map(|body| parse_tool_call(body.as_str()))
        .collect()
}

/// Returns `text` with every tool call block removed.
pub fn strip_tool_calls(text: &str) -> String {
    tool_call_pattern().replace_all(text, "").into_owned()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Text,
    Call,
}

/// Splits streamed chunks into user-visible text and tool calls.
///
/// Text that might be the beginning of a `<tool_call>` tag is held back until it is known not
/// to be one, so tool call markup never leaks into the visible output. Complete blocks whose
/// body cannot be decoded are kept as [`ToolCallStreamParser::malformed_calls`].
#[derive(Debug)]
pub struct ToolCallStreamParser {
    state: State,
    buffer: String,
    calls: Vec<ToolCall>,
    malformed: Vec<String>,
}

impl Default for ToolCallStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCallStreamParser {
    /// Creates a parser expecting plain text.
    pub fn new() -> Self {
        Self {
            state: State::Text,
            buffer: String::new(),
            calls: Vec::new(),
            malformed: Vec::new(),
        }
    }

    /// Feeds one chunk, returning the text that can be shown to the user, if any.
    pub fn process(&mut self, chunk: &str) -> Option<String> {
        self.buffer.push_str(chunk);
        let mut visible = String::new();

        loop {
            match self.state {
                State::Text => {
                    if let Some(start) = self.buffer.find(TOOL_CALL_START) {
                        visible.push_str(&self.buffer[..start]);
                        self.buffer.drain(..start + TOOL_CALL_START.len());
                        self.state = State::Call;
                        continue;
                    }

                    let held = partial_tag_len(&self.buffer, TOOL_CALL_START);
                    let emit = self.buffer.len() - held;
                    visible.push_str(&self.buffer[..emit]);
                    self.buffer.drain(..emit);
                    break;
                }
                State::Call => {
                    let Some(end) = self.buffer.find(TOOL_CALL_END) else {
                        break;
                    };

                    let body = &self.buffer[..end];
                    match decode_tool_call(body) {
                        Ok(call) => self.calls.push(call),
                        Err(reason) => {
                            warn!("Malformed tool call {body:?}: {reason}");
                            self.malformed.push(reason);
                        }
                    }
                    self.buffer.drain(..end + TOOL_CALL_END.len());
                    self.state = State::Text;
                }
            }
        }

        (!visible.is_empty()).then_some(visible)
    }

    /// Ends the stream, returning any text still held back.
    ///
    /// An unterminated tool call is accepted if its body is complete JSON; otherwise it is
    /// returned as text.
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);

        let text = match self.state {
            State::Text => rest,
            State::Call => match parse_tool_call(&rest) {
                Some(call) => {
                    self.calls.push(call);
                    String::new()
                }
                None => format!("{TOOL_CALL_START}{rest}"),
            },
        };

        self.state = State::Text;
        (!text.is_empty()).then_some(text)
    }

    /// The tool calls parsed so far.
    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.calls
    }

    /// Takes the tool calls parsed so far.
    pub fn take_tool_calls(&mut self) -> Vec<ToolCall> {
        std::mem::take(&mut self.calls)
    }

    /// Why each complete but undecodable tool call block was rejected, in order.
    pub fn malformed_calls(&self) -> &[String] {
        &self.malformed
    }
}

/// The length of the longest suffix of `text` which is a proper prefix of `tag`.
fn partial_tag_len(text: &str, tag: &str) -> usize {
    (1..tag.len().min(text.len() + 1))
        .rev()
        .find(|&len| text.is_char_boundary(text.len() - len) && text.ends_with(&tag[..len]))
        .unwrap_or(0)
}
