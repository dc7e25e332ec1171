//! Tool calling: declaring tools, parsing the model's calls and dispatching them.

use std::error::Error as StdError;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::LlmError;

mod parser;
mod schema;

pub use parser::{
    parse_tool_call, parse_tool_calls, strip_tool_calls, ToolCallStreamParser, TOOL_CALL_END,
    TOOL_CALL_START,
};
pub use schema::{ArgumentType, ToolDeclaration, ToolSchema};

/// The error type returned by [`Tool::call`].
pub type ToolError = Box<dyn StdError + Send + Sync>;

/// A function call requested by the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Identifies this call; echoed back in the matching [`ToolOutput`].
    pub id: String,
    /// The name of the tool to call.
    pub name: String,
    /// The arguments, as produced by the model.
    pub arguments: Value,
}

impl ToolCall {
    /// A call with a fresh id.
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), name, arguments)
    }

    /// A call with the given id.
    pub fn with_id(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Deserializes the arguments.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, LlmError> {
        serde_json::from_value(self.arguments.clone()).map_err(|e| {
            LlmError::InvalidParameter(format!(
                "cannot decode the arguments of `{}`: {e}",
                self.name
            ))
        })
    }

    /// The call as the model writes it.
    pub fn to_markup(&self) -> String {
        let body = serde_json::json!({ "name": self.name, "arguments": self.arguments });
        format!("{TOOL_CALL_START}\n{body}\n{TOOL_CALL_END}")
    }
}

/// The result of executing a [`ToolCall`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// The id of the call this output answers.
    pub tool_call_id: String,
    /// The textual result.
    pub content: String,
}

impl ToolOutput {
    /// Creates an output.
    pub fn new(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
        }
    }
}

/// Generated text along with the tool calls it contains.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GeneratedContent {
    /// The full generated text, tool call markup included.
    pub text: String,
    /// The tool calls, in the order they were generated.
    pub tool_calls: Vec<ToolCall>,
}

impl GeneratedContent {
    /// Parses the tool calls out of `text`.
    pub fn from_text(text: String) -> Self {
        let tool_calls = parse_tool_calls(&text);
        Self { text, tool_calls }
    }

    /// The text without tool call markup.
    pub fn visible_text(&self) -> String {
        strip_tool_calls(&self.text)
    }
}

/// A function the model can call.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The name the model calls the tool by.
    fn name(&self) -> &str;

    /// What the tool does.
    fn description(&self) -> &str;

    /// The tool's arguments.
    fn schema(&self) -> ToolSchema;

    /// Executes the tool. `arguments` have already been validated against [`Tool::schema`].
    ///
    /// Strings are passed back to the model verbatim, other values as JSON.
    async fn call(&self, arguments: Value) -> Result<Value, ToolError>;

    /// The declaration presented to the model.
    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration::new(self.name(), self.description(), self.schema())
    }
}

/// The tools available to a [`Session`][crate::Session].
#[derive(Clone, Default)]
pub struct ToolSet {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tool, replacing any tool with the same name.
    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.insert(Arc::new(tool));
        self
    }

    /// Adds a tool, replacing any tool with the same name.
    pub fn insert(&mut self, tool: Arc<dyn Tool>) {
        if let Some(existing) = self.tools.iter_mut().find(|t| t.name() == tool.name()) {
            warn!("Replacing tool `{}`", tool.name());
            *existing = tool;
        } else {
            self.tools.push(tool);
        }
    }

    /// Whether the set has no tools.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// The number of tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Looks up a tool by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// The declarations of every tool.
    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        self.tools.iter().map(|t| t.declaration()).collect()
    }

    /// Validates the arguments of `call` and executes the named tool.
    pub async fn dispatch(&self, call: &ToolCall) -> Result<ToolOutput, LlmError> {
        let Some(tool) = self.get(&call.name) else {
            return Err(LlmError::InvalidParameter(format!(
                "tool `{}` not found",
                call.name
            )));
        };

        tool.schema()
            .validate(&call.arguments)
            .map_err(|reason| {
                LlmError::InvalidParameter(format!("invalid call to `{}`: {reason}", call.name))
            })?;

        info!("Calling tool `{}` ({})", call.name, call.id);
        let result = tool
            .call(call.arguments.clone())
            .await
            .map_err(|source| LlmError::ToolExecutionFailed {
                tool: call.name.clone(),
                source,
            })?;
        debug!("Tool `{}` returned {result}", call.name);

        let content = match result {
            Value::String(text) => text,
            other => other.to_string(),
        };
        Ok(ToolOutput::new(call.id.clone(), content))
    }
}

impl std::fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.tools.iter().map(|t| t.name()))
            .finish()
    }
}
