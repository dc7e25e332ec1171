//! A client layer for on-device large language model inference.
//!
//! This crate drives a native inference backend (anything implementing [`Backend`]) through a
//! decode/sample loop, turns structured conversations (text plus image attachments) into
//! positioned token batches, and exposes streaming generation through a [`Client`] and a
//! stateful, multi-turn [`Session`]. Tool calling is supported end to end: tools are declared
//! with a [`ToolSchema`], the model's `<tool_call>` output is parsed into [`ToolCall`]s and
//! generation resumes once the tool outputs have been fed back.
//!
//! The crate never links a native library by itself. Bindings implement [`Backend`] and hand
//! an instance to [`Client::new`] (or a loader to [`Client::load_from_file`]).
//!
//! ## Examples
//!
//! ```no_run
//! # async fn run<B: local_llm::Backend>(backend: B) -> Result<(), local_llm::LlmError> {
//! use futures::StreamExt;
//! use local_llm::{Client, ClientParams, FactoryModel, Session};
//!
//! let client = Client::new(backend, ClientParams::default())?;
//!
//! // One-shot generation.
//! let text = client.generate_async("Tell me a joke.").await?;
//! println!("{text}");
//!
//! // Multi-turn chat.
//! let session = Session::new(FactoryModel::new(move || Ok(client.clone())));
//! let mut stream = session.stream_response("Hello!", vec![]);
//!
//! while let Some(chunk) = stream.next().await {
//!     print!("{}", chunk?);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Logging
//!
//! Everything is logged through [`tracing`]. Backends can forward their native log output with
//! [`detail::forward_native_log`].

#![warn(missing_docs)]

use thiserror::Error;

mod batch;
mod client;
mod context;
mod generator;
mod input;
mod multimodal;
mod session;
mod template;

pub mod backend;
pub mod detail;
#[cfg(feature = "download")]
pub mod download;
pub mod standard_sampler;
pub mod tool;

pub use backend::{Backend, LoadError, NativeRuntime, TokenizationError};
pub use batch::{Batch, BatchEntry, BatchError};
pub use client::*;
pub use context::{encode_prompt, Context, ContextError, DecodeContext};
pub use generator::{CancelHandle, TokenDecoder, TokenGenerator};
pub use input::*;
pub use multimodal::{Embedding, ImageEmbedding};
pub use session::*;
pub use standard_sampler::{Candidates, StandardSampler, TokenData};
pub use template::{ChatFormat, RenderedPrompt};
pub use tool::{
    ArgumentType, GeneratedContent, Tool, ToolCall, ToolDeclaration, ToolOutput, ToolSchema,
    ToolSet,
};

/// A single token produced or consumed by a model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Token(pub i32);

/// Something which selects a [`Token`] from the logits of the last decoded position.
pub trait Sampler {
    /// Given the previously committed tokens and the candidate list built from the most recent
    /// logits, selects the next token.
    fn sample(&mut self, history: &[Token], candidates: &mut Candidates) -> Token;

    /// Informs the sampler that `token` was committed to the context.
    fn accept(&mut self, _token: Token) {}

    /// Resets any state accumulated over a generation.
    fn reset(&mut self) {}
}

/// The error type returned by the public [`Client`], [`Session`] and tool APIs.
#[derive(Error, Debug)]
pub enum LlmError {
    /// A model, vision projector or backend failed to load.
    #[error("failed to load model: {0}")]
    FailedToLoad(#[from] LoadError),

    /// Malformed arguments were provided by the caller or the model.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The backend failed while decoding; fatal to the current generation.
    #[error("decoding failed: {0}")]
    DecodingFailed(ContextError),

    /// An image was provided to a backend without vision support.
    #[error("the loaded model does not support image input")]
    VisionUnsupported,

    /// A tool was found and called, but it returned an error.
    #[error("tool `{tool}` failed: {source}")]
    ToolExecutionFailed {
        /// The name of the tool.
        tool: String,
        /// The error reported by the tool.
        source: tool::ToolError,
    },

    /// A response is already being generated for this session.
    #[error("a response is already being generated for this session")]
    SessionBusy,
}

impl From<ContextError> for LlmError {
    fn from(value: ContextError) -> Self {
        match value {
            ContextError::VisionUnsupported => LlmError::VisionUnsupported,
            ContextError::MissingMarker(_)
            | ContextError::EmptyMarker
            | ContextError::OverlappingMarkers(_, _) => LlmError::InvalidParameter(value.to_string()),
            other => LlmError::DecodingFailed(other),
        }
    }
}
