//! The contract between this crate and a native inference backend.

use std::path::PathBuf;

use thiserror::Error;

use crate::{Batch, ContextError, ImageEmbedding, Token};

mod runtime;

pub use runtime::NativeRuntime;
pub(crate) use runtime::RuntimeRef;

/// An error raised while loading a model.
#[derive(Error, Debug)]
pub enum LoadError {
    /// The provided model path does not exist.
    #[error("path does not exist: {0}")]
    DoesNotExist(PathBuf),

    /// A vision projector was configured, but it could not be found.
    #[error("vision projector does not exist: {0}")]
    MissingProjector(PathBuf),

    /// The backend rejected the model.
    #[error("the backend failed to load the model: {0}")]
    Backend(String),

    /// The model could not be acquired from its remote source.
    #[error("failed to download model: {0}")]
    Download(String),
}

/// An error raised while tokenizing text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenizationError {
    /// The provided text is larger than the backend can tokenize in one go.
    #[error("the tokenizer was given {n_bytes} bytes, but it accepts at most {max_bytes}")]
    InputTooLarge {
        /// The number of bytes that were provided.
        n_bytes: usize,
        /// The maximum number of bytes the backend accepts.
        max_bytes: usize,
    },

    /// The backend failed to tokenize the text.
    #[error("the backend failed to tokenize the text: {0}")]
    Backend(String),
}

/// A loaded model plus its inference context, as exposed by a native backend.
///
/// A [`Backend`] is exclusively owned by one [`Client`][crate::Client], which serializes all
/// calls to it. Implementations only have to provide the primitives; batching, sampling and
/// text reassembly are handled by this crate.
pub trait Backend: Send + 'static {
    /// The number of tokens in the model's vocabulary.
    fn vocabulary_size(&self) -> usize;

    /// Whether the model expects a beginning-of-sequence token at the start of the context.
    fn add_bos(&self) -> bool {
        true
    }

    /// Converts `text` into tokens.
    ///
    /// If `special` is set, control tokens written literally in `text` (e.g. `<|im_start|>`)
    /// are parsed as control tokens instead of plain text.
    fn tokenize(
        &self,
        text: &str,
        add_bos: bool,
        special: bool,
    ) -> Result<Vec<Token>, TokenizationError>;

    /// Returns the raw bytes `token` stands for. These need not be valid UTF-8 on their own.
    fn token_to_bytes(&self, token: Token, special: bool) -> Vec<u8>;

    /// Whether `token` ends generation (end-of-sequence, end-of-turn, ...).
    fn is_end_of_generation(&self, token: Token) -> bool;

    /// Evaluates every entry of `batch`, writing them into the key/value cache.
    ///
    /// Returns the backend's status code on failure.
    fn decode(&mut self, batch: &Batch) -> Result<(), i32>;

    /// The logits produced for the last batch entry that requested them.
    fn logits(&mut self) -> &[f32];

    /// Clears the key/value cache.
    fn clear_cache(&mut self);

    /// The chat template embedded in the model, if any.
    fn chat_template(&self) -> Option<String> {
        None
    }

    /// Whether this backend can embed and decode images.
    fn supports_vision(&self) -> bool {
        false
    }

    /// Converts encoded image bytes into an embedding ready to be decoded.
    fn embed_image(&mut self, _image: &[u8]) -> Result<ImageEmbedding, ContextError> {
        Err(ContextError::VisionUnsupported)
    }

    /// Decodes `embedding` starting at `cursor`, returning the new cursor.
    fn decode_image(
        &mut self,
        _embedding: &ImageEmbedding,
        _cursor: usize,
        _batch_size: usize,
    ) -> Result<usize, ContextError> {
        Err(ContextError::VisionUnsupported)
    }

    /// The process-wide native runtime this backend depends on, if any.
    ///
    /// It is initialised before the first model of this backend is loaded and shut down after
    /// the last client using it is dropped.
    fn runtime() -> Option<&'static dyn NativeRuntime>
    where
        Self: Sized,
    {
        None
    }
}
