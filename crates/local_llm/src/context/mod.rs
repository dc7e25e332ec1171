//! Implements [`Context`], which owns a [`Backend`] together with its batch and sampler.

use thiserror::Error;
use tracing::{debug, error, trace};

use crate::{
    Backend, Batch, BatchError, Candidates, ClientParams, ImageEmbedding, Sampler,
    StandardSampler, Token, TokenizationError,
};

mod encoder;

pub use encoder::encode_prompt;

/// The only sequence this crate decodes into.
const SEQUENCE: i32 = 0;

/// An error raised while decoding into a [`Context`].
#[derive(Error, Debug)]
pub enum ContextError {
    /// Tokenization failed.
    #[error("tokenization failed: {0}")]
    Tokenization(#[from] TokenizationError),

    /// A batch write failed.
    #[error("batch write failed: {0}")]
    Batch(#[from] BatchError),

    /// The prompt does not fit into the context.
    #[error("the prompt needs {needed} positions, but only {available} are left")]
    ContextFull {
        /// The number of positions the text needs.
        needed: usize,
        /// The number of free positions.
        available: usize,
    },

    /// The backend returned a non-zero status while decoding.
    #[error("the backend failed to decode a batch (status {0})")]
    DecodeFailed(i32),

    /// The backend failed to embed or decode an image.
    #[error("image processing failed: {0}")]
    ImageFailed(String),

    /// An image was provided to a backend without vision support.
    #[error("the backend does not support images")]
    VisionUnsupported,

    /// An attachment's marker does not occur in the remaining prompt.
    #[error("attachment marker `{0}` does not occur in the prompt")]
    MissingMarker(String),

    /// An attachment was registered under an empty marker.
    #[error("attachment markers cannot be empty")]
    EmptyMarker,

    /// Two attachment markers occur at the same position of the prompt.
    #[error("attachment markers `{0}` and `{1}` start at the same position")]
    OverlappingMarkers(String, String),
}

/// Where the next decode writes into the key/value cache, and how text is tokenized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodeContext {
    /// The next free position; equals the number of committed tokens and embedding slots.
    pub cursor: usize,

    /// Whether control tokens written in text are parsed as control tokens.
    pub special: bool,
}

impl DecodeContext {
    /// A context starting at the beginning of the cache.
    pub fn new(special: bool) -> Self {
        Self { cursor: 0, special }
    }
}

/// A [`Backend`] along with the batch and sampler used to drive it.
///
/// Only one generation can use a context at a time; [`Client`][crate::Client] keeps it behind a
/// mutex.
pub struct Context<B> {
    backend: B,
    batch: Batch,
    sampler: Box<dyn Sampler + Send>,
    params: ClientParams,

    /// Committed tokens, used by the sampler's repetition window.
    history: Vec<Token>,
}

impl<B: Backend> Context<B> {
    /// Wraps `backend`, sizing the batch and the sampler from `params`.
    pub fn new(backend: B, params: ClientParams) -> Self {
        Self {
            backend,
            batch: Batch::new(params.batch_size, 1),
            sampler: Box::new(StandardSampler::from_params(&params)),
            params,
            history: Vec::new(),
        }
    }

    /// Replaces the sampler.
    pub fn set_sampler(&mut self, sampler: impl Sampler + Send + 'static) {
        self.sampler = Box::new(sampler);
    }

    /// The backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The backend, mutably.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// The parameters this context was created with.
    pub fn params(&self) -> &ClientParams {
        &self.params
    }

    /// Tokens committed since the last [`Context::clear`].
    pub fn history(&self) -> &[Token] {
        &self.history
    }

    /// Forgets everything decoded so far.
    pub fn clear(&mut self) {
        debug!("Clearing context");

        self.backend.clear_cache();
        self.batch.clear();
        self.history.clear();
        self.sampler.reset();
    }

    /// Decodes every pending batch entry, producing logits for the last one.
    ///
    /// Does nothing if the batch is empty. The batch is cleared on success.
    pub fn decode(&mut self) -> Result<(), ContextError> {
        if self.batch.is_empty() {
            return Ok(());
        }

        let last = self.batch.tokens() - 1;
        self.batch.set_logits(last, true);

        trace!("Decoding {} tokens", self.batch.tokens());
        if let Err(status) = self.backend.decode(&self.batch) {
            error!("Backend failed to decode a batch of {} tokens: {status}", self.batch.tokens());
            return Err(ContextError::DecodeFailed(status));
        }

        self.batch.clear();
        Ok(())
    }

    /// Tokenizes `text` and decodes it at the cursor, returning the advanced context.
    ///
    /// A beginning-of-sequence token is prepended only at position zero, and only if the
    /// backend wants one.
    pub fn decode_text(
        &mut self,
        text: &str,
        mut decode_context: DecodeContext,
    ) -> Result<DecodeContext, ContextError> {
        let add_bos = self.backend.add_bos() && decode_context.cursor == 0;
        let tokens = self
            .backend
            .tokenize(text, add_bos, decode_context.special)?;

        let available = self
            .params
            .context_length
            .saturating_sub(decode_context.cursor);
        if tokens.len() > available {
            return Err(ContextError::ContextFull {
                needed: tokens.len(),
                available,
            });
        }

        trace!(
            "Decoding {} tokens of text at position {}",
            tokens.len(),
            decode_context.cursor
        );

        for token in tokens {
            if self.batch.is_full() {
                self.decode()?;
            }
            self.batch
                .add(token, decode_context.cursor, &[SEQUENCE], false)?;
            self.history.push(token);
            decode_context.cursor += 1;
        }

        self.decode()?;
        Ok(decode_context)
    }

    /// Converts encoded image bytes into an embedding.
    pub fn embed_image(&mut self, image: &[u8]) -> Result<ImageEmbedding, ContextError> {
        if !self.backend.supports_vision() {
            return Err(ContextError::VisionUnsupported);
        }

        self.backend.embed_image(image)
    }

    /// Decodes `embedding` at the cursor, returning the advanced context.
    pub fn decode_image(
        &mut self,
        embedding: &ImageEmbedding,
        mut decode_context: DecodeContext,
    ) -> Result<DecodeContext, ContextError> {
        if !self.backend.supports_vision() {
            return Err(ContextError::VisionUnsupported);
        }

        // pending text has to land in the cache before the image
        self.decode()?;

        let cursor = self.backend.decode_image(
            embedding,
            decode_context.cursor,
            self.params.batch_size,
        )?;
        if cursor < decode_context.cursor {
            return Err(ContextError::ImageFailed(format!(
                "the backend moved the cursor backwards ({} -> {cursor})",
                decode_context.cursor
            )));
        }

        debug!(
            "Decoded image embedding at {}..{cursor}",
            decode_context.cursor
        );
        decode_context.cursor = cursor;
        Ok(decode_context)
    }

    /// Picks the next token from the logits of the last decode.
    pub fn sample(&mut self) -> Token {
        let mut candidates = Candidates::from_logits(self.backend.logits());
        let token = self.sampler.sample(&self.history, &mut candidates);
        self.sampler.accept(token);
        token
    }

    /// Queues `token` at `position`, to be decoded (with logits) on the next [`Context::decode`].
    pub fn push_token(&mut self, token: Token, position: usize) -> Result<(), ContextError> {
        if self.batch.is_full() {
            self.decode()?;
        }

        self.batch.add(token, position, &[SEQUENCE], true)?;
        self.history.push(token);
        Ok(())
    }
}
