//! Implements [`TokenGenerator`], the autoregressive decode/sample loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::{Backend, Context, ContextError, DecodeContext};

mod token_decoder;

pub use token_decoder::TokenDecoder;

/// A shared flag used to cancel a generation.
///
/// Generation checks the flag once per token, so cancelling takes effect before the next token
/// is decoded.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Creates a handle which is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Producing,
    Exhausted,
    Failed,
}

/// An iterator over the text chunks generated from an already encoded context.
///
/// Every call to [`Iterator::next`] decodes the pending batch, samples one token and returns the
/// text that became decodable. Chunks may be empty while a multi-byte character is split over
/// several tokens. The iterator ends on an end-of-generation token, when the context is full,
/// when one of the configured extra end-of-sequence strings is produced, or when cancelled.
///
/// A decoding error is yielded once, after which the iterator ends.
pub struct TokenGenerator<'a, B: Backend> {
    context: &'a mut Context<B>,
    decode_context: DecodeContext,
    state: State,
    iteration: usize,
    decoder: TokenDecoder,
    cancel: CancelHandle,
}

impl<'a, B: Backend> TokenGenerator<'a, B> {
    /// Starts generating from `decode_context`, which must describe what was already decoded
    /// into `context`.
    pub fn new(
        context: &'a mut Context<B>,
        decode_context: DecodeContext,
        cancel: CancelHandle,
    ) -> Self {
        debug!("Starting generation at position {}", decode_context.cursor);

        Self {
            context,
            decode_context,
            state: State::Producing,
            iteration: 0,
            decoder: TokenDecoder::new(),
            cancel,
        }
    }

    /// The position the next token will be written to.
    pub fn cursor(&self) -> usize {
        self.decode_context.cursor
    }

    /// The number of tokens generated so far.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    fn step(&mut self) -> Result<Option<String>, ContextError> {
        self.context.decode()?;

        let token = self.context.sample();
        let budget = self.context.params().context_length;

        if self.context.backend().is_end_of_generation(token) || self.decode_context.cursor >= budget
        {
            info!(
                "Generation finished after {} tokens at position {}",
                self.iteration, self.decode_context.cursor
            );
            self.state = State::Exhausted;
            return Ok(self.decoder.flush());
        }

        let bytes = self
            .context
            .backend()
            .token_to_bytes(token, self.decode_context.special);
        let chunk = self.decoder.add_token(&bytes);

        if self.iteration > 0 && self.context.params().extra_eos_tokens.contains(&chunk) {
            debug!("Stopping on extra end-of-sequence string {chunk:?}");
            self.state = State::Exhausted;
            return Ok(None);
        }

        self.context.push_token(token, self.decode_context.cursor)?;
        self.decode_context.cursor += 1;
        self.iteration += 1;

        Ok(Some(chunk))
    }
}

impl<'a, B: Backend> Iterator for TokenGenerator<'a, B> {
    type Item = Result<String, ContextError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state != State::Producing {
            return None;
        }

        if self.cancel.is_cancelled() {
            info!("Generation cancelled after {} tokens", self.iteration);
            self.state = State::Exhausted;
            return None;
        }

        match self.step() {
            Ok(chunk) => chunk.map(Ok),
            Err(e) => {
                self.state = State::Failed;
                Some(Err(e))
            }
        }
    }
}
