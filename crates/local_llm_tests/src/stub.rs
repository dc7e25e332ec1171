//! A scripted, byte-level [`Backend`] that records every call made to it.
//!
//! Every byte is its own token, so token counts and positions can be predicted exactly. The
//! generated text is chosen by a responder closure which sees everything decoded since the
//! cache was last cleared.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use local_llm::detail::{forward_native_log, NativeLogLevel};
use local_llm::{
    Backend, Batch, ClientParams, ContextError, Embedding, ImageEmbedding, Token,
    TokenizationError,
};

/// The beginning-of-sequence token.
pub const BOS: Token = Token(1);

/// The end-of-sequence token.
pub const EOS: Token = Token(2);

const BYTE_OFFSET: i32 = 3;
const VOCABULARY_SIZE: usize = 256 + BYTE_OFFSET as usize;

/// The token standing for `byte`.
pub fn byte_token(byte: u8) -> Token {
    Token(byte as i32 + BYTE_OFFSET)
}

/// Tokenizes `text` the way [`StubBackend`] does, without a beginning-of-sequence token.
pub fn byte_tokens(text: &str) -> Vec<Token> {
    text.bytes().map(byte_token).collect()
}

/// Parameters for deterministic generation against a [`StubBackend`].
pub fn greedy_params(context_length: usize) -> ClientParams {
    ClientParams {
        context_length,
        batch_size: context_length.min(64),
        temperature: 0.0,
        penalty_repeat: 1.0,
        seed: Some(0),
        ..ClientParams::default()
    }
}

/// One call made to a [`StubBackend`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendEvent {
    /// The key/value cache was cleared.
    ClearCache,

    /// A batch was decoded.
    Decode {
        /// The batch, as text. Control tokens are left out.
        text: String,
        /// The position of the first entry.
        first_position: usize,
        /// The number of entries.
        tokens: usize,
    },

    /// An image was embedded.
    EmbedImage,

    /// An image embedding was decoded.
    Image {
        /// The position the embedding was written to.
        cursor: usize,
        /// The number of positions it occupies.
        slots: usize,
    },
}

/// The embedding produced by a vision-enabled [`StubBackend`].
#[derive(Debug)]
pub struct StubEmbedding {
    /// The number of positions the image occupies.
    pub slots: usize,
}

impl Embedding for StubEmbedding {
    fn slots(&self) -> usize {
        self.slots
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

type Responder = Arc<dyn Fn(&str) -> String + Send + Sync>;

enum Script {
    /// Answers with the responder's text followed by end-of-sequence.
    Respond(Responder),

    /// Repeats one byte forever.
    Endless(u8),
}

/// A scripted byte-level backend.
pub struct StubBackend {
    script: Script,
    events: Arc<Mutex<Vec<BackendEvent>>>,

    /// Everything decoded since the last cache clear, as raw bytes.
    decoded: Vec<u8>,

    /// The response chosen for the current generation, and how much of it was decoded back.
    response: Option<Vec<Token>>,
    generated: usize,

    logits: Vec<f32>,
    decode_calls: usize,
    fail_on_decode: Option<usize>,
    decode_delay: Option<Duration>,
    image_slots: Option<usize>,
}

impl StubBackend {
    /// A backend answering every prompt with `responder(prompt)`.
    pub fn new(responder: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        Self::with_script(Script::Respond(Arc::new(responder)))
    }

    /// A backend always answering with `text`.
    pub fn replying(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(move |_| text.clone())
    }

    /// A backend generating `byte` forever, never ending generation by itself.
    pub fn endless(byte: u8) -> Self {
        Self::with_script(Script::Endless(byte))
    }

    fn with_script(script: Script) -> Self {
        Self {
            script,
            events: Arc::new(Mutex::new(Vec::new())),
            decoded: Vec::new(),
            response: None,
            generated: 0,
            logits: vec![0.0; VOCABULARY_SIZE],
            decode_calls: 0,
            fail_on_decode: None,
            decode_delay: None,
            image_slots: None,
        }
    }

    /// Fails the `n`th decode call (counting from zero) with status `-1`.
    pub fn failing_on_decode(mut self, n: usize) -> Self {
        self.fail_on_decode = Some(n);
        self
    }

    /// Sleeps for `delay` in every decode call.
    pub fn with_decode_delay(mut self, delay: Duration) -> Self {
        self.decode_delay = Some(delay);
        self
    }

    /// Enables images, each occupying `slots` positions.
    pub fn with_vision(mut self, slots: usize) -> Self {
        self.image_slots = Some(slots);
        self
    }

    /// A handle to the event log, which stays valid after the backend moved into a client.
    pub fn events(&self) -> EventLog {
        EventLog(self.events.clone())
    }

    fn record(&self, event: BackendEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    fn next_token(&mut self) -> Token {
        let response = match &self.script {
            Script::Endless(byte) => return byte_token(*byte),
            Script::Respond(responder) => {
                let decoded = &self.decoded;
                self.response.get_or_insert_with(|| {
                    let prompt = String::from_utf8_lossy(decoded);
                    let mut tokens = byte_tokens(&responder(&*prompt));
                    tokens.push(EOS);
                    tokens
                })
            }
        };

        response.get(self.generated).copied().unwrap_or(EOS)
    }
}

impl Backend for StubBackend {
    fn vocabulary_size(&self) -> usize {
        VOCABULARY_SIZE
    }

    fn tokenize(
        &self,
        text: &str,
        add_bos: bool,
        _special: bool,
    ) -> Result<Vec<Token>, TokenizationError> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_bos {
            tokens.push(BOS);
        }
        tokens.extend(byte_tokens(text));
        Ok(tokens)
    }

    fn token_to_bytes(&self, token: Token, _special: bool) -> Vec<u8> {
        match u8::try_from(token.0 - BYTE_OFFSET) {
            Ok(byte) => vec![byte],
            Err(_) => Vec::new(),
        }
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        token == EOS
    }

    fn decode(&mut self, batch: &Batch) -> Result<(), i32> {
        let call = self.decode_calls;
        self.decode_calls += 1;

        if let Some(delay) = self.decode_delay {
            std::thread::sleep(delay);
        }

        if self.fail_on_decode == Some(call) {
            forward_native_log(NativeLogLevel::Error, "stub: injected decode failure\n");
            return Err(-1);
        }

        let bytes: Vec<u8> = batch
            .entries()
            .iter()
            .flat_map(|entry| self.token_to_bytes(entry.token, true))
            .collect();

        if self.response.is_some() {
            self.generated += batch.tokens();
        }
        self.decoded.extend_from_slice(&bytes);

        self.record(BackendEvent::Decode {
            text: String::from_utf8_lossy(&bytes).into_owned(),
            first_position: batch.entries().first().map_or(0, |entry| entry.position),
            tokens: batch.tokens(),
        });

        Ok(())
    }

    fn logits(&mut self) -> &[f32] {
        let token = self.next_token();

        self.logits.iter_mut().for_each(|logit| *logit = 0.0);
        self.logits[token.0 as usize] = 100.0;
        &self.logits
    }

    fn clear_cache(&mut self) {
        self.decoded.clear();
        self.response = None;
        self.generated = 0;
        self.record(BackendEvent::ClearCache);
    }

    fn supports_vision(&self) -> bool {
        self.image_slots.is_some()
    }

    fn embed_image(&mut self, image: &[u8]) -> Result<ImageEmbedding, ContextError> {
        let slots = self.image_slots.ok_or(ContextError::VisionUnsupported)?;
        if image.is_empty() {
            return Err(ContextError::ImageFailed("empty image".to_string()));
        }

        self.record(BackendEvent::EmbedImage);
        Ok(ImageEmbedding::new(StubEmbedding { slots }))
    }

    fn decode_image(
        &mut self,
        embedding: &ImageEmbedding,
        cursor: usize,
        _batch_size: usize,
    ) -> Result<usize, ContextError> {
        let embedding = embedding
            .downcast_ref::<StubEmbedding>()
            .ok_or_else(|| ContextError::ImageFailed("foreign embedding".to_string()))?;

        self.decoded.extend_from_slice(b"[image]");
        self.record(BackendEvent::Image {
            cursor,
            slots: embedding.slots,
        });

        Ok(cursor + embedding.slots)
    }
}

/// A shared view of a [`StubBackend`]'s calls.
#[derive(Clone)]
pub struct EventLog(Arc<Mutex<Vec<BackendEvent>>>);

impl EventLog {
    fn lock(&self) -> MutexGuard<'_, Vec<BackendEvent>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A copy of every event so far.
    pub fn snapshot(&self) -> Vec<BackendEvent> {
        self.lock().clone()
    }

    /// Forgets every event so far.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// The total number of positions written by decode calls, text and images alike.
    pub fn positions_written(&self) -> usize {
        self.lock()
            .iter()
            .map(|event| match event {
                BackendEvent::Decode { tokens, .. } => *tokens,
                BackendEvent::Image { slots, .. } => *slots,
                _ => 0,
            })
            .sum()
    }
}
