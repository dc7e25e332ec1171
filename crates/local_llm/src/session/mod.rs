//! Implements [`Session`], a multi-turn conversation with a lazily loaded [`Client`].

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::tool::ToolCallStreamParser;
use crate::{
    Attachment, CancelHandle, Client, Conversation, GeneratedContent, LlmError, Message, ToolOutput,
    ToolSet,
};

mod model;

#[cfg(feature = "download")]
pub use model::DownloadModel;
pub use model::{FactoryModel, LocalModel, Loader, ModelProvider};

/// How many times the model may call tools before it has to answer.
const MAX_TOOL_ROUNDS: usize = 8;

type Chunk = Result<String, LlmError>;

/// The inner part of a [`Session`].
struct SessionInner<M: ModelProvider> {
    model: M,
    tools: ToolSet,
    messages: Mutex<Vec<Message>>,

    /// Loaded on first use.
    client: tokio::sync::Mutex<Option<Client<M::Backend>>>,

    /// Set while a response is being generated.
    in_flight: AtomicBool,

    /// Cancels the response being generated, if any.
    cancel: Mutex<Option<CancelHandle>>,
}

/// A conversation with a model.
///
/// The session owns the message history. Each response appends the user's message, generates
/// against the whole history, then appends the assistant's reply. Only one response can be
/// generated at a time; clones share the same history.
///
/// If the session has tools, tool calls made by the model are executed and their results fed
/// back automatically before the final reply.
pub struct Session<M: ModelProvider> {
    inner: Arc<SessionInner<M>>,
}

impl<M: ModelProvider> Clone for Session<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: ModelProvider> Session<M> {
    /// Creates an empty session. The model is not loaded until first needed.
    pub fn new(model: M) -> Self {
        Self::with_history(model, Vec::new(), ToolSet::new())
    }

    /// Creates a session continuing `messages`, with `tools` available to the model.
    pub fn with_history(model: M, messages: Vec<Message>, tools: ToolSet) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                model,
                tools,
                messages: Mutex::new(messages),
                client: tokio::sync::Mutex::const_new(None),
                in_flight: AtomicBool::new(false),
                cancel: Mutex::new(None),
            }),
        }
    }

    /// Creates an empty session with `tools` available to the model.
    pub fn with_tools(model: M, tools: ToolSet) -> Self {
        Self::with_history(model, Vec::new(), tools)
    }

    /// A copy of the message history.
    pub fn messages(&self) -> Vec<Message> {
        self.inner.lock_messages().clone()
    }

    /// Replaces the message history.
    pub fn set_messages(&self, messages: Vec<Message>) {
        *self.inner.lock_messages() = messages;
    }

    /// The tools available to the model.
    pub fn tools(&self) -> &ToolSet {
        &self.inner.tools
    }

    /// Acquires the model and builds the client ahead of the first response. Does nothing if
    /// the client is already loaded.
    pub async fn prewarm(&self) -> Result<(), LlmError> {
        self.inner.load_client().await.map(|_| ())
    }

    /// Generates a complete reply to `prompt`.
    pub async fn respond(&self, prompt: impl Into<String>) -> Result<String, LlmError> {
        self.respond_with(prompt, Vec::new()).await
    }

    /// Generates a complete reply to `prompt` with `attachments`.
    pub async fn respond_with(
        &self,
        prompt: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Result<String, LlmError> {
        let mut stream = self.stream_response(prompt, attachments);

        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            text.push_str(&chunk?);
        }
        Ok(text)
    }

    /// Starts generating a reply to `prompt` with `attachments`.
    ///
    /// The user message is recorded immediately. The assistant message is recorded once the
    /// stream ends, unless generation failed or was cancelled. Dropping the stream cancels
    /// generation.
    ///
    /// If a reply is already being generated, the stream yields a single
    /// [`LlmError::SessionBusy`].
    ///
    /// # Panics
    ///
    /// If called outside of a Tokio runtime.
    pub fn stream_response(
        &self,
        prompt: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> ResponseStream {
        let (tx, rx) = flume::unbounded();
        let cancel = CancelHandle::new();

        let Some(guard) = InFlightGuard::acquire(&self.inner, cancel.clone()) else {
            warn!("Rejecting a response while another one is in progress");
            let _ = tx.send(Err(LlmError::SessionBusy));
            return ResponseStream::new(rx, cancel);
        };

        let message = Message::user(prompt).with_attachments(attachments);
        let turn_cancel = cancel.clone();

        tokio::spawn(async move {
            let inner = guard.session.clone();
            if let Err(e) = inner.run_turn(message, &tx, &turn_cancel).await {
                warn!("Response failed: {e}");
                let _ = tx.send(Err(e));
            }
            drop(guard);
        });

        ResponseStream::new(rx, cancel)
    }

    /// Cancels the reply being generated, if any.
    pub fn cancel(&self) {
        if let Some(cancel) = self
            .inner
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            info!("Cancelling response");
            cancel.cancel();
        }
    }

    /// Generates a reply to `prompt` without executing the tool calls it contains.
    ///
    /// The user message and the raw reply are recorded. Answer the calls with
    /// [`Session::resume_with_tool_outputs`]. If cancelled, the partial reply is returned but
    /// not recorded.
    pub async fn respond_with_tool_calls(
        &self,
        prompt: impl Into<String>,
    ) -> Result<GeneratedContent, LlmError> {
        let cancel = CancelHandle::new();
        let _guard = InFlightGuard::acquire(&self.inner, cancel.clone())
            .ok_or(LlmError::SessionBusy)?;

        let client = self.inner.load_client().await?;
        self.inner.push_message(Message::user(prompt));

        let text = client
            .generate_stream_with(Conversation::Chat(self.messages()), cancel.clone())
            .into_text_async()
            .await?;
        if cancel.is_cancelled() {
            info!("Response cancelled; the reply is not recorded");
        } else {
            self.inner.push_message(Message::assistant(text.clone()));
        }

        Ok(GeneratedContent::from_text(text))
    }

    /// Records `outputs` as tool messages and generates the model's reply to them.
    ///
    /// If cancelled, the partial reply is returned but not recorded.
    pub async fn resume_with_tool_outputs(
        &self,
        outputs: Vec<ToolOutput>,
    ) -> Result<String, LlmError> {
        let cancel = CancelHandle::new();
        let _guard = InFlightGuard::acquire(&self.inner, cancel.clone())
            .ok_or(LlmError::SessionBusy)?;

        let client = self.inner.load_client().await?;
        for output in outputs {
            self.inner
                .push_message(Message::tool(output.content, output.tool_call_id));
        }

        let text = client
            .generate_stream_with(Conversation::Chat(self.messages()), cancel.clone())
            .into_text_async()
            .await?;
        if cancel.is_cancelled() {
            info!("Response cancelled; the reply is not recorded");
        } else {
            self.inner.push_message(Message::assistant(text.clone()));
        }

        Ok(text)
    }
}

impl<M: ModelProvider> SessionInner<M> {
    fn lock_messages(&self) -> MutexGuard<'_, Vec<Message>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_message(&self, message: Message) {
        self.lock_messages().push(message);
    }

    async fn load_client(&self) -> Result<Client<M::Backend>, LlmError> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }

        info!("Loading session client");
        self.model.prewarm().await?;
        let client = self.model.make_client().await?;
        if !self.tools.is_empty() {
            client.set_tools(self.tools.declarations());
        }

        Ok(slot.insert(client).clone())
    }

    /// Records `message`, then generates and records the reply, executing tool calls.
    ///
    /// The reply, and the tool calls and results leading to it, are only recorded once the
    /// whole turn succeeds.
    async fn run_turn(
        &self,
        message: Message,
        tx: &flume::Sender<Chunk>,
        cancel: &CancelHandle,
    ) -> Result<(), LlmError> {
        let client = self.load_client().await?;
        self.push_message(message);

        let mut staged = Vec::new();
        for round in 0.. {
            let parse_tools = !self.tools.is_empty() && round < MAX_TOOL_ROUNDS;
            let mut parser = parse_tools.then(ToolCallStreamParser::new);

            let Some(text) = self
                .stream_generation(&client, &staged, tx, cancel, parser.as_mut())
                .await?
            else {
                info!("Response cancelled; the reply is not recorded");
                return Ok(());
            };

            let calls = match parser.as_mut() {
                Some(parser) => {
                    if let Some(rest) = parser.flush() {
                        if tx.send(Ok(rest)).is_err() {
                            debug!("Response stream dropped");
                            cancel.cancel();
                            return Ok(());
                        }
                    }
                    if let Some(reason) = parser.malformed_calls().first() {
                        return Err(LlmError::InvalidParameter(format!(
                            "malformed tool call: {reason}"
                        )));
                    }
                    parser.take_tool_calls()
                }
                None => Vec::new(),
            };

            staged.push(Message::assistant(text));
            if calls.is_empty() {
                self.lock_messages().extend(staged);
                return Ok(());
            }

            debug!("Model requested {} tool calls", calls.len());
            for call in &calls {
                let output = self.tools.dispatch(call).await?;
                staged.push(Message::tool(output.content, output.tool_call_id));
            }
        }

        Ok(())
    }

    /// Streams one generation against the history followed by `staged` into `tx`.
    ///
    /// Returns the full text, or `None` if the turn was cancelled or the consumer went away.
    async fn stream_generation(
        &self,
        client: &Client<M::Backend>,
        staged: &[Message],
        tx: &flume::Sender<Chunk>,
        cancel: &CancelHandle,
        mut parser: Option<&mut ToolCallStreamParser>,
    ) -> Result<Option<String>, LlmError> {
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let mut history = self.lock_messages().clone();
        history.extend_from_slice(staged);

        let mut stream = client.generate_stream_with(Conversation::Chat(history), cancel.clone());
        let mut text = String::new();

        while let Some(chunk) = stream.next_chunk_async().await {
            let chunk = chunk?;
            text.push_str(&chunk);

            let visible = match parser.as_mut() {
                Some(parser) => parser.process(&chunk),
                None => (!chunk.is_empty()).then_some(chunk),
            };

            if let Some(visible) = visible {
                if tx.send(Ok(visible)).is_err() {
                    debug!("Response stream dropped");
                    cancel.cancel();
                    return Ok(None);
                }
            }
        }

        if cancel.is_cancelled() {
            return Ok(None);
        }
        Ok(Some(text))
    }
}

/// Marks a session as busy until dropped.
struct InFlightGuard<M: ModelProvider> {
    session: Arc<SessionInner<M>>,
}

impl<M: ModelProvider> InFlightGuard<M> {
    fn acquire(session: &Arc<SessionInner<M>>, cancel: CancelHandle) -> Option<Self> {
        session
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;

        *session.cancel.lock().unwrap_or_else(PoisonError::into_inner) = Some(cancel);
        Some(Self {
            session: session.clone(),
        })
    }
}

impl<M: ModelProvider> Drop for InFlightGuard<M> {
    fn drop(&mut self) {
        self.session
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.session.in_flight.store(false, Ordering::SeqCst);
    }
}

/// The chunks of a [`Session`] reply.
///
/// Dropping the stream cancels generation.
pub struct ResponseStream {
    chunks: BoxStream<'static, Chunk>,
    cancel: CancelHandle,
}

impl ResponseStream {
    fn new(rx: flume::Receiver<Chunk>, cancel: CancelHandle) -> Self {
        Self {
            chunks: rx.into_stream().boxed(),
            cancel,
        }
    }

    /// Stops generation before its next token.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for ResponseStream {
    type Item = Chunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.chunks.poll_next_unpin(cx)
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
