//! Implements [`Client`], the entry point for generating text with a [`Backend`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread;

use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::{debug, info, warn};

use crate::backend::RuntimeRef;
use crate::context::encode_prompt;
use crate::{
    Attachment, Backend, CancelHandle, ChatFormat, Context, Conversation, DecodeContext,
    GeneratedContent, LlmError, LoadError, Message, PromptAttachment, RenderedPrompt, Role,
    TemplateMessage, TokenGenerator, ToolCall, ToolDeclaration, ToolOutput,
};

mod completion;
mod params;

pub use completion::CompletionStream;
pub use params::ClientParams;

/// The inner part of a [`Client`].
///
/// This is a thin wrapper over an `Arc<ClientInner>`, which is used to share the context
/// between clones and generation threads.
struct ClientInner<B: Backend> {
    /// The backend and everything mutated while decoding; one generation at a time.
    context: Mutex<Context<B>>,

    /// The parameters the client was created with.
    params: ClientParams,

    /// The format chat conversations are rendered with.
    format: ChatFormat,

    /// Tools declared to the model in chat conversations.
    tools: RwLock<Vec<ToolDeclaration>>,

    /// Dropped last, after the backend.
    _runtime: Option<RuntimeRef>,
}

/// A loaded model with its inference context.
///
/// Generation runs on a dedicated thread while holding the context's lock, so calls made while
/// another generation is in progress wait for it to finish. Clones share the same context.
pub struct Client<B: Backend> {
    inner: Arc<ClientInner<B>>,
}

impl<B: Backend> Clone for Client<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: Backend> Client<B> {
    /// Wraps an already loaded `backend`.
    pub fn new(backend: B, params: ClientParams) -> Result<Self, LlmError> {
        params.validate()?;

        let runtime = B::runtime().map(RuntimeRef::acquire);
        Ok(Self::from_parts(backend, params, runtime))
    }

    /// Loads the model at `model_path` with `loader`.
    ///
    /// The model path, and the vision projector if one is configured, are checked to exist
    /// before the backend's native runtime is initialised and `loader` is called.
    pub fn load_from_file<F>(
        model_path: impl AsRef<Path>,
        params: ClientParams,
        loader: F,
    ) -> Result<Self, LlmError>
    where
        F: FnOnce(&Path, &ClientParams) -> Result<B, LoadError>,
    {
        let path = model_path.as_ref();

        if !path.exists() {
            return Err(LoadError::DoesNotExist(path.to_path_buf()).into());
        }
        if let Some(projector) = &params.vision_projector {
            if !projector.exists() {
                return Err(LoadError::MissingProjector(projector.clone()).into());
            }
        }
        params.validate()?;

        let runtime = B::runtime().map(RuntimeRef::acquire);

        info!("Loading model \"{}\"", path.display());
        let backend = loader(path, &params)?;

        Ok(Self::from_parts(backend, params, runtime))
    }

    /// Loads the model at `model_path` with `loader` on a blocking thread.
    ///
    /// See [`Client::load_from_file`].
    pub async fn load_from_file_async<F>(
        model_path: impl AsRef<Path>,
        params: ClientParams,
        loader: F,
    ) -> Result<Self, LlmError>
    where
        F: FnOnce(&Path, &ClientParams) -> Result<B, LoadError> + Send + 'static,
    {
        let path = model_path.as_ref().to_owned();

        tokio::task::spawn_blocking(move || Self::load_from_file(path, params, loader))
            .await
            .map_err(|e| LoadError::Backend(format!("loader thread failed: {e}")))?
    }

    fn from_parts(backend: B, params: ClientParams, runtime: Option<RuntimeRef>) -> Self {
        let format = params
            .chat_format
            .unwrap_or_else(|| ChatFormat::detect(backend.chat_template().as_deref()));

        info!(
            "Created client with a context of {} tokens ({format:?})",
            params.context_length
        );

        Self {
            inner: Arc::new(ClientInner {
                context: Mutex::new(Context::new(backend, params.clone())),
                params,
                format,
                tools: RwLock::new(Vec::new()),
                _runtime: runtime,
            }),
        }
    }

    /// The parameters the client was created with.
    pub fn params(&self) -> &ClientParams {
        &self.inner.params
    }

    /// The format chat conversations are rendered with.
    pub fn chat_format(&self) -> ChatFormat {
        self.inner.format
    }

    /// Declares `tools` to the model in every subsequent chat conversation.
    pub fn set_tools(&self, tools: Vec<ToolDeclaration>) {
        *self
            .inner
            .tools
            .write()
            .unwrap_or_else(PoisonError::into_inner) = tools;
    }

    /// The tools declared to the model.
    pub fn tools(&self) -> Vec<ToolDeclaration> {
        self.inner.tools()
    }

    /// Runs `f` with exclusive access to the context, waiting for any running generation.
    pub fn with_context<R>(&self, f: impl FnOnce(&mut Context<B>) -> R) -> R {
        f(&mut self.inner.lock_context())
    }

    /// Renders chat `messages` the way they would be presented to the model.
    pub fn render_prompt(&self, messages: &[Message]) -> Result<RenderedPrompt, LlmError> {
        let messages: Vec<TemplateMessage> = messages.iter().map(TemplateMessage::from).collect();
        self.inner.format.render(&messages, &self.tools())
    }

    /// Starts generating a response to `input` on a new thread.
    pub fn generate_stream(&self, input: impl Into<Conversation>) -> CompletionStream {
        self.generate_stream_with(input, CancelHandle::new())
    }

    /// Starts generating a response to `input` on a new thread, stopping once `cancel` is
    /// cancelled.
    pub fn generate_stream_with(
        &self,
        input: impl Into<Conversation>,
        cancel: CancelHandle,
    ) -> CompletionStream {
        let input = input.into();
        let (tx, rx) = unbounded_channel();
        let inner = self.inner.clone();
        let thread_cancel = cancel.clone();

        thread::spawn(move || {
            let mut context = inner.lock_context();

            if let Err(e) = inner.run(&mut context, input, &thread_cancel, &tx) {
                warn!("Generation failed: {e}");
                let _ = tx.send(Err(e));
            }
        });

        CompletionStream::new(rx, cancel)
    }

    /// Generates a complete response to `input`, blocking the current thread.
    pub fn generate(&self, input: impl Into<Conversation>) -> Result<String, LlmError> {
        self.generate_stream(input).into_text()
    }

    /// Generates a complete response to `input`.
    pub async fn generate_async(&self, input: impl Into<Conversation>) -> Result<String, LlmError> {
        self.generate_stream(input).into_text_async().await
    }

    /// Generates a complete response to `input` and extracts its tool calls.
    pub fn generate_tool_calls(
        &self,
        input: impl Into<Conversation>,
    ) -> Result<GeneratedContent, LlmError> {
        self.generate(input).map(GeneratedContent::from_text)
    }

    /// Generates a complete response to `input` and extracts its tool calls.
    pub async fn generate_tool_calls_async(
        &self,
        input: impl Into<Conversation>,
    ) -> Result<GeneratedContent, LlmError> {
        self.generate_async(input)
            .await
            .map(GeneratedContent::from_text)
    }

    /// Continues the chat `original_input` after `tool_calls` were executed, producing the
    /// model's answer given their `outputs`.
    ///
    /// Fails with [`LlmError::InvalidParameter`] unless `original_input` is a
    /// [`Conversation::Chat`].
    pub fn resume(
        &self,
        tool_calls: &[ToolCall],
        outputs: &[ToolOutput],
        original_input: Conversation,
    ) -> Result<String, LlmError> {
        self.generate(resumed_conversation(tool_calls, outputs, original_input)?)
    }

    /// Async version of [`Client::resume`].
    pub async fn resume_async(
        &self,
        tool_calls: &[ToolCall],
        outputs: &[ToolOutput],
        original_input: Conversation,
    ) -> Result<String, LlmError> {
        self.generate_async(resumed_conversation(tool_calls, outputs, original_input)?)
            .await
    }
}

impl<B: Backend> ClientInner<B> {
    fn lock_context(&self) -> MutexGuard<'_, Context<B>> {
        self.context.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tools(&self) -> Vec<ToolDeclaration> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Encodes `input` and streams the generated chunks into `tx`.
    fn run(
        &self,
        context: &mut Context<B>,
        input: Conversation,
        cancel: &CancelHandle,
        tx: &UnboundedSender<Result<String, LlmError>>,
    ) -> Result<(), LlmError> {
        if cancel.is_cancelled() {
            debug!("Generation cancelled before it started");
            return Ok(());
        }

        let decode_context = self.encode(context, input)?;

        for chunk in TokenGenerator::new(context, decode_context, cancel.clone()) {
            if tx.send(chunk.map_err(LlmError::from)).is_err() {
                debug!("Completion stream dropped, stopping generation");
                break;
            }
        }

        Ok(())
    }

    /// Clears the context and decodes `input` into it.
    fn encode(
        &self,
        context: &mut Context<B>,
        input: Conversation,
    ) -> Result<DecodeContext, LlmError> {
        context.clear();

        let special = self.params.parse_special;
        match input {
            Conversation::Plain(text) => {
                Ok(context.decode_text(&text, DecodeContext::new(special))?)
            }
            Conversation::Prompt(prompt) => {
                let decode_context = DecodeContext::new(prompt.parse_special.unwrap_or(special));
                Ok(encode_prompt(
                    context,
                    decode_context,
                    &prompt.text,
                    prompt.attachments,
                )?)
            }
            Conversation::Chat(messages) => {
                let messages: Vec<TemplateMessage> =
                    messages.iter().map(TemplateMessage::from).collect();
                self.encode_messages(context, &messages)
            }
            Conversation::Template(messages) => self.encode_messages(context, &messages),
        }
    }

    fn encode_messages(
        &self,
        context: &mut Context<B>,
        messages: &[TemplateMessage],
    ) -> Result<DecodeContext, LlmError> {
        let rendered = self.format.render(messages, &self.tools())?;
        debug!("Rendered prompt:\n{}", rendered.text);

        let mut attachments = HashMap::with_capacity(rendered.attachments.len());
        for (marker, attachment) in rendered.attachments {
            let attachment = match attachment {
                Attachment::Text(text) => PromptAttachment::Text(text),
                Attachment::Image(bytes) => PromptAttachment::Image(context.embed_image(&bytes)?),
            };
            attachments.insert(marker, attachment);
        }

        // rendered templates contain control tokens
        Ok(encode_prompt(
            context,
            DecodeContext::new(true),
            &rendered.text,
            attachments,
        )?)
    }
}

fn resumed_conversation(
    tool_calls: &[ToolCall],
    outputs: &[ToolOutput],
    original_input: Conversation,
) -> Result<Conversation, LlmError> {
    let Conversation::Chat(mut messages) = original_input else {
        return Err(LlmError::InvalidParameter(
            "resuming after tool calls requires a chat conversation".into(),
        ));
    };

    if !tool_calls.is_empty() && messages.last().map(|m| &m.role) != Some(&Role::Assistant) {
        let markup = tool_calls
            .iter()
            .map(ToolCall::to_markup)
            .collect::<Vec<_>>()
            .join("\n");
        messages.push(Message::assistant(markup));
    }

    for output in outputs {
        if !tool_calls.iter().any(|call| call.id == output.tool_call_id) {
            warn!("Tool output for unknown call {}", output.tool_call_id);
        }
        messages.push(Message::tool(
            output.content.clone(),
            output.tool_call_id.clone(),
        ));
    }

    Ok(Conversation::Chat(messages))
}
