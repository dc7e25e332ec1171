use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures::executor::block_on;
use futures::Stream;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::{CancelHandle, LlmError};

/// A handle (and channel) to an ongoing generation on an off thread.
///
/// Yields text chunks in order. A failed generation yields its error as the last item. If this
/// structure is dropped before generation ended, the off thread stops before decoding its next
/// token.
pub struct CompletionStream {
    /// The chunk receiver bound to the off thread.
    rx: UnboundedReceiver<Result<String, LlmError>>,

    /// Checked by the off thread before every token.
    cancel: CancelHandle,

    /// Set once the receiver reported the end of generation.
    finished: bool,
}

impl CompletionStream {
    pub(crate) fn new(rx: UnboundedReceiver<Result<String, LlmError>>, cancel: CancelHandle) -> Self {
        Self {
            rx,
            cancel,
            finished: false,
        }
    }

    fn observe(
        &mut self,
        item: Option<Result<String, LlmError>>,
    ) -> Option<Result<String, LlmError>> {
        self.finished |= item.is_none();
        item
    }

    /// Blocks the current thread, resolving to the next chunk, or `None` once generation ends.
    pub fn next_chunk(&mut self) -> Option<Result<String, LlmError>> {
        let item = block_on(self.rx.recv());
        self.observe(item)
    }

    /// Asynchronously waits for the next chunk, or `None` once generation ends.
    pub async fn next_chunk_async(&mut self) -> Option<Result<String, LlmError>> {
        let item = self.rx.recv().await;
        self.observe(item)
    }

    /// Stops generation before its next token. Chunks already produced can still be received.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The handle cancelling this generation.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Blocks until generation ends, concatenating every chunk.
    pub fn into_text(mut self) -> Result<String, LlmError> {
        let mut text = String::new();
        while let Some(chunk) = self.next_chunk() {
            text.push_str(&chunk?);
        }
        Ok(text)
    }

    /// Waits until generation ends, concatenating every chunk.
    pub async fn into_text_async(mut self) -> Result<String, LlmError> {
        let mut text = String::new();
        while let Some(chunk) = self.next_chunk_async().await {
            text.push_str(&chunk?);
        }
        Ok(text)
    }
}

impl Iterator for CompletionStream {
    type Item = Result<String, LlmError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk()
    }
}

impl Stream for CompletionStream {
    type Item = Result<String, LlmError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let item = ready!(self.rx.poll_recv(cx));
        Poll::Ready(self.observe(item))
    }
}

impl Drop for CompletionStream {
    fn drop(&mut self) {
        // the handle may be shared with later generations
        if !self.finished {
            self.cancel.cancel();
        }
    }
}
