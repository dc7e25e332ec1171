//! Image embeddings handed from a vision-capable [`Backend`][crate::Backend] to the prompt
//! encoder.

use std::any::Any;
use std::fmt::Debug;

/// A backend-specific, pre-computed image embedding.
///
/// Implementations usually wrap a native allocation and free it in [`Drop`].
pub trait Embedding: Send + Sync + Debug + Any {
    /// The number of key/value cache positions this embedding occupies once decoded.
    fn slots(&self) -> usize;

    /// Returns `self` as [`Any`], so a backend can recover its concrete type.
    fn as_any(&self) -> &dyn Any;
}

/// An owned image embedding.
///
/// The embedding is exclusively owned by the attachment holding it, and freed when that
/// attachment is dropped.
#[derive(Debug)]
pub struct ImageEmbedding {
    inner: Box<dyn Embedding>,
}

impl ImageEmbedding {
    /// Wraps a backend embedding.
    pub fn new<E: Embedding>(embedding: E) -> Self {
        Self {
            inner: Box::new(embedding),
        }
    }

    /// The number of key/value cache positions this embedding occupies once decoded.
    pub fn slots(&self) -> usize {
        self.inner.slots()
    }

    /// Returns the backend embedding, if it is of type `E`.
    pub fn downcast_ref<E: Embedding>(&self) -> Option<&E> {
        self.inner.as_any().downcast_ref::<E>()
    }
}
