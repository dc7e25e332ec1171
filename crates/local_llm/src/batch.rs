//! Implements the [`Batch`] struct

use thiserror::Error;
use tinyvec::TinyVec;
use tracing::trace;

use crate::Token;

/// An error raised when writing into a [`Batch`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchError {
    /// The batch already holds as many entries as it can.
    #[error("the batch is full ({capacity} entries); decode it before adding more")]
    Full {
        /// The capacity of the batch.
        capacity: usize,
    },

    /// An entry was assigned to more sequences than the batch supports.
    #[error("an entry was assigned to {provided} sequences, but the batch supports {max}")]
    TooManySequences {
        /// The number of sequence ids provided.
        provided: usize,
        /// The maximum number of sequences.
        max: usize,
    },
}

/// One positioned token waiting to be decoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchEntry {
    /// The token.
    pub token: Token,

    /// The position of the token in the key/value cache.
    pub position: usize,

    /// The sequences this token belongs to.
    pub sequence_ids: TinyVec<[i32; 4]>,

    /// Whether the backend should produce logits for this entry.
    pub logits: bool,
}

/// A fixed-capacity, reusable buffer of tokens to hand to [`Backend::decode`].
///
/// [`Backend::decode`]: crate::Backend::decode
#[derive(Debug)]
pub struct Batch {
    entries: Vec<BatchEntry>,

    /// The maximum number of tokens this batch can have.
    capacity: usize,

    /// The maximum number of sequences a single entry can belong to.
    max_sequences: usize,
}

impl Batch {
    /// Creates an empty batch.
    ///
    /// # Panics
    ///
    /// If `capacity` or `max_sequences` is zero. Both come from validated
    /// [`ClientParams`][crate::ClientParams].
    pub fn new(capacity: usize, max_sequences: usize) -> Self {
        if capacity == 0 {
            panic!("Cannot create a batch with no capacity");
        }
        if max_sequences == 0 {
            panic!("At least one sequence must be generated");
        }

        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            max_sequences,
        }
    }

    /// Removes every entry, keeping the allocation.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Appends an entry, returning its index.
    pub fn add(
        &mut self,
        token: Token,
        position: usize,
        sequence_ids: &[i32],
        logits: bool,
    ) -> Result<usize, BatchError> {
        trace!(
            "Writing token {} of {} ({token:?})",
            self.entries.len(),
            self.capacity
        );

        if self.is_full() {
            return Err(BatchError::Full {
                capacity: self.capacity,
            });
        }
        if self.max_sequences < sequence_ids.len() {
            return Err(BatchError::TooManySequences {
                provided: sequence_ids.len(),
                max: self.max_sequences,
            });
        }

        self.entries.push(BatchEntry {
            token,
            position,
            sequence_ids: sequence_ids.iter().copied().collect(),
            logits,
        });

        Ok(self.entries.len() - 1)
    }

    /// Sets whether the entry at `idx` produces logits.
    ///
    /// # Panics
    ///
    /// If `idx` is out of bounds.
    pub fn set_logits(&mut self, idx: usize, value: bool) {
        assert!(idx < self.entries.len(), "Index out of bounds");

        self.entries[idx].logits = value;
    }

    /// The number of entries in the batch.
    pub fn tokens(&self) -> usize {
        self.entries.len()
    }

    /// Whether the batch has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the batch cannot take another entry.
    pub fn is_full(&self) -> bool {
        self.entries.len() == self.capacity
    }

    /// The maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The entries, in the order they were added.
    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }
}
