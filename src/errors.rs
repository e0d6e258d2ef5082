//! Errors returned by the heap.
use thiserror::Error;

/// An error that occurs while allocating
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// The system allocator couldn't provide a new pool
    #[error("Out of memory allocating {words} words")]
    OutOfMemory {
        /// The size of the pool we tried to allocate
        words: usize
    },
    /// Growing the heap would exceed the configured limit
    #[error("Heap limit of {limit} words exceeded (requested {requested} words)")]
    HeapLimit {
        limit: usize,
        requested: usize
    },
    /// The object can never fit inside a single pool
    #[error("Object of {words} words is larger than a pool ({pool_words} words)")]
    ObjectTooLarge {
        words: usize,
        pool_words: usize
    }
}
