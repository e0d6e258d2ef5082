//! Utilities for logging.
use std::fmt::{self, Debug, Display, Formatter};

use crate::layout::WORD_BYTES;

/// The identity of a thread, for logging
#[derive(Clone)]
pub struct ThreadId {
    id: std::thread::ThreadId,
    name: Option<String>
}
impl ThreadId {
    pub fn current() -> ThreadId {
        let thread = std::thread::current();
        ThreadId {
            id: thread.id(),
            name: thread.name().map(String::from)
        }
    }
}
impl slog::Value for ThreadId {
    fn serialize(
        &self, _record: &slog::Record,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer
    ) -> slog::Result<()> {
        match self.name {
            Some(ref name) => {
                serializer.emit_arguments(key, &format_args!(
                    "{}: {:?}", *name, self.id
                ))
            },
            None => {
                serializer.emit_arguments(key, &format_args!(
                    "{:?}", self.id
                ))
            },
        }
    }
}
impl Debug for ThreadId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.name {
            None => write!(f, "{:?}", self.id),
            Some(ref name) => {
                f.debug_tuple("ThreadId")
                    .field(&self.id)
                    .field(name)
                    .finish()
            }
        }
    }
}

/// The size of memory in bytes
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemorySize {
    pub bytes: usize
}
impl MemorySize {
    #[inline]
    pub fn from_words(words: usize) -> MemorySize {
        MemorySize { bytes: words * WORD_BYTES }
    }
}
impl Display for MemorySize {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            write!(f, "{}", self.bytes)
        } else {
            // Write approximation
            let bytes = self.bytes;
            let (amount, suffix) = if bytes > 1024 * 1024 * 1024 {
                (1024 * 1024 * 1024, "GB")
            } else if bytes > 1024 * 1024 {
                (1024 * 1024, "MB")
            } else if bytes > 1024 {
                (1024, "KB")
            } else {
                (1, "")
            };
            write!(f, "{:.2}{}", bytes as f64 / amount as f64, suffix)
        }
    }
}
