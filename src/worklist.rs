//! The worklist of slots that still need to be searched.
//!
//! This is an explicit stack, so deep object graphs
//! can't overflow the native stack.
use std::ptr::NonNull;

use arrayvec::ArrayVec;

use crate::layout::Word;

/// The number of entries in a single chunk
pub const CHUNK_SIZE: usize = 1024;

type Chunk = ArrayVec<NonNull<Word>, CHUNK_SIZE>;

/// A chunked stack of *addresses of pointers*.
///
/// Chunks are kept around once allocated,
/// so a heap's worklist stops allocating after its first few collections.
pub struct Worklist {
    chunks: Vec<Box<Chunk>>,
    /// The index of the chunk currently being pushed to
    current: usize,
}
impl Worklist {
    pub fn new() -> Self {
        Worklist {
            chunks: vec![Box::new(ArrayVec::new())],
            current: 0
        }
    }
    #[inline]
    pub fn push(&mut self, slot: NonNull<Word>) {
        if self.chunks[self.current].is_full() {
            self.current += 1;
            if self.current == self.chunks.len() {
                self.chunks.push(Box::new(ArrayVec::new()));
            }
            debug_assert!(self.chunks[self.current].is_empty());
        }
        self.chunks[self.current].push(slot);
    }
    #[inline]
    pub fn pop(&mut self) -> Option<NonNull<Word>> {
        let chunk = &mut self.chunks[self.current];
        let slot = chunk.pop()?;
        if chunk.is_empty() && self.current > 0 {
            self.current -= 1;
        }
        Some(slot)
    }
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.current == 0 && self.chunks[0].is_empty()
    }
    /// The total number of entries
    pub fn len(&self) -> usize {
        self.current * CHUNK_SIZE + self.chunks[self.current].len()
    }
    /// The number of chunks that have been allocated (used or not)
    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
    /// Remove every entry, keeping the chunks for reuse
    pub fn clear(&mut self) {
        for chunk in &mut self.chunks[..=self.current] {
            chunk.clear();
        }
        self.current = 0;
    }
}
impl Default for Worklist {
    fn default() -> Self {
        Worklist::new()
    }
}
/// The worklist is always empty between collections
unsafe impl Send for Worklist {}
