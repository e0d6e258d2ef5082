//! Configuration of the heap.

/// The default size of a pool, in words (1 MiB on 64-bit targets)
pub const DEFAULT_POOL_WORDS: usize = 128 * 1024;
/// By default, grow once half of the heap survives
pub const DEFAULT_GROWTH_RATIO: u32 = 1;

/// The configuration of a heap
///
/// This is fixed once the heap is created.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde1", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde1", serde(default))]
pub struct HeapConfig {
    /// The size of every pool, in words
    ///
    /// This bounds the size of a single object.
    pub pool_words: usize,
    /// Grow the heap whenever `survivors << growth_ratio`
    /// exceeds the capacity.
    pub growth_ratio: u32,
    /// The maximum number of words the heap may allocate
    /// (including both halves of the copying collector)
    pub max_heap_words: Option<usize>,
}
impl HeapConfig {
    /// Check if the survivors of a collection should trigger growth
    #[inline]
    pub fn should_grow(&self, survivors: usize, capacity: usize) -> bool {
        1usize.checked_shl(self.growth_ratio)
            .and_then(|factor| survivors.checked_mul(factor))
            .map_or(true, |scaled| scaled > capacity)
    }
}
impl Default for HeapConfig {
    fn default() -> Self {
        HeapConfig {
            pool_words: DEFAULT_POOL_WORDS,
            growth_ratio: DEFAULT_GROWTH_RATIO,
            max_heap_words: None
        }
    }
}
