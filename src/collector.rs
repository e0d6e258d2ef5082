//! The interface between the heap and its collection strategy.
//!
//! Both strategies share the allocator front end and the marking phase.
//! They only differ in how they reclaim memory (and grow the heap).
use std::ptr::NonNull;

use slog::Logger;

use crate::config::HeapConfig;
use crate::errors::AllocError;
use crate::layout::{ObjectRef, Word, TAG_MASK};
use crate::pool::{PoolArena, PoolId};
use crate::roots::RootSnapshot;
use crate::worklist::Worklist;

/// Everything a strategy needs to reclaim memory.
///
/// By the time this is created, marking has already completed.
pub struct CollectionContext<'a> {
    pub pools: &'a mut PoolArena,
    pub roots: &'a RootSnapshot<'a>,
    pub logger: &'a Logger,
}

/// The results of the marking phase
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct MarkStats {
    /// The number of objects that were reached
    pub objects: usize,
    /// The total words of the reached objects
    pub words: usize,
}

/// The results of reclamation
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ReclaimStats {
    /// The words retained by live objects
    pub live_words: usize,
    /// The words made available for reuse
    pub reclaimed_words: usize,
}

/// A strategy for reclaiming memory.
///
/// This is selected once, when the heap is created.
pub trait CollectorStrategy: Sized + Send + 'static {
    /// The name of the strategy, for logging
    const NAME: &'static str;

    fn new(config: &HeapConfig) -> Self;
    /// Check if the initial pools have been created
    fn is_initialized(&self) -> bool;
    /// Create the initial pools
    ///
    /// This happens lazily, on the first allocation.
    fn init_pools(
        &mut self, pools: &mut PoolArena,
        config: &HeapConfig, logger: &Logger
    ) -> Result<(), AllocError>;
    /// The first pool of the chain that allocation uses
    fn allocation_head(&self) -> Option<PoolId>;
    /// The number of words that are actually reserved
    /// for an object of `size` words
    #[inline]
    fn object_words(size: usize) -> usize {
        size
    }
    /// Attempt to allocate the specified number of words in a single pool.
    ///
    /// The memory doesn't need to be cleared.
    #[inline]
    fn allocate_in(&mut self, pools: &mut PoolArena, pool: PoolId, words: usize) -> Option<NonNull<Word>> {
        pools[pool].bump(words)
    }
    /// Reclaim the memory of every object that wasn't marked,
    /// clearing all the mark bits.
    ///
    /// ## Safety
    /// Marking must have just completed, and the roots of the
    /// snapshot must be the same ones that were used for marking.
    unsafe fn reclaim(&mut self, context: CollectionContext<'_>) -> ReclaimStats;
    /// Apply the growth heuristic, after a collection triggered by allocation.
    ///
    /// Growth always happens if `force` is true.
    /// An unforced growth that would exceed the heap limit is skipped,
    /// only a forced one reports [AllocError::HeapLimit].
    /// Returns true if the heap grew.
    fn grow(
        &mut self, pools: &mut PoolArena, config: &HeapConfig,
        force: bool, logger: &Logger
    ) -> Result<bool, AllocError>;
}

/// Mark every object that is reachable from the roots,
/// counting the survivors of each pool.
///
/// Addresses outside of the heap (like static descriptors)
/// are never marked.
///
/// ## Safety
/// Every root and every pointer field must reference a valid object (or be null).
/// The worklist must be empty.
pub unsafe fn mark_from_roots(
    pools: &mut PoolArena,
    worklist: &mut Worklist,
    roots: &RootSnapshot<'_>,
    object_words: fn(usize) -> usize
) -> MarkStats {
    debug_assert!(worklist.is_empty());
    pools.reset_survivors();
    roots.for_each_slot(|slot| worklist.push(NonNull::from(slot).cast::<Word>()));
    let mut stats = MarkStats::default();
    while let Some(slot) = worklist.pop() {
        let value = *slot.as_ptr();
        if value == 0 {
            continue;
        }
        // Header slots are already marked
        let object = match ObjectRef::from_word(value & !TAG_MASK) {
            Some(object) => object,
            None => continue,
        };
        let pool = match pools.pool_of(object.addr()) {
            Some(pool) => pool,
            None => continue,
        };
        let header = object.header();
        if header.is_marked() {
            continue;
        }
        debug_assert!(!header.is_forwarded(), "Forwarded during marking: {:?}", object);
        object.set_header(header.marked());
        let descriptor = header.descriptor();
        let words = object_words(descriptor.size());
        pools[pool].survivors += words;
        stats.objects += 1;
        stats.words += words;
        for field in descriptor.pointer_fields() {
            if object.read(field) != 0 {
                worklist.push(NonNull::new_unchecked(object.slot(field)));
            }
        }
        worklist.push(NonNull::new_unchecked(object.slot(0)));
    }
    stats
}

/// The statistics used by the growth heuristic
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct GrowthSample {
    pub survivors: usize,
    pub capacity: usize,
}
impl GrowthSample {
    /// Sum the survivors and capacity of a chain,
    /// resetting the survivors of every pool.
    pub fn take(pools: &mut PoolArena, head: Option<PoolId>) -> GrowthSample {
        let mut sample = GrowthSample::default();
        for id in pools.chain_ids(head) {
            let pool = &mut pools[id];
            sample.capacity += pool.capacity();
            sample.survivors += std::mem::take(&mut pool.survivors);
        }
        sample
    }
    #[inline]
    pub fn should_grow(&self, config: &HeapConfig) -> bool {
        config.should_grow(self.survivors, self.capacity)
    }
}
