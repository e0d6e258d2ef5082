//! A semi-space copying collector.
//!
//! The heap is split into two halves of paired (buddy) pools.
//! Allocation bumps through the active half. A collection copies every marked
//! object into its pool's buddy, then the halves swap roles.
//!
//! Dead objects are never touched, so collection is proportional
//! to the size of the live set. The cost is doubled memory usage.
use std::ptr::{self, NonNull};

use slog::{debug, trace, Logger};

use poolgc::collector::{CollectionContext, CollectorStrategy, GrowthSample, ReclaimStats};
use poolgc::layout::{HeaderWord, ObjectRef, Word};
use poolgc::utils::MemorySize;
use poolgc::{AllocError, Heap, HeapConfig, PoolArena, PoolId};

/// A heap using the semi-space collector
pub type SemiSpaceHeap = Heap<SemiSpace>;

/// The semi-space copying strategy
#[derive(Debug)]
pub struct SemiSpace {
    /// The first pool of each half
    halves: [Option<PoolId>; 2],
    /// The index of the half we're allocating from
    active: usize,
    pool_words: usize,
}
impl SemiSpace {
    /// The index of the currently active half (either zero or one)
    #[inline]
    pub fn active_half(&self) -> usize {
        self.active
    }
    /// The head of the specified half
    #[inline]
    pub fn half(&self, index: usize) -> Option<PoolId> {
        self.halves[index]
    }
    /// Allocate a new pair of buddy pools
    fn create_pair(&self, pools: &mut PoolArena) -> Result<(PoolId, PoolId), AllocError> {
        pools.check_limit(2 * self.pool_words)?;
        let first = pools.create_pool(self.pool_words)?;
        let second = pools.create_pool(self.pool_words)?;
        pools[first].buddy = Some(second);
        pools[second].buddy = Some(first);
        Ok((first, second))
    }
    /// Copy every marked object of `from` into its buddy,
    /// leaving a forwarding address behind.
    ///
    /// Returns the number of (live, dead) words.
    unsafe fn forward_pool(pools: &mut PoolArena, from: PoolId) -> (usize, usize) {
        let to = pools[from].buddy
            .unwrap_or_else(|| panic!("Pool {:?} has no buddy", from));
        let end = pools[from].free_ptr();
        let mut ptr = pools[from].start();
        let (mut live, mut dead) = (0, 0);
        while ptr < end {
            let object = ObjectRef::from_non_null(NonNull::new_unchecked(ptr));
            let header = object.header();
            // The descriptor may have been forwarded, but its size is intact
            let size = header.descriptor().size();
            if header.is_marked() {
                let target = pools[to].bump(size)
                    .unwrap_or_else(|| panic!("Buddy pool {:?} overflowed", to));
                ptr::copy_nonoverlapping(ptr, target.as_ptr(), size);
                let target = ObjectRef::from_non_null(target);
                target.set_header(header.unmarked());
                object.set_header(HeaderWord::forwarded_to(target));
                live += size;
            } else {
                dead += size;
            }
            ptr = ptr.add(size);
        }
        (live, dead)
    }
    /// Rewrite every reference to a forwarded object,
    /// in every (copied) object of the pool
    unsafe fn fixup_pool(pools: &PoolArena, pool: PoolId) {
        let end = pools[pool].free_ptr();
        let mut ptr: *mut Word = pools[pool].start();
        while ptr < end {
            let object = ObjectRef::from_non_null(NonNull::new_unchecked(ptr));
            let descriptor_header = object.descriptor().as_object().header();
            if descriptor_header.is_forwarded() {
                object.set_header(HeaderWord(descriptor_header.forwarding_target().addr()));
            }
            let descriptor = object.descriptor();
            for field in descriptor.pointer_fields() {
                if let Some(target) = object.field(field) {
                    let target_header = target.header();
                    if target_header.is_forwarded() {
                        object.set_field(field, Some(target_header.forwarding_target()));
                    }
                }
            }
            ptr = ptr.add(descriptor.size());
        }
    }
}
impl CollectorStrategy for SemiSpace {
    const NAME: &'static str = "semi-space";

    fn new(config: &HeapConfig) -> Self {
        SemiSpace {
            halves: [None, None],
            active: 0,
            pool_words: config.pool_words
        }
    }

    #[inline]
    fn is_initialized(&self) -> bool {
        self.halves[0].is_some()
    }

    fn init_pools(
        &mut self, pools: &mut PoolArena,
        _config: &HeapConfig, logger: &Logger
    ) -> Result<(), AllocError> {
        debug_assert!(!self.is_initialized());
        let (first, second) = self.create_pair(pools)?;
        self.halves = [Some(first), Some(second)];
        self.active = 0;
        trace!(
            logger, "Created initial pools";
            "pool_size" => %MemorySize::from_words(self.pool_words)
        );
        Ok(())
    }

    #[inline]
    fn allocation_head(&self) -> Option<PoolId> {
        self.halves[self.active]
    }

    unsafe fn reclaim(&mut self, context: CollectionContext<'_>) -> ReclaimStats {
        let CollectionContext { pools, roots, logger } = context;
        let from_pools = pools.chain_ids(self.halves[self.active]);
        let mut stats = ReclaimStats::default();
        for &pool in &from_pools {
            let (live, dead) = Self::forward_pool(pools, pool);
            stats.live_words += live;
            stats.reclaimed_words += dead;
        }
        self.active ^= 1;
        trace!(
            logger, "Forwarded objects";
            "copied" => stats.live_words,
            "abandoned" => stats.reclaimed_words
        );
        roots.for_each_slot(|slot| {
            if let Some(object) = slot.get() {
                let header = object.header();
                if header.is_forwarded() {
                    slot.set(Some(header.forwarding_target()));
                }
            }
        });
        for pool in pools.chain_ids(self.halves[self.active]) {
            Self::fixup_pool(pools, pool);
        }
        for &pool in &from_pools {
            pools[pool].reset();
        }
        stats
    }

    fn grow(
        &mut self, pools: &mut PoolArena, config: &HeapConfig,
        force: bool, logger: &Logger
    ) -> Result<bool, AllocError> {
        let active = self.halves[self.active];
        let inactive = self.halves[self.active ^ 1];
        // Survivors were counted against the pools they were copied from
        let survivors = GrowthSample::take(pools, active).survivors
            + GrowthSample::take(pools, inactive).survivors;
        let sample = GrowthSample {
            survivors,
            capacity: pools.chain_capacity(active)
        };
        if !force && !sample.should_grow(config) {
            return Ok(false);
        }
        let (active_head, inactive_head) = match (active, inactive) {
            (Some(active), Some(inactive)) => (active, inactive),
            _ => return Ok(false)
        };
        let existing = pools.chain(Some(active_head)).count();
        if let Err(cause) = pools.check_limit(existing * 2 * self.pool_words) {
            if !force {
                debug!(
                    logger, "Skipped growth at the heap limit";
                    "cause" => %cause,
                    "survivors" => sample.survivors
                );
                return Ok(false);
            }
            return Err(cause);
        }
        let mut active_tail = pools.tail(active_head);
        let mut inactive_tail = pools.tail(inactive_head);
        for _ in 0..existing {
            let (first, second) = self.create_pair(pools)?;
            pools[active_tail].next = Some(first);
            pools[inactive_tail].next = Some(second);
            active_tail = first;
            inactive_tail = second;
        }
        debug!(
            logger, "Added pool pairs";
            "pairs" => existing,
            "forced" => force,
            "survivors" => sample.survivors,
            "capacity" => sample.capacity
        );
        Ok(true)
    }
}
