//! An in place mark/sweep collector.
//!
//! Live objects never move. Dead objects are swept into per-pool
//! [free lists](free_list), which allocation searches (first fit)
//! before falling back to the pool's bump cursor.
//!
//! Every object takes at least two words, so it can hold a free block.
use std::ptr::NonNull;

use slog::{debug, trace, Logger};

use poolgc::collector::{CollectionContext, CollectorStrategy, GrowthSample, ReclaimStats};
use poolgc::layout::{HeaderWord, Word, MARK_BIT, TAG_MASK};
use poolgc::utils::MemorySize;
use poolgc::{AllocError, Heap, HeapConfig, PoolArena, PoolId};

pub mod free_list;

use self::free_list::{FreeBlock, DEAD_TAG, FREE_TAG, MINIMUM_WORDS};

/// A heap using the mark/sweep collector
pub type MarkSweepHeap = Heap<MarkSweep>;

/// The mark/sweep strategy
#[derive(Debug)]
pub struct MarkSweep {
    head: Option<PoolId>,
    pool_words: usize,
}
impl MarkSweep {
    /// The first pool of the chain
    #[inline]
    pub fn head(&self) -> Option<PoolId> {
        self.head
    }
    /// Replace the header of every dead object with its (tagged) size.
    ///
    /// This has to finish before any free block is written,
    /// because a dead object's descriptor may itself be a dead object.
    unsafe fn classify_pool(pools: &PoolArena, pool: PoolId) -> usize {
        let pool = &pools[pool];
        let end = pool.free_ptr();
        let mut ptr: *mut Word = pool.start();
        let mut dead = 0;
        while ptr < end {
            let header = HeaderWord(*ptr);
            let size = match header.0 & TAG_MASK {
                FREE_TAG => (*(ptr as *const FreeBlock)).size,
                MARK_BIT => Self::object_words(header.descriptor().size()),
                0 => {
                    let size = Self::object_words(header.descriptor().size());
                    *ptr = (size << 2) | DEAD_TAG;
                    dead += size;
                    size
                },
                _ => panic!("Invalid header {:?} at {:p}", header, ptr),
            };
            ptr = ptr.add(size);
        }
        dead
    }
    /// Unmark live objects, and rebuild the free list from
    /// both the old free blocks and the newly dead objects.
    ///
    /// Returns the number of live words.
    unsafe fn sweep_pool(pools: &mut PoolArena, pool: PoolId) -> usize {
        let pool = &mut pools[pool];
        let end = pool.free_ptr();
        let mut ptr: *mut Word = pool.start();
        let mut head: Option<usize> = None;
        let mut live = 0;
        while ptr < end {
            let header = HeaderWord(*ptr);
            let size = match header.0 & TAG_MASK {
                MARK_BIT => {
                    *ptr = header.unmarked().0;
                    let size = Self::object_words(header.descriptor().size());
                    live += size;
                    size
                },
                FREE_TAG | DEAD_TAG => {
                    let size = if header.0 & TAG_MASK == DEAD_TAG {
                        header.0 >> 2
                    } else {
                        (*(ptr as *const FreeBlock)).size
                    };
                    debug_assert!(size >= MINIMUM_WORDS);
                    let block = &mut *(ptr as *mut FreeBlock);
                    block.size = size;
                    block.link = FreeBlock::encode_link(head);
                    head = Some(pool.offset_of(ptr));
                    size
                },
                _ => panic!("Unclassified header {:?} at {:p}", header, ptr),
            };
            ptr = ptr.add(size);
        }
        pool.free_list = head;
        live
    }
}
impl CollectorStrategy for MarkSweep {
    const NAME: &'static str = "mark-sweep";

    fn new(config: &HeapConfig) -> Self {
        assert!(config.pool_words >= MINIMUM_WORDS);
        MarkSweep {
            head: None,
            pool_words: config.pool_words
        }
    }

    #[inline]
    fn is_initialized(&self) -> bool {
        self.head.is_some()
    }

    fn init_pools(
        &mut self, pools: &mut PoolArena,
        _config: &HeapConfig, logger: &Logger
    ) -> Result<(), AllocError> {
        debug_assert!(!self.is_initialized());
        self.head = Some(pools.create_pool(self.pool_words)?);
        trace!(
            logger, "Created initial pool";
            "pool_size" => %MemorySize::from_words(self.pool_words)
        );
        Ok(())
    }

    #[inline]
    fn allocation_head(&self) -> Option<PoolId> {
        self.head
    }

    #[inline]
    fn object_words(size: usize) -> usize {
        size.max(MINIMUM_WORDS)
    }

    #[inline]
    fn allocate_in(&mut self, pools: &mut PoolArena, pool: PoolId, words: usize) -> Option<NonNull<Word>> {
        let pool = &mut pools[pool];
        if pool.free_list.is_some() {
            if let Some(ptr) = unsafe { free_list::take_first_fit(pool, words) } {
                return Some(ptr);
            }
        }
        pool.bump(words)
    }

    unsafe fn reclaim(&mut self, context: CollectionContext<'_>) -> ReclaimStats {
        let CollectionContext { pools, roots: _, logger } = context;
        let chain = pools.chain_ids(self.head);
        for &pool in &chain {
            free_list::tag_all(&pools[pool]);
        }
        let mut stats = ReclaimStats::default();
        for &pool in &chain {
            stats.reclaimed_words += Self::classify_pool(pools, pool);
        }
        for &pool in &chain {
            stats.live_words += Self::sweep_pool(pools, pool);
        }
        trace!(
            logger, "Swept pools";
            "pools" => chain.len(),
            "live" => stats.live_words,
            "freed" => stats.reclaimed_words
        );
        stats
    }

    fn grow(
        &mut self, pools: &mut PoolArena, config: &HeapConfig,
        force: bool, logger: &Logger
    ) -> Result<bool, AllocError> {
        let head = match self.head {
            Some(head) => head,
            None => return Ok(false)
        };
        let sample = GrowthSample::take(pools, Some(head));
        if !force && !sample.should_grow(config) {
            return Ok(false);
        }
        let existing = pools.chain(Some(head)).count();
        if let Err(cause) = pools.check_limit(existing * self.pool_words) {
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
        let mut tail = pools.tail(head);
        for _ in 0..existing {
            let pool = pools.create_pool(self.pool_words)?;
            pools[tail].next = Some(pool);
            tail = pool;
        }
        debug!(
            logger, "Added pools";
            "pools" => existing,
            "forced" => force,
            "survivors" => sample.survivors,
            "capacity" => sample.capacity
        );
        Ok(true)
    }
}
