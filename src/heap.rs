//! The heap, and its allocator.
use std::ptr::NonNull;
use std::sync::Arc;

use slog::{crit, debug, o, trace, Logger};

use crate::collector::{
    mark_from_roots, CollectionContext, CollectorStrategy, MarkStats, ReclaimStats
};
use crate::config::HeapConfig;
use crate::descriptor::DescriptorTable;
use crate::errors::AllocError;
use crate::layout::{
    build_bitmap, DescriptorRef, HeaderWord, ObjectRef, Word, DESCRIPTOR_PREFIX_WORDS
};
use crate::pool::{clear_object, PoolArena, PoolId};
use crate::push_roots;
use crate::roots::{MutatorRoots, RootRegistry, RootSlot};
use crate::utils::MemorySize;
use crate::worklist::Worklist;

/// Statistics on the lifetime of a heap
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// The total number of collections
    pub collections: u64,
    /// The number of times the heap has grown
    pub growths: u64,
    /// The marking results of the last collection
    pub last_mark: MarkStats,
    /// The reclamation results of the last collection
    pub last_reclaim: ReclaimStats,
}

/// A garbage collected heap, using the specified strategy.
///
/// There is no global state: every heap is independent.
/// The heap itself is `Send`, so threads that share it
/// must wrap it in a lock.
/// Their roots are registered separately,
/// through the heap's [RootRegistry].
pub struct Heap<S: CollectorStrategy> {
    config: HeapConfig,
    logger: Logger,
    pools: PoolArena,
    strategy: S,
    worklist: Worklist,
    registry: Arc<RootRegistry>,
    descriptors: DescriptorTable,
    /// The pool we're currently allocating from
    current: Option<PoolId>,
    stats: HeapStats,
}
impl<S: CollectorStrategy> Heap<S> {
    /// Create a heap with the default configuration,
    /// discarding all log messages
    pub fn create() -> Self {
        Self::with_logger(Logger::root(::slog::Discard, o!()))
    }
    pub fn with_logger(logger: Logger) -> Self {
        Self::with_config(HeapConfig::default(), logger)
    }
    pub fn with_config(config: HeapConfig, logger: Logger) -> Self {
        assert!(config.pool_words >= 2, "Invalid pool size: {}", config.pool_words);
        let logger = logger.new(o!("strategy" => S::NAME));
        debug!(
            logger, "Creating heap";
            "pool_size" => %MemorySize::from_words(config.pool_words),
            "growth_ratio" => config.growth_ratio
        );
        Heap {
            strategy: S::new(&config),
            pools: PoolArena::new(config.max_heap_words),
            worklist: Worklist::new(),
            registry: RootRegistry::new(logger.new(o!("component" => "roots"))),
            descriptors: DescriptorTable::new(),
            current: None,
            stats: HeapStats::default(),
            config, logger
        }
    }
    #[inline]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }
    #[inline]
    pub fn logger(&self) -> &Logger {
        &self.logger
    }
    #[inline]
    pub fn registry(&self) -> &Arc<RootRegistry> {
        &self.registry
    }
    /// Register a new set of roots for the current thread
    #[inline]
    pub fn create_roots(&self) -> MutatorRoots {
        self.registry.register()
    }
    #[inline]
    pub fn stats(&self) -> HeapStats {
        self.stats
    }
    #[inline]
    pub fn pools(&self) -> &PoolArena {
        &self.pools
    }
    #[inline]
    pub fn strategy(&self) -> &S {
        &self.strategy
    }
    #[inline]
    pub fn descriptors(&self) -> &DescriptorTable {
        &self.descriptors
    }
    /// The total words allocated from the system (in every pool)
    #[inline]
    pub fn capacity_words(&self) -> usize {
        self.pools.total_words()
    }
    /// Check if the object is inside an allocated region of this heap
    pub fn contains(&self, object: ObjectRef) -> bool {
        self.pools.pool_of(object.addr())
            .map_or(false, |id| self.pools[id].is_used(object.addr()))
    }
    /// Define a new type, with the specified pointer fields
    ///
    /// The descriptor lives as long as the heap, and is never collected.
    pub fn define_type(&mut self, size: usize, pointer_fields: &[usize]) -> DescriptorRef {
        self.descriptors.define(size, pointer_fields)
    }
    /// Define a new type from a pre-built bitmap
    pub fn define_type_raw(&mut self, size: usize, bitmap: &[Word]) -> DescriptorRef {
        self.descriptors.define_raw(size, bitmap)
    }
    /// Allocate a descriptor inside the collected heap.
    ///
    /// Unlike [Heap::define_type], the result is collected like any other object
    /// (and may be moved), so it must be rooted to stay valid.
    pub fn allocate_descriptor(
        &mut self, roots: &MutatorRoots,
        size: usize, pointer_fields: &[usize]
    ) -> Result<DescriptorRef, AllocError> {
        let bitmap = build_bitmap(size, pointer_fields);
        let meta = self.descriptors.meta_descriptor(bitmap.len());
        let object = self.try_allocate(roots, meta)?;
        unsafe {
            object.write(1, size);
            for (index, &word) in bitmap.iter().enumerate() {
                object.write(DESCRIPTOR_PREFIX_WORDS + index, word);
            }
            Ok(object.as_descriptor())
        }
    }
    /// Allocate a new object, aborting the process if memory can't be obtained.
    ///
    /// Every field besides the header is zeroed.
    pub fn allocate(&mut self, roots: &MutatorRoots, descriptor: DescriptorRef) -> ObjectRef {
        match self.try_allocate(roots, descriptor) {
            Ok(object) => object,
            Err(cause) => {
                crit!(
                    self.logger, "Unable to allocate";
                    "cause" => %cause,
                    "words" => descriptor.size(),
                    "heap_size" => %MemorySize::from_words(self.pools.total_words())
                );
                std::process::abort()
            }
        }
    }
    /// Allocate a new object, collecting and growing the heap as needed
    ///
    /// Only roots that are registered (either in `roots`,
    /// or by a blocked thread) survive a collection.
    pub fn try_allocate(
        &mut self, roots: &MutatorRoots,
        descriptor: DescriptorRef
    ) -> Result<ObjectRef, AllocError> {
        assert!(
            Arc::ptr_eq(roots.registry(), &self.registry),
            "Roots belong to a different heap"
        );
        let words = S::object_words(descriptor.size());
        if words > self.config.pool_words {
            return Err(AllocError::ObjectTooLarge {
                words, pool_words: self.config.pool_words
            });
        }
        if !self.strategy.is_initialized() {
            self.strategy.init_pools(&mut self.pools, &self.config, &self.logger)?;
            self.current = self.strategy.allocation_head();
        }
        let mut descriptor = descriptor;
        let mut retries = 0u32;
        loop {
            if let Some(ptr) = self.allocate_from_chain(words) {
                unsafe {
                    clear_object(ptr, words);
                    let object = ObjectRef::from_non_null(ptr);
                    object.set_header(HeaderWord::new(descriptor));
                    return Ok(object);
                }
            }
            trace!(
                self.logger, "Heap exhausted";
                "words" => words,
                "retries" => retries
            );
            // Heap descriptors can move
            let descriptor_slot = RootSlot::new(Some(descriptor.as_object()));
            {
                push_roots!(roots, descriptor_slot);
                self.collect_internal(roots);
            }
            if let Some(moved) = descriptor_slot.get() {
                descriptor = unsafe { moved.as_descriptor() };
            }
            self.grow(retries > 0)?;
            self.current = self.strategy.allocation_head();
            retries += 1;
        }
    }
    fn allocate_from_chain(&mut self, words: usize) -> Option<NonNull<Word>> {
        while let Some(id) = self.current {
            if let Some(ptr) = self.strategy.allocate_in(&mut self.pools, id, words) {
                return Some(ptr);
            }
            self.current = self.pools[id].next;
        }
        None
    }
    fn grow(&mut self, force: bool) -> Result<(), AllocError> {
        let old_capacity = self.pools.total_words();
        if self.strategy.grow(&mut self.pools, &self.config, force, &self.logger)? {
            self.stats.growths += 1;
            debug!(
                self.logger, "Grew heap";
                "forced" => force,
                "old_size" => %MemorySize::from_words(old_capacity),
                "new_size" => %MemorySize::from_words(self.pools.total_words())
            );
        }
        Ok(())
    }
    /// Perform a collection, using the roots of the current thread
    /// (and every blocked thread).
    ///
    /// This never grows the heap.
    pub fn collect(&mut self, roots: &MutatorRoots) -> ReclaimStats {
        let stats = self.collect_internal(roots);
        // Manual collections don't count towards growth
        self.pools.reset_survivors();
        stats
    }
    fn collect_internal(&mut self, roots: &MutatorRoots) -> ReclaimStats {
        if !self.strategy.is_initialized() {
            return ReclaimStats::default();
        }
        let snapshot = self.registry.snapshot(roots);
        debug!(
            self.logger, "Beginning collection";
            "threads" => snapshot.thread_count(),
            "heap_size" => %MemorySize::from_words(self.pools.total_words())
        );
        let mark = {
            let mut worklist = scopeguard::guard(&mut self.worklist, |worklist| worklist.clear());
            unsafe { mark_from_roots(&mut self.pools, &mut **worklist, &snapshot, S::object_words) }
        };
        let reclaim = unsafe {
            self.strategy.reclaim(CollectionContext {
                pools: &mut self.pools,
                roots: &snapshot,
                logger: &self.logger
            })
        };
        self.current = self.strategy.allocation_head();
        self.stats.collections += 1;
        self.stats.last_mark = mark;
        self.stats.last_reclaim = reclaim;
        debug!(
            self.logger, "Finished collection";
            "marked_objects" => mark.objects,
            "live" => %MemorySize::from_words(reclaim.live_words),
            "reclaimed" => %MemorySize::from_words(reclaim.reclaimed_words)
        );
        reclaim
    }
    /// A cooperative scheduling hook, invoked at safepoints.
    ///
    /// Currently does nothing, and never yields.
    #[inline]
    pub fn yield_now(&self) -> bool {
        false
    }
}
