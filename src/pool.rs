//! Pools of heap memory.
//!
//! A pool is a contiguous run of words with a bump cursor.
//! Pools are owned by a [PoolArena] and referenced by [PoolId],
//! so the chains between them are just indexes.
use std::alloc::{self, Layout};
use std::fmt::{self, Debug, Formatter};
use std::ops::{Index, IndexMut};
use std::ptr::{self, NonNull};

use crate::errors::AllocError;
use crate::layout::{Word, WORD_BYTES};

/// Identifies a pool within its arena
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(usize);
impl PoolId {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// A contiguous region of memory with a bump allocator
///
/// Invariant: `start <= free <= end`
pub struct Pool {
    memory: NonNull<Word>,
    layout: Layout,
    /// The capacity in words
    capacity: usize,
    /// The bump cursor, as an offset from the start
    free: usize,
    /// The next pool in the chain
    pub next: Option<PoolId>,
    /// The pool that objects are copied into.
    ///
    /// Only used by the copying collector.
    pub buddy: Option<PoolId>,
    /// Words retained by the last collection
    pub survivors: usize,
    /// The first free block, as an offset from the start
    ///
    /// Only used by the mark/sweep collector.
    pub free_list: Option<usize>,
}
impl Pool {
    fn alloc(capacity: usize) -> Result<Pool, AllocError> {
        assert!(capacity >= 2, "Pools need room for at least one object");
        let layout = Layout::array::<Word>(capacity)
            .map_err(|_| AllocError::OutOfMemory { words: capacity })?;
        let memory = unsafe { alloc::alloc_zeroed(layout) } as *mut Word;
        let memory = NonNull::new(memory)
            .ok_or(AllocError::OutOfMemory { words: capacity })?;
        Ok(Pool {
            memory, layout, capacity, free: 0,
            next: None, buddy: None,
            survivors: 0, free_list: None
        })
    }
    #[inline]
    pub fn start(&self) -> *mut Word {
        self.memory.as_ptr()
    }
    #[inline]
    pub fn end(&self) -> *mut Word {
        self.memory.as_ptr().wrapping_add(self.capacity)
    }
    /// The current position of the bump cursor
    #[inline]
    pub fn free_ptr(&self) -> *mut Word {
        self.memory.as_ptr().wrapping_add(self.free)
    }
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
    /// The words below the bump cursor
    #[inline]
    pub fn used(&self) -> usize {
        self.free
    }
    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity - self.free
    }
    /// Bump allocate the specified number of words
    ///
    /// The memory is **not** cleared.
    #[inline]
    pub fn bump(&mut self, words: usize) -> Option<NonNull<Word>> {
        if self.remaining() >= words {
            let ptr = self.word_ptr(self.free);
            self.free += words;
            Some(ptr)
        } else {
            None
        }
    }
    /// Reset the bump cursor, abandoning everything in the pool
    #[inline]
    pub fn reset(&mut self) {
        self.free = 0;
        self.free_list = None;
    }
    /// Pointer to the word at the specified offset
    #[inline]
    pub fn word_ptr(&self, offset: usize) -> NonNull<Word> {
        assert!(offset <= self.capacity);
        unsafe { NonNull::new_unchecked(self.memory.as_ptr().add(offset)) }
    }
    /// The offset of the specified address within this pool
    #[inline]
    pub fn offset_of(&self, ptr: *const Word) -> usize {
        debug_assert!(self.contains(ptr as usize));
        (ptr as usize - self.start() as usize) / WORD_BYTES
    }
    /// Check if the specified address falls within the pool
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start() as usize && addr < self.end() as usize
    }
    /// Check if the specified address is below the bump cursor
    #[inline]
    pub fn is_used(&self, addr: usize) -> bool {
        addr >= self.start() as usize && addr < self.free_ptr() as usize
    }
}
impl Drop for Pool {
    fn drop(&mut self) {
        unsafe {
            alloc::dealloc(self.memory.as_ptr() as *mut u8, self.layout);
        }
    }
}
impl Debug for Pool {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("start", &self.start())
            .field("free", &self.free)
            .field("capacity", &self.capacity)
            .field("next", &self.next)
            .field("buddy", &self.buddy)
            .field("survivors", &self.survivors)
            .finish()
    }
}

/// Clear the words of a freshly allocated object, except for its header
///
/// ## Safety
/// The memory must be valid for `words` words.
#[inline]
pub unsafe fn clear_object(ptr: NonNull<Word>, words: usize) {
    if words > 1 {
        ptr::write_bytes(ptr.as_ptr().add(1), 0, words - 1);
    }
}

/// Owns all the pools of a heap
///
/// Pools are never freed (until the arena is dropped),
/// so a [PoolId] stays valid for the lifetime of the arena.
pub struct PoolArena {
    pools: Vec<Pool>,
    /// The start address of each pool, sorted for lookup
    by_address: Vec<(usize, PoolId)>,
    /// The total words of all pools
    total_words: usize,
    /// The maximum number of words we're allowed to allocate
    limit: Option<usize>,
}
impl PoolArena {
    pub fn new(limit: Option<usize>) -> Self {
        PoolArena {
            pools: Vec::new(),
            by_address: Vec::new(),
            total_words: 0,
            limit
        }
    }
    /// Allocate a new (unchained) pool with the specified capacity
    pub fn create_pool(&mut self, capacity: usize) -> Result<PoolId, AllocError> {
        self.check_limit(capacity)?;
        let requested = self.total_words + capacity;
        let pool = Pool::alloc(capacity)?;
        let id = PoolId(self.pools.len());
        let start = pool.start() as usize;
        let position = self.by_address.partition_point(|&(addr, _)| addr < start);
        self.by_address.insert(position, (start, id));
        self.pools.push(pool);
        self.total_words = requested;
        Ok(id)
    }
    /// Check that `additional` words can be allocated without exceeding the limit
    pub fn check_limit(&self, additional: usize) -> Result<(), AllocError> {
        let requested = self.total_words + additional;
        match self.limit {
            Some(limit) if requested > limit => {
                Err(AllocError::HeapLimit { limit, requested })
            },
            _ => Ok(())
        }
    }
    /// Find the pool containing the specified address
    #[inline]
    pub fn pool_of(&self, addr: usize) -> Option<PoolId> {
        let position = self.by_address.partition_point(|&(start, _)| start <= addr);
        let (_, id) = *self.by_address.get(position.checked_sub(1)?)?;
        if self.pools[id.0].contains(addr) {
            Some(id)
        } else {
            None
        }
    }
    /// Iterate over the chain of pools starting at `head`
    #[inline]
    pub fn chain(&self, head: Option<PoolId>) -> impl Iterator<Item=PoolId> + '_ {
        std::iter::successors(head, move |&id| self.pools[id.0].next)
    }
    /// Collect the chain into a vector,
    /// so the pools can be mutated while iterating
    pub fn chain_ids(&self, head: Option<PoolId>) -> Vec<PoolId> {
        self.chain(head).collect()
    }
    /// The last pool of the chain starting at `head`
    pub fn tail(&self, head: PoolId) -> PoolId {
        self.chain(Some(head)).last().unwrap_or(head)
    }
    /// The total capacity of a chain, in words
    pub fn chain_capacity(&self, head: Option<PoolId>) -> usize {
        self.chain(head).map(|id| self.pools[id.0].capacity()).sum()
    }
    /// The number of words below the bump cursors of a chain
    pub fn chain_used(&self, head: Option<PoolId>) -> usize {
        self.chain(head).map(|id| self.pools[id.0].used()).sum()
    }
    #[inline]
    pub fn len(&self) -> usize {
        self.pools.len()
    }
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
    /// The total words of every pool, in every chain
    #[inline]
    pub fn total_words(&self) -> usize {
        self.total_words
    }
    /// Forget the survivors of every pool
    pub fn reset_survivors(&mut self) {
        for pool in &mut self.pools {
            pool.survivors = 0;
        }
    }
    pub fn iter(&self) -> impl Iterator<Item=(PoolId, &Pool)> + '_ {
        self.pools.iter().enumerate().map(|(index, pool)| (PoolId(index), pool))
    }
}
impl Index<PoolId> for PoolArena {
    type Output = Pool;
    #[inline]
    fn index(&self, id: PoolId) -> &Pool {
        &self.pools[id.0]
    }
}
impl IndexMut<PoolId> for PoolArena {
    #[inline]
    fn index_mut(&mut self, id: PoolId) -> &mut Pool {
        &mut self.pools[id.0]
    }
}
/// Pools are only accessed by the thread that owns the heap
unsafe impl Send for PoolArena {}
