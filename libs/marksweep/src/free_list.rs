//! Per-pool lists of free blocks.
//!
//! A free block overlays a dead object, so it needs at least two words:
//!
//! ```text
//! [link][size]
//! ```
//!
//! The link is the offset of the next block (within the same pool),
//! packed so that it never conflicts with the tag bits of a header.
//! A zero link ends the list.
use std::ptr::NonNull;

use poolgc::layout::{Word, FORWARD_BIT, MARK_BIT, TAG_MASK};
use poolgc::Pool;

/// The minimum size of a free block (in words)
pub const MINIMUM_WORDS: usize = 2;

/// Tags a block that was already free before the current sweep
///
/// This reuses the bit that marks forwarded objects,
/// since objects are never forwarded by this collector.
pub const FREE_TAG: Word = FORWARD_BIT;
/// Tags a block that was found dead during the current sweep.
///
/// The rest of the word is the size of the block,
/// since the block's descriptor may already be gone.
pub const DEAD_TAG: Word = FORWARD_BIT | MARK_BIT;

/// A free block, overlaying the first two words of a dead object
#[repr(C)]
pub struct FreeBlock {
    /// The (packed) link to the next block, possibly tagged
    pub link: Word,
    /// The size of the block in words
    pub size: usize,
}
impl FreeBlock {
    /// Pack the offset of the next block
    #[inline]
    pub fn encode_link(next: Option<usize>) -> Word {
        match next {
            Some(offset) => (offset + 1) << 2,
            None => 0
        }
    }
    /// The offset of the next block, ignoring any tags
    #[inline]
    pub fn next(&self) -> Option<usize> {
        match self.link >> 2 {
            0 => None,
            packed => Some(packed - 1)
        }
    }
    #[inline]
    pub fn is_tagged(&self) -> bool {
        self.link & TAG_MASK == FREE_TAG
    }
}

/// The block at the specified offset of the pool
///
/// ## Safety
/// The offset must actually reference a free block
#[inline]
pub unsafe fn block_at(pool: &Pool, offset: usize) -> &mut FreeBlock {
    &mut *(pool.word_ptr(offset).as_ptr() as *mut FreeBlock)
}

/// Iterate over the (offset, size) of every block in the free list
///
/// ## Safety
/// The free list must not be corrupted,
/// and must not be modified while iterating
pub unsafe fn iter(pool: &Pool) -> impl Iterator<Item=(usize, usize)> + '_ {
    std::iter::successors(pool.free_list, move |&offset| block_at(pool, offset).next())
        .map(move |offset| (offset, block_at(pool, offset).size))
}

/// The total words in the free list
pub fn free_words(pool: &Pool) -> usize {
    unsafe { iter(pool).map(|(_, size)| size).sum() }
}

/// Tag every block in the free list, so a sweep can tell them apart from dead objects
///
/// ## Safety
/// The list must be valid, and not already tagged
pub unsafe fn tag_all(pool: &Pool) {
    let mut cursor = pool.free_list;
    while let Some(offset) = cursor {
        let block = block_at(pool, offset);
        debug_assert_eq!(block.link & TAG_MASK, 0);
        cursor = block.next();
        block.link |= FREE_TAG;
    }
}

/// Take `words` from the first block that fits
///
/// A block with room for the request *and* another free block is split,
/// giving out its front. A block of exactly the right size is unlinked.
/// Anything else is skipped.
///
/// ## Safety
/// The free list must be valid
pub unsafe fn take_first_fit(pool: &mut Pool, words: usize) -> Option<NonNull<Word>> {
    debug_assert!(words >= MINIMUM_WORDS);
    let mut prev: Option<usize> = None;
    let mut cursor = pool.free_list;
    while let Some(offset) = cursor {
        let block = block_at(pool, offset);
        let next = block.next();
        let replacement = if block.size >= words + MINIMUM_WORDS {
            let remaining = offset + words;
            let remaining_block = block_at(pool, remaining);
            remaining_block.size = block.size - words;
            remaining_block.link = FreeBlock::encode_link(next);
            Some(Some(remaining))
        } else if block.size == words {
            Some(next)
        } else {
            None
        };
        if let Some(replacement) = replacement {
            match prev {
                Some(prev) => block_at(pool, prev).link = FreeBlock::encode_link(replacement),
                None => pool.free_list = replacement,
            }
            return Some(pool.word_ptr(offset));
        }
        prev = Some(offset);
        cursor = next;
    }
    None
}
