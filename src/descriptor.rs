//! Static descriptor tables.
//!
//! Descriptors defined here live outside the collected heap,
//! in an arena owned by the heap. They are never collected.
//!
//! Every descriptor needs a header of its own.
//! That is a *meta descriptor*, which describes a descriptor object
//! with a specific number of bitmap words.
//! The smallest meta descriptor describes itself.
use std::ptr::NonNull;

use bumpalo::Bump;

use crate::layout::{
    bitmap_words, build_bitmap, DescriptorRef, Word, DESCRIPTOR_PREFIX_WORDS, TAG_MASK
};

/// An arena of static descriptors
pub struct DescriptorTable {
    arena: Bump,
    /// Meta descriptors, indexed by the bitmap length they describe
    meta: Vec<Option<DescriptorRef>>,
    /// The number of descriptors defined by the user
    count: usize,
}
impl DescriptorTable {
    pub fn new() -> Self {
        DescriptorTable {
            arena: Bump::new(),
            meta: Vec::new(),
            count: 0
        }
    }
    /// Define a type of `size` words, where the specified fields are pointers
    ///
    /// Panics if any field is out of bounds (or is the header).
    pub fn define(&mut self, size: usize, pointer_fields: &[usize]) -> DescriptorRef {
        let bitmap = build_bitmap(size, pointer_fields);
        self.define_raw(size, &bitmap)
    }
    /// Define a type using a pre-built pointer bitmap
    ///
    /// This is the format emitted by the front end.
    pub fn define_raw(&mut self, size: usize, bitmap: &[Word]) -> DescriptorRef {
        assert!(size >= 1, "Objects need at least a header");
        assert_eq!(bitmap.len(), bitmap_words(size), "Invalid bitmap for size {}", size);
        let meta = self.meta_descriptor(bitmap.len());
        let descriptor = self.alloc_descriptor(bitmap.len());
        unsafe {
            let ptr = descriptor.as_object().as_ptr();
            *ptr = meta.addr();
            *ptr.add(1) = size;
            std::ptr::copy_nonoverlapping(
                bitmap.as_ptr(),
                ptr.add(DESCRIPTOR_PREFIX_WORDS),
                bitmap.len()
            );
        }
        self.count += 1;
        descriptor
    }
    /// The number of types defined in this table
    ///
    /// This doesn't include meta descriptors
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
    /// Check if the specified descriptor was allocated by this table
    pub fn contains(&self, descriptor: DescriptorRef) -> bool {
        let addr = descriptor.addr();
        // Meta descriptors live in the arena too, checking them first is just faster
        self.meta.iter().flatten().any(|meta| meta.addr() == addr)
            || unsafe {
                self.arena.iter_allocated_chunks_raw().any(|(ptr, len)| {
                    addr >= ptr as usize && addr < ptr as usize + len
                })
            }
    }
    /// The descriptor of descriptor objects with `bitmap_len` bitmap words
    ///
    /// These are used both as the header of static descriptors
    /// and for descriptors allocated in the heap.
    pub fn meta_descriptor(&mut self, bitmap_len: usize) -> DescriptorRef {
        assert!(bitmap_len >= 1);
        if let Some(Some(existing)) = self.meta.get(bitmap_len) {
            return *existing;
        }
        let object_size = DESCRIPTOR_PREFIX_WORDS + bitmap_len;
        let own_bitmap_len = bitmap_words(object_size);
        let header = if own_bitmap_len == bitmap_len {
            None // describes itself
        } else {
            debug_assert!(own_bitmap_len < bitmap_len);
            Some(self.meta_descriptor(own_bitmap_len))
        };
        let meta = self.alloc_descriptor(own_bitmap_len);
        unsafe {
            let ptr = meta.as_object().as_ptr();
            *ptr = header.unwrap_or(meta).addr();
            *ptr.add(1) = object_size;
            // Descriptors have no pointers besides their header
            for index in 0..own_bitmap_len {
                *ptr.add(DESCRIPTOR_PREFIX_WORDS + index) = 0;
            }
        }
        if self.meta.len() <= bitmap_len {
            self.meta.resize(bitmap_len + 1, None);
        }
        self.meta[bitmap_len] = Some(meta);
        meta
    }
    fn alloc_descriptor(&mut self, bitmap_len: usize) -> DescriptorRef {
        let words = self.arena.alloc_slice_fill_copy(
            DESCRIPTOR_PREFIX_WORDS + bitmap_len,
            0 as Word
        );
        let ptr = NonNull::from(&mut words[0]);
        assert_eq!(ptr.as_ptr() as usize & TAG_MASK, 0, "Misaligned descriptor");
        unsafe { DescriptorRef::from_raw(ptr) }
    }
}
impl Default for DescriptorTable {
    fn default() -> Self {
        DescriptorTable::new()
    }
}
/// The table is only mutated through `&mut`,
/// and descriptors are immutable once defined.
unsafe impl Send for DescriptorTable {}
