//! The in memory layout of heap objects.
//!
//! Every object is a run of machine words. Word zero is the [header](HeaderWord),
//! which references the object's [descriptor](DescriptorRef).
//! Descriptors are laid out like any other object:
//!
//! ```text
//! [header][size][bitmap 0][bitmap 1]...
//! ```
//!
//! ## Safety
//! Relying on this layout is incredibly unsafe.
//! Generated code depends on it though, so it is documented (and stable).
use std::fmt::{self, Debug, Formatter};
use std::mem;
use std::ptr::NonNull;

/// A single machine word of heap memory
pub type Word = usize;
/// The size of a [Word] in bytes
pub const WORD_BYTES: usize = mem::size_of::<Word>();
/// The number of bits in a [Word]
pub const WORD_BITS: usize = WORD_BYTES * 8;

/// The low bits of a header that are used for collector state.
///
/// This is why descriptors must be aligned to at least four bytes.
pub const TAG_MASK: Word = 0b11;
/// Set on a header once the object has been reached during marking
pub const MARK_BIT: Word = 0b01;
/// Set on a header once the object has been copied,
/// the rest of the header is the address of the copy
pub const FORWARD_BIT: Word = 0b10;

/// Words preceding the bitmap in a descriptor (header and size)
pub const DESCRIPTOR_PREFIX_WORDS: usize = 2;

/// The number of bitmap words needed to describe an object of `size` words
#[inline]
pub const fn bitmap_words(size: usize) -> usize {
    if size <= WORD_BITS {
        1
    } else {
        (size + WORD_BITS - 1) / WORD_BITS
    }
}

/// Build the pointer bitmap for an object of `size` words
///
/// The header (word zero) can't be listed.
/// Its bit is used as the "has pointers" flag instead.
pub fn build_bitmap(size: usize, pointer_fields: &[usize]) -> Vec<Word> {
    assert!(size >= 1, "Objects need at least a header");
    let mut bitmap = vec![0; bitmap_words(size)];
    for &field in pointer_fields {
        assert!(
            field >= 1 && field < size,
            "Invalid pointer field {} for object of {} words",
            field, size
        );
        bitmap[field / WORD_BITS] |= 1 << (field % WORD_BITS);
    }
    if !pointer_fields.is_empty() {
        bitmap[0] |= 1;
    }
    bitmap
}

/// A reference to a heap object.
///
/// This is just the address of the object's header word.
/// `Option<ObjectRef>` has the same representation as a nullable pointer,
/// which is exactly what root slots and pointer fields contain.
///
/// A moving collection invalidates every reference
/// that isn't reachable from a registered root.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef(NonNull<Word>);
impl ObjectRef {
    /// Wrap a raw address, returning `None` if it is null
    #[inline]
    pub fn from_ptr(ptr: *mut Word) -> Option<ObjectRef> {
        NonNull::new(ptr).map(ObjectRef)
    }
    #[inline]
    pub fn from_non_null(ptr: NonNull<Word>) -> ObjectRef {
        ObjectRef(ptr)
    }
    /// Interpret a word as a (nullable) object reference
    #[inline]
    pub fn from_word(word: Word) -> Option<ObjectRef> {
        ObjectRef::from_ptr(word as *mut Word)
    }
    #[inline]
    pub fn as_ptr(self) -> *mut Word {
        self.0.as_ptr()
    }
    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
    /// A pointer to the specified word of the object
    ///
    /// ## Safety
    /// The index must be in bounds
    #[inline]
    pub unsafe fn slot(self, index: usize) -> *mut Word {
        self.as_ptr().add(index)
    }
    /// The (possibly tagged) header word
    ///
    /// ## Safety
    /// Assumes this references a valid object
    #[inline]
    pub unsafe fn header(self) -> HeaderWord {
        HeaderWord(*self.as_ptr())
    }
    #[inline]
    pub unsafe fn set_header(self, header: HeaderWord) {
        *self.as_ptr() = header.0;
    }
    /// The descriptor of this object, ignoring any tag bits
    ///
    /// ## Safety
    /// Undefined behavior if the object has been forwarded
    #[inline]
    pub unsafe fn descriptor(self) -> DescriptorRef {
        self.header().descriptor()
    }
    /// Read the specified word of the object
    ///
    /// ## Safety
    /// The index must be in bounds, and the object must be valid
    #[inline]
    pub unsafe fn read(self, index: usize) -> Word {
        *self.slot(index)
    }
    #[inline]
    pub unsafe fn write(self, index: usize, value: Word) {
        *self.slot(index) = value;
    }
    /// Read a pointer field of the object
    #[inline]
    pub unsafe fn field(self, index: usize) -> Option<ObjectRef> {
        ObjectRef::from_word(self.read(index))
    }
    /// Write a pointer field of the object
    #[inline]
    pub unsafe fn set_field(self, index: usize, value: Option<ObjectRef>) {
        self.write(index, value.map_or(0, ObjectRef::addr));
    }
    /// Reinterpret this object as a descriptor
    ///
    /// ## Safety
    /// The object must actually have been allocated as a descriptor
    #[inline]
    pub unsafe fn as_descriptor(self) -> DescriptorRef {
        DescriptorRef(self.0)
    }
}
impl Debug for ObjectRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:p})", self.0)
    }
}

/// The logical state of a header.
///
/// This is never stored directly.
/// It's packed into a single [HeaderWord].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HeaderState {
    /// The state between collections
    Unmarked(DescriptorRef),
    /// Reached during marking, but not (yet) copied
    Marked(DescriptorRef),
    /// Copied to the specified location
    Forwarded(ObjectRef),
}

/// A header, possibly with the collector's tag bits set.
///
/// This is the packed representation of a [HeaderState].
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct HeaderWord(pub Word);
impl HeaderWord {
    #[inline]
    pub fn new(descriptor: DescriptorRef) -> Self {
        debug_assert_eq!(descriptor.addr() & TAG_MASK, 0);
        HeaderWord(descriptor.addr())
    }
    #[inline]
    pub fn is_marked(self) -> bool {
        self.0 & MARK_BIT != 0
    }
    #[inline]
    pub fn is_forwarded(self) -> bool {
        self.0 & FORWARD_BIT != 0
    }
    #[inline]
    pub fn marked(self) -> Self {
        HeaderWord(self.0 | MARK_BIT)
    }
    #[inline]
    pub fn unmarked(self) -> Self {
        HeaderWord(self.0 & !MARK_BIT)
    }
    /// The header of an object that was copied to `target`
    #[inline]
    pub fn forwarded_to(target: ObjectRef) -> Self {
        debug_assert_eq!(target.addr() & TAG_MASK, 0);
        HeaderWord(target.addr() | FORWARD_BIT)
    }
    /// The address with all tag bits stripped
    #[inline]
    pub fn untagged(self) -> usize {
        self.0 & !TAG_MASK
    }
    /// The referenced descriptor, ignoring tag bits
    ///
    /// ## Safety
    /// Undefined behavior if this header has been forwarded,
    /// or is not actually a header
    #[inline]
    pub unsafe fn descriptor(self) -> DescriptorRef {
        debug_assert!(!self.is_forwarded(), "Forwarded header {:#x}", self.0);
        DescriptorRef(NonNull::new_unchecked(self.untagged() as *mut Word))
    }
    /// The location this object was copied to
    ///
    /// ## Safety
    /// Undefined behavior unless the header is forwarded
    #[inline]
    pub unsafe fn forwarding_target(self) -> ObjectRef {
        debug_assert!(self.is_forwarded());
        ObjectRef(NonNull::new_unchecked(self.untagged() as *mut Word))
    }
    /// Unpack the logical state of the header
    ///
    /// ## Safety
    /// Assumes this is actually a header word
    pub unsafe fn state(self) -> HeaderState {
        if self.is_forwarded() {
            HeaderState::Forwarded(self.forwarding_target())
        } else if self.is_marked() {
            HeaderState::Marked(self.descriptor())
        } else {
            HeaderState::Unmarked(self.descriptor())
        }
    }
}
impl Debug for HeaderWord {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "HeaderWord({:#x})", self.0)
    }
}

/// A reference to a type descriptor.
///
/// Descriptors are objects too (with their own header),
/// so this is really an [ObjectRef] with a known layout.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorRef(NonNull<Word>);
impl DescriptorRef {
    /// ## Safety
    /// The pointer must reference a valid descriptor,
    /// aligned to at least four bytes.
    #[inline]
    pub unsafe fn from_raw(ptr: NonNull<Word>) -> Self {
        debug_assert_eq!(ptr.as_ptr() as usize & TAG_MASK, 0);
        DescriptorRef(ptr)
    }
    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
    #[inline]
    pub fn as_object(self) -> ObjectRef {
        ObjectRef(self.0)
    }
    /// The size of described objects, in words (including the header)
    #[inline]
    pub fn size(self) -> usize {
        unsafe { *self.0.as_ptr().add(1) }
    }
    /// The number of words in the pointer bitmap
    #[inline]
    pub fn bitmap_len(self) -> usize {
        bitmap_words(self.size())
    }
    #[inline]
    pub fn bitmap_word(self, index: usize) -> Word {
        assert!(index < self.bitmap_len());
        unsafe { *self.0.as_ptr().add(DESCRIPTOR_PREFIX_WORDS + index) }
    }
    /// Whether described objects have any pointer fields
    #[inline]
    pub fn has_pointers(self) -> bool {
        self.bitmap_word(0) & 1 != 0
    }
    /// Check if the specified word is a pointer field
    #[inline]
    pub fn is_pointer(self, index: usize) -> bool {
        index >= 1 && index < self.size()
            && self.bitmap_word(index / WORD_BITS) & (1 << (index % WORD_BITS)) != 0
    }
    /// The indexes of every pointer field, in ascending order
    ///
    /// This never includes the header.
    #[inline]
    pub fn pointer_fields(self) -> PointerFields {
        PointerFields {
            descriptor: self,
            index: 1,
            end: if self.has_pointers() { self.size() } else { 1 },
            current: self.bitmap_word(0) >> 1,
        }
    }
}
impl Debug for DescriptorRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorRef")
            .field("ptr", &self.0)
            .field("size", &self.size())
            .finish()
    }
}

/// Iterates over the pointer fields of a descriptor
pub struct PointerFields {
    descriptor: DescriptorRef,
    index: usize,
    end: usize,
    /// The remaining bits of the current bitmap word
    current: Word,
}
impl Iterator for PointerFields {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while self.index < self.end {
            let index = self.index;
            if index % WORD_BITS == 0 {
                self.current = self.descriptor.bitmap_word(index / WORD_BITS);
            }
            let is_pointer = self.current & 1 != 0;
            self.current >>= 1;
            self.index += 1;
            if is_pointer {
                return Some(index);
            }
        }
        None
    }
}
