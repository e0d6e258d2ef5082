//! The root set.
//!
//! Each mutator thread owns a [MutatorRoots], containing
//! a [PointerStack] of frames pushed by Rust code and
//! a [JitPointerStack] maintained by generated code.
//!
//! The [RootRegistry] tracks every thread that is currently *blocked*,
//! so collections started by another thread still scan their roots.
use std::cell::{Cell, RefCell};
use std::fmt::{self, Debug, Formatter};
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;

use arrayvec::ArrayVec;
use parking_lot::Mutex;
use slog::{debug, trace, FnValue, Logger};

use crate::layout::{ObjectRef, Word};
use crate::utils::ThreadId;

/// A location holding a (nullable) reference to a heap object.
///
/// Slots must be pushed as roots before anything that could collect,
/// otherwise their referents may be freed (or moved).
pub type RootSlot = Cell<Option<ObjectRef>>;

/// The maximum number of slots in a single frame
///
/// Larger pushes are split across multiple frames.
pub const FRAME_CAPACITY: usize = 16;
/// The default number of entries in the [JitPointerStack]
pub const DEFAULT_JIT_CAPACITY: usize = 1024;

type Frame = ArrayVec<NonNull<RootSlot>, FRAME_CAPACITY>;

/// A stack of frames, each holding the addresses of root slots
#[derive(Default)]
pub struct PointerStack {
    frames: RefCell<Vec<Frame>>,
}
impl PointerStack {
    /// The number of frames currently pushed
    #[inline]
    pub fn depth(&self) -> usize {
        self.frames.borrow().len()
    }
    /// Visit every slot in every frame, from the bottom up
    pub fn for_each_slot(&self, mut func: impl FnMut(&RootSlot)) {
        for frame in self.frames.borrow().iter() {
            for slot in frame {
                // NOTE: Frames are popped before their slots go out of scope
                func(unsafe { slot.as_ref() })
            }
        }
    }
}

/// A flat stack of object references, bounded by `top`.
///
/// This is the interface used by generated code,
/// which can write directly to [JitPointerStack::as_mut_ptr]
/// and adjust [JitPointerStack::top_cursor].
pub struct JitPointerStack {
    buffer: Box<[RootSlot]>,
    top: Cell<usize>,
}
impl JitPointerStack {
    pub fn with_capacity(capacity: usize) -> Self {
        JitPointerStack {
            buffer: (0..capacity).map(|_| Cell::new(None)).collect(),
            top: Cell::new(0)
        }
    }
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }
    /// The number of entries below `top`
    #[inline]
    pub fn len(&self) -> usize {
        self.top.get()
    }
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.top.get() == 0
    }
    /// Push an entry, returning its index
    ///
    /// Panics if the stack overflows.
    pub fn push(&self, value: Option<ObjectRef>) -> usize {
        let index = self.top.get();
        assert!(index < self.buffer.len(), "JIT pointer stack overflow");
        self.buffer[index].set(value);
        self.top.set(index + 1);
        index
    }
    /// Pop the top entry, which may have been updated by the collector
    pub fn pop(&self) -> Option<ObjectRef> {
        let index = self.top.get();
        assert!(index > 0, "JIT pointer stack underflow");
        self.top.set(index - 1);
        self.buffer[index - 1].take()
    }
    /// The entry at the specified index (below `top`)
    #[inline]
    pub fn get(&self, index: usize) -> Option<ObjectRef> {
        assert!(index < self.top.get());
        self.buffer[index].get()
    }
    #[inline]
    pub fn set(&self, index: usize, value: Option<ObjectRef>) {
        assert!(index < self.top.get());
        self.buffer[index].set(value)
    }
    /// The start of the underlying buffer
    ///
    /// Entries have the same representation as nullable pointers.
    #[inline]
    pub fn as_mut_ptr(&self) -> *mut Option<ObjectRef> {
        self.buffer.as_ptr() as *mut Option<ObjectRef>
    }
    /// A pointer to the `top` index, for use by generated code
    ///
    /// ## Safety
    /// Writers must never set `top` past the capacity.
    #[inline]
    pub fn top_cursor(&self) -> *mut usize {
        self.top.as_ptr()
    }
    pub fn for_each_slot(&self, mut func: impl FnMut(&RootSlot)) {
        let top = self.top.get();
        assert!(top <= self.buffer.len(), "Corrupt JIT stack top: {}", top);
        for slot in &self.buffer[..top] {
            func(slot);
        }
    }
}

/// The roots of a single mutator thread.
///
/// Obtained from [RootRegistry::register].
/// Dropping it deregisters the thread.
pub struct MutatorRoots {
    registry: Arc<RootRegistry>,
    pointer_stack: PointerStack,
    jit_stack: JitPointerStack,
    blocked: Cell<bool>,
}
impl MutatorRoots {
    #[inline]
    pub fn registry(&self) -> &Arc<RootRegistry> {
        &self.registry
    }
    #[inline]
    pub fn pointer_stack(&self) -> &PointerStack {
        &self.pointer_stack
    }
    #[inline]
    pub fn jit_stack(&self) -> &JitPointerStack {
        &self.jit_stack
    }
    /// Push a frame containing the specified slots
    ///
    /// The frame is popped once the guard is dropped.
    /// Prefer the [push_roots!](crate::push_roots) macro,
    /// which guarantees the slots outlive the frame.
    ///
    /// The slots stay borrowed until the guard is dropped,
    /// so they can't be moved while they are roots.
    ///
    /// ## Safety
    /// The guard must not be leaked.
    pub unsafe fn push_frame<'a>(&'a self, slots: &[&'a RootSlot]) -> FrameGuard<'a> {
        let mut frames = self.frames_mut();
        let original_depth = frames.len();
        for chunk in slots.chunks(FRAME_CAPACITY) {
            frames.push(chunk.iter().map(|&slot| NonNull::from(slot)).collect());
        }
        FrameGuard {
            roots: self,
            original_depth,
            expected_depth: frames.len(),
            slots: PhantomData
        }
    }
    #[inline]
    fn frames_mut(&self) -> std::cell::RefMut<'_, Vec<Frame>> {
        self.pointer_stack.frames.borrow_mut()
    }
    /// Mark this thread as blocked until the guard is dropped.
    ///
    /// While blocked, collections triggered by other threads
    /// scan (and update) these roots.
    /// The thread must not touch its roots or the heap until it unblocks.
    pub fn block(&self) -> BlockGuard<'_> {
        assert!(!self.blocked.get(), "Already blocked");
        self.registry.add_blocked(self);
        self.blocked.set(true);
        BlockGuard { roots: self }
    }
    #[inline]
    pub fn is_blocked(&self) -> bool {
        self.blocked.get()
    }
    /// Visit every non-null slot of this thread
    pub fn for_each_slot(&self, mut func: impl FnMut(&RootSlot)) {
        let mut visit = |slot: &RootSlot| {
            if slot.get().is_some() {
                func(slot)
            }
        };
        self.pointer_stack.for_each_slot(&mut visit);
        self.jit_stack.for_each_slot(&mut visit);
    }
}
impl Drop for MutatorRoots {
    fn drop(&mut self) {
        // The guard may have been leaked
        if self.blocked.get() {
            self.registry.remove_blocked(self);
            self.blocked.set(false);
        }
        self.registry.deregister();
    }
}
impl Debug for MutatorRoots {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutatorRoots")
            .field("frames", &self.pointer_stack.depth())
            .field("jit_len", &self.jit_stack.len())
            .field("blocked", &self.blocked.get())
            .finish()
    }
}

/// Pops a frame pushed by [MutatorRoots::push_frame]
#[must_use]
pub struct FrameGuard<'a> {
    roots: &'a MutatorRoots,
    original_depth: usize,
    expected_depth: usize,
    slots: PhantomData<&'a RootSlot>,
}
impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        let mut frames = self.roots.frames_mut();
        assert_eq!(
            frames.len(), self.expected_depth,
            "Frames must be popped in LIFO order"
        );
        frames.truncate(self.original_depth);
    }
}

/// Unblocks the thread once dropped
#[must_use]
pub struct BlockGuard<'a> {
    roots: &'a MutatorRoots,
}
impl Drop for BlockGuard<'_> {
    fn drop(&mut self) {
        self.roots.registry.remove_blocked(self.roots);
        self.roots.blocked.set(false);
    }
}

/// Push the specified [RootSlot] locals as roots until the end of the scope.
///
/// ```
/// # use poolgc::{push_roots, RootSlot, RootRegistry};
/// let registry = RootRegistry::new(slog::Logger::root(slog::Discard, slog::o!()));
/// let roots = registry.register();
/// let first = RootSlot::new(None);
/// let second = RootSlot::new(None);
/// push_roots!(roots, first, second);
/// assert_eq!(roots.pointer_stack().depth(), 1);
/// ```
///
/// The slots stay borrowed until the end of the scope,
/// so a rooted slot can't be moved:
///
/// ```compile_fail
/// # use poolgc::{push_roots, RootSlot, RootRegistry};
/// let registry = RootRegistry::new(slog::Logger::root(slog::Discard, slog::o!()));
/// let roots = registry.register();
/// let head = RootSlot::new(None);
/// push_roots!(roots, head);
/// let moved = head;
/// ```
#[macro_export]
macro_rules! push_roots {
    ($roots:expr, $($slot:ident),+ $(,)?) => {
        let _frame_guard = unsafe {
            $roots.push_frame(&[$(&$slot),+])
        };
    };
}

struct RegistryState {
    /// The number of threads that have registered (and not yet dropped)
    active: usize,
    blocked: Vec<NonNull<MutatorRoots>>,
}

/// The registry of mutator threads.
///
/// The lock is only held to mutate the registry
/// and to take a snapshot of the blocked threads.
pub struct RootRegistry {
    state: Mutex<RegistryState>,
    logger: Logger,
}
impl RootRegistry {
    pub fn new(logger: Logger) -> Arc<Self> {
        Arc::new(RootRegistry {
            state: Mutex::new(RegistryState {
                active: 0,
                blocked: Vec::new()
            }),
            logger
        })
    }
    /// Register the current thread, giving it an empty set of roots
    pub fn register(self: &Arc<Self>) -> MutatorRoots {
        self.register_with_jit_capacity(DEFAULT_JIT_CAPACITY)
    }
    pub fn register_with_jit_capacity(self: &Arc<Self>, jit_capacity: usize) -> MutatorRoots {
        let old_active = {
            let mut state = self.state.lock();
            state.active += 1;
            state.active - 1
        };
        trace!(
            self.logger, "Registering mutator";
            "old_active" => old_active,
            "current_thread" => FnValue(|_| ThreadId::current())
        );
        MutatorRoots {
            registry: Arc::clone(self),
            pointer_stack: PointerStack::default(),
            jit_stack: JitPointerStack::with_capacity(jit_capacity),
            blocked: Cell::new(false)
        }
    }
    /// The number of registered threads
    pub fn active_count(&self) -> usize {
        self.state.lock().active
    }
    /// The number of threads currently blocked
    pub fn blocked_count(&self) -> usize {
        self.state.lock().blocked.len()
    }
    fn deregister(&self) {
        let mut state = self.state.lock();
        state.active -= 1;
    }
    fn add_blocked(&self, roots: &MutatorRoots) {
        let ptr = NonNull::from(roots);
        let mut state = self.state.lock();
        debug_assert!(!state.blocked.contains(&ptr));
        state.blocked.push(ptr);
        let blocked = state.blocked.len();
        drop(state);
        debug!(
            self.logger, "Blocked mutator";
            "blocked" => blocked,
            "current_thread" => FnValue(|_| ThreadId::current())
        );
    }
    fn remove_blocked(&self, roots: &MutatorRoots) {
        let ptr = NonNull::from(roots);
        let mut state = self.state.lock();
        let index = state.blocked.iter().position(|&other| other == ptr)
            .unwrap_or_else(|| panic!("Missing blocked roots: {:?}", ptr));
        state.blocked.swap_remove(index);
        let blocked = state.blocked.len();
        drop(state);
        debug!(
            self.logger, "Unblocked mutator";
            "blocked" => blocked,
            "current_thread" => FnValue(|_| ThreadId::current())
        );
    }
    /// Take a snapshot of the roots for a collection started by `current`
    ///
    /// The lock is released before this returns,
    /// so scanning happens without it.
    pub fn snapshot<'a>(&self, current: &'a MutatorRoots) -> RootSnapshot<'a> {
        assert!(
            std::ptr::eq(&*current.registry, self),
            "Roots belong to a different heap"
        );
        let current_ptr = NonNull::from(current);
        let mut stacks = vec![current_ptr];
        {
            let state = self.state.lock();
            stacks.extend(state.blocked.iter().copied().filter(|&ptr| ptr != current_ptr));
        }
        RootSnapshot {
            stacks,
            marker: PhantomData
        }
    }
}
impl Debug for RootRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RootRegistry")
            .field("active", &state.active)
            .field("blocked", &state.blocked.len())
            .finish()
    }
}
/// Blocked roots are only accessed by the collecting thread,
/// while their owner is blocked.
unsafe impl Send for RootRegistry {}
unsafe impl Sync for RootRegistry {}

/// The roots of every thread taking part in a collection
pub struct RootSnapshot<'a> {
    stacks: Vec<NonNull<MutatorRoots>>,
    marker: PhantomData<&'a MutatorRoots>,
}
impl RootSnapshot<'_> {
    /// The number of threads whose roots are included
    #[inline]
    pub fn thread_count(&self) -> usize {
        self.stacks.len()
    }
    /// Visit every non-null root slot
    pub fn for_each_slot(&self, mut func: impl FnMut(&RootSlot)) {
        for stack in &self.stacks {
            // Blocked threads can't drop their roots until they unblock
            let roots = unsafe { stack.as_ref() };
            roots.for_each_slot(&mut func);
        }
    }
    /// The addresses of every non-null root slot
    pub fn slot_addresses(&self) -> Vec<NonNull<Word>> {
        let mut result = Vec::new();
        self.for_each_slot(|slot| result.push(NonNull::from(slot).cast::<Word>()));
        result
    }
}
