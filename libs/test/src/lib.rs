//! Test scenarios shared by every collection strategy.
//!
//! Each strategy crate runs them with [generic_tests!].
use slog::{o, Drain, Logger};

use poolgc::layout::ObjectRef;
use poolgc::{CollectorStrategy, DescriptorRef, Heap, HeapConfig, MutatorRoots};

pub mod scenarios;

/// The value field of a node
pub const NODE_VALUE: usize = 1;
/// The (pointer) field linking a node to the next one
pub const NODE_NEXT: usize = 2;

/// The types used by the scenarios
#[derive(Debug, Copy, Clone)]
pub struct TestTypes {
    /// `[header, value, next]`
    pub node: DescriptorRef,
    /// `[header, value]`
    pub leaf: DescriptorRef,
    /// A single header word
    pub unit: DescriptorRef,
}
impl TestTypes {
    pub fn define<S: CollectorStrategy>(heap: &mut Heap<S>) -> TestTypes {
        TestTypes {
            node: heap.define_type(3, &[NODE_NEXT]),
            leaf: heap.define_type(2, &[]),
            unit: heap.define_type(1, &[]),
        }
    }
}

/// The logger for tests
///
/// Messages are discarded unless `POOLGC_TEST_LOG` is set.
pub fn test_logger() -> Logger {
    if std::env::var_os("POOLGC_TEST_LOG").is_some() {
        let plain = slog_term::PlainSyncDecorator::new(std::io::stderr());
        Logger::root(
            slog_term::FullFormat::new(plain).build().fuse(),
            o!("test" => true)
        )
    } else {
        Logger::root(::slog::Discard, o!())
    }
}

/// Create a heap with the specified pool size (in words)
pub fn test_heap<S: CollectorStrategy>(pool_words: usize) -> Heap<S> {
    let config = HeapConfig {
        pool_words,
        ..HeapConfig::default()
    };
    Heap::with_config(config, test_logger())
}

/// Allocate a node that links to `next`
pub fn alloc_node<S: CollectorStrategy>(
    heap: &mut Heap<S>, roots: &MutatorRoots,
    types: &TestTypes, value: usize,
    next: &poolgc::RootSlot
) -> anyhow::Result<ObjectRef> {
    let node = heap.try_allocate(roots, types.node)?;
    unsafe {
        node.write(NODE_VALUE, value);
        // The allocation may have moved `next`
        node.set_field(NODE_NEXT, next.get());
    }
    Ok(node)
}

/// The values of every node in a list, following the `next` links
pub fn list_values(head: Option<ObjectRef>) -> Vec<usize> {
    let mut result = Vec::new();
    let mut current = head;
    while let Some(node) = current {
        unsafe {
            result.push(node.read(NODE_VALUE));
            current = node.field(NODE_NEXT);
        }
    }
    result
}

/// Define a `#[test]` for every generic scenario, using the specified strategy
#[macro_export]
macro_rules! generic_tests {
    ($strategy:ty) => {
        $crate::generic_tests!($strategy;
            chain_with_dropped_head,
            unrooted_cycle,
            exhaustion_grows_heap,
            repeated_collection_is_stable,
            garbage_never_grows_heap,
            capacity_never_shrinks,
            blocked_thread_roots,
            heap_descriptors_survive,
            dead_heap_descriptors,
            descriptor_protected_during_allocation,
            jit_stack_roots,
            object_too_large,
            heap_limit,
            limit_with_reclaimable_space,
            binary_trees,
        );
    };
    ($strategy:ty; $($name:ident),* $(,)?) => {
        $(
            #[test]
            fn $name() -> anyhow::Result<()> {
                $crate::scenarios::$name::<$strategy>()
            }
        )*
    };
}
