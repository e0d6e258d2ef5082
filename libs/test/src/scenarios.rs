//! Scenarios that every strategy must pass.
//!
//! These only rely on the behavior shared by both strategies,
//! so they never assume objects stay at the same address.
use std::sync::Barrier;

use anyhow::{anyhow, bail, ensure, Context};
use parking_lot::Mutex;

use poolgc::{push_roots, AllocError, CollectorStrategy, HeapConfig, Heap, RootSlot};

use crate::{alloc_node, list_values, test_heap, test_logger, TestTypes, NODE_NEXT, NODE_VALUE};

/// Allocate `A -> B -> C`, then drop the root to `A`
pub fn chain_with_dropped_head<S: CollectorStrategy>() -> anyhow::Result<()> {
    let mut heap = test_heap::<S>(1024);
    let types = TestTypes::define(&mut heap);
    let roots = heap.create_roots();
    let head = RootSlot::new(None);
    push_roots!(roots, head);
    for value in [3, 2, 1] {
        let node = alloc_node(&mut heap, &roots, &types, value, &head)?;
        head.set(Some(node));
    }
    ensure!(list_values(head.get()) == vec![1, 2, 3]);
    let first = head.get().context("Missing head")?;
    head.set(unsafe { first.field(NODE_NEXT) });
    let reclaimed = heap.collect(&roots);
    let mark = heap.stats().last_mark;
    ensure!(mark.objects == 2, "Expected only B and C to survive: {:?}", mark);
    ensure!(reclaimed.reclaimed_words == 3, "Unexpected reclamation: {:?}", reclaimed);
    ensure!(list_values(head.get()) == vec![2, 3]);
    Ok(())
}

/// A cycle with no external roots must not keep itself alive
pub fn unrooted_cycle<S: CollectorStrategy>() -> anyhow::Result<()> {
    let mut heap = test_heap::<S>(1024);
    let types = TestTypes::define(&mut heap);
    let roots = heap.create_roots();
    {
        let first = RootSlot::new(None);
        let second = RootSlot::new(None);
        push_roots!(roots, first, second);
        first.set(Some(heap.try_allocate(&roots, types.node)?));
        second.set(Some(alloc_node(&mut heap, &roots, &types, 2, &first)?));
        let first = first.get().context("Missing first")?;
        unsafe { first.set_field(NODE_NEXT, second.get()); }
    }
    let reclaimed = heap.collect(&roots);
    ensure!(heap.stats().last_mark.objects == 0);
    ensure!(reclaimed.live_words == 0, "Cycle survived: {:?}", reclaimed);
    ensure!(reclaimed.reclaimed_words == 6, "Unexpected reclamation: {:?}", reclaimed);
    Ok(())
}

/// Filling the heap with live objects must grow it, without losing anything
pub fn exhaustion_grows_heap<S: CollectorStrategy>() -> anyhow::Result<()> {
    let mut heap = test_heap::<S>(64);
    let types = TestTypes::define(&mut heap);
    let roots = heap.create_roots();
    let head = RootSlot::new(None);
    push_roots!(roots, head);
    for value in 0..100 {
        let node = alloc_node(&mut heap, &roots, &types, value, &head)?;
        head.set(Some(node));
    }
    let stats = heap.stats();
    ensure!(stats.collections >= 1, "Never collected: {:?}", stats);
    ensure!(stats.growths >= 1, "Never grew: {:?}", stats);
    ensure!(list_values(head.get()) == (0..100).rev().collect::<Vec<_>>());
    Ok(())
}

/// Collecting twice (without mutation) changes nothing
pub fn repeated_collection_is_stable<S: CollectorStrategy>() -> anyhow::Result<()> {
    let mut heap = test_heap::<S>(1024);
    let types = TestTypes::define(&mut heap);
    let roots = heap.create_roots();
    let head = RootSlot::new(None);
    push_roots!(roots, head);
    for value in 0..20 {
        let node = alloc_node(&mut heap, &roots, &types, value, &head)?;
        head.set(Some(node));
        // Garbage
        heap.try_allocate(&roots, types.leaf)?;
    }
    heap.collect(&roots);
    let first_mark = heap.stats().last_mark;
    let first_values = list_values(head.get());
    let reclaimed = heap.collect(&roots);
    ensure!(heap.stats().last_mark == first_mark);
    ensure!(list_values(head.get()) == first_values);
    ensure!(reclaimed.reclaimed_words == 0, "Nothing left to reclaim: {:?}", reclaimed);
    ensure!(first_mark.objects == 20);
    Ok(())
}

/// A heap that is entirely garbage never needs to grow
pub fn garbage_never_grows_heap<S: CollectorStrategy>() -> anyhow::Result<()> {
    let mut heap = test_heap::<S>(256);
    let types = TestTypes::define(&mut heap);
    let roots = heap.create_roots();
    heap.try_allocate(&roots, types.leaf)?;
    let initial_capacity = heap.capacity_words();
    for _ in 0..5000 {
        let leaf = heap.try_allocate(&roots, types.leaf)?;
        unsafe { leaf.write(1, 42); }
    }
    let stats = heap.stats();
    ensure!(stats.collections >= 1, "Never collected: {:?}", stats);
    ensure!(stats.growths == 0, "Grew without survivors: {:?}", stats);
    ensure!(heap.capacity_words() == initial_capacity);
    Ok(())
}

/// Capacity only ever increases, even as garbage is reclaimed
pub fn capacity_never_shrinks<S: CollectorStrategy>() -> anyhow::Result<()> {
    let mut heap = test_heap::<S>(64);
    let types = TestTypes::define(&mut heap);
    let roots = heap.create_roots();
    let head = RootSlot::new(None);
    push_roots!(roots, head);
    let mut capacity = 0;
    for value in 0..200 {
        let node = alloc_node(&mut heap, &roots, &types, value, &head)?;
        head.set(Some(node));
        heap.try_allocate(&roots, types.leaf)?;
        heap.try_allocate(&roots, types.unit)?;
        if value % 50 == 0 {
            heap.collect(&roots);
        }
        ensure!(
            heap.capacity_words() >= capacity,
            "Capacity shrunk from {} to {}", capacity, heap.capacity_words()
        );
        capacity = heap.capacity_words();
    }
    ensure!(heap.stats().growths >= 1);
    ensure!(list_values(head.get()).len() == 200);
    Ok(())
}

/// The roots of a blocked thread survive collections triggered by another thread
pub fn blocked_thread_roots<S: CollectorStrategy>() -> anyhow::Result<()> {
    const COUNT: usize = 10;
    let heap = Mutex::new(test_heap::<S>(1024));
    let barrier = Barrier::new(2);
    crossbeam_utils::thread::scope(|scope| -> anyhow::Result<()> {
        let worker = scope.spawn(|_| -> anyhow::Result<Vec<usize>> {
            let roots = heap.lock().create_roots();
            let head = RootSlot::new(None);
            push_roots!(roots, head);
            {
                let mut heap = heap.lock();
                let types = TestTypes::define(&mut *heap);
                for value in 0..COUNT {
                    let node = alloc_node(&mut *heap, &roots, &types, value, &head)?;
                    head.set(Some(node));
                }
            }
            {
                let _blocked = roots.block();
                barrier.wait();
                // The other thread is collecting
                barrier.wait();
            }
            Ok(list_values(head.get()))
        });
        barrier.wait();
        let collected = (|| -> anyhow::Result<()> {
            let mut heap = heap.lock();
            let types = TestTypes::define(&mut *heap);
            let roots = heap.create_roots();
            ensure!(heap.registry().blocked_count() == 1);
            for _ in 0..2000 {
                heap.try_allocate(&roots, types.leaf)?;
            }
            heap.collect(&roots);
            let mark = heap.stats().last_mark;
            ensure!(mark.objects == COUNT, "Missing blocked roots: {:?}", mark);
            Ok(())
        })();
        barrier.wait();
        let values = worker.join().map_err(|_| anyhow!("Worker panicked"))??;
        collected?;
        ensure!(values == (0..COUNT).rev().collect::<Vec<_>>(), "Corrupted list: {:?}", values);
        Ok(())
    }).map_err(|_| anyhow!("Scoped thread panicked"))?
}

/// Descriptors allocated in the heap are traced through the headers that use them
pub fn heap_descriptors_survive<S: CollectorStrategy>() -> anyhow::Result<()> {
    let mut heap = test_heap::<S>(256);
    let roots = heap.create_roots();
    let descriptor = RootSlot::new(None);
    let head = RootSlot::new(None);
    push_roots!(roots, descriptor, head);
    let custom = heap.allocate_descriptor(&roots, 3, &[NODE_NEXT])?;
    descriptor.set(Some(custom.as_object()));
    ensure!(heap.contains(custom.as_object()));
    for value in 0..5 {
        let current = unsafe { descriptor.get().context("Missing descriptor")?.as_descriptor() };
        let node = heap.try_allocate(&roots, current)?;
        unsafe {
            node.write(NODE_VALUE, value);
            node.set_field(NODE_NEXT, head.get());
        }
        head.set(Some(node));
    }
    heap.collect(&roots);
    let current = descriptor.get().context("Missing descriptor")?;
    ensure!(heap.contains(current));
    let mut node = head.get();
    while let Some(current_node) = node {
        unsafe {
            ensure!(current_node.descriptor().as_object() == current);
            node = current_node.field(NODE_NEXT);
        }
    }
    // Only the headers keep it alive now
    descriptor.set(None);
    heap.collect(&roots);
    ensure!(heap.stats().last_mark.objects == 6);
    let mut node = head.get();
    while let Some(current_node) = node {
        unsafe {
            let descriptor = current_node.descriptor();
            ensure!(descriptor.size() == 3);
            ensure!(descriptor.pointer_fields().collect::<Vec<_>>() == vec![NODE_NEXT]);
            ensure!(heap.contains(descriptor.as_object()));
            node = current_node.field(NODE_NEXT);
        }
    }
    ensure!(list_values(head.get()) == vec![4, 3, 2, 1, 0]);
    Ok(())
}

/// Dead objects whose descriptors are also dead are reclaimed together
pub fn dead_heap_descriptors<S: CollectorStrategy>() -> anyhow::Result<()> {
    const ROUNDS: usize = 4;
    let mut heap = test_heap::<S>(512);
    let types = TestTypes::define(&mut heap);
    let roots = heap.create_roots();
    let head = RootSlot::new(None);
    push_roots!(roots, head);
    for round in 0..ROUNDS {
        {
            let descriptor = RootSlot::new(None);
            push_roots!(roots, descriptor);
            // Objects are larger than their (three word) descriptor
            let custom = heap.allocate_descriptor(&roots, 5, &[2, 4])?;
            descriptor.set(Some(custom.as_object()));
            for _ in 0..3 {
                let current = unsafe { descriptor.get().context("Missing descriptor")?.as_descriptor() };
                let object = heap.try_allocate(&roots, current)?;
                unsafe { object.write(1, round); }
            }
        }
        let node = alloc_node(&mut heap, &roots, &types, round, &head)?;
        head.set(Some(node));
    }
    let reclaimed = heap.collect(&roots);
    ensure!(heap.stats().last_mark.objects == ROUNDS);
    ensure!(reclaimed.live_words == ROUNDS * 3, "Unexpected live words: {:?}", reclaimed);
    ensure!(reclaimed.reclaimed_words == ROUNDS * (3 + 3 * 5), "Unexpected reclamation: {:?}", reclaimed);
    // The reclaimed space is usable
    for value in ROUNDS..ROUNDS + 50 {
        let node = alloc_node(&mut heap, &roots, &types, value, &head)?;
        head.set(Some(node));
    }
    heap.collect(&roots);
    ensure!(list_values(head.get()) == (0..ROUNDS + 50).rev().collect::<Vec<_>>());
    Ok(())
}

/// Allocation must protect its (possibly moving) descriptor during collection
pub fn descriptor_protected_during_allocation<S: CollectorStrategy>() -> anyhow::Result<()> {
    let mut heap = test_heap::<S>(64);
    let roots = heap.create_roots();
    let descriptor = RootSlot::new(None);
    push_roots!(roots, descriptor);
    let custom = heap.allocate_descriptor(&roots, 4, &[])?;
    descriptor.set(Some(custom.as_object()));
    for value in 0..200 {
        let current = unsafe { descriptor.get().context("Missing descriptor")?.as_descriptor() };
        let object = heap.try_allocate(&roots, current)?;
        let updated = descriptor.get().context("Missing descriptor")?;
        unsafe {
            object.write(1, value);
            ensure!(
                object.descriptor().as_object() == updated,
                "Stale descriptor for object #{}", value
            );
        }
    }
    ensure!(heap.stats().collections >= 1);
    Ok(())
}

/// Entries of the JIT stack are roots, including those after a null entry
pub fn jit_stack_roots<S: CollectorStrategy>() -> anyhow::Result<()> {
    let mut heap = test_heap::<S>(64);
    let types = TestTypes::define(&mut heap);
    let roots = heap.create_roots();
    let jit = roots.jit_stack();
    let first = heap.try_allocate(&roots, types.leaf)?;
    unsafe { first.write(1, 1); }
    jit.push(Some(first));
    jit.push(None);
    let second = heap.try_allocate(&roots, types.leaf)?;
    unsafe { second.write(1, 2); }
    jit.push(Some(second));
    for _ in 0..200 {
        heap.try_allocate(&roots, types.node)?;
    }
    ensure!(heap.stats().collections >= 1);
    ensure!(jit.len() == 3);
    ensure!(jit.get(1).is_none());
    let second = jit.pop().context("Missing second")?;
    ensure!(jit.pop().is_none());
    let first = jit.pop().context("Missing first")?;
    ensure!(heap.contains(first) && heap.contains(second));
    unsafe {
        ensure!(first.read(1) == 1);
        ensure!(second.read(1) == 2);
    }
    Ok(())
}

/// Objects that can't fit in a pool are rejected up front
pub fn object_too_large<S: CollectorStrategy>() -> anyhow::Result<()> {
    let mut heap = test_heap::<S>(64);
    let roots = heap.create_roots();
    let huge = heap.define_type(65, &[1, 64]);
    match heap.try_allocate(&roots, huge) {
        Err(AllocError::ObjectTooLarge { words: 65, pool_words: 64 }) => {},
        other => bail!("Unexpected result: {:?}", other),
    }
    ensure!(heap.stats().collections == 0);
    Ok(())
}

/// The configured limit is enforced without losing live objects
pub fn heap_limit<S: CollectorStrategy>() -> anyhow::Result<()> {
    let config = HeapConfig {
        pool_words: 64,
        max_heap_words: Some(256),
        ..HeapConfig::default()
    };
    let mut heap = Heap::<S>::with_config(config, test_logger());
    let types = TestTypes::define(&mut heap);
    let roots = heap.create_roots();
    let head = RootSlot::new(None);
    push_roots!(roots, head);
    let mut count = 0;
    let error = loop {
        match alloc_node(&mut heap, &roots, &types, count, &head) {
            Ok(node) => {
                head.set(Some(node));
                count += 1;
            },
            Err(error) => break error,
        }
        ensure!(count < 1000, "Limit never reached");
    };
    match error.downcast_ref::<AllocError>() {
        Some(AllocError::HeapLimit { limit: 256, .. }) => {},
        _ => bail!("Unexpected error: {}", error),
    }
    ensure!(heap.capacity_words() <= 256);
    ensure!(list_values(head.get()) == (0..count).rev().collect::<Vec<_>>());
    Ok(())
}

/// Reaching the heap limit must not fail allocations
/// that fit in space reclaimed by the collection
pub fn limit_with_reclaimable_space<S: CollectorStrategy>() -> anyhow::Result<()> {
    let initial_capacity = {
        let mut unlimited = test_heap::<S>(64);
        let types = TestTypes::define(&mut unlimited);
        let roots = unlimited.create_roots();
        unlimited.try_allocate(&roots, types.leaf)?;
        unlimited.capacity_words()
    };
    let config = HeapConfig {
        pool_words: 64,
        // Survivors always exceed a quarter of the heap
        growth_ratio: 2,
        max_heap_words: Some(initial_capacity),
    };
    let mut heap = Heap::<S>::with_config(config, test_logger());
    let types = TestTypes::define(&mut heap);
    let roots = heap.create_roots();
    let head = RootSlot::new(None);
    push_roots!(roots, head);
    for value in 0..7 {
        let node = alloc_node(&mut heap, &roots, &types, value, &head)?;
        head.set(Some(node));
    }
    for _ in 0..200 {
        let leaf = heap.try_allocate(&roots, types.leaf)?;
        unsafe { leaf.write(1, 42); }
    }
    let stats = heap.stats();
    ensure!(stats.collections >= 1, "Never collected: {:?}", stats);
    ensure!(stats.growths == 0, "Grew past the limit: {:?}", stats);
    ensure!(heap.capacity_words() == initial_capacity);
    ensure!(list_values(head.get()) == (0..7).rev().collect::<Vec<_>>());
    Ok(())
}

/// Run the binary trees workload
pub fn binary_trees<S: CollectorStrategy>() -> anyhow::Result<()> {
    let heap = test_heap::<S>(2048);
    let results = crate::examples::binary_trees::main(&test_logger(), heap, 8)?;
    results.verify()
}
