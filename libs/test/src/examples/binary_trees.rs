use anyhow::{ensure, Context};
use slog::{info, Logger};

use poolgc::layout::ObjectRef;
use poolgc::{push_roots, CollectorStrategy, DescriptorRef, Heap, MutatorRoots, RootSlot};

const LEFT: usize = 1;
const RIGHT: usize = 2;

fn item_check(tree: ObjectRef) -> u32 {
    match unsafe { (tree.field(LEFT), tree.field(RIGHT)) } {
        (Some(left), Some(right)) => 1 + item_check(right) + item_check(left),
        _ => 1
    }
}

fn bottom_up_tree<S: CollectorStrategy>(
    heap: &mut Heap<S>, roots: &MutatorRoots,
    tree_type: DescriptorRef, depth: u32
) -> anyhow::Result<ObjectRef> {
    let tree = RootSlot::new(Some(heap.try_allocate(roots, tree_type)?));
    push_roots!(roots, tree);
    if depth > 0 {
        let right = RootSlot::new(Some(bottom_up_tree(heap, roots, tree_type, depth - 1)?));
        push_roots!(roots, right);
        let left = bottom_up_tree(heap, roots, tree_type, depth - 1)?;
        let tree = tree.get().context("Missing tree")?;
        unsafe {
            tree.set_field(LEFT, Some(left));
            tree.set_field(RIGHT, right.get());
        }
    }
    tree.get().context("Missing tree")
}

/// The expected check of a tree with the specified depth
fn expected_check(depth: u32) -> u32 {
    (1 << (depth + 1)) - 1
}

fn inner<S: CollectorStrategy>(
    heap: &mut Heap<S>, roots: &MutatorRoots,
    tree_type: DescriptorRef,
    depth: u32, iterations: u32
) -> anyhow::Result<u32> {
    let mut check = 0;
    for _ in 0..iterations {
        let tree = bottom_up_tree(heap, roots, tree_type, depth)?;
        check += item_check(tree);
    }
    Ok(check)
}

/// The output of the workload
#[derive(Debug, Clone, Default)]
pub struct BinaryTreesResults {
    pub stretch_depth: u32,
    pub stretch_check: u32,
    /// The (depth, iterations, check) of every round
    pub rounds: Vec<(u32, u32, u32)>,
    pub long_lived_depth: u32,
    pub long_lived_check: u32,
}
impl BinaryTreesResults {
    /// Check every tree was intact
    pub fn verify(&self) -> anyhow::Result<()> {
        ensure!(self.stretch_check == expected_check(self.stretch_depth));
        for &(depth, iterations, check) in &self.rounds {
            ensure!(
                check == iterations * expected_check(depth),
                "Bad check {} for {} trees of depth {}", check, iterations, depth
            );
        }
        ensure!(self.long_lived_check == expected_check(self.long_lived_depth));
        Ok(())
    }
}

pub const EXAMPLE_NAME: &str = file!();
pub fn main<S: CollectorStrategy>(
    logger: &Logger, mut heap: Heap<S>, n: u32
) -> anyhow::Result<BinaryTreesResults> {
    let min_depth = 4;
    let max_depth = if min_depth + 2 > n { min_depth + 2 } else { n };
    // [header, left, right]
    let tree_type = heap.define_type(3, &[LEFT, RIGHT]);
    let roots = heap.create_roots();
    let mut results = BinaryTreesResults::default();
    {
        let depth = max_depth + 1;
        let tree = bottom_up_tree(&mut heap, &roots, tree_type, depth)?;
        results.stretch_depth = depth;
        results.stretch_check = item_check(tree);
        info!(
            logger, "stretch tree";
            "depth" => depth, "check" => results.stretch_check
        );
    }

    let long_lived_tree = RootSlot::new(Some(bottom_up_tree(&mut heap, &roots, tree_type, max_depth)?));
    push_roots!(roots, long_lived_tree);

    for half_depth in (min_depth / 2)..(max_depth / 2 + 1) {
        let depth = half_depth * 2;
        let iterations = 1 << (max_depth - depth + min_depth);
        let check = inner(&mut heap, &roots, tree_type, depth, iterations)?;
        info!(
            logger, "trees";
            "iterations" => iterations, "depth" => depth, "check" => check
        );
        results.rounds.push((depth, iterations, check));
    }

    let long_lived_tree = long_lived_tree.get().context("Missing long lived tree")?;
    results.long_lived_depth = max_depth;
    results.long_lived_check = item_check(long_lived_tree);
    info!(
        logger, "long lived tree";
        "depth" => max_depth, "check" => results.long_lived_check,
        "collections" => heap.stats().collections
    );
    Ok(results)
}
