//! A pool based garbage collected heap.
//!
//! Objects are runs of machine words, described by a [DescriptorRef]
//! (the object size, and a bitmap of pointer fields).
//! Collection is precise, using the roots explicitly registered
//! with a thread's [MutatorRoots].
//!
//! The heap is generic over its [CollectorStrategy].
//! The strategies themselves live in their own crates:
//! `poolgc-copying` (semi-space copying) and `poolgc-marksweep`
//! (in place mark/sweep with free lists).
//!
//! ## Layout
//! The collector uses the two low bits of every header as tags,
//! so descriptors must be aligned to at least four bytes.
//! See the [layout] module for details.
#![allow(
    clippy::missing_safety_doc, // Most unsafe functions share the same contract
)]

pub mod collector;
pub mod config;
pub mod descriptor;
pub mod errors;
pub mod heap;
pub mod layout;
pub mod pool;
pub mod roots;
pub mod utils;
pub mod worklist;

pub use self::collector::{CollectorStrategy, CollectionContext, MarkStats, ReclaimStats};
pub use self::config::HeapConfig;
pub use self::descriptor::DescriptorTable;
pub use self::errors::AllocError;
pub use self::heap::{Heap, HeapStats};
pub use self::layout::{DescriptorRef, HeaderState, HeaderWord, ObjectRef, Word};
pub use self::pool::{Pool, PoolArena, PoolId};
pub use self::roots::{JitPointerStack, MutatorRoots, RootRegistry, RootSlot};
