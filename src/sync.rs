//! Atomic-type indirection.
//!
//! Under a plain build this re-exports `core::sync::atomic` unchanged.
//! Under a `--cfg loom` build (the `loom-test` feature's test harness),
//! it re-exports `loom`'s shadow atomics instead, so the CAS loops in
//! [`crate::hazard`], [`crate::sorted_list`] and [`crate::hash_table`]
//! run against loom's model-checked scheduler rather than real memory.
//! Every atomic used by those three modules is imported from here
//! rather than directly from `core`.

#[cfg(not(loom))]
pub use core::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

#[cfg(loom)]
pub use loom::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
