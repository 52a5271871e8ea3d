//! Sequence counter: stamps mutations with a monotonically increasing
//! order number and reports skipped numbers.
//!
//! Every operation that changes a list or hash table's state allocates
//! the next number via [`SequenceCounter::allocate`], whether or not
//! the operation ultimately applies. When it does not (insert against
//! an already-present key, delete against a missing one, ...), the
//! allocated number is *skipped*: the registered callback, if any, is
//! invoked with it so an external sequencer can account for the gap.
//!
//! A counter is not owned by any single list. [`SequenceCounter`] is a
//! cheap, `Clone`-able handle over a shared `AtomicU64`, so several
//! lists and hash tables can share one to observe a joint total order.
//!
//! ```
//! use hazardmap::sequence::SequenceCounter;
//!
//! let seq = SequenceCounter::starting_at(42);
//! assert_eq!(seq.allocate(), 43);
//! assert_eq!(seq.allocate(), 44);
//! ```

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing order-number allocator, optionally shared
/// across multiple lists/tables, with an optional skip callback.
#[derive(Clone)]
pub struct SequenceCounter {
    counter: Arc<AtomicU64>,
    skip_callback: Option<Arc<dyn Fn(u64) + Send + Sync>>,
}

impl fmt::Debug for SequenceCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequenceCounter")
            .field("current", &self.current())
            .field("has_skip_callback", &self.skip_callback.is_some())
            .finish()
    }
}

impl SequenceCounter {
    /// A fresh counter whose first [`allocate`](Self::allocate) call
    /// returns 1.
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// A fresh counter whose first allocated number is `initial + 1`.
    pub fn starting_at(initial: u64) -> Self {
        Self {
            counter: Arc::new(AtomicU64::new(initial)),
            skip_callback: None,
        }
    }

    /// Attach a callback invoked, on the allocating thread, whenever an
    /// allocated number is reported skipped. The callback must not call
    /// back into the list/table that skipped the number.
    pub fn with_skip_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.skip_callback = Some(Arc::new(callback));
        self
    }

    /// Allocate the next order number. Monotonically increasing across
    /// all threads and all clones of this counter.
    #[inline]
    pub fn allocate(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Report that `number` (previously returned by
    /// [`allocate`](Self::allocate)) was not applied to any state.
    /// Invokes the skip callback if one is registered; otherwise a
    /// no-op.
    pub fn report_skipped(&self, number: u64) {
        if let Some(cb) = &self.skip_callback {
            cb(number);
        }
    }

    /// The most recently allocated number, without allocating a new
    /// one. Diagnostic only: another thread may allocate between this
    /// read and any subsequent decision based on it.
    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}
