//! Builder-style configuration for sorted lists and hash tables.
//!
//! Follows the `with_*` constructor convention already used in this
//! crate (`Backoff::with_ceiling`, `HashSet::with_capacity_and_allocator`).

use crate::sequence::SequenceCounter;

/// Default number of hazard-pointer retirements a thread accumulates
/// before it scans for reclaimable nodes.
pub const DEFAULT_RECLAIM_THRESHOLD: usize = 64;

/// Default initial bucket count for a new hash table generation.
pub const DEFAULT_INITIAL_BUCKETS: usize = 16;

/// Configuration for [`crate::sorted_list::SortedList`] construction.
///
/// The hazard-pointer reclaim threshold is deliberately not configurable
/// here: it is a property of a [`crate::hazard::HazardPointerRegistry`],
/// which a list never owns (only callers' [`crate::hazard::ThreadHandle`]s
/// reference it per-call) — set it directly via
/// [`crate::hazard::HazardPointerRegistry::set_reclaim_threshold`].
#[derive(Clone, Default)]
pub struct ListConfig {
    pub(crate) sequence_counter: Option<SequenceCounter>,
    pub(crate) require_sequencing: bool,
}

impl ListConfig {
    /// Start from the defaults: no sequence counter, sequencing not
    /// required.
    pub fn new() -> Self {
        Self::default()
    }

    /// Share a sequence counter with this list (and, typically, with
    /// other lists or hash tables that should observe a joint order).
    pub fn with_sequence_counter(mut self, counter: SequenceCounter) -> Self {
        self.sequence_counter = Some(counter);
        self
    }

    /// Fail construction with [`crate::Error::MisconfigError`] if no
    /// sequence counter was supplied. See `SPEC_FULL.md` §4.A for why
    /// this check happens at construction instead of per-call.
    pub fn require_sequencing(mut self, required: bool) -> Self {
        self.require_sequencing = required;
        self
    }
}

/// Configuration for [`crate::hash_table::HashTable`] construction. See
/// [`ListConfig`]'s doc comment for why the hazard-pointer reclaim
/// threshold has no builder here either.
#[derive(Clone)]
pub struct TableConfig {
    pub(crate) sequence_counter: Option<SequenceCounter>,
    pub(crate) require_sequencing: bool,
    pub(crate) initial_buckets: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            sequence_counter: None,
            require_sequencing: false,
            initial_buckets: DEFAULT_INITIAL_BUCKETS,
        }
    }
}

impl TableConfig {
    /// Start from the defaults (16 initial buckets, no counter).
    pub fn new() -> Self {
        Self::default()
    }

    /// Share a sequence counter with this table.
    pub fn with_sequence_counter(mut self, counter: SequenceCounter) -> Self {
        self.sequence_counter = Some(counter);
        self
    }

    /// See [`ListConfig::require_sequencing`].
    pub fn require_sequencing(mut self, required: bool) -> Self {
        self.require_sequencing = required;
        self
    }

    /// Set generation 0's bucket count. Rounded up to a power of two;
    /// zero is rejected by [`crate::hash_table::HashTable::create`].
    pub fn with_initial_buckets(mut self, buckets: usize) -> Self {
        self.initial_buckets = buckets;
        self
    }
}
