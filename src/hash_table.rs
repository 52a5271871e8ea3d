//! The resizable lock-free hash table: a non-blocking cascade of
//! bucket-array "generations" over [`crate::sorted_list::SortedList`].
//!
//! A table never resizes a generation in place. Instead, once a
//! generation's item count reaches its bucket count, a new generation
//! with double the buckets is CAS-installed ahead of it. Older
//! generations are never drained proactively; they are probed in age
//! order by every cascading operation and destroyed, oldest first,
//! when the table itself is dropped.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cmp::Ordering;
use core::ptr;
use crate::config::{ListConfig, TableConfig};
use crate::error::{Error, Result};
use crate::hazard::ThreadHandle;
use crate::malloc::{Allocator, GlobalAllocator};
use crate::node::NodeRef;
use crate::sequence::SequenceCounter;
use crate::sorted_list::{Inserted, SetValue, SortedList, WriteBarrier};
use crate::sync::{AtomicPtr, AtomicUsize, Ordering as AtomicOrdering};

/// One bucket array. Buckets are lazily populated with a sorted list
/// on first use (CAS-installed); a null slot means "empty bucket,
/// nothing has hashed here yet."
struct Generation<K, V, C, A: Allocator> {
    bucket_count: usize,
    buckets: Vec<AtomicPtr<SortedList<K, V, C, A>>>,
    item_count: AtomicUsize,
    older: AtomicPtr<Generation<K, V, C, A>>,
}

impl<K, V, C, A: Allocator> Generation<K, V, C, A> {
    fn new(bucket_count: usize, older: *mut Generation<K, V, C, A>) -> Self {
        let mut buckets = Vec::with_capacity(bucket_count);
        buckets.resize_with(bucket_count, || AtomicPtr::new(ptr::null_mut()));
        Self {
            bucket_count,
            buckets,
            item_count: AtomicUsize::new(0),
            older: AtomicPtr::new(older),
        }
    }
}

/// A lock-free, resizable associative container: a hash of key to
/// [`SortedList`]-backed buckets, generalized over a caller-supplied
/// hash function `H` and key comparator `C`.
///
/// `C` must be [`Clone`] because each bucket owns an independent
/// `SortedList<K, V, C, A>`; typically `C` is a zero-sized function
/// item or a closure with no captures, so cloning it is free.
pub struct HashTable<K, V, H, C, A: Allocator = GlobalAllocator> {
    newest: AtomicPtr<Generation<K, V, C, A>>,
    hash_fn: H,
    cmp: C,
    sequence: Option<SequenceCounter>,
    alloc: A,
}

impl<K, V, H, C> HashTable<K, V, H, C, GlobalAllocator>
where
    H: Fn(&K) -> u64,
    C: Fn(&K, &K) -> Ordering + Clone,
{
    /// A new table using the global allocator and `config`'s initial
    /// bucket count (rounded up to a power of two). Fails with
    /// [`Error::NullArgument`] if `config.initial_buckets` is zero, or
    /// [`Error::MisconfigError`] if `config` requires sequencing but
    /// supplies no counter.
    pub fn create(hash_fn: H, cmp: C, config: TableConfig) -> Result<Self> {
        Self::with_allocator(hash_fn, cmp, config, GlobalAllocator)
    }
}

impl<K, V, H, C, A> HashTable<K, V, H, C, A>
where
    H: Fn(&K) -> u64,
    C: Fn(&K, &K) -> Ordering + Clone,
    A: Allocator + Clone + Send + 'static,
{
    /// A new table using a caller-supplied allocator.
    pub fn with_allocator(hash_fn: H, cmp: C, config: TableConfig, alloc: A) -> Result<Self> {
        if config.initial_buckets == 0 {
            return Err(Error::NullArgument);
        }
        if config.require_sequencing && config.sequence_counter.is_none() {
            return Err(Error::MisconfigError);
        }
        let bucket_count = config.initial_buckets.next_power_of_two();
        let gen0 = Box::into_raw(Box::new(Generation::new(bucket_count, ptr::null_mut())));
        Ok(Self {
            newest: AtomicPtr::new(gen0),
            hash_fn,
            cmp,
            sequence: config.sequence_counter,
            alloc,
        })
    }

    fn list_config(&self) -> ListConfig {
        let mut cfg = ListConfig::new();
        if let Some(seq) = &self.sequence {
            cfg = cfg.with_sequence_counter(seq.clone());
        }
        cfg
    }

    fn bucket_index(&self, gen: &Generation<K, V, C, A>, key: &K) -> usize {
        (self.hash_fn)(key) as usize & (gen.bucket_count - 1)
    }

    /// The bucket's list if one has already been created, without
    /// installing one.
    fn existing_list<'g>(
        &self,
        gen: &'g Generation<K, V, C, A>,
        key: &K,
    ) -> Option<&'g SortedList<K, V, C, A>> {
        let idx = self.bucket_index(gen, key);
        let ptr = gen.buckets[idx].load(AtomicOrdering::Acquire);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { &*ptr })
        }
    }

    /// The bucket's list, lazily CAS-installing one if this is the
    /// first key to hash there.
    fn list_for<'g>(&self, gen: &'g Generation<K, V, C, A>, key: &K) -> Result<&'g SortedList<K, V, C, A>> {
        let idx = self.bucket_index(gen, key);
        let slot = &gen.buckets[idx];
        let existing = slot.load(AtomicOrdering::Acquire);
        if !existing.is_null() {
            return Ok(unsafe { &*existing });
        }

        let list = SortedList::with_allocator(self.cmp.clone(), self.list_config(), self.alloc.clone())?;
        let new_ptr = Box::into_raw(Box::new(list));
        match slot.compare_exchange(
            ptr::null_mut(),
            new_ptr,
            AtomicOrdering::AcqRel,
            AtomicOrdering::Acquire,
        ) {
            Ok(_) => Ok(unsafe { &*new_ptr }),
            Err(winner) => {
                unsafe { drop(Box::from_raw(new_ptr)) };
                Ok(unsafe { &*winner })
            }
        }
    }

    /// Generations oldest-to-newest excluded; walks from `newest`
    /// toward the oldest generation, yielding each in turn.
    fn older_generations(&self, newest: &Generation<K, V, C, A>) -> GenerationWalk<'_, K, V, C, A> {
        GenerationWalk {
            current: newest.older.load(AtomicOrdering::Acquire),
        }
    }

    /// If the newest generation's item count has reached its bucket
    /// count, CAS-install a new generation with double the buckets.
    /// Racing resizers all succeed at their own CAS attempt or simply
    /// discover the winner's generation is already newest.
    fn maybe_resize(&self, newest_ptr: *mut Generation<K, V, C, A>, newest: &Generation<K, V, C, A>) {
        if newest.item_count.load(AtomicOrdering::Acquire) < newest.bucket_count {
            return;
        }
        let grown = Box::into_raw(Box::new(Generation::new(newest.bucket_count * 2, newest_ptr)));
        if self
            .newest
            .compare_exchange(
                newest_ptr,
                grown,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            )
            .is_err()
        {
            unsafe { drop(Box::from_raw(grown)) };
        }
    }

    /// Insert `key`/`value` into the newest generation. Fails with
    /// [`Error::KeyAlreadyExists`] if `key` is present in the newest
    /// generation or in any older generation (preserving H3: a key
    /// occupies at most one generation).
    pub fn insert(&self, thread: &ThreadHandle<'_>, key: K, value: V) -> Result<Inserted>
    where
        K: Clone,
    {
        let newest_ptr = self.newest.load(AtomicOrdering::Acquire);
        let newest = unsafe { &*newest_ptr };

        for gen in self.older_generations(newest) {
            if let Some(list) = self.existing_list(gen, &key) {
                if list.contains_key(thread, &key)? {
                    return Err(Error::KeyAlreadyExists);
                }
            }
        }

        let list = self.list_for(newest, &key)?;
        let result = list.insert(thread, key, value)?;
        newest.item_count.fetch_add(1, AtomicOrdering::AcqRel);
        self.maybe_resize(newest_ptr, newest);
        Ok(result)
    }

    /// Remove `key`, cascading newest generation first. Returns on the
    /// first generation whose bucket holds the key.
    pub fn delete_key(&self, thread: &ThreadHandle<'_>, key: &K) -> Result<Option<u64>> {
        let newest_ptr = self.newest.load(AtomicOrdering::Acquire);
        let newest = unsafe { &*newest_ptr };

        for gen in core::iter::once(newest).chain(self.older_generations(newest)) {
            if let Some(list) = self.existing_list(gen, key) {
                match list.delete_key(thread, key) {
                    Ok(seq) => return Ok(seq),
                    Err(Error::NotFound) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Err(Error::NotFound)
    }

    /// As [`delete_key`](Self::delete_key), handing back the removed
    /// node instead of dropping it immediately.
    pub fn remove_key(
        &self,
        thread: &ThreadHandle<'_>,
        key: &K,
    ) -> Result<(NodeRef<K, V>, Option<u64>)> {
        let newest_ptr = self.newest.load(AtomicOrdering::Acquire);
        let newest = unsafe { &*newest_ptr };

        for gen in core::iter::once(newest).chain(self.older_generations(newest)) {
            if let Some(list) = self.existing_list(gen, key) {
                match list.remove_key(thread, key) {
                    Ok(found) => return Ok(found),
                    Err(Error::NotFound) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Err(Error::NotFound)
    }

    /// Find `key`, cascading newest generation first.
    pub fn find(&self, thread: &ThreadHandle<'_>, key: &K) -> Result<NodeRef<K, V>> {
        let newest_ptr = self.newest.load(AtomicOrdering::Acquire);
        let newest = unsafe { &*newest_ptr };

        for gen in core::iter::once(newest).chain(self.older_generations(newest)) {
            if let Some(list) = self.existing_list(gen, key) {
                match list.find_key(thread, key) {
                    Ok(node) => return Ok(node),
                    Err(Error::NotFound) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Err(Error::NotFound)
    }

    /// Set `key` to `value` in the newest generation. Before applying,
    /// evicts `key` from every older generation so that at most one
    /// generation ever holds it (H3), matching the behavior the
    /// original source leaves ambiguous.
    pub fn set_value(&self, thread: &ThreadHandle<'_>, key: K, value: V) -> Result<SetValue<K, V>>
    where
        K: Clone,
    {
        let newest_ptr = self.newest.load(AtomicOrdering::Acquire);
        let newest = unsafe { &*newest_ptr };

        for gen in self.older_generations(newest) {
            if let Some(list) = self.existing_list(gen, &key) {
                match list.delete_key(thread, &key) {
                    Ok(_) | Err(Error::NotFound) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        let list = self.list_for(newest, &key)?;
        let result = list.set_value(thread, key, value, false)?;
        newest.item_count.fetch_add(1, AtomicOrdering::AcqRel);
        self.maybe_resize(newest_ptr, newest);
        Ok(result)
    }

    /// Number of generations currently installed, oldest included.
    /// Diagnostic only.
    pub fn generation_count(&self) -> usize {
        let newest_ptr = self.newest.load(AtomicOrdering::Acquire);
        let newest = unsafe { &*newest_ptr };
        1 + self.older_generations(newest).count()
    }

    /// Lock writes across every bucket list instantiated in every
    /// generation at the time of this call. While the returned guard
    /// is held, [`get_count`](Self::get_count) may run. A bucket
    /// lazily created by a racing insert *after* this call is not
    /// covered; this mirrors the table's general stance that resize
    /// and first-touch bucket creation are wait-free events no barrier
    /// holds up.
    pub fn lock_writes(&self) -> TableWriteBarrier<'_, K, V, C, A> {
        let newest_ptr = self.newest.load(AtomicOrdering::Acquire);
        let newest = unsafe { &*newest_ptr };
        let mut barriers = Vec::new();
        for gen in core::iter::once(newest).chain(self.older_generations(newest)) {
            for slot in &gen.buckets {
                let ptr = slot.load(AtomicOrdering::Acquire);
                if !ptr.is_null() {
                    barriers.push(unsafe { &*ptr }.lock_writes());
                }
            }
        }
        TableWriteBarrier { _barriers: barriers }
    }

    /// Total item count across every bucket in every generation.
    /// Requires every currently-instantiated bucket to be covered by
    /// an active write barrier (see [`lock_writes`](Self::lock_writes)).
    pub fn get_count(&self) -> Result<usize> {
        let newest_ptr = self.newest.load(AtomicOrdering::Acquire);
        let newest = unsafe { &*newest_ptr };
        let mut total = 0usize;
        for gen in core::iter::once(newest).chain(self.older_generations(newest)) {
            for slot in &gen.buckets {
                let ptr = slot.load(AtomicOrdering::Acquire);
                if !ptr.is_null() {
                    total += unsafe { &*ptr }.get_count()?;
                }
            }
        }
        Ok(total)
    }
}

/// Aggregate write barrier returned by [`HashTable::lock_writes`]: holds
/// one per-bucket [`WriteBarrier`] for every bucket instantiated across
/// every generation at the time it was taken.
pub struct TableWriteBarrier<'t, K, V, C, A: Allocator> {
    _barriers: Vec<WriteBarrier<'t, K, V, C, A>>,
}

struct GenerationWalk<'g, K, V, C, A: Allocator> {
    current: *mut Generation<K, V, C, A>,
}

impl<'g, K, V, C, A: Allocator> Iterator for GenerationWalk<'g, K, V, C, A> {
    type Item = &'g Generation<K, V, C, A>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current.is_null() {
            return None;
        }
        let gen = unsafe { &*self.current };
        self.current = gen.older.load(AtomicOrdering::Acquire);
        Some(gen)
    }
}

impl<K, V, H, C, A: Allocator> Drop for HashTable<K, V, H, C, A> {
    fn drop(&mut self) {
        let mut generations = Vec::new();
        let mut current = *self.newest.get_mut();
        while !current.is_null() {
            let gen = unsafe { &mut *current };
            let next = *gen.older.get_mut();
            generations.push(current);
            current = next;
        }
        // Oldest first.
        for ptr in generations.into_iter().rev() {
            let mut generation = unsafe { Box::from_raw(ptr) };
            for slot in generation.buckets.iter_mut() {
                let list_ptr = *slot.get_mut();
                if !list_ptr.is_null() {
                    unsafe { drop(Box::from_raw(list_ptr)) };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hazard::HazardPointerRegistry;

    fn table() -> HashTable<u32, u32, fn(&u32) -> u64, fn(&u32, &u32) -> Ordering> {
        fn hash(k: &u32) -> u64 {
            *k as u64
        }
        fn cmp(a: &u32, b: &u32) -> Ordering {
            a.cmp(b)
        }
        HashTable::create(hash, cmp, TableConfig::new().with_initial_buckets(2)).unwrap()
    }

    #[test]
    fn zero_initial_buckets_is_rejected() {
        fn hash(k: &u32) -> u64 {
            *k as u64
        }
        fn cmp(a: &u32, b: &u32) -> Ordering {
            a.cmp(b)
        }
        let err = HashTable::create(hash, cmp, TableConfig::new().with_initial_buckets(0)).unwrap_err();
        assert!(matches!(err, Error::NullArgument));
    }

    #[test]
    fn insert_then_find_round_trips() {
        let registry = HazardPointerRegistry::new();
        let thread = registry.register_thread();
        let t = table();

        t.insert(&thread, 1, 100).unwrap();
        t.insert(&thread, 2, 200).unwrap();
        t.insert(&thread, 3, 300).unwrap();

        let found = t.find(&thread, &2).unwrap();
        assert_eq!(*found.value(), 200);
        found.release(&thread, &GlobalAllocator);

        assert!(matches!(t.find(&thread, &4), Err(Error::NotFound)));
    }

    #[test]
    fn insert_triggers_resize() {
        let registry = HazardPointerRegistry::new();
        let thread = registry.register_thread();
        let t = table();

        assert_eq!(t.generation_count(), 1);
        t.insert(&thread, 1, 1).unwrap();
        t.insert(&thread, 2, 2).unwrap();
        // Newest generation's bucket_count (2) reached by item_count; a
        // second generation should now exist.
        assert_eq!(t.generation_count(), 2);
    }

    #[test]
    fn duplicate_key_is_rejected_even_across_generations() {
        let registry = HazardPointerRegistry::new();
        let thread = registry.register_thread();
        let t = table();

        t.insert(&thread, 1, 1).unwrap();
        t.insert(&thread, 2, 2).unwrap();
        // Forces a new generation; key 1 now lives in the older one.
        assert!(t.generation_count() >= 2);

        let err = t.insert(&thread, 1, 99).unwrap_err();
        assert!(matches!(err, Error::KeyAlreadyExists));
    }

    #[test]
    fn colliding_hash_different_keys_both_findable() {
        fn hash(_: &u32) -> u64 {
            0
        }
        fn cmp(a: &u32, b: &u32) -> Ordering {
            a.cmp(b)
        }
        let registry = HazardPointerRegistry::new();
        let thread = registry.register_thread();
        let t: HashTable<u32, u32, _, _> =
            HashTable::create(hash, cmp, TableConfig::new().with_initial_buckets(1)).unwrap();

        t.insert(&thread, 1, 10).unwrap();
        t.insert(&thread, 2, 20).unwrap();

        let a = t.find(&thread, &1).unwrap();
        assert_eq!(*a.value(), 10);
        a.release(&thread, &GlobalAllocator);

        t.delete_key(&thread, &1).unwrap();
        assert!(matches!(t.find(&thread, &1), Err(Error::NotFound)));
        let b = t.find(&thread, &2).unwrap();
        assert_eq!(*b.value(), 20);
        b.release(&thread, &GlobalAllocator);
    }

    #[test]
    fn delete_key_twice_reports_not_found_second_time() {
        let registry = HazardPointerRegistry::new();
        let thread = registry.register_thread();
        let t = table();

        t.insert(&thread, 1, 1).unwrap();
        assert!(t.delete_key(&thread, &1).is_ok());
        assert!(matches!(t.delete_key(&thread, &1), Err(Error::NotFound)));
    }

    #[test]
    fn set_value_evicts_older_generation_copy() {
        let registry = HazardPointerRegistry::new();
        let thread = registry.register_thread();
        let t = table();

        t.insert(&thread, 1, 1).unwrap();
        t.insert(&thread, 2, 2).unwrap();
        assert!(t.generation_count() >= 2);

        // key 1 lives in an older generation; set_value must evict it
        // there and re-home it in the newest.
        let result = t.set_value(&thread, 1, 111).unwrap();
        assert!(result.previous.is_none());

        let found = t.find(&thread, &1).unwrap();
        assert_eq!(*found.value(), 111);
        found.release(&thread, &GlobalAllocator);
    }

    #[test]
    fn get_count_under_lock_counts_across_buckets_and_generations() {
        let registry = HazardPointerRegistry::new();
        let thread = registry.register_thread();
        let t = table();

        t.insert(&thread, 1, 1).unwrap();
        t.insert(&thread, 2, 2).unwrap();
        t.insert(&thread, 3, 3).unwrap();
        assert!(t.generation_count() >= 2);

        let _barrier = t.lock_writes();
        assert_eq!(t.get_count().unwrap(), 3);
    }

    #[test]
    fn get_count_without_lock_writes_is_not_locked() {
        let registry = HazardPointerRegistry::new();
        let thread = registry.register_thread();
        let t = table();
        t.insert(&thread, 1, 1).unwrap();
        assert!(matches!(t.get_count(), Err(Error::NotLocked)));
    }

    #[test]
    fn remove_key_hands_back_the_node() {
        let registry = HazardPointerRegistry::new();
        let thread = registry.register_thread();
        let t = table();

        t.insert(&thread, 1, 42).unwrap();
        let (node, _seq) = t.remove_key(&thread, &1).unwrap();
        assert_eq!(*node.value(), 42);
        node.release(&thread, &GlobalAllocator);

        assert!(matches!(t.find(&thread, &1), Err(Error::NotFound)));
    }
}
