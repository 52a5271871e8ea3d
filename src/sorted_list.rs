//! The sorted list: a Harris-Michael ordered linked list with marked-
//! pointer logical deletion, hazard-pointer-protected traversal,
//! refcounted node handles, sequence-number stamping and a write
//! barrier for safe enumeration.
//!
//! This is the heart of the crate — every other component (the hash
//! table) is a cascade of these.

use alloc::boxed::Box;
use core::cmp::Ordering;
use core::marker::PhantomData;
use crate::backoff::Backoff;
use crate::config::ListConfig;
use crate::error::{Error, Result};
use crate::hazard::{SlotHandle, ThreadHandle};
use crate::malloc::{Allocator, GlobalAllocator};
use crate::node::{is_marked, marked, unmarked, Node, NodeRef};
use crate::sequence::SequenceCounter;
use crate::sync::{AtomicPtr, AtomicUsize, Ordering as AtomicOrdering};

/// The result of a successful [`SortedList::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inserted {
    /// The order number this insertion was stamped with, if the list
    /// is configured with a [`SequenceCounter`].
    pub seq_no: Option<u64>,
}

/// The result of a successful [`SortedList::set_value`].
pub struct SetValue<K, V> {
    /// The node previously stored under this key, if any, handed back
    /// to the caller with its refcount preserved (release it when
    /// done).
    pub previous: Option<NodeRef<K, V>>,
    /// The order number this splice/insert was stamped with.
    pub seq_no: Option<u64>,
}

struct WriteLock {
    lock_requests: AtomicUsize,
    pending_writes: AtomicUsize,
}

impl WriteLock {
    const fn new() -> Self {
        Self {
            lock_requests: AtomicUsize::new(0),
            pending_writes: AtomicUsize::new(0),
        }
    }

    /// Called by every mutator before its first CAS. Spins out any
    /// active write-barrier before proceeding.
    fn enter_mutation(&self) {
        loop {
            self.pending_writes.fetch_add(1, AtomicOrdering::AcqRel);
            if self.lock_requests.load(AtomicOrdering::Acquire) == 0 {
                return;
            }
            self.pending_writes.fetch_sub(1, AtomicOrdering::AcqRel);
            while self.lock_requests.load(AtomicOrdering::Acquire) != 0 {
                crate::pr::stall();
            }
        }
    }

    fn exit_mutation(&self) {
        self.pending_writes.fetch_sub(1, AtomicOrdering::AcqRel);
    }

    fn lock_writes(&self) {
        self.lock_requests.fetch_add(1, AtomicOrdering::AcqRel);
        while self.pending_writes.load(AtomicOrdering::Acquire) != 0 {
            crate::pr::stall();
        }
    }

    fn unlock_writes(&self) {
        self.lock_requests.fetch_sub(1, AtomicOrdering::AcqRel);
    }

    fn is_locked(&self) -> bool {
        self.lock_requests.load(AtomicOrdering::Acquire) > 0
    }
}

/// RAII write barrier returned by [`SortedList::lock_writes`]. While
/// held, [`SortedList::get_count`] and [`SortedList::get_all`] may run;
/// every mutator on the list spins until the barrier is dropped.
pub struct WriteBarrier<'list, K, V, C, A: Allocator = GlobalAllocator> {
    list: &'list SortedList<K, V, C, A>,
}

impl<K, V, C, A: Allocator> Drop for WriteBarrier<'_, K, V, C, A> {
    fn drop(&mut self) {
        self.list.write_lock.unlock_writes();
    }
}

/// The predecessor in a `locate` traversal: either the list's own head
/// link or a live node's `next` field. Unifying the two avoids a
/// sentinel node that would otherwise need a placeholder `K`.
enum Pred<'a, K, V> {
    Head(&'a AtomicPtr<Node<K, V>>),
    Node(*mut Node<K, V>),
}

impl<K, V> Pred<'_, K, V> {
    fn next_slot(&self) -> &AtomicPtr<Node<K, V>> {
        match self {
            Pred::Head(slot) => slot,
            Pred::Node(ptr) => unsafe { &(**ptr).next },
        }
    }
}

struct Located<'a, K, V> {
    pred: Pred<'a, K, V>,
    pred_slot: Option<SlotHandle>,
    curr: *mut Node<K, V>,
    curr_slot: Option<SlotHandle>,
}

impl<'a, K, V> Located<'a, K, V> {
    fn release(self, thread: &ThreadHandle<'_>) {
        if let Some(slot) = self.pred_slot {
            thread.release(slot);
        }
        if let Some(slot) = self.curr_slot {
            thread.release(slot);
        }
    }
}

/// A lock-free ordered list keyed by `K`, compared with `C`, whose
/// nodes are allocated through `A`.
pub struct SortedList<K, V, C, A: Allocator = GlobalAllocator> {
    head: AtomicPtr<Node<K, V>>,
    cmp: C,
    write_lock: WriteLock,
    sequence: Option<SequenceCounter>,
    alloc: A,
    _marker: PhantomData<(K, V)>,
}

impl<K, V, C> SortedList<K, V, C, GlobalAllocator>
where
    C: Fn(&K, &K) -> Ordering,
{
    /// A new, empty list with no sequence counter and the global
    /// allocator.
    pub fn new(cmp: C) -> Self {
        Self::with_allocator(cmp, ListConfig::new(), GlobalAllocator)
            .expect("default configuration never fails construction")
    }

    /// A new, empty list configured per `config`. Fails with
    /// [`Error::MisconfigError`] if `config` requires sequencing but
    /// supplies no counter.
    pub fn with_config(cmp: C, config: ListConfig) -> Result<Self> {
        Self::with_allocator(cmp, config, GlobalAllocator)
    }
}

impl<K, V, C, A> SortedList<K, V, C, A>
where
    C: Fn(&K, &K) -> Ordering,
    A: Allocator + Clone + Send + 'static,
{
    /// A new, empty list using a caller-supplied allocator.
    pub fn with_allocator(cmp: C, config: ListConfig, alloc: A) -> Result<Self> {
        if config.require_sequencing && config.sequence_counter.is_none() {
            return Err(Error::MisconfigError);
        }
        Ok(Self {
            head: AtomicPtr::new(core::ptr::null_mut()),
            cmp,
            write_lock: WriteLock::new(),
            sequence: config.sequence_counter,
            alloc,
            _marker: PhantomData,
        })
    }

    fn allocate_seq_no(&self) -> Option<u64> {
        self.sequence.as_ref().map(SequenceCounter::allocate)
    }

    fn report_skipped(&self, n: Option<u64>) {
        if let (Some(seq), Some(n)) = (&self.sequence, n) {
            seq.report_skipped(n);
        }
    }

    fn reclaim_node(&self, thread: &ThreadHandle<'_>, ptr: *mut Node<K, V>) {
        let alloc = self.alloc.clone();
        unsafe {
            thread.reclaim_with(ptr, move |p| Node::deallocate(&alloc, p));
        }
    }

    /// `locate(key) -> (pred, curr)`: the traversal primitive every
    /// mutator and reader builds on. Physically unlinks any
    /// logically-deleted node it passes over along the way.
    fn locate<'s>(&'s self, thread: &ThreadHandle<'_>, key: &K) -> Result<Located<'s, K, V>> {
        let mut backoff = Backoff::new();
        'restart: loop {
            let pred = Pred::Head(&self.head);
            let mut curr = unmarked(self.head.load(AtomicOrdering::Acquire));
            let mut curr_slot = None;
            if !curr.is_null() {
                let slot = thread.acquire(curr)?;
                if crate::cc::unlikely(unmarked(pred.next_slot().load(AtomicOrdering::Acquire)) != curr) {
                    thread.release(slot);
                    backoff.spin();
                    continue 'restart;
                }
                curr_slot = Some(slot);
            }

            let mut pred = pred;
            let mut pred_slot: Option<SlotHandle> = None;

            loop {
                if curr.is_null() {
                    return Ok(Located {
                        pred,
                        pred_slot,
                        curr,
                        curr_slot,
                    });
                }

                let pred_next = pred.next_slot().load(AtomicOrdering::Acquire);
                if crate::cc::unlikely(is_marked(pred_next) || unmarked(pred_next) != curr) {
                    if let Some(slot) = pred_slot {
                        thread.release(slot);
                    }
                    if let Some(slot) = curr_slot {
                        thread.release(slot);
                    }
                    backoff.spin();
                    continue 'restart;
                }

                let succ_raw = unsafe { (*curr).next.load(AtomicOrdering::Acquire) };
                let succ = unmarked(succ_raw);

                if is_marked(succ_raw) {
                    // curr is logically deleted; try to physically unlink it.
                    match pred.next_slot().compare_exchange(
                        curr,
                        succ,
                        AtomicOrdering::AcqRel,
                        AtomicOrdering::Relaxed,
                    ) {
                        Ok(_) => {
                            self.reclaim_node(thread, curr);
                            if let Some(slot) = curr_slot.take() {
                                thread.release(slot);
                            }
                            curr = succ;
                            if !curr.is_null() {
                                curr_slot = Some(thread.acquire(curr)?);
                            }
                            continue;
                        }
                        Err(_) => {
                            if let Some(slot) = pred_slot {
                                thread.release(slot);
                            }
                            if let Some(slot) = curr_slot {
                                thread.release(slot);
                            }
                            backoff.spin();
                            continue 'restart;
                        }
                    }
                }

                let ordering = (self.cmp)(unsafe { &(*curr).key }, key);
                if ordering != Ordering::Less {
                    return Ok(Located {
                        pred,
                        pred_slot,
                        curr,
                        curr_slot,
                    });
                }

                // Advance: pred = curr, curr = succ.
                if let Some(slot) = pred_slot.take() {
                    thread.release(slot);
                }
                pred_slot = curr_slot.take();
                pred = Pred::Node(curr);
                curr = succ;
                if !curr.is_null() {
                    curr_slot = Some(thread.acquire(curr)?);
                }
            }
        }
    }

    /// Insert `key`/`value` as a new node. Fails with
    /// [`Error::KeyAlreadyExists`] without mutating the list if `key`
    /// is already present; the allocated sequence number is reported
    /// through the skip callback in that case.
    pub fn insert(&self, thread: &ThreadHandle<'_>, key: K, value: V) -> Result<Inserted> {
        self.insert_with_reclaim(thread, key, value, None)
    }

    /// As [`insert`](Self::insert), with a cleanup closure run exactly
    /// once when the new node is eventually reclaimed.
    pub fn insert_with_reclaim(
        &self,
        thread: &ThreadHandle<'_>,
        key: K,
        value: V,
        on_reclaim: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<Inserted> {
        let seq = self.allocate_seq_no();
        let new_ptr = Node::allocate(&self.alloc, key, value, on_reclaim)?;

        loop {
            self.write_lock.enter_mutation();
            let key_ref = unsafe { &(*new_ptr).key };
            let located = match self.locate(thread, key_ref) {
                Ok(l) => l,
                Err(e) => {
                    self.write_lock.exit_mutation();
                    unsafe { Node::deallocate(&self.alloc, new_ptr) };
                    return Err(e);
                }
            };

            if !located.curr.is_null()
                && (self.cmp)(unsafe { &(*located.curr).key }, key_ref) == Ordering::Equal
            {
                located.release(thread);
                self.write_lock.exit_mutation();
                unsafe { Node::deallocate(&self.alloc, new_ptr) };
                self.report_skipped(seq);
                return Err(Error::KeyAlreadyExists);
            }

            unsafe {
                (*new_ptr).next.store(located.curr, AtomicOrdering::Relaxed);
            }
            let result = located.pred.next_slot().compare_exchange(
                located.curr,
                new_ptr,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Relaxed,
            );
            located.release(thread);
            self.write_lock.exit_mutation();

            if result.is_ok() {
                if let Some(n) = seq {
                    unsafe { (*new_ptr).set_seq_no(n) };
                }
                return Ok(Inserted { seq_no: seq });
            }
        }
    }

    fn delete_matching(
        &self,
        thread: &ThreadHandle<'_>,
        key: &K,
        expect: Option<*mut Node<K, V>>,
    ) -> Result<(*mut Node<K, V>, Option<u64>)> {
        let seq = self.allocate_seq_no();
        loop {
            self.write_lock.enter_mutation();
            let located = self.locate(thread, key).map_err(|e| {
                self.write_lock.exit_mutation();
                e
            })?;

            let matched = !located.curr.is_null()
                && (self.cmp)(unsafe { &(*located.curr).key }, key) == Ordering::Equal
                && expect.map_or(true, |p| p == located.curr);

            if !matched {
                located.release(thread);
                self.write_lock.exit_mutation();
                self.report_skipped(seq);
                return Err(Error::NotFound);
            }

            let curr = located.curr;
            let succ = unsafe { (*curr).next.load(AtomicOrdering::Acquire) };
            if is_marked(succ) {
                // Someone else is deleting it concurrently.
                located.release(thread);
                self.write_lock.exit_mutation();
                self.report_skipped(seq);
                return Err(Error::NotFound);
            }

            let marked_succ = marked(succ);
            let cas = unsafe { &(*curr).next }.compare_exchange(
                succ,
                marked_succ,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Relaxed,
            );

            if cas.is_err() {
                located.release(thread);
                self.write_lock.exit_mutation();
                continue;
            }

            // Best-effort physical unlink; a later locate() finishes it
            // if this CAS loses a race.
            let _ = located.pred.next_slot().compare_exchange(
                curr,
                unmarked(succ),
                AtomicOrdering::AcqRel,
                AtomicOrdering::Relaxed,
            );

            located.release(thread);
            self.write_lock.exit_mutation();
            return Ok((curr, seq));
        }
    }

    /// Delete a specific node this caller previously obtained (e.g.
    /// from [`find_key`](Self::find_key)). Fails with
    /// [`Error::NotFound`] if the node is no longer linked under its
    /// key.
    pub fn delete_item(
        &self,
        thread: &ThreadHandle<'_>,
        node: &NodeRef<K, V>,
    ) -> Result<Option<u64>> {
        let key = node.key();
        let (curr, seq) = self.delete_matching(thread, key, Some(node.as_ptr()))?;
        let node = unsafe { &*curr };
        if node.dec_ref() == 0 {
            self.reclaim_node(thread, curr);
        }
        Ok(seq)
    }

    /// Delete the node currently stored under `key`, dropping the
    /// list's own reference. Concurrent `NodeRef` holders keep the
    /// payload alive until they release.
    pub fn delete_key(&self, thread: &ThreadHandle<'_>, key: &K) -> Result<Option<u64>> {
        let (curr, seq) = self.delete_matching(thread, key, None)?;
        let node = unsafe { &*curr };
        if node.dec_ref() == 0 {
            self.reclaim_node(thread, curr);
        }
        Ok(seq)
    }

    /// Delete the node currently stored under `key` and hand it back
    /// to the caller, kept alive until released. The list's own
    /// reference is transferred to the returned handle rather than
    /// dropped.
    pub fn remove_key(
        &self,
        thread: &ThreadHandle<'_>,
        key: &K,
    ) -> Result<(NodeRef<K, V>, Option<u64>)> {
        let (curr, seq) = self.delete_matching(thread, key, None)?;
        Ok((NodeRef::new(curr), seq))
    }

    /// `true` if `key` is currently present, without exposing a
    /// handle to it. A thin convenience over [`find_key`](Self::find_key)
    /// for callers that only need a presence check (e.g. the hash
    /// table's cross-generation H3 guard).
    pub fn contains_key(&self, thread: &ThreadHandle<'_>, key: &K) -> Result<bool> {
        match self.find_key(thread, key) {
            Ok(node) => {
                node.release(thread, &self.alloc);
                Ok(true)
            }
            Err(Error::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Find the node currently stored under `key` and return a
    /// refcounted handle to it. Release the handle explicitly via
    /// [`NodeRef::release`] when done.
    pub fn find_key(&self, thread: &ThreadHandle<'_>, key: &K) -> Result<NodeRef<K, V>> {
        loop {
            let located = self.locate(thread, key)?;
            if located.curr.is_null()
                || (self.cmp)(unsafe { &(*located.curr).key }, key) != Ordering::Equal
            {
                located.release(thread);
                return Err(Error::NotFound);
            }
            let node = unsafe { &*located.curr };
            let acquired = node.try_inc_ref();
            let curr = located.curr;
            located.release(thread);
            if acquired {
                return Ok(NodeRef::new(curr));
            }
            // refcount had already hit zero: the node is being
            // reclaimed concurrently. Retry the lookup.
        }
    }

    /// Insert or replace the value stored under `key`. If `key` is
    /// absent and `only_if_exists` is `true`, this is a no-op that
    /// still allocates and skips a sequence number, returning
    /// [`Error::NotFound`]. If `key` is absent and `only_if_exists` is
    /// `false`, behaves exactly like [`insert`](Self::insert) wrapped
    /// in [`SetValue`]. If `key` is present, the old node is spliced
    /// out and handed back with its refcount preserved; setting the
    /// same node (pointer equality) is a no-op after allocating a
    /// sequence number.
    pub fn set_value(
        &self,
        thread: &ThreadHandle<'_>,
        key: K,
        value: V,
        only_if_exists: bool,
    ) -> Result<SetValue<K, V>> {
        let seq = self.allocate_seq_no();
        let new_ptr = Node::allocate(&self.alloc, key, value, None)?;

        loop {
            self.write_lock.enter_mutation();
            let key_ref = unsafe { &(*new_ptr).key };
            let located = match self.locate(thread, key_ref) {
                Ok(l) => l,
                Err(e) => {
                    self.write_lock.exit_mutation();
                    unsafe { Node::deallocate(&self.alloc, new_ptr) };
                    return Err(e);
                }
            };

            let matches = !located.curr.is_null()
                && (self.cmp)(unsafe { &(*located.curr).key }, key_ref) == Ordering::Equal;

            if !matches {
                if only_if_exists {
                    located.release(thread);
                    self.write_lock.exit_mutation();
                    unsafe { Node::deallocate(&self.alloc, new_ptr) };
                    self.report_skipped(seq);
                    return Err(Error::NotFound);
                }
                unsafe {
                    (*new_ptr).next.store(located.curr, AtomicOrdering::Relaxed);
                }
                let result = located.pred.next_slot().compare_exchange(
                    located.curr,
                    new_ptr,
                    AtomicOrdering::AcqRel,
                    AtomicOrdering::Relaxed,
                );
                located.release(thread);
                self.write_lock.exit_mutation();
                if result.is_ok() {
                    if let Some(n) = seq {
                        unsafe { (*new_ptr).set_seq_no(n) };
                    }
                    return Ok(SetValue {
                        previous: None,
                        seq_no: seq,
                    });
                }
                continue;
            }

            if located.curr == new_ptr {
                // Setting the same node already linked: a documented
                // no-op once a sequence number has been allocated.
                located.release(thread);
                self.write_lock.exit_mutation();
                unsafe { Node::deallocate(&self.alloc, new_ptr) };
                return Ok(SetValue {
                    previous: None,
                    seq_no: seq,
                });
            }

            let old = located.curr;
            let old_succ = unsafe { (*old).next.load(AtomicOrdering::Acquire) };
            if is_marked(old_succ) {
                located.release(thread);
                self.write_lock.exit_mutation();
                continue;
            }

            unsafe {
                (*new_ptr)
                    .next
                    .store(unmarked(old_succ), AtomicOrdering::Relaxed);
            }

            let mark_old = unsafe { &(*old).next }.compare_exchange(
                old_succ,
                marked(old_succ),
                AtomicOrdering::AcqRel,
                AtomicOrdering::Relaxed,
            );
            if mark_old.is_err() {
                located.release(thread);
                self.write_lock.exit_mutation();
                continue;
            }

            let splice = located.pred.next_slot().compare_exchange(
                old,
                new_ptr,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Relaxed,
            );
            located.release(thread);
            self.write_lock.exit_mutation();

            if splice.is_err() {
                // A later locate() will finish unlinking `old`; this
                // attempt simply retries with a fresh traversal.
                continue;
            }

            if let Some(n) = seq {
                unsafe { (*new_ptr).set_seq_no(n) };
            }
            return Ok(SetValue {
                previous: Some(NodeRef::new(old)),
                seq_no: seq,
            });
        }
    }

    /// Begin a write barrier: spins out in-flight mutators and pauses
    /// new ones from entering their critical section until the
    /// returned guard is dropped.
    pub fn lock_writes(&self) -> WriteBarrier<'_, K, V, C, A> {
        self.write_lock.lock_writes();
        WriteBarrier { list: self }
    }

    /// Count unmarked nodes reachable from the head. Requires an
    /// active write barrier.
    pub fn get_count(&self) -> Result<usize> {
        if !self.write_lock.is_locked() {
            return Err(Error::NotLocked);
        }
        let mut count = 0usize;
        let mut curr = unmarked(self.head.load(AtomicOrdering::Acquire));
        while !curr.is_null() {
            let next_raw = unsafe { (*curr).next.load(AtomicOrdering::Acquire) };
            if !is_marked(next_raw) {
                count += 1;
            }
            curr = unmarked(next_raw);
        }
        Ok(count)
    }

    /// Copy refcounted handles to every unmarked node, in key-ascending
    /// order, into `buffer`. Requires an active write barrier and a
    /// buffer whose length matches [`get_count`](Self::get_count)
    /// exactly.
    pub fn get_all(&self, buffer: &mut [Option<NodeRef<K, V>>]) -> Result<()> {
        if !self.write_lock.is_locked() {
            return Err(Error::NotLocked);
        }
        let count = self.get_count()?;
        if buffer.len() != count {
            return Err(Error::WrongSize);
        }
        let mut curr = unmarked(self.head.load(AtomicOrdering::Acquire));
        let mut index = 0;
        while !curr.is_null() {
            let node = unsafe { &*curr };
            let next_raw = node.next.load(AtomicOrdering::Acquire);
            if !is_marked(next_raw) && node.try_inc_ref() {
                buffer[index] = Some(NodeRef::new(curr));
                index += 1;
            }
            curr = unmarked(next_raw);
        }
        // Under an active write barrier no node reachable here can be
        // concurrently unlinked, so `try_inc_ref` should never fail and
        // `index` should always reach `count`. Surface a short fill
        // rather than returning `Ok` over unfilled trailing slots.
        if index != count {
            return Err(Error::WrongSize);
        }
        Ok(())
    }
}

impl<K, V, C, A: Allocator> Drop for SortedList<K, V, C, A> {
    fn drop(&mut self) {
        let mut seen = crate::cycle_guard::PointerSet::new();
        let mut curr = unmarked(self.head.load(AtomicOrdering::Relaxed));
        while !curr.is_null() {
            if seen.visit(curr as usize) {
                #[cfg(feature = "tracing")]
                tracing::error!("cycle detected while destroying a sorted list; leaking the remainder");
                return;
            }
            let next = unmarked(unsafe { (*curr).next.load(AtomicOrdering::Relaxed) });
            unsafe { Node::deallocate(&self.alloc, curr) };
            curr = next;
        }
    }
}
