//! Hazard pointers: safe memory reclamation for the sorted list and
//! hash table.
//!
//! Each registered thread owns a fixed-size array of hazard slots. To
//! dereference a pointer read from shared memory, a thread first
//! publishes it into one of its slots, then re-reads the shared
//! location to confirm the pointer is still current (H4). Unlinked
//! nodes are handed to [`ThreadHandle::reclaim`], which frees them only
//! once no thread's hazard slots reference them — the classical Michael
//! scheme.
//!
//! ```
//! use hazardmap::hazard::HazardPointerRegistry;
//!
//! let registry = HazardPointerRegistry::new();
//! let thread = registry.register_thread();
//! let value = Box::into_raw(Box::new(7i32));
//! let slot = thread.acquire(value).unwrap();
//! thread.release(slot);
//! unsafe { thread.reclaim(value) };
//! registry.unregister_thread(thread);
//! ```

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ptr;
use crate::error::{Error, Result};
use crate::sync::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

cfg_if::cfg_if! {
    if #[cfg(feature = "more-concurrency")] {
        /// Hazard slots available per registered thread.
        pub const HAZARD_SLOTS_PER_THREAD: usize = 8;
    } else {
        /// Hazard slots available per registered thread: predecessor,
        /// current and successor of a `locate`, plus one spare for a
        /// caller-visible refcounted handle (`find_key`/`get_all`).
        pub const HAZARD_SLOTS_PER_THREAD: usize = 4;
    }
}

const DEFAULT_RECLAIM_THRESHOLD: usize = crate::config::DEFAULT_RECLAIM_THRESHOLD;

struct RetiredNode {
    ptr: *mut (),
    free_fn: Box<dyn FnOnce(*mut ()) + Send>,
}

// SAFETY: `ptr` is only ever dereferenced by `free_fn`, which recreates
// the exact typed pointer it was retired from; the `RetiredNode` itself
// is only ever touched by the thread that owns the retire list it lives
// in, or, for orphaned nodes, under the registry's orphan-list lock.
unsafe impl Send for RetiredNode {}

/// One thread's hazard slots, retire list and linked-list membership in
/// a registry. Not exposed directly; always accessed through a
/// [`ThreadHandle`].
#[repr(C)]
struct ThreadRecord {
    hazards: [AtomicPtr<()>; HAZARD_SLOTS_PER_THREAD],
    next: AtomicPtr<ThreadRecord>,
    /// `true` while a live `ThreadHandle` owns this record.
    active: AtomicBool,
    retire_list: UnsafeCell<Vec<RetiredNode>>,
}

impl ThreadRecord {
    fn new() -> Self {
        Self {
            hazards: core::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            next: AtomicPtr::new(ptr::null_mut()),
            active: AtomicBool::new(true),
            retire_list: UnsafeCell::new(Vec::new()),
        }
    }
}

/// A lock-free spin-locked stack of retired nodes left behind by
/// threads that unregistered before every hazard against them cleared.
/// Drained opportunistically by any thread's [`ThreadHandle::scan`].
struct OrphanList {
    locked: AtomicBool,
    nodes: UnsafeCell<Vec<RetiredNode>>,
}

// SAFETY: all access to `nodes` is gated by `locked`.
unsafe impl Sync for OrphanList {}

impl OrphanList {
    const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            nodes: UnsafeCell::new(Vec::new()),
        }
    }

    fn with_lock<R>(&self, f: impl FnOnce(&mut Vec<RetiredNode>) -> R) -> R {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            crate::pr::stall();
        }
        let result = f(unsafe { &mut *self.nodes.get() });
        self.locked.store(false, Ordering::Release);
        result
    }
}

/// The shared hazard-pointer registry. A sorted list and a hash table
/// each own one (or share one, mirroring a shared [`crate::sequence::SequenceCounter`]).
pub struct HazardPointerRegistry {
    records: AtomicPtr<ThreadRecord>,
    reclaim_threshold: AtomicUsize,
    orphans: OrphanList,
}

impl HazardPointerRegistry {
    /// An empty registry with the default reclaim threshold.
    pub fn new() -> Self {
        Self {
            records: AtomicPtr::new(ptr::null_mut()),
            reclaim_threshold: AtomicUsize::new(DEFAULT_RECLAIM_THRESHOLD),
            orphans: OrphanList::new(),
        }
    }

    /// Set the registry-wide retire-list length that triggers a scan.
    pub fn set_reclaim_threshold(&self, n: usize) {
        self.reclaim_threshold.store(n.max(1), Ordering::Relaxed);
    }

    fn reclaim_threshold(&self) -> usize {
        self.reclaim_threshold.load(Ordering::Relaxed)
    }

    /// Allocate or reuse a thread record and return a handle bound to
    /// the calling thread. Reuse prefers a record freed by a prior
    /// [`unregister_thread`](Self::unregister_thread) call, bounding the
    /// registry's size under threads that come and go.
    pub fn register_thread(&self) -> ThreadHandle<'_> {
        let mut current = self.records.load(Ordering::Acquire);
        while !current.is_null() {
            let record = unsafe { &*current };
            if record
                .active
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return ThreadHandle {
                    registry: self,
                    record: current,
                    _not_send: PhantomData,
                };
            }
            current = record.next.load(Ordering::Acquire);
        }

        let record = Box::into_raw(Box::new(ThreadRecord::new()));
        loop {
            let head = self.records.load(Ordering::Relaxed);
            unsafe { (*record).next.store(head, Ordering::Relaxed) };
            if self
                .records
                .compare_exchange_weak(head, record, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        ThreadHandle {
            registry: self,
            record,
            _not_send: PhantomData,
        }
    }

    /// Drain the retire list of `handle`'s thread and mark its record
    /// free for reuse. Nodes still hazarded by another thread move to
    /// the registry's orphan list and are reclaimed by a later scan
    /// from any thread.
    pub fn unregister_thread(&self, handle: ThreadHandle<'_>) {
        handle.scan();
        let record = unsafe { &*handle.record };
        let leftover = unsafe { &mut *record.retire_list.get() };
        if !leftover.is_empty() {
            let drained: Vec<RetiredNode> = leftover.drain(..).collect();
            self.orphans.with_lock(|orphans| orphans.extend(drained));
        }
        record.active.store(false, Ordering::Release);
        core::mem::forget(handle);
    }

    fn collect_hazards(&self) -> Vec<*mut ()> {
        let mut hazards = Vec::new();
        let mut current = self.records.load(Ordering::Acquire);
        while !current.is_null() {
            let record = unsafe { &*current };
            if record.active.load(Ordering::Acquire) {
                for hp in &record.hazards {
                    let ptr = hp.load(Ordering::Acquire);
                    if !ptr.is_null() {
                        hazards.push(ptr);
                    }
                }
            }
            current = record.next.load(Ordering::Acquire);
        }
        hazards
    }
}

impl Default for HazardPointerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HazardPointerRegistry {
    fn drop(&mut self) {
        let mut current = self.records.load(Ordering::Relaxed);
        while !current.is_null() {
            let record = unsafe { Box::from_raw(current) };
            current = record.next.load(Ordering::Relaxed);
            let retired = unsafe { &mut *record.retire_list.get() };
            for node in retired.drain(..) {
                unsafe { (node.free_fn)(node.ptr) };
            }
        }
        self.orphans.with_lock(|orphans| {
            for node in orphans.drain(..) {
                unsafe { (node.free_fn)(node.ptr) };
            }
        });
    }
}

/// A registered thread's handle into a [`HazardPointerRegistry`].
///
/// Neither `Send` nor `Sync`: a handle obtained on one thread cannot be
/// moved to, or used from, another. This upgrades the "must only be
/// used on the registering thread" requirement into a compiler-checked
/// invariant rather than a documented convention.
pub struct ThreadHandle<'reg> {
    registry: &'reg HazardPointerRegistry,
    record: *mut ThreadRecord,
    _not_send: PhantomData<*mut ()>,
}

/// An opaque token identifying one occupied hazard slot. Can only be
/// obtained from, and released through, the [`ThreadHandle`] that
/// issued it.
pub struct SlotHandle(usize);

impl<'reg> ThreadHandle<'reg> {
    fn record(&self) -> &ThreadRecord {
        unsafe { &*self.record }
    }

    /// Publish `ptr` into the first free hazard slot. Pure publication:
    /// no validation that `ptr` is still live. The caller must re-read
    /// the shared location afterwards and confirm it still holds `ptr`
    /// before treating the pointer as protected (H4).
    pub fn acquire<T>(&self, ptr: *const T) -> Result<SlotHandle> {
        let record = self.record();
        for (index, hazard) in record.hazards.iter().enumerate() {
            if hazard
                .compare_exchange(
                    ptr::null_mut(),
                    ptr as *mut (),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                crate::pr::fence_acquire();
                return Ok(SlotHandle(index));
            }
        }
        Err(Error::SlotExhausted)
    }

    /// Clear a previously acquired slot, making it available for reuse.
    pub fn release(&self, slot: SlotHandle) {
        self.record().hazards[slot.0].store(ptr::null_mut(), Ordering::Release);
    }

    /// Add `ptr` to this thread's retire list using the default,
    /// `Box`-based free function; once the list reaches the registry's
    /// reclaim threshold, [`scan`](Self::scan) runs automatically.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `Box::into_raw` and must not still be
    /// reachable from any shared location other threads may read from.
    pub unsafe fn reclaim<T: Send + 'static>(&self, ptr: *mut T) {
        self.reclaim_with(ptr, |raw| drop(Box::from_raw(raw)))
    }

    /// Add `ptr` to this thread's retire list with a caller-supplied
    /// free function, for nodes not allocated through `Box` (e.g. a
    /// node freed through a [`crate::malloc::Allocator`]).
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for `free` to consume exactly once, and must
    /// not still be reachable from any shared location other threads
    /// may read from.
    pub unsafe fn reclaim_with<T, F>(&self, ptr: *mut T, free: F)
    where
        F: FnOnce(*mut T) + Send + 'static,
    {
        let record = self.record();
        let retire_list = &mut *record.retire_list.get();
        retire_list.push(RetiredNode {
            ptr: ptr as *mut (),
            free_fn: Box::new(move |erased| free(erased as *mut T)),
        });
        if retire_list.len() >= self.registry.reclaim_threshold() {
            self.scan();
        }
    }

    /// Snapshot every registered thread's hazard slots and free any
    /// retired pointer (this thread's own, and any left behind in the
    /// registry's orphan list) not present in the snapshot.
    pub fn scan(&self) {
        let hazards = self.registry.collect_hazards();
        let record = self.record();
        let retire_list = unsafe { &mut *record.retire_list.get() };
        Self::sweep(retire_list, &hazards);

        self.registry
            .orphans
            .with_lock(|orphans| Self::sweep(orphans, &hazards));
    }

    fn sweep(list: &mut Vec<RetiredNode>, hazards: &[*mut ()]) {
        let mut index = 0;
        while index < list.len() {
            if hazards.contains(&list[index].ptr) {
                index += 1;
            } else {
                let node = list.swap_remove(index);
                unsafe { (node.free_fn)(node.ptr) };
            }
        }
    }
}
