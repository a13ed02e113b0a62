//! Reference-counted object pool backed by fixed-size slabs.
//!
//! Mirrors `ObjectPool<T>` / `Ref<T>` from the original design: a pool holds
//! a linked list of slabs sized to roughly one page each; `obtain` pops a
//! free node (demand-allocating a new slab if none is free), and the last
//! strong reference dropping returns the node to its owning slab's free
//! list. The slab owning a node is recovered by pointer arithmetic rather
//! than by storing a back-pointer per node, to keep the per-node overhead
//! small the way the original allocator does.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::fmt;
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock, Weak as StdWeak};

use parking_lot::ReentrantMutex;

/// Target size, in bytes, for one slab's backing allocation. Node count per
/// slab is derived from this so that one slab occupies roughly one page.
pub const DEFAULT_SLAB_SIZE_BYTES: usize = 4096;

struct Node<T> {
    value: UnsafeCell<MaybeUninit<T>>,
    strong: Cell<usize>,
    weak: Cell<usize>,
    /// Bumped every time this node is handed out by `obtain`, so a `Weak`
    /// taken against a previous occupant cannot silently upgrade into a
    /// handle on an unrelated, later object stored in the same slot.
    generation: Cell<u32>,
    /// Position of this node within its owning slab's `nodes` array. Used
    /// to recover the slab pointer via `node_ptr.sub(index)`.
    index: u32,
    next_free: Cell<i32>,
}

impl<T> Node<T> {
    fn is_live(&self) -> bool {
        self.strong.get() > 0
    }
}

struct Slab<T> {
    nodes: Box<[Node<T>]>,
    free_count: Cell<usize>,
}

impl<T> Slab<T> {
    fn new(capacity: usize) -> Self {
        let mut nodes = Vec::with_capacity(capacity);
        for i in 0..capacity {
            nodes.push(Node {
                value: UnsafeCell::new(MaybeUninit::uninit()),
                strong: Cell::new(0),
                weak: Cell::new(0),
                generation: Cell::new(0),
                index: i as u32,
                next_free: Cell::new(if i + 1 < capacity { (i + 1) as i32 } else { -1 }),
            });
        }
        Slab {
            nodes: nodes.into_boxed_slice(),
            free_count: Cell::new(capacity),
        }
    }

    fn base_ptr(&self) -> *const Node<T> {
        self.nodes.as_ptr()
    }

    fn contains(&self, node: *const Node<T>) -> bool {
        let start = self.nodes.as_ptr();
        // SAFETY: pure pointer comparison within/just past the slice.
        let end = unsafe { start.add(self.nodes.len()) };
        node >= start && node < end
    }
}

/// Number of nodes per slab such that `nodes.len() * size_of::<Node<T>>()`
/// is close to (but does not exceed, once at least one node fits)
/// [`DEFAULT_SLAB_SIZE_BYTES`].
fn nodes_per_slab<T>() -> usize {
    let node_size = std::mem::size_of::<Node<T>>().max(1);
    (DEFAULT_SLAB_SIZE_BYTES / node_size).max(1)
}

struct Inner<T> {
    slabs: Vec<Box<Slab<T>>>,
    free_head: Option<(usize, usize)>,
    /// Number of fully-free slabs allowed to linger before being dropped.
    high_water_mark: usize,
    failed_allocation: bool,
}

impl<T> Inner<T> {
    fn new(high_water_mark: usize) -> Self {
        Inner {
            slabs: Vec::new(),
            free_head: None,
            high_water_mark,
            failed_allocation: false,
        }
    }

    fn push_free(&mut self, slab_idx: usize, node_idx: usize) {
        let prev_head = self.free_head;
        let slab = &self.slabs[slab_idx];
        slab.nodes[node_idx]
            .next_free
            .set(prev_head.map(|(s, n)| encode_link(s, n)).unwrap_or(-1));
        slab.free_count.set(slab.free_count.get() + 1);
        self.free_head = Some((slab_idx, node_idx));
    }

    fn pop_free(&mut self) -> Option<(usize, usize)> {
        let (slab_idx, node_idx) = self.free_head?;
        let slab = &self.slabs[slab_idx];
        let node = &slab.nodes[node_idx];
        self.free_head = decode_link(node.next_free.get());
        slab.free_count.set(slab.free_count.get() - 1);
        Some((slab_idx, node_idx))
    }

    fn grow(&mut self) -> bool {
        let capacity = nodes_per_slab::<T>();
        let slab = Box::new(Slab::new(capacity));
        let slab_idx = self.slabs.len();
        self.slabs.push(slab);
        for node_idx in (0..capacity).rev() {
            self.push_free(slab_idx, node_idx);
        }
        true
    }

    /// Finds the slab index owning `node_ptr` using pointer arithmetic on
    /// the node's recorded index, falling back to a scan over slab base
    /// pointers (there are typically only a handful of slabs live at once).
    fn slab_index_for(&self, node_ptr: *const Node<T>, index: u32) -> usize {
        let candidate_base = unsafe { node_ptr.sub(index as usize) };
        self.slabs
            .iter()
            .position(|s| s.base_ptr() == candidate_base)
            .expect("node must belong to one of this pool's slabs")
    }

    fn maybe_trim(&mut self) {
        let free_slabs = self
            .slabs
            .iter()
            .filter(|s| s.free_count.get() == s.nodes.len())
            .count();
        if free_slabs <= self.high_water_mark {
            return;
        }
        // Rebuild the free list, dropping exactly one fully-free slab and
        // excluding its nodes.
        if let Some(victim) = self
            .slabs
            .iter()
            .position(|s| s.free_count.get() == s.nodes.len())
        {
            let mut remaining: Vec<(usize, usize)> = Vec::new();
            let mut cursor = self.free_head;
            while let Some((s, n)) = cursor {
                let node = &self.slabs[s].nodes[n];
                cursor = decode_link(node.next_free.get());
                if s != victim {
                    remaining.push((s, n));
                }
            }
            self.slabs.remove(victim);
            // Slab indices above `victim` have shifted down by one.
            let fix = |idx: usize| if idx > victim { idx - 1 } else { idx };
            self.free_head = None;
            for (s, n) in remaining.into_iter().rev() {
                self.push_free(fix(s), n);
            }
        }
    }
}

fn encode_link(slab_idx: usize, node_idx: usize) -> i32 {
    debug_assert!(slab_idx < (1 << 16) && node_idx < (1 << 16));
    ((slab_idx as i32) << 16) | (node_idx as i32 & 0xFFFF)
}

fn decode_link(v: i32) -> Option<(usize, usize)> {
    if v < 0 {
        None
    } else {
        Some(((v >> 16) as usize, (v & 0xFFFF) as usize))
    }
}

/// Process-wide hook invoked when an `ObjectPool` fails to grow because the
/// underlying heap allocation failed. Mirrors the original "memory
/// paranoia" callback; the default implementation just logs.
pub trait AllocationFailedHook: Send + Sync {
    fn on_allocation_failed(&self, pool_name: &str);
}

struct DefaultHook;
impl AllocationFailedHook for DefaultHook {
    fn on_allocation_failed(&self, pool_name: &str) {
        tracing::error!(pool = pool_name, "object pool allocation failed");
    }
}

trait Flushable: Send + Sync {
    fn flush_cached_objects(&self);
    fn name(&self) -> &str;
}

static REGISTRY: OnceLock<std::sync::Mutex<Vec<StdWeak<dyn Flushable>>>> = OnceLock::new();

fn registry() -> &'static std::sync::Mutex<Vec<StdWeak<dyn Flushable>>> {
    REGISTRY.get_or_init(|| std::sync::Mutex::new(Vec::new()))
}

/// Invokes `flush_cached_objects` on every live, registered pool. Intended
/// to be called once at process shutdown.
pub fn global_flush_all_cached_objects() {
    let reg = registry().lock().unwrap();
    for weak in reg.iter() {
        if let Some(pool) = weak.upgrade() {
            pool.flush_cached_objects();
        }
    }
}

/// A pool of reusable, reference-counted `T` instances backed by slabs.
pub struct ObjectPool<T: 'static> {
    name: String,
    inner: ReentrantMutex<RefCell<Inner<T>>>,
    hook: Box<dyn AllocationFailedHook>,
}

impl<T: 'static> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool").field("name", &self.name).finish()
    }
}

impl<T: 'static> ObjectPool<T> {
    /// Creates a new pool. `high_water_mark` bounds how many fully-free
    /// slabs are allowed to linger before being released back to the heap.
    pub fn new(name: impl Into<String>, high_water_mark: usize) -> Arc<Self> {
        Self::with_hook(name, high_water_mark, Box::new(DefaultHook))
    }

    pub fn with_hook(
        name: impl Into<String>,
        high_water_mark: usize,
        hook: Box<dyn AllocationFailedHook>,
    ) -> Arc<Self> {
        let pool = Arc::new(ObjectPool {
            name: name.into(),
            inner: ReentrantMutex::new(RefCell::new(Inner::new(high_water_mark))),
            hook,
        });
        registry()
            .lock()
            .unwrap()
            .push(Arc::downgrade(&pool) as StdWeak<dyn Flushable>);
        pool
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of live (strong-referenced) objects currently obtained.
    pub fn live_count(&self) -> usize {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner
            .slabs
            .iter()
            .map(|s| s.nodes.iter().filter(|n| n.is_live()).count())
            .sum()
    }

    pub fn slab_count(&self) -> usize {
        self.inner.lock().borrow().slabs.len()
    }

    /// Obtains a node, default-constructing it, and wraps it in a strong
    /// `PoolRef`. Returns `None` if growing the pool failed (heap
    /// exhaustion); the allocation-failed hook is invoked in that case.
    pub fn obtain(self: &Arc<Self>) -> Option<PoolRef<T>>
    where
        T: Default,
    {
        self.obtain_with(T::default)
    }

    pub fn obtain_with<F: FnOnce() -> T>(self: &Arc<Self>, make: F) -> Option<PoolRef<T>> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if inner.free_head.is_none() && !inner.grow() {
            inner.failed_allocation = true;
            drop(inner);
            drop(guard);
            self.hook.on_allocation_failed(&self.name);
            return None;
        }
        let (slab_idx, node_idx) = inner.pop_free().expect("just grew or had free nodes");
        let node = &inner.slabs[slab_idx].nodes[node_idx];
        unsafe {
            (*node.value.get()).write(make());
        }
        node.strong.set(1);
        node.generation.set(node.generation.get().wrapping_add(1));
        let ptr = NonNull::from(node);
        PoolRef::new(ptr, self.clone()).into()
    }

    /// Returns `true` and clears the flag if an allocation failed since the
    /// last call. Polled by the reactor's out-of-memory check (§4.8 step 6).
    pub fn take_failed_allocation_flag(&self) -> bool {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        let had = inner.failed_allocation;
        inner.failed_allocation = false;
        had
    }

    fn release(&self, node_ptr: NonNull<Node<T>>, index: u32) {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        let slab_idx = inner.slab_index_for(node_ptr.as_ptr(), index);
        let node_idx = index as usize;
        inner.push_free(slab_idx, node_idx);
        inner.maybe_trim();
    }
}

impl<T: 'static> Flushable for ObjectPool<T> {
    fn flush_cached_objects(&self) {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        // Drop every fully-free slab; slabs still holding live objects are
        // left alone since flushing must not invalidate live references.
        let victims: Vec<usize> = inner
            .slabs
            .iter()
            .enumerate()
            .filter(|(_, s)| s.free_count.get() == s.nodes.len())
            .map(|(i, _)| i)
            .collect();
        for idx in victims.into_iter().rev() {
            // Remove any free-list entries pointing into this slab first.
            let mut remaining = Vec::new();
            let mut cursor = inner.free_head;
            while let Some((s, n)) = cursor {
                let node = &inner.slabs[s].nodes[n];
                cursor = decode_link(node.next_free.get());
                if s != idx {
                    remaining.push((s, n));
                }
            }
            inner.slabs.remove(idx);
            let fix = |i: usize| if i > idx { i - 1 } else { i };
            inner.free_head = None;
            for (s, n) in remaining.into_iter().rev() {
                inner.push_free(fix(s), n);
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A strong, pool-owning reference. Dropping the last strong reference runs
/// `T`'s destructor in place and returns the node to its slab's free list.
pub struct PoolRef<T: 'static> {
    node: NonNull<Node<T>>,
    pool: Arc<ObjectPool<T>>,
}

// SAFETY: PoolRef is only ever used from the single reactor thread in this
// crate's intended usage (§5: the object pools are guarded by a single
// recursive mutex, compiled out in single-thread mode); we still guard
// cross-thread handoff with the pool's ReentrantMutex on every access.
unsafe impl<T: Send> Send for PoolRef<T> {}

impl<T: 'static> PoolRef<T> {
    fn new(node: NonNull<Node<T>>, pool: Arc<ObjectPool<T>>) -> Self {
        PoolRef { node, pool }
    }

    pub fn get(&self) -> &T {
        unsafe { (*self.node.as_ref().value.get()).assume_init_ref() }
    }

    pub fn get_mut(&mut self) -> &mut T {
        unsafe { (*self.node.as_ref().value.get()).assume_init_mut() }
    }

    pub fn downgrade(&self) -> PoolWeak<T> {
        let node = unsafe { self.node.as_ref() };
        node.weak.set(node.weak.get() + 1);
        PoolWeak {
            node: self.node,
            generation: node.generation.get(),
            pool: self.pool.clone(),
        }
    }

    pub fn strong_count(&self) -> usize {
        unsafe { self.node.as_ref().strong.get() }
    }
}

impl<T: 'static> std::ops::Deref for PoolRef<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.get()
    }
}

impl<T: 'static> std::ops::DerefMut for PoolRef<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.get_mut()
    }
}

impl<T: 'static> Clone for PoolRef<T> {
    fn clone(&self) -> Self {
        let node = unsafe { self.node.as_ref() };
        node.strong.set(node.strong.get() + 1);
        PoolRef {
            node: self.node,
            pool: self.pool.clone(),
        }
    }
}

impl<T: 'static> Drop for PoolRef<T> {
    fn drop(&mut self) {
        let node = unsafe { self.node.as_ref() };
        let remaining = node.strong.get() - 1;
        node.strong.set(remaining);
        if remaining == 0 {
            unsafe {
                (*node.value.get()).assume_init_drop();
            }
            let index = node.index;
            self.pool.release(self.node, index);
        }
    }
}

/// A weak, non-owning reference. Upgrades to a [`PoolRef`] only while the
/// strong count is non-zero *and* the node has not since been recycled and
/// handed out to a different logical object (tracked via a per-node
/// generation counter).
pub struct PoolWeak<T: 'static> {
    node: NonNull<Node<T>>,
    generation: u32,
    pool: Arc<ObjectPool<T>>,
}

unsafe impl<T: Send> Send for PoolWeak<T> {}

impl<T: 'static> PoolWeak<T> {
    pub fn upgrade(&self) -> Option<PoolRef<T>> {
        let _guard = self.pool.inner.lock();
        let node = unsafe { self.node.as_ref() };
        if node.generation.get() != self.generation || node.strong.get() == 0 {
            return None;
        }
        node.strong.set(node.strong.get() + 1);
        Some(PoolRef {
            node: self.node,
            pool: self.pool.clone(),
        })
    }
}

impl<T: 'static> Clone for PoolWeak<T> {
    fn clone(&self) -> Self {
        let node = unsafe { self.node.as_ref() };
        node.weak.set(node.weak.get() + 1);
        PoolWeak {
            node: self.node,
            generation: self.generation,
            pool: self.pool.clone(),
        }
    }
}

impl<T: 'static> Drop for PoolWeak<T> {
    fn drop(&mut self) {
        let node = unsafe { self.node.as_ref() };
        node.weak.set(node.weak.get() - 1);
        // Control-block storage lives inside the slab for the pool's
        // lifetime in this implementation; nothing further to free here.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obtain_and_release_preserve_identity() {
        let pool = ObjectPool::<i64>::new("test-i64", 0);
        let a = pool.obtain_with(|| 10).unwrap();
        let ptr_a = a.node.as_ptr();
        drop(a);
        let b = pool.obtain_with(|| 20).unwrap();
        // The freed node is very likely reused (LIFO free list, single slab).
        assert_eq!(b.node.as_ptr(), ptr_a);
        assert_eq!(*b, 20);
    }

    #[test]
    fn churn_ten_thousand_objects() {
        let pool = ObjectPool::<u64>::new("churn", 0);
        let mut refs = Vec::with_capacity(10_000);
        for i in 0..10_000u64 {
            refs.push(pool.obtain_with(move || i).unwrap());
        }
        for (i, r) in refs.iter().enumerate() {
            assert_eq!(**r, i as u64);
        }
        while let Some(r) = refs.pop() {
            drop(r);
        }
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn weak_upgrade_fails_after_recycle_generation_changes() {
        let pool = ObjectPool::<String>::new("weak-test", 0);
        let strong = pool.obtain_with(|| "first".to_string()).unwrap();
        let weak = strong.downgrade();
        drop(strong);
        // Node is recycled for a new logical object; the old weak must not
        // resurrect a handle onto it.
        let _new_owner = pool.obtain_with(|| "second".to_string()).unwrap();
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn weak_upgrades_while_strong_alive() {
        let pool = ObjectPool::<i32>::new("weak-alive", 0);
        let strong = pool.obtain_with(|| 7).unwrap();
        let weak = strong.downgrade();
        let upgraded = weak.upgrade().expect("strong ref still alive");
        assert_eq!(*upgraded, 7);
    }

    #[test]
    fn no_two_live_refs_alias_same_storage() {
        let pool = ObjectPool::<u8>::new("alias-check", 0);
        let mut live_ptrs = std::collections::HashSet::new();
        let mut held = Vec::new();
        for i in 0..500u8 {
            let r = pool.obtain_with(move || i).unwrap();
            assert!(live_ptrs.insert(r.node.as_ptr() as usize));
            held.push(r);
        }
    }
}
