//! Lock-striped flat hash map with per-bucket optimistic snapshots.
//!
//! Buckets hold seven inline slots plus an overflow pointer. A single 64-bit
//! meta word per bucket carries one tag byte per slot (non-zero = occupied,
//! low 7 bits = hash fingerprint) and, in its top byte, the root-bucket
//! operation lock. A per-bucket sequence word lets readers validate an
//! unlocked snapshot: writers make it odd for the duration of each slot
//! mutation, readers retry when the word changed underneath them.
//!
//! Growth is cooperative: the writer that trips the trigger allocates a
//! doubled table and every writer arriving mid-resize copies a chunk of the
//! old buckets before retrying against the published table.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::cell::UnsafeCell;
use std::hash::{BuildHasher, Hash, Hasher};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

use ahash::RandomState;
use tracing::{debug, trace};

/// Number of inline slots per bucket. The seven low tag bytes of the meta
/// word map one-to-one onto these slots; the top byte is reserved for the
/// root lock.
pub const SLOTS_PER_BUCKET: usize = 7;

/// Minimum bucket-array length of any table.
pub(crate) const MIN_TABLE_LEN: usize = 32;

/// Occupancy marker within each tag byte.
const TAG_OCCUPIED: u8 = 0x80;

/// Every slot's occupancy bit, in meta-word position.
const META_OCCUPIED: u64 = 0x0080_8080_8080_8080;

/// Tag byte of a vacant slot.
const TAG_EMPTY: u8 = 0;

/// Root-bucket operation lock, stored in the top meta byte.
const ROOT_LOCK: u64 = 0x8000_0000_0000_0000;

/// Grow once live entries exceed this fraction of total slot capacity.
const LOAD_FACTOR: f64 = 0.75;

/// Smallest amount of copy work handed to one resize helper.
const MIN_BUCKETS_PER_CHUNK: usize = 64;

/// Spins before a contended party yields the CPU.
const SPIN_LIMIT: i32 = 128;

/// Outcome of a [`StripedMap::compute`] or [`StripedMap::range_compute`]
/// closure.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Op {
    /// Leave the entry untouched.
    Cancel,
    /// Replace (or insert) the entry with the returned value.
    Update,
    /// Remove the entry if present.
    Delete,
}

/// One `{hash, key, value}` triple. `hash == 0` marks a vacant slot; live
/// hashes are forced non-zero before they are stored.
struct Slot<K, V> {
    hash: u64,
    key: MaybeUninit<K>,
    val: MaybeUninit<V>,
}

impl<K, V> Slot<K, V> {
    const fn vacant() -> Self {
        Self {
            hash: 0,
            key: MaybeUninit::uninit(),
            val: MaybeUninit::uninit(),
        }
    }

    #[inline(always)]
    fn fill(&mut self, hash: u64, key: K, value: V) {
        self.hash = hash;
        self.key.write(key);
        self.val.write(value);
    }

    /// Borrow the key. Caller must hold the bucket lock and have checked
    /// occupancy through the meta word.
    #[inline(always)]
    fn key_ref(&self) -> &K {
        unsafe { self.key.assume_init_ref() }
    }

    #[inline(always)]
    fn value_ref(&self) -> &V {
        unsafe { self.val.assume_init_ref() }
    }

    /// Drop the old value in place and store a new one. Lock holder only.
    #[inline(always)]
    fn replace_value(&mut self, value: V) {
        unsafe { self.val.assume_init_drop() };
        self.val.write(value);
    }

    /// Move the value out and release the key, leaving the slot vacant.
    /// The slot must already be unpublished from the meta word.
    #[inline(always)]
    fn vacate(&mut self) -> V {
        self.hash = 0;
        unsafe {
            self.key.assume_init_drop();
            self.val.assume_init_read()
        }
    }

    /// Drop both fields in place, leaving the slot vacant.
    #[inline(always)]
    fn clear(&mut self) {
        self.hash = 0;
        unsafe {
            self.key.assume_init_drop();
            self.val.assume_init_drop();
        }
    }

    /// Clone the pair without holding the lock. The bytes may be torn by a
    /// concurrent writer; the caller must discard the result unless the
    /// bucket sequence word is unchanged across the copy.
    #[inline(always)]
    unsafe fn speculative_pair(&self) -> (K, V)
    where
        K: Clone,
        V: Clone,
    {
        (
            self.key.assume_init_ref().clone(),
            self.val.assume_init_ref().clone(),
        )
    }
}

/// A bucket: sequence word, meta word, overflow pointer, seven slots.
/// Cache-line aligned; never moved while its table is reachable.
#[repr(align(64))]
struct Bucket<K, V> {
    seq: AtomicU64,
    meta: AtomicU64,
    next: AtomicPtr<Bucket<K, V>>,
    slots: UnsafeCell<[Slot<K, V>; SLOTS_PER_BUCKET]>,
}

unsafe impl<K: Send, V: Send> Send for Bucket<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Bucket<K, V> {}

impl<K, V> Bucket<K, V> {
    fn empty() -> Self {
        Self {
            seq: AtomicU64::new(0),
            meta: AtomicU64::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
            slots: UnsafeCell::new([
                Slot::vacant(),
                Slot::vacant(),
                Slot::vacant(),
                Slot::vacant(),
                Slot::vacant(),
                Slot::vacant(),
                Slot::vacant(),
            ]),
        }
    }

    /// A fresh overflow bucket holding a single entry in slot 0.
    fn seeded(hash: u64, tag: u8, key: K, value: V) -> Self {
        let b = Self::empty();
        unsafe { (*b.slots.get())[0].fill(hash, key, value) };
        b.meta.store(with_tag_byte(0, tag, 0), Ordering::Relaxed);
        b
    }

    /// Acquire the root operation lock, spinning with backoff.
    fn lock(&self) -> BucketGuard<'_, K, V> {
        let mut spins = 0;
        loop {
            let meta = self.meta.load(Ordering::Relaxed);
            if meta & ROOT_LOCK == 0 {
                if self
                    .meta
                    .compare_exchange_weak(
                        meta,
                        meta | ROOT_LOCK,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return BucketGuard { root: self };
                }
                continue;
            }
            backoff(&mut spins);
        }
    }

    #[inline(always)]
    fn slots(&self) -> &[Slot<K, V>; SLOTS_PER_BUCKET] {
        unsafe { &*self.slots.get() }
    }

    /// Mutable slot access for the lock holder.
    #[allow(clippy::mut_from_ref)]
    #[inline(always)]
    fn slots_mut(&self) -> &mut [Slot<K, V>; SLOTS_PER_BUCKET] {
        unsafe { &mut *self.slots.get() }
    }

    #[inline(always)]
    fn next_acquire(&self) -> Option<&Bucket<K, V>> {
        let p = self.next.load(Ordering::Acquire);
        if p.is_null() {
            None
        } else {
            Some(unsafe { &*p })
        }
    }

    #[inline(always)]
    fn next_relaxed(&self) -> Option<&Bucket<K, V>> {
        let p = self.next.load(Ordering::Relaxed);
        if p.is_null() {
            None
        } else {
            Some(unsafe { &*p })
        }
    }

    /// Begin a slot mutation: make the sequence word odd. Lock holder only.
    #[inline(always)]
    fn write_begin(&self) -> u64 {
        let s = self.seq.load(Ordering::Relaxed);
        self.seq.store(s + 1, Ordering::Relaxed);
        s
    }

    /// Publish a slot mutation: make the sequence word even again.
    #[inline(always)]
    fn write_end(&self, s: u64) {
        self.seq.store(s + 2, Ordering::Release);
    }
}

impl<K, V> Drop for Bucket<K, V> {
    fn drop(&mut self) {
        let meta = *self.meta.get_mut();
        let slots = self.slots.get_mut();
        let mut occupied = meta & META_OCCUPIED;
        while occupied != 0 {
            slots[first_match_index(occupied)].clear();
            occupied &= occupied - 1;
        }
        let next = *self.next.get_mut();
        if !next.is_null() {
            drop(unsafe { Box::from_raw(next) });
        }
    }
}

/// RAII holder of a root-bucket lock. Releasing on drop keeps the bucket
/// usable even when a user closure panics under the lock.
struct BucketGuard<'a, K, V> {
    root: &'a Bucket<K, V>,
}

impl<K, V> Drop for BucketGuard<'_, K, V> {
    fn drop(&mut self) {
        let meta = self.root.meta.load(Ordering::Relaxed);
        self.root.meta.store(meta & !ROOT_LOCK, Ordering::Release);
    }
}

/// One cache-line-padded stripe of the size counter.
#[repr(align(64))]
struct CounterStripe(AtomicUsize);

/// Bucket array plus striped counters, published through a table-level
/// sequence word (even = stable). Snapshots are shallow copies sharing the
/// raw storage; the map frees storage exactly once, on drop.
struct Table<K, V> {
    buckets: UnsafeCell<*mut Bucket<K, V>>,
    mask: UnsafeCell<usize>,
    stripes: UnsafeCell<*mut CounterStripe>,
    stripe_mask: UnsafeCell<u32>,
    seq: AtomicU32,
}

unsafe impl<K: Send, V: Send> Send for Table<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Table<K, V> {}

impl<K, V> Table<K, V> {
    /// Allocate and zero-initialize a table of `len` buckets.
    fn allocate(len: usize) -> Self {
        let bucket_layout = Layout::array::<Bucket<K, V>>(len).unwrap();
        let buckets = unsafe { alloc(bucket_layout) as *mut Bucket<K, V> };
        if buckets.is_null() {
            handle_alloc_error(bucket_layout);
        }
        for i in 0..len {
            unsafe { ptr::write(buckets.add(i), Bucket::empty()) };
        }

        let stripe_len = stripe_count_for(len);
        let stripe_layout = Layout::array::<CounterStripe>(stripe_len).unwrap();
        let stripes = unsafe { alloc(stripe_layout) as *mut CounterStripe };
        if stripes.is_null() {
            handle_alloc_error(stripe_layout);
        }
        for i in 0..stripe_len {
            unsafe { ptr::write(stripes.add(i), CounterStripe(AtomicUsize::new(0))) };
        }

        Self {
            buckets: UnsafeCell::new(buckets),
            mask: UnsafeCell::new(len - 1),
            stripes: UnsafeCell::new(stripes),
            stripe_mask: UnsafeCell::new(stripe_len as u32 - 1),
            seq: AtomicU32::new(2),
        }
    }

    #[inline(always)]
    fn buckets_ptr(&self) -> *mut Bucket<K, V> {
        unsafe { *self.buckets.get() }
    }

    #[inline(always)]
    fn mask(&self) -> usize {
        unsafe { *self.mask.get() }
    }

    #[inline(always)]
    fn stripes_ptr(&self) -> *mut CounterStripe {
        unsafe { *self.stripes.get() }
    }

    #[inline(always)]
    fn stripe_mask(&self) -> u32 {
        unsafe { *self.stripe_mask.get() }
    }

    #[inline(always)]
    fn bucket(&self, index: usize) -> &Bucket<K, V> {
        unsafe { &*self.buckets_ptr().add(index) }
    }

    #[inline(always)]
    fn stripe(&self, index: usize) -> &AtomicUsize {
        unsafe { &(*self.stripes_ptr().add(index)).0 }
    }

    /// The sequence value this snapshot was taken at.
    #[inline(always)]
    fn generation(&self) -> u32 {
        self.seq.load(Ordering::Relaxed)
    }

    /// Validated read of the table fields: retries until the sequence word
    /// is even and unchanged across the copy.
    #[inline(always)]
    fn snapshot(&self) -> Table<K, V> {
        loop {
            let s1 = self.seq.load(Ordering::Acquire);
            if s1 & 1 == 0 {
                let copy = Table {
                    buckets: UnsafeCell::new(self.buckets_ptr()),
                    mask: UnsafeCell::new(self.mask()),
                    stripes: UnsafeCell::new(self.stripes_ptr()),
                    stripe_mask: UnsafeCell::new(self.stripe_mask()),
                    seq: AtomicU32::new(s1),
                };
                if self.seq.load(Ordering::Acquire) == s1 {
                    return copy;
                }
            }
            std::hint::spin_loop();
        }
    }

    /// Swap the table fields for `next`'s. Only the resize finisher calls
    /// this, so the odd window never overlaps another publish.
    fn publish(&self, next: &Table<K, V>) {
        let s = self.seq.load(Ordering::Relaxed);
        self.seq.store(s + 1, Ordering::Relaxed);
        unsafe {
            *self.buckets.get() = next.buckets_ptr();
            *self.mask.get() = next.mask();
            *self.stripes.get() = next.stripes_ptr();
            *self.stripe_mask.get() = next.stripe_mask();
        }
        self.seq.store(s + 2, Ordering::Release);
    }

    #[inline(always)]
    fn add_len(&self, bucket_index: usize, delta: isize) {
        let stripe = self.stripe(bucket_index & self.stripe_mask() as usize);
        if delta >= 0 {
            stripe.fetch_add(delta as usize, Ordering::Relaxed);
        } else {
            stripe.fetch_sub(delta.unsigned_abs(), Ordering::Relaxed);
        }
    }

    /// Sum of all stripes. Individual stripes may have wrapped below zero
    /// when an insert and its delete landed on different stripes; wrapping
    /// addition cancels that out.
    fn len_sum(&self) -> usize {
        let mut sum = 0usize;
        for i in 0..=self.stripe_mask() as usize {
            sum = sum.wrapping_add(self.stripe(i).load(Ordering::Relaxed));
        }
        sum
    }

    fn len_exceeds(&self, limit: usize) -> bool {
        let mut sum = 0usize;
        for i in 0..=self.stripe_mask() as usize {
            sum = sum.wrapping_add(self.stripe(i).load(Ordering::Relaxed));
            if sum > limit {
                return true;
            }
        }
        false
    }

    /// Move one entry into this not-yet-published table during a grow.
    /// Doubling maps every old bucket onto a disjoint pair of new buckets,
    /// so chunked copiers never contend on a destination bucket and no
    /// destination locking is needed.
    fn receive_copied(&self, hash: u64, tag: u8, key: K, value: V) {
        let mut b = self.bucket(bucket_index(hash, self.mask()));
        loop {
            let meta = b.meta.load(Ordering::Relaxed);
            let vacant = !meta & META_OCCUPIED;
            if vacant != 0 {
                let i = first_match_index(vacant);
                b.slots_mut()[i].fill(hash, key, value);
                b.meta.store(with_tag_byte(meta, tag, i), Ordering::Relaxed);
                return;
            }
            match b.next_relaxed() {
                Some(next) => b = next,
                None => {
                    let overflow = Box::into_raw(Box::new(Bucket::seeded(hash, tag, key, value)));
                    b.next.store(overflow, Ordering::Relaxed);
                    return;
                }
            }
        }
    }

    /// Free bucket and stripe storage. Caller guarantees no snapshot of
    /// this table is still in use.
    unsafe fn destroy(&mut self) {
        let len = self.mask() + 1;
        let buckets = self.buckets_ptr();
        for i in 0..len {
            ptr::drop_in_place(buckets.add(i));
        }
        dealloc(
            buckets as *mut u8,
            Layout::array::<Bucket<K, V>>(len).unwrap(),
        );
        dealloc(
            self.stripes_ptr() as *mut u8,
            Layout::array::<CounterStripe>(self.stripe_mask() as usize + 1).unwrap(),
        );
    }
}

/// Progress of an in-flight grow. `active` is the IDLE -> IN_PROGRESS CAS;
/// `chunks` doubles as the publication barrier for `next_table`.
struct ResizeState<K, V> {
    active: AtomicBool,
    next_table: UnsafeCell<Option<Table<K, V>>>,
    chunks: AtomicI32,
    next_chunk: AtomicI32,
    done_chunks: AtomicI32,
}

unsafe impl<K: Send, V: Send> Send for ResizeState<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for ResizeState<K, V> {}

impl<K, V> ResizeState<K, V> {
    fn idle() -> Self {
        Self {
            active: AtomicBool::new(false),
            next_table: UnsafeCell::new(None),
            chunks: AtomicI32::new(0),
            next_chunk: AtomicI32::new(0),
            done_chunks: AtomicI32::new(0),
        }
    }

    /// True once the new table is allocated and visible. The finisher
    /// stores `next_table` before releasing `chunks`, so an acquire load of
    /// `chunks` also makes the table contents visible.
    #[inline(always)]
    fn table_ready(&self) -> bool {
        if self.chunks.load(Ordering::Acquire) == 0 {
            return false;
        }
        match unsafe { &*self.next_table.get() } {
            Some(t) => t.seq.load(Ordering::Acquire) == 2,
            None => false,
        }
    }
}

/// Concurrent flat hash map: open addressing inside seven-slot buckets,
/// per-bucket optimistic reads, root-bucket locks for writers, cooperative
/// chunked growth.
///
/// Reads clone values out of the map, so `V: Clone` (an `Arc` for anything
/// expensive). Closures passed to [`compute`](Self::compute) and
/// [`range_compute`](Self::range_compute) run **under the bucket lock**;
/// they must not block and must not touch this map.
pub struct StripedMap<K, V, S = RandomState> {
    table: Table<K, V>,
    retired: Mutex<Vec<Table<K, V>>>,
    resize: ResizeState<K, V>,
    hasher: S,
}

unsafe impl<K: Send, V: Send, S: Send> Send for StripedMap<K, V, S> {}
unsafe impl<K: Send + Sync, V: Send + Sync, S: Sync> Sync for StripedMap<K, V, S> {}

impl<K: Hash + Eq + Clone, V: Clone> StripedMap<K, V, RandomState> {
    /// An empty map with the default (seeded) hasher.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// An empty map pre-sized for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, RandomState::new())
    }
}

impl<K: Hash + Eq + Clone, V: Clone, S: BuildHasher + Default> Default for StripedMap<K, V, S> {
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K: Hash + Eq + Clone, V: Clone, S: BuildHasher + Default> FromIterator<(K, V)>
    for StripedMap<K, V, S>
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let map = Self::with_hasher(S::default());
        for (k, v) in iter {
            map.store(k, v);
        }
        map
    }
}

impl<K: Hash + Eq + Clone, V: Clone, S: BuildHasher> StripedMap<K, V, S> {
    /// An empty map using `hasher` for key placement. The hasher cannot be
    /// changed later; it determines every entry's bucket.
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_capacity_and_hasher(0, hasher)
    }

    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Self {
        Self {
            table: Table::allocate(table_len_for(capacity)),
            retired: Mutex::new(Vec::new()),
            resize: ResizeState::idle(),
            hasher,
        }
    }

    #[inline(always)]
    fn hash_pair(&self, key: &K) -> (u64, u8) {
        let mut h = self.hasher.build_hasher();
        key.hash(&mut h);
        // 0 marks a vacant slot, so live hashes are pinned away from it.
        let hash = h.finish().max(1);
        (hash, (hash as u8) | TAG_OCCUPIED)
    }

    /// Lock-free lookup. Returns a clone of the value observed at some
    /// instant between call and return; never a torn one.
    pub fn load(&self, key: &K) -> Option<V> {
        let table = self.table.snapshot();
        let (hash, tag) = self.hash_pair(key);
        let root = table.bucket(bucket_index(hash, table.mask()));
        let tag_word = broadcast(tag);

        let mut bucket = Some(root);
        while let Some(b) = bucket {
            let mut spins = 0;
            'snapshot: loop {
                let s1 = b.seq.load(Ordering::Acquire);
                if s1 & 1 != 0 {
                    // Writer mid-mutation; spin briefly, then take the lock.
                    if spin_briefly(&mut spins) {
                        continue 'snapshot;
                    }
                    return self.load_locked(root, key, hash, tag_word);
                }
                let meta = b.meta.load(Ordering::Relaxed);
                let mut candidates = match_tag_bytes(meta, tag_word);
                while candidates != 0 {
                    let slot = &b.slots()[first_match_index(candidates)];
                    candidates &= candidates - 1;
                    if slot.hash != hash {
                        continue;
                    }
                    let (k, v) = unsafe { slot.speculative_pair() };
                    if b.seq.load(Ordering::Acquire) != s1 {
                        continue 'snapshot;
                    }
                    // Sequence unchanged: the copy is a valid point-in-time
                    // view and safe to inspect.
                    if k == *key {
                        return Some(v);
                    }
                }
                break 'snapshot;
            }
            bucket = b.next_acquire();
        }
        None
    }

    /// Fallback for readers that lost the optimistic race too many times.
    fn load_locked(&self, root: &Bucket<K, V>, key: &K, hash: u64, tag_word: u64) -> Option<V> {
        let _guard = root.lock();
        let mut bucket = Some(root);
        while let Some(b) = bucket {
            let meta = b.meta.load(Ordering::Relaxed);
            let mut candidates = match_tag_bytes(meta, tag_word);
            while candidates != 0 {
                let slot = &b.slots()[first_match_index(candidates)];
                candidates &= candidates - 1;
                if slot.hash == hash && slot.key_ref() == key {
                    return Some(slot.value_ref().clone());
                }
            }
            bucket = b.next_relaxed();
        }
        None
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.load(key).is_some()
    }

    /// Insert or replace.
    pub fn store(&self, key: K, value: V) {
        self.load_and_store(key, value);
    }

    /// Insert or replace, returning the previous value if any.
    pub fn load_and_store(&self, key: K, value: V) -> Option<V> {
        self.compute(key, |_| (Op::Update, Some(value.clone()))).0
    }

    /// Return the existing value (`loaded = true`) or insert `value`
    /// (`loaded = false`), as one atomic step.
    pub fn load_or_store(&self, key: K, value: V) -> (V, bool) {
        if let Some(existing) = self.load(&key) {
            return (existing, true);
        }
        let (prev, _) = self.compute(key, |old| match old {
            Some(_) => (Op::Cancel, None),
            None => (Op::Update, Some(value.clone())),
        });
        match prev {
            Some(p) => (p, true),
            None => (value, false),
        }
    }

    /// Remove the entry, returning its value if it was present.
    pub fn load_and_delete(&self, key: &K) -> Option<V> {
        self.compute(key.clone(), |_| (Op::Delete, None)).0
    }

    /// Atomic read-modify-write of a single key.
    ///
    /// `f` receives the current value (or `None`) and decides the outcome;
    /// it is invoked exactly once, **under the root bucket lock**. Returns
    /// `(previous, current)`: `Cancel` yields the unchanged value in both
    /// positions, `Update` the old and the new, `Delete` the removed value
    /// and `None`. An `Update` without a value is treated as `Cancel`.
    pub fn compute<F>(&self, key: K, mut f: F) -> (Option<V>, Option<V>)
    where
        F: FnMut(Option<&V>) -> (Op, Option<V>),
    {
        let (hash, tag) = self.hash_pair(&key);
        let tag_word = broadcast(tag);
        loop {
            let table = self.table.snapshot();
            let idx = bucket_index(hash, table.mask());
            let root = table.bucket(idx);
            let guard = root.lock();

            // A published-but-unfinished grow means this bucket may already
            // be copied; help finish, then retry on the new table.
            if self.resize.active.load(Ordering::Acquire) && self.resize.table_ready() {
                drop(guard);
                self.help_copy_and_wait();
                continue;
            }
            // Table swapped between snapshot and lock.
            if table.generation() != self.table.seq.load(Ordering::Relaxed) {
                continue;
            }

            // Walk the chain: find the key, remember the first free slot
            // and the tail for a possible insert.
            let mut found: Option<(&Bucket<K, V>, usize)> = None;
            let mut free: Option<(&Bucket<K, V>, usize)> = None;
            let mut chain_len = 1usize;
            let mut tail = root;
            let mut b = root;
            'walk: loop {
                let meta = b.meta.load(Ordering::Relaxed);
                let mut candidates = match_tag_bytes(meta, tag_word);
                while candidates != 0 {
                    let i = first_match_index(candidates);
                    candidates &= candidates - 1;
                    let slot = &b.slots()[i];
                    if slot.hash == hash && slot.key_ref() == &key {
                        found = Some((b, i));
                        break 'walk;
                    }
                }
                if free.is_none() {
                    let vacant = !meta & META_OCCUPIED;
                    if vacant != 0 {
                        free = Some((b, first_match_index(vacant)));
                    }
                }
                match b.next_relaxed() {
                    Some(next) => {
                        chain_len += 1;
                        tail = next;
                        b = next;
                    }
                    None => break 'walk,
                }
            }

            return if let Some((bucket, i)) = found {
                let slot = &mut bucket.slots_mut()[i];
                let (op, new_val) = f(Some(slot.value_ref()));
                match (op, new_val) {
                    (Op::Update, Some(new_v)) => {
                        let prev = slot.value_ref().clone();
                        let s = bucket.write_begin();
                        slot.replace_value(new_v.clone());
                        bucket.write_end(s);
                        drop(guard);
                        (Some(prev), Some(new_v))
                    }
                    (Op::Delete, _) => {
                        // Unpublish the slot first so no new reader finds
                        // it, then reclaim the fields.
                        let meta = bucket.meta.load(Ordering::Relaxed);
                        let s = bucket.write_begin();
                        bucket
                            .meta
                            .store(with_tag_byte(meta, TAG_EMPTY, i), Ordering::Relaxed);
                        bucket.write_end(s);
                        let prev = slot.vacate();
                        drop(guard);
                        table.add_len(idx, -1);
                        (Some(prev), None)
                    }
                    // Cancel, or an Update carrying no value.
                    _ => {
                        let current = slot.value_ref().clone();
                        drop(guard);
                        (Some(current.clone()), Some(current))
                    }
                }
            } else {
                let (op, new_val) = f(None);
                match (op, new_val) {
                    (Op::Update, Some(new_v)) => {
                        if let Some((bucket, i)) = free {
                            // Fill the slot before publishing its tag so
                            // the odd window stays short.
                            bucket.slots_mut()[i].fill(hash, key, new_v.clone());
                            let meta = bucket.meta.load(Ordering::Relaxed);
                            let s = bucket.write_begin();
                            bucket
                                .meta
                                .store(with_tag_byte(meta, tag, i), Ordering::Relaxed);
                            bucket.write_end(s);
                            drop(guard);
                            table.add_len(idx, 1);
                            self.maybe_grow(&table, chain_len);
                        } else {
                            let overflow =
                                Box::into_raw(Box::new(Bucket::seeded(hash, tag, key, new_v.clone())));
                            tail.next.store(overflow, Ordering::Release);
                            drop(guard);
                            table.add_len(idx, 1);
                            self.maybe_grow(&table, chain_len + 1);
                        }
                        (None, Some(new_v))
                    }
                    _ => (None, None),
                }
            };
        }
    }

    /// Visit every entry, applying `f`'s verdict under each bucket's lock.
    /// Entries observed are those present at visit time; concurrent inserts
    /// into already-visited buckets are missed, like any live iteration.
    pub fn range_compute<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V) -> (Op, Option<V>),
    {
        'restart: loop {
            let table = self.table.snapshot();
            for idx in 0..=table.mask() {
                let root = table.bucket(idx);
                let guard = root.lock();

                if self.resize.active.load(Ordering::Acquire) && self.resize.table_ready() {
                    drop(guard);
                    self.help_copy_and_wait();
                    continue 'restart;
                }
                if table.generation() != self.table.seq.load(Ordering::Relaxed) {
                    continue 'restart;
                }

                let mut b = root;
                loop {
                    let slots = b.slots_mut();
                    let mut meta = b.meta.load(Ordering::Relaxed);
                    let mut occupied = meta & META_OCCUPIED;
                    while occupied != 0 {
                        let i = first_match_index(occupied);
                        occupied &= occupied - 1;
                        let slot = &mut slots[i];
                        let (op, new_val) = f(slot.key_ref(), slot.value_ref());
                        match (op, new_val) {
                            (Op::Update, Some(new_v)) => {
                                let s = b.write_begin();
                                slot.replace_value(new_v);
                                b.write_end(s);
                            }
                            (Op::Delete, _) => {
                                meta = with_tag_byte(meta, TAG_EMPTY, i);
                                let s = b.write_begin();
                                b.meta.store(meta, Ordering::Relaxed);
                                b.write_end(s);
                                slot.clear();
                                table.add_len(idx, -1);
                            }
                            _ => {}
                        }
                    }
                    match b.next_relaxed() {
                        Some(next) => b = next,
                        None => break,
                    }
                }
                drop(guard);
            }
            return;
        }
    }

    /// Visit entries with a read-only closure, stopping early when it
    /// returns `false`. Each bucket is snapshotted under its lock and the
    /// visitor runs after the lock is released, so mutating the map (even
    /// deleting the visited key) from inside `f` is fine.
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let table = self.table.snapshot();
        let mut pending: Vec<(K, V)> = Vec::new();
        for idx in 0..=table.mask() {
            let root = table.bucket(idx);
            {
                let _guard = root.lock();
                let mut b = Some(root);
                while let Some(cur) = b {
                    let slots = cur.slots();
                    let mut occupied = cur.meta.load(Ordering::Relaxed) & META_OCCUPIED;
                    while occupied != 0 {
                        let slot = &slots[first_match_index(occupied)];
                        occupied &= occupied - 1;
                        pending.push((slot.key_ref().clone(), slot.value_ref().clone()));
                    }
                    b = cur.next_relaxed();
                }
            }
            for (k, v) in pending.drain(..) {
                if !f(&k, &v) {
                    return;
                }
            }
        }
    }

    /// Iterate cloned `(key, value)` pairs, one bucket at a time.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            table: self.table.snapshot(),
            bucket_index: 0,
            pending: Vec::new(),
            _map: PhantomData,
        }
    }

    /// Iterate cloned keys.
    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.iter().map(|(k, _)| k)
    }

    /// Iterate cloned values.
    pub fn values(&self) -> impl Iterator<Item = V> + '_ {
        self.iter().map(|(_, v)| v)
    }

    /// Delete every entry.
    pub fn clear(&self) {
        self.range_compute(|_, _| (Op::Delete, None));
    }

    /// Entry count from the striped counters; exact only at quiescence.
    pub fn len(&self) -> usize {
        self.table.snapshot().len_sum()
    }

    pub fn is_empty(&self) -> bool {
        !self.table.snapshot().len_exceeds(0)
    }

    #[inline(always)]
    fn maybe_grow(&self, table: &Table<K, V>, chain_len: usize) {
        if self.resize.active.load(Ordering::Relaxed) {
            return;
        }
        // Either trigger starts the same grow: occupancy past the load
        // factor, or a probe chain past one overflow bucket.
        let capacity = (table.mask() + 1) * SLOTS_PER_BUCKET;
        if chain_len > 2 || table.len_exceeds((capacity as f64 * LOAD_FACTOR) as usize) {
            self.try_grow();
        }
    }

    fn try_grow(&self) {
        if self.resize.active.load(Ordering::Acquire) {
            return;
        }
        if self
            .resize
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Someone else won the CAS; they will drive the copy and every
            // writer that meets the published table helps.
            return;
        }

        unsafe { *self.resize.next_table.get() = None };
        self.resize.chunks.store(0, Ordering::Release);
        self.resize.next_chunk.store(0, Ordering::Release);
        self.resize.done_chunks.store(0, Ordering::Release);

        let old_len = self.table.snapshot().mask() + 1;
        let new_len = old_len * 2;
        let chunks = copy_chunks_for(old_len);
        trace!(old_len, new_len, chunks, "table grow started");

        let next = Table::allocate(new_len);
        // Store the table first; the release store of `chunks` publishes it.
        unsafe { *self.resize.next_table.get() = Some(next) };
        self.resize.chunks.store(chunks as i32, Ordering::Release);

        self.help_copy_and_wait();
    }

    /// Claim and copy chunks of the old table until none remain, then
    /// either finish the swap (last finisher) or wait for it.
    fn help_copy_and_wait(&self) {
        let state = &self.resize;
        if !state.active.load(Ordering::Acquire) {
            return;
        }
        let chunks = state.chunks.load(Ordering::Acquire);
        if chunks == 0 {
            return;
        }
        let next_table = match unsafe { &*state.next_table.get() } {
            Some(t) => t,
            None => return,
        };

        let old_table = self.table.snapshot();
        let old_len = old_table.mask() + 1;
        let chunk_sz = old_len.div_ceil(chunks as usize);

        loop {
            let chunk = state.next_chunk.fetch_add(1, Ordering::Relaxed);
            if chunk >= chunks {
                while state.active.load(Ordering::Acquire) {
                    thread::yield_now();
                }
                return;
            }

            let start = chunk as usize * chunk_sz;
            let end = (start + chunk_sz).min(old_len);
            let mut moved = 0usize;
            for i in start..end {
                moved += self.copy_bucket(old_table.bucket(i), next_table);
            }
            if moved > 0 {
                next_table.add_len(start, moved as isize);
            }

            if state.done_chunks.fetch_add(1, Ordering::AcqRel) + 1 == chunks {
                // Last chunk: park the old storage, publish the new table,
                // and return the state machine to idle.
                let published = unsafe { (*state.next_table.get()).as_ref().unwrap().snapshot() };
                self.retired.lock().unwrap().push(self.table.snapshot());
                self.table.publish(&published);
                unsafe { *state.next_table.get() = None };
                state.chunks.store(0, Ordering::Release);
                state.active.store(false, Ordering::Release);
                debug!(len = published.mask() + 1, "table grow finished");
                return;
            }
        }
    }

    /// Migrate one old bucket chain into the new table. The source lock
    /// freezes the chain; entries are cloned because readers may still be
    /// probing the old storage.
    fn copy_bucket(&self, source: &Bucket<K, V>, next_table: &Table<K, V>) -> usize {
        let _guard = source.lock();
        let mut moved = 0usize;
        let mut b = Some(source);
        while let Some(cur) = b {
            let slots = cur.slots();
            let mut occupied = cur.meta.load(Ordering::Relaxed) & META_OCCUPIED;
            while occupied != 0 {
                let slot = &slots[first_match_index(occupied)];
                occupied &= occupied - 1;
                let hash = slot.hash;
                next_table.receive_copied(
                    hash,
                    (hash as u8) | TAG_OCCUPIED,
                    slot.key_ref().clone(),
                    slot.value_ref().clone(),
                );
                moved += 1;
            }
            b = cur.next_relaxed();
        }
        moved
    }
}

impl<K, V, S> Drop for StripedMap<K, V, S> {
    fn drop(&mut self) {
        // Exclusive access: snapshots and helpers are gone, so the current
        // table, every parked table, and a half-built resize target can all
        // be reclaimed.
        unsafe {
            for mut table in self.retired.get_mut().unwrap().drain(..) {
                table.destroy();
            }
            if let Some(mut next) = (*self.resize.next_table.get()).take() {
                next.destroy();
            }
            self.table.destroy();
        }
    }
}

/// Bucket-at-a-time iterator of cloned pairs. Holds each bucket's lock only
/// while cloning its entries.
pub struct Iter<'a, K, V> {
    table: Table<K, V>,
    bucket_index: usize,
    pending: Vec<(K, V)>,
    _map: PhantomData<&'a ()>,
}

impl<K: Clone, V: Clone> Iterator for Iter<'_, K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        loop {
            if let Some(pair) = self.pending.pop() {
                return Some(pair);
            }
            if self.bucket_index > self.table.mask() {
                return None;
            }
            let root = self.table.bucket(self.bucket_index);
            self.bucket_index += 1;
            let _guard = root.lock();
            let mut b = Some(root);
            while let Some(cur) = b {
                let slots = cur.slots();
                let mut occupied = cur.meta.load(Ordering::Relaxed) & META_OCCUPIED;
                while occupied != 0 {
                    let slot = &slots[first_match_index(occupied)];
                    occupied &= occupied - 1;
                    self.pending
                        .push((slot.key_ref().clone(), slot.value_ref().clone()));
                }
                b = cur.next_relaxed();
            }
        }
    }
}

#[inline(always)]
fn bucket_index(hash: u64, mask: usize) -> usize {
    // The low byte feeds the tag; index bits start above it.
    ((hash >> 7) as usize) & mask
}

#[inline(always)]
fn broadcast(tag: u8) -> u64 {
    (tag as u64) * 0x0101_0101_0101_0101
}

/// SWAR zero-byte scan of `meta ^ tag_word`: a set occupancy bit in the
/// result marks a slot whose tag byte equals the probe tag.
#[inline(always)]
fn match_tag_bytes(meta: u64, tag_word: u64) -> u64 {
    let diff = meta ^ tag_word;
    diff.wrapping_sub(0x0101_0101_0101_0101) & !diff & META_OCCUPIED
}

#[inline(always)]
fn first_match_index(marks: u64) -> usize {
    (marks.trailing_zeros() >> 3) as usize
}

#[inline(always)]
fn with_tag_byte(meta: u64, tag: u8, index: usize) -> u64 {
    let shift = (index as u64) << 3;
    (meta & !(0xffu64 << shift)) | ((tag as u64) << shift)
}

#[inline(always)]
fn spin_briefly(spins: &mut i32) -> bool {
    if *spins < SPIN_LIMIT {
        *spins += *spins + 1;
        std::hint::spin_loop();
        true
    } else {
        false
    }
}

#[inline(always)]
fn backoff(spins: &mut i32) {
    if *spins < SPIN_LIMIT {
        *spins += *spins + 1;
        std::hint::spin_loop();
    } else {
        *spins = 0;
        thread::yield_now();
    }
}

fn table_len_for(capacity: usize) -> usize {
    let buckets = (capacity as f64 / (SLOTS_PER_BUCKET as f64 * LOAD_FACTOR)) as usize;
    buckets
        .max(MIN_TABLE_LEN)
        .checked_next_power_of_two()
        .unwrap_or(MIN_TABLE_LEN)
}

fn stripe_count_for(table_len: usize) -> usize {
    num_cpus::get()
        .min(table_len >> 10)
        .max(1)
        .next_power_of_two()
}

fn copy_chunks_for(table_len: usize) -> usize {
    (table_len / MIN_BUCKETS_PER_CHUNK).clamp(1, num_cpus::get())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_bytes_round_trip() {
        let meta = with_tag_byte(with_tag_byte(0, 0x85, 0), 0x93, 3);
        assert_eq!(match_tag_bytes(meta, broadcast(0x85)), 0x80);
        assert_eq!(first_match_index(match_tag_bytes(meta, broadcast(0x93))), 3);
        assert_eq!(match_tag_bytes(meta, broadcast(0x91)), 0);
    }

    #[test]
    fn vacancy_scan_finds_first_open_slot() {
        let mut meta = 0u64;
        for i in 0..3 {
            meta = with_tag_byte(meta, 0x80 | i as u8, i);
        }
        let vacant = !meta & META_OCCUPIED;
        assert_eq!(first_match_index(vacant), 3);
    }

    #[test]
    fn table_len_respects_minimum_and_load_factor() {
        assert_eq!(table_len_for(0), MIN_TABLE_LEN);
        assert_eq!(table_len_for(96), MIN_TABLE_LEN);
        let len = table_len_for(10_000);
        assert!(len.is_power_of_two());
        assert!(len * SLOTS_PER_BUCKET * 3 / 4 >= 10_000);
    }
}
