use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_epoch::{self as epoch, Atomic, Collector, Guard, LocalHandle, Owned};
use parking_lot::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::config::StoreConfig;
use crate::errinput;
use crate::error::Result;
use crate::flock::FileLock;
use crate::heap::{Heap, HeapStats};
use crate::store::blob::Blob;

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// Per-thread epoch registrations, one per live store. Registering
    /// with a collector is far more expensive than pinning an existing
    /// registration, and `get` must stay cheap, so each thread keeps
    /// its handle for a store across calls. Entries for dropped stores
    /// are swept out whenever a new store registers.
    static EPOCH_HANDLES: RefCell<Vec<CachedHandle>> = const { RefCell::new(Vec::new()) };
}

struct CachedHandle {
    store_id: u64,
    alive: Weak<()>,
    handle: LocalHandle,
}

/// A chain node. `next` is written once, before the bucket is published
/// through its table slot, and never changes; buckets are never removed
/// (there is no key deletion). `kv` is swapped on overwrite, and the old
/// blob is reclaimed through the epoch collector once every reader that
/// loaded it has unpinned.
#[derive(Debug)]
struct Bucket {
    next: AtomicPtr<Bucket>,
    kv: Atomic<Blob>,
}

impl Drop for Bucket {
    fn drop(&mut self) {
        // A clean shutdown keeps the current blob allocated on disk so
        // the next open recovers it from the used list.
        unsafe {
            let guard = epoch::unprotected();
            let kv = self.kv.load(Ordering::Relaxed, guard);
            if !kv.is_null() {
                kv.into_owned().into_box().persist();
            }
        }
    }
}

/// A persistent, concurrent key-value store. Values live in a single
/// memory-mapped heap file; the index is a fixed-size chained hash table
/// rebuilt from the heap's used list on open.
///
/// Writes are serialized by one mutex. Reads take no lock: chain heads
/// and per-bucket blob pointers are published with release stores and
/// walked with acquire loads, so a `get` racing a `put` sees either the
/// old or the new state, never a torn one.
#[derive(Debug)]
pub struct KvStore {
    heap: Arc<Heap>,
    table: Box<[AtomicPtr<Bucket>]>,
    /// The write mutex. It also owns the bucket arena: buckets are boxed
    /// so their addresses are stable while the Vec grows, and the arena
    /// only ever appends.
    arena: Mutex<Vec<Box<Bucket>>>,
    /// Store-scoped epoch domain for blob reclamation. Threads cache
    /// their registrations (see EPOCH_HANDLES), so the domain can
    /// outlive the store; `Drop` drains it and retires the heap so a
    /// free deferred past shutdown cannot touch a reopened file.
    collector: Collector,
    /// Key for this store's EPOCH_HANDLES entries.
    id: u64,
    /// Liveness token for sweeping stale EPOCH_HANDLES entries.
    alive: Arc<()>,
    _flock: FileLock,
}

impl KvStore {
    /// Opens the store with the default configuration (`kvstore.bin` in
    /// the working directory), recovering any existing content.
    pub fn new() -> Result<KvStore> {
        Self::open(StoreConfig::default())
    }

    /// Opens the store described by `config`, recovering any existing
    /// content from the heap file.
    pub fn open(config: StoreConfig) -> Result<KvStore> {
        let flock = FileLock::lock_for(&config.path)?;
        let heap = Arc::new(Heap::open(&config.path, config.heap_size)?);
        let table = (0..config.table_slots)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let store = KvStore {
            heap,
            table,
            arena: Mutex::new(Vec::new()),
            collector: Collector::new(),
            id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            alive: Arc::new(()),
            _flock: flock,
        };
        store.recover();
        Ok(store)
    }

    /// Rebuilds the index from the heap's used list. The used list is
    /// LIFO, so the first blob seen for a key is the newest one; older
    /// duplicates (overwrites whose deferred free never ran before the
    /// process exited) and malformed payloads are returned to the heap.
    fn recover(&self) {
        let blocks: Vec<(u64, u64)> = self.heap.used_blocks().collect();
        let mut arena = self.arena.lock();
        let guard = self.pin();
        let mut discarded = 0usize;

        for (payload, data_size) in blocks {
            let Some(blob) = Blob::from_used_block(&self.heap, payload, data_size) else {
                warn!(payload, data_size, "discarding malformed blob");
                self.heap.deallocate(payload);
                discarded += 1;
                continue;
            };
            let slot = self.slot(blob.key());
            if self.find_bucket(slot, blob.key(), &guard).is_some() {
                warn!(payload, "discarding stale blob for already-recovered key");
                drop(blob);
                discarded += 1;
                continue;
            }
            Self::publish_new_bucket(&self.table[slot], &mut arena, blob);
        }

        info!(entries = arena.len(), discarded, "recovered index from heap");
    }

    /// Inserts or overwrites a key. Returns Ok(false) when the heap has
    /// no free block large enough for the serialized entry; the caller
    /// may retry after other keys shrink. Keys must be non-empty and
    /// NUL-free; values must be NUL-free.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        if key.is_empty() {
            return errinput!("key must not be empty");
        }
        if key.contains(&0) {
            return errinput!("key must not contain NUL bytes");
        }
        if value.contains(&0) {
            return errinput!("value must not contain NUL bytes");
        }

        let mut arena = self.arena.lock();

        // Allocate before touching the index: an exhausted heap fails
        // fast and leaves the chains untouched.
        let Some(blob) = Blob::write(&self.heap, key, value) else {
            return Ok(false);
        };

        let slot = self.slot(key);
        let guard = self.pin();
        match self.find_bucket(slot, key, &guard) {
            Some(bucket) => {
                let old = bucket.kv.swap(Owned::new(blob), Ordering::AcqRel, &guard);
                // Readers may still hold the old blob; its Drop returns
                // the block to the heap once the epoch advances past
                // every reader that loaded it.
                unsafe { guard.defer_destroy(old) };
                guard.flush();
            }
            None => Self::publish_new_bucket(&self.table[slot], &mut arena, blob),
        }
        Ok(true)
    }

    /// Looks up a key and returns a copy of its value, or None when the
    /// key is absent. Takes no lock and never blocks on writers.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let slot = self.slot(key);
        let guard = self.pin();
        let mut cursor = self.table[slot].load(Ordering::Acquire);
        while let Some(bucket) = unsafe { cursor.as_ref() } {
            // kv is initialized before the bucket is published.
            let blob = unsafe { bucket.kv.load(Ordering::Acquire, &guard).deref() };
            if blob.key() == key {
                // Copy out: the blob may be reclaimed as soon as the
                // guard drops.
                return Some(blob.value().to_vec());
            }
            cursor = bucket.next.load(Ordering::Relaxed);
        }
        None
    }

    /// Iterates `(key, value)` pairs in bucket creation order. Holds the
    /// write mutex for the iterator's lifetime; writers block until it
    /// is dropped.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            store: self,
            arena: self.arena.lock(),
            index: 0,
        }
    }

    /// Number of keys in the store.
    pub fn len(&self) -> usize {
        self.arena.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index and heap usage counters.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            entries: self.len() as u64,
            heap: self.heap.stats(),
        }
    }

    /// The backing heap, for diagnostic consumers (block iterators, file
    /// size).
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    fn slot(&self, key: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.table.len() as u64) as usize
    }

    /// Pins this thread in the store's epoch domain. The registration is
    /// created on the thread's first call for this store and cached in
    /// EPOCH_HANDLES; pinning a cached registration is cheap enough for
    /// the read path.
    fn pin(&self) -> Guard {
        EPOCH_HANDLES.with(|cell| {
            let mut handles = cell.borrow_mut();
            if let Some(cached) = handles.iter().find(|c| c.store_id == self.id) {
                return cached.handle.pin();
            }
            handles.retain(|c| c.alive.strong_count() > 0);
            let handle = self.collector.register();
            let guard = handle.pin();
            handles.push(CachedHandle {
                store_id: self.id,
                alive: Arc::downgrade(&self.alive),
                handle,
            });
            guard
        })
    }

    /// Walks the chain at `slot` for a bucket whose current blob carries
    /// `key`.
    fn find_bucket<'a>(&'a self, slot: usize, key: &[u8], guard: &Guard) -> Option<&'a Bucket> {
        let mut cursor = self.table[slot].load(Ordering::Acquire);
        while let Some(bucket) = unsafe { cursor.as_ref() } {
            let blob = unsafe { bucket.kv.load(Ordering::Acquire, guard).deref() };
            if blob.key() == key {
                return Some(bucket);
            }
            cursor = bucket.next.load(Ordering::Relaxed);
        }
        None
    }

    /// Boxes a bucket holding `blob`, appends it to the arena, then
    /// publishes it at the chain head. The release store is the last
    /// write: a reader either misses the bucket entirely or sees it
    /// fully initialized.
    fn publish_new_bucket(head: &AtomicPtr<Bucket>, arena: &mut Vec<Box<Bucket>>, blob: Blob) {
        let bucket = Box::new(Bucket {
            next: AtomicPtr::new(head.load(Ordering::Acquire)),
            kv: Atomic::new(blob),
        });
        let bucket_ptr = &*bucket as *const Bucket as *mut Bucket;
        arena.push(bucket);
        head.store(bucket_ptr, Ordering::Release);
    }
}

impl Drop for KvStore {
    fn drop(&mut self) {
        // Run deferred frees now, while no reader can still be pinned,
        // so a clean shutdown leaves only live blobs on the used list.
        let handle = self.collector.register();
        for _ in 0..16 {
            handle.pin().flush();
        }
        // A free still queued behind another thread's cached
        // registration may fire long after this store is gone; retiring
        // the heap turns it into a no-op, and the next open's recovery
        // reclaims the block instead.
        self.heap.retire();
    }
}

/// Index-plus-heap usage, as reported by [`KvStore::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub entries: u64,
    pub heap: HeapStats,
}

/// Iterator over the store's entries in bucket creation order.
pub struct Iter<'a> {
    store: &'a KvStore,
    arena: MutexGuard<'a, Vec<Box<Bucket>>>,
    index: usize,
}

impl Iterator for Iter<'_> {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        let bucket = self.arena.get(self.index)?;
        self.index += 1;
        let guard = self.store.pin();
        let blob = unsafe { bucket.kv.load(Ordering::Acquire, &guard).deref() };
        Some((blob.key().to_vec(), blob.value().to_vec()))
    }
}
