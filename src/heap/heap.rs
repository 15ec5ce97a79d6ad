use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use memmap2::MmapMut;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::Result;
use crate::heap::layout::{
    ListId, Mapping, BLOCK_HEADER_SIZE, HEAP_HEADER_SIZE, NULL_OFFSET, SPLIT_SLACK,
};
use crate::{errdata, errinput};

/// A persistent heap over a fixed-size, file-backed, memory-mapped
/// region. Blocks tile the file contiguously after the 16-byte header;
/// every block is on exactly one of two intrusive doubly-linked lists,
/// threaded through file-relative offsets so the layout survives
/// remapping at a different address:
///
/// - the free list, sorted by ascending offset (which makes coalescing a
///   neighbor check), and
/// - the used list, LIFO, whose enumeration drives restart recovery.
///
/// A single mutex serializes all list mutation. There is no explicit
/// flush; durability is the OS page writeback's business.
#[derive(Debug)]
pub struct Heap {
    lists: Mutex<Lists>,
    map: Mapping,
    _mmap: MmapMut,
    path: PathBuf,
    retired: AtomicBool,
}

// All list state lives in the mapped file and is only touched under
// `lists`. Payload bytes are written before a blob is published and read
// while a live blob guards the allocation. See Mapping.
unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

impl Heap {
    /// Opens the heap file at `path`, creating and initializing it with
    /// the given size if it does not exist (or exists empty). For an
    /// existing file the persisted size wins and the header and lists
    /// are validated before use.
    pub fn open<P: AsRef<Path>>(path: P, size: u64) -> Result<Heap> {
        let path = path.as_ref().to_path_buf();
        if size < HEAP_HEADER_SIZE + BLOCK_HEADER_SIZE {
            return errinput!(
                "heap size {size} below minimum {}",
                HEAP_HEADER_SIZE + BLOCK_HEADER_SIZE
            );
        }

        let (file, mut fresh) = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => (file, true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let file = OpenOptions::new().read(true).write(true).open(&path)?;
                (file, false)
            }
            Err(e) => return Err(e.into()),
        };

        if fresh {
            file.set_len(size)?;
            info!(path = %path.display(), size, "created heap file");
        } else if file.metadata()?.len() == 0 {
            // An existing zero-length file carries no state.
            file.set_len(size)?;
            fresh = true;
            info!(path = %path.display(), size, "initializing empty heap file");
        }

        let file_size = file.metadata()?.len();
        if file_size < HEAP_HEADER_SIZE + BLOCK_HEADER_SIZE {
            return errdata!("heap file is {file_size} bytes, too small to hold a header");
        }
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let map = Mapping::new(mmap.as_mut_ptr(), file_size);

        if fresh {
            // One free block spans everything after the header.
            let first = HEAP_HEADER_SIZE;
            map.set_head(ListId::Free, first);
            map.set_head(ListId::Used, NULL_OFFSET);
            map.set_block_prev(first, NULL_OFFSET);
            map.set_block_next(first, NULL_OFFSET);
            map.set_block_size(first, file_size - HEAP_HEADER_SIZE - BLOCK_HEADER_SIZE);
        } else {
            validate(&map)?;
            info!(path = %path.display(), size = file_size, "opened existing heap file");
        }

        Ok(Heap {
            lists: Mutex::new(Lists { map }),
            map,
            _mmap: mmap,
            path,
            retired: AtomicBool::new(false),
        })
    }

    /// Allocates `size` payload bytes and returns the payload's file
    /// offset, or None when no free block is large enough. The block may
    /// be up to `BLOCK_HEADER_SIZE + SPLIT_SLACK - 1` bytes oversized
    /// when splitting was skipped.
    pub fn allocate(&self, size: u64) -> Option<u64> {
        self.lists.lock().allocate(size)
    }

    /// Returns the allocation at the given payload offset to the free
    /// list, merging it with any adjacent free neighbors. The offset
    /// must come from a previous `allocate` on this heap.
    pub fn deallocate(&self, payload: u64) {
        self.lists.lock().deallocate(payload)
    }

    /// Iterates `(payload_offset, data_size)` over the used list in list
    /// order (most recently allocated first). Holds the heap mutex for
    /// the iterator's lifetime.
    pub fn used_blocks(&self) -> BlockIter<'_> {
        BlockIter::new(self.lists.lock(), ListId::Used)
    }

    /// Iterates `(payload_offset, data_size)` over the free list in
    /// ascending offset order. Holds the heap mutex for the iterator's
    /// lifetime.
    pub fn free_blocks(&self) -> BlockIter<'_> {
        BlockIter::new(self.lists.lock(), ListId::Free)
    }

    /// Aggregate usage counters for both lists.
    pub fn stats(&self) -> HeapStats {
        let lists = self.lists.lock();
        let map = lists.map;
        let mut stats = HeapStats::default();

        let mut cursor = map.head(ListId::Used);
        while cursor != NULL_OFFSET {
            stats.used_blocks += 1;
            stats.used_bytes += map.block_size(cursor);
            cursor = map.block_next(cursor);
        }
        let mut cursor = map.head(ListId::Free);
        while cursor != NULL_OFFSET {
            let size = map.block_size(cursor);
            stats.free_blocks += 1;
            stats.free_bytes += size;
            stats.largest_free = stats.largest_free.max(size);
            cursor = map.block_next(cursor);
        }
        stats
    }

    /// Size of the backing file in bytes.
    pub fn size(&self) -> u64 {
        self.map.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Marks the heap as outliving its owner. A deallocation deferred
    /// past this point must not run: the file may have been reopened
    /// since, and the block will be reclaimed by that open's recovery
    /// instead (see Blob).
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Raw pointer to payload bytes. Dereferencing is subject to the
    /// access rules on Mapping.
    pub(crate) fn payload_ptr(&self, payload: u64) -> *mut u8 {
        self.map.payload_ptr(payload)
    }

    /// Fills an unpublished allocation with `data`.
    pub(crate) fn write_payload(&self, payload: u64, data: &[u8]) {
        self.map.write_payload(payload, data)
    }
}

/// Aggregate heap usage, as reported by [`Heap::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    pub used_blocks: u64,
    pub used_bytes: u64,
    pub free_blocks: u64,
    pub free_bytes: u64,
    pub largest_free: u64,
}

/// The allocator state proper. Everything it mutates lives in the file;
/// the mutex around it is what makes the heap thread-safe.
#[derive(Debug)]
struct Lists {
    map: Mapping,
}

impl Lists {
    fn allocate(&mut self, size: u64) -> Option<u64> {
        let map = self.map;
        if size > map.len() {
            return None;
        }

        // First-fit walk of the free list.
        let mut cursor = map.head(ListId::Free);
        while cursor != NULL_OFFSET {
            if map.block_size(cursor) >= size {
                self.unlink(ListId::Free, cursor);
                self.split(cursor, size);
                self.push_head(ListId::Used, cursor);
                return Some(Mapping::payload_of(cursor));
            }
            cursor = map.block_next(cursor);
        }

        debug!(size, "allocation failed: no free block large enough");
        None
    }

    /// Carves the tail of `block` into a new free block, unless the
    /// leftover payload would be under SPLIT_SLACK bytes.
    fn split(&mut self, block: u64, size: u64) {
        let map = self.map;
        let block_size = map.block_size(block);
        if block_size < size + BLOCK_HEADER_SIZE + SPLIT_SLACK {
            return;
        }

        let tail = Mapping::payload_of(block) + size;
        map.set_block_prev(tail, NULL_OFFSET);
        map.set_block_next(tail, NULL_OFFSET);
        map.set_block_size(tail, block_size - size - BLOCK_HEADER_SIZE);
        map.set_block_size(block, size);
        self.insert_free_sorted(tail);
    }

    fn deallocate(&mut self, payload: u64) {
        let block = Mapping::block_of(payload);
        self.unlink(ListId::Used, block);
        self.insert_free_sorted(block);
        self.coalesce(block);
    }

    /// Detaches `block` from the given list, clearing its links.
    fn unlink(&mut self, list: ListId, block: u64) {
        let map = self.map;
        let prev = map.block_prev(block);
        let next = map.block_next(block);

        if prev != NULL_OFFSET {
            map.set_block_next(prev, next);
        } else {
            debug_assert_eq!(map.head(list), block, "block not on the {list:?} list");
            map.set_head(list, next);
        }
        if next != NULL_OFFSET {
            map.set_block_prev(next, prev);
        }

        map.set_block_prev(block, NULL_OFFSET);
        map.set_block_next(block, NULL_OFFSET);
    }

    fn push_head(&mut self, list: ListId, block: u64) {
        let map = self.map;
        let head = map.head(list);
        if head != NULL_OFFSET {
            map.set_block_prev(head, block);
        }
        map.set_block_prev(block, NULL_OFFSET);
        map.set_block_next(block, head);
        map.set_head(list, block);
    }

    /// Inserts `block` into the free list at the unique position that
    /// keeps offsets strictly ascending.
    fn insert_free_sorted(&mut self, block: u64) {
        let map = self.map;
        let mut prev = NULL_OFFSET;
        let mut cursor = map.head(ListId::Free);
        while cursor != NULL_OFFSET && cursor < block {
            prev = cursor;
            cursor = map.block_next(cursor);
        }
        debug_assert_ne!(cursor, block, "block already on the free list");

        if prev == NULL_OFFSET {
            self.push_head(ListId::Free, block);
        } else {
            map.set_block_next(prev, block);
            map.set_block_prev(block, prev);
            map.set_block_next(block, cursor);
            if cursor != NULL_OFFSET {
                map.set_block_prev(cursor, block);
            }
        }
    }

    /// Merges a just-inserted free block with its free-list neighbors.
    /// Since the free list is offset-sorted, the list neighbors are the
    /// only candidates for file adjacency.
    fn coalesce(&mut self, block: u64) {
        let map = self.map;
        let prev = map.block_prev(block);
        let next = map.block_next(block);
        let prev_adjacent = prev != NULL_OFFSET && map.block_end(prev) == block;
        let next_adjacent = next != NULL_OFFSET && map.block_end(block) == next;

        match (prev_adjacent, next_adjacent) {
            (true, true) => {
                self.unlink(ListId::Free, block);
                self.unlink(ListId::Free, next);
                map.set_block_size(
                    prev,
                    map.block_size(prev)
                        + 2 * BLOCK_HEADER_SIZE
                        + map.block_size(block)
                        + map.block_size(next),
                );
            }
            (true, false) => {
                self.unlink(ListId::Free, block);
                map.set_block_size(
                    prev,
                    map.block_size(prev) + BLOCK_HEADER_SIZE + map.block_size(block),
                );
            }
            (false, true) => {
                self.unlink(ListId::Free, next);
                map.set_block_size(
                    block,
                    map.block_size(block) + BLOCK_HEADER_SIZE + map.block_size(next),
                );
            }
            (false, false) => {}
        }
    }
}

/// Checks a reopened file's header and lists before trusting them: heads
/// and links in bounds, no cycles, and both lists together tiling the
/// file exactly.
fn validate(map: &Mapping) -> Result<()> {
    let len = map.len();
    let max_blocks = (len - HEAP_HEADER_SIZE) / BLOCK_HEADER_SIZE + 1;
    let mut total: u64 = 0;

    for list in [ListId::Free, ListId::Used] {
        let mut seen: u64 = 0;
        let mut prev = NULL_OFFSET;
        let mut cursor = map.head(list);
        while cursor != NULL_OFFSET {
            let header_ok = cursor >= HEAP_HEADER_SIZE
                && cursor.checked_add(BLOCK_HEADER_SIZE).is_some_and(|end| end <= len);
            if !header_ok {
                return errdata!("{list:?} list offset {cursor} out of bounds");
            }
            let size = map.block_size(cursor);
            let end = match Mapping::payload_of(cursor).checked_add(size) {
                Some(end) if end <= len => end,
                _ => return errdata!("block at {cursor} extends past end of file"),
            };
            if map.block_prev(cursor) != prev {
                return errdata!("block at {cursor} has a broken prev link");
            }
            seen += 1;
            if seen > max_blocks {
                return errdata!("{list:?} list contains a cycle");
            }
            total += end - cursor;
            prev = cursor;
            cursor = map.block_next(cursor);
        }
    }

    if total != len - HEAP_HEADER_SIZE {
        return errdata!(
            "blocks cover {total} bytes, expected {}",
            len - HEAP_HEADER_SIZE
        );
    }
    Ok(())
}

/// Iterator over one of the heap's lists, yielding
/// `(payload_offset, data_size)` pairs. Keeps the heap locked while
/// alive.
pub struct BlockIter<'a> {
    lists: MutexGuard<'a, Lists>,
    cursor: u64,
}

impl<'a> BlockIter<'a> {
    fn new(lists: MutexGuard<'a, Lists>, list: ListId) -> Self {
        let cursor = lists.map.head(list);
        Self { lists, cursor }
    }
}

impl Iterator for BlockIter<'_> {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == NULL_OFFSET {
            return None;
        }
        let map = self.lists.map;
        let block = self.cursor;
        self.cursor = map.block_next(block);
        Some((Mapping::payload_of(block), map.block_size(block)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    fn open_heap(dir: &TempDir, size: u64) -> Heap {
        Heap::open(dir.path().join("heap.bin"), size).expect("Failed to open heap")
    }

    /// Structural allocator invariants: tiling, exclusive list
    /// membership, free-list ordering, coalescing maximality.
    fn assert_invariants(heap: &Heap) {
        let free: Vec<_> = heap.free_blocks().collect();
        let used: Vec<_> = heap.used_blocks().collect();

        for pair in free.windows(2) {
            assert!(
                pair[0].0 < pair[1].0,
                "free list not in ascending offset order"
            );
        }

        let mut all: Vec<(u64, u64, bool)> = free
            .iter()
            .map(|&(payload, size)| (payload, size, true))
            .chain(used.iter().map(|&(payload, size)| (payload, size, false)))
            .collect();
        all.sort_by_key(|block| block.0);

        for pair in all.windows(2) {
            assert_ne!(pair[0].0, pair[1].0, "block on both lists");
            // Blocks tile the file, so consecutive blocks are adjacent.
            assert!(
                !(pair[0].2 && pair[1].2),
                "adjacent free blocks not coalesced"
            );
        }

        let mut expected_payload = HEAP_HEADER_SIZE + BLOCK_HEADER_SIZE;
        for &(payload, size, _) in &all {
            assert_eq!(payload, expected_payload, "gap or overlap in block tiling");
            expected_payload = payload + size + BLOCK_HEADER_SIZE;
        }
        assert_eq!(
            expected_payload - BLOCK_HEADER_SIZE,
            heap.size(),
            "blocks do not tile the file exactly"
        );
    }

    #[test]
    fn test_fresh_heap_has_one_free_block() {
        let dir = TempDir::new().unwrap();
        let heap = open_heap(&dir, MIB);

        let free: Vec<_> = heap.free_blocks().collect();
        assert_eq!(
            free,
            vec![(
                HEAP_HEADER_SIZE + BLOCK_HEADER_SIZE,
                MIB - HEAP_HEADER_SIZE - BLOCK_HEADER_SIZE
            )]
        );
        assert_eq!(heap.used_blocks().count(), 0);
        assert_invariants(&heap);
    }

    #[test]
    fn test_alloc_free_lifo_enumeration() {
        let dir = TempDir::new().unwrap();
        let heap = open_heap(&dir, 64 * MIB);

        let a = heap.allocate(16).expect("alloc a");
        let b = heap.allocate(32).expect("alloc b");
        let c = heap.allocate(64).expect("alloc c");
        let d = heap.allocate(128).expect("alloc d");
        let offsets = [a, b, c, d];
        for pair in offsets.windows(2) {
            assert_ne!(pair[0], pair[1], "allocations must be distinct");
        }

        heap.deallocate(d);

        // Used list enumerates most recently allocated first.
        let used: Vec<_> = heap.used_blocks().collect();
        assert_eq!(used, vec![(c, 64), (b, 32), (a, 16)]);

        // d merged with the free tail next to it.
        let free: Vec<_> = heap.free_blocks().collect();
        assert_eq!(free.len(), 1);
        let capacity = 64 * MIB - HEAP_HEADER_SIZE - BLOCK_HEADER_SIZE;
        assert_eq!(
            free[0].1,
            capacity - 16 - 32 - 64 - 3 * BLOCK_HEADER_SIZE
        );
        assert_eq!(heap.stats().largest_free, free[0].1);
        assert_invariants(&heap);
    }

    #[test]
    fn test_split_produces_exact_block() {
        let dir = TempDir::new().unwrap();
        let heap = open_heap(&dir, 4096);

        let payload = heap.allocate(16).expect("alloc");
        let used: Vec<_> = heap.used_blocks().collect();
        assert_eq!(used, vec![(payload, 16)]);
        assert_invariants(&heap);
    }

    #[test]
    fn test_split_skipped_below_slack() {
        let dir = TempDir::new().unwrap();
        let heap = open_heap(&dir, 4096);
        let capacity = 4096 - HEAP_HEADER_SIZE - BLOCK_HEADER_SIZE;

        // Leftover would be BLOCK_HEADER_SIZE + 50 < the split threshold,
        // so the caller gets the whole oversized block.
        let request = capacity - BLOCK_HEADER_SIZE - 50;
        let payload = heap.allocate(request).expect("alloc");
        let used: Vec<_> = heap.used_blocks().collect();
        assert_eq!(used, vec![(payload, capacity)]);
        assert_eq!(heap.free_blocks().count(), 0);
        assert_invariants(&heap);
    }

    #[test]
    fn test_split_at_exact_threshold() {
        let dir = TempDir::new().unwrap();
        let heap = open_heap(&dir, 4096);
        let capacity = 4096 - HEAP_HEADER_SIZE - BLOCK_HEADER_SIZE;

        // Leftover payload is exactly SPLIT_SLACK: the split happens.
        let request = capacity - BLOCK_HEADER_SIZE - SPLIT_SLACK;
        let payload = heap.allocate(request).expect("alloc");
        let used: Vec<_> = heap.used_blocks().collect();
        assert_eq!(used, vec![(payload, request)]);

        let free: Vec<_> = heap.free_blocks().collect();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].1, SPLIT_SLACK);
        assert_invariants(&heap);
    }

    #[test]
    fn test_coalesce_three_way() {
        let dir = TempDir::new().unwrap();
        let heap = open_heap(&dir, MIB);

        let a = heap.allocate(100).expect("alloc a");
        let b = heap.allocate(100).expect("alloc b");
        let c = heap.allocate(100).expect("alloc c");
        // d keeps the free tail from being adjacent to c.
        let _d = heap.allocate(100).expect("alloc d");

        heap.deallocate(a);
        heap.deallocate(c);
        heap.deallocate(b);

        let free: Vec<_> = heap.free_blocks().collect();
        assert_eq!(free.len(), 2, "a, b, c must collapse into one block");
        assert_eq!(free[0].0, a);
        assert_eq!(free[0].1, 300 + 2 * BLOCK_HEADER_SIZE);
        assert_invariants(&heap);
    }

    #[test]
    fn test_allocation_failure_returns_none() {
        let dir = TempDir::new().unwrap();
        let heap = open_heap(&dir, 4096);

        assert_eq!(heap.allocate(4096), None);
        assert_eq!(heap.allocate(u64::MAX), None);

        // Exhaust the heap, then fail.
        let capacity = 4096 - HEAP_HEADER_SIZE - BLOCK_HEADER_SIZE;
        let payload = heap.allocate(capacity).expect("alloc everything");
        assert_eq!(heap.allocate(1), None);

        // Freeing restores the space.
        heap.deallocate(payload);
        assert!(heap.allocate(capacity).is_some());
        assert_invariants(&heap);
    }

    #[test]
    fn test_reopen_preserves_blocks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("heap.bin");

        let (a, b);
        {
            let heap = Heap::open(&path, MIB).expect("Failed to create heap");
            a = heap.allocate(100).expect("alloc a");
            b = heap.allocate(200).expect("alloc b");
            heap.write_payload(a, b"aaaa");
            heap.write_payload(b, b"bbbb");
        }

        // Reopen with a different requested size: the file's size wins.
        let heap = Heap::open(&path, 2 * MIB).expect("Failed to reopen heap");
        assert_eq!(heap.size(), MIB);

        let used: Vec<_> = heap.used_blocks().collect();
        assert_eq!(used, vec![(b, 200), (a, 100)]);

        let mut buf = [0u8; 4];
        unsafe {
            std::ptr::copy_nonoverlapping(heap.payload_ptr(a), buf.as_mut_ptr(), 4);
        }
        assert_eq!(&buf, b"aaaa");
        assert_invariants(&heap);
    }

    #[test]
    fn test_zero_length_existing_file_is_fresh() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("heap.bin");
        std::fs::File::create(&path).expect("Failed to touch file");

        let heap = Heap::open(&path, MIB).expect("Failed to open heap");
        assert_eq!(heap.size(), MIB);
        assert_eq!(heap.free_blocks().count(), 1);
        assert_invariants(&heap);
    }

    #[test]
    fn test_corrupt_header_rejected() {
        use crate::error::Error;
        use std::io::{Seek, SeekFrom, Write};

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("heap.bin");
        drop(Heap::open(&path, 4096).expect("Failed to create heap"));

        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(&u64::MAX.to_le_bytes()).unwrap();
        drop(file);

        match Heap::open(&path, 4096) {
            Err(Error::InvalidData(_)) => {}
            other => panic!("Expected InvalidData, got {other:?}"),
        }
    }

    #[test]
    fn test_size_below_minimum_rejected() {
        use crate::error::Error;

        let dir = TempDir::new().unwrap();
        match Heap::open(dir.path().join("heap.bin"), HEAP_HEADER_SIZE) {
            Err(Error::InvalidInput(_)) => {}
            other => panic!("Expected InvalidInput, got {other:?}"),
        }
    }

    #[test]
    fn test_stats() {
        let dir = TempDir::new().unwrap();
        let heap = open_heap(&dir, MIB);

        let a = heap.allocate(100).expect("alloc a");
        let _b = heap.allocate(200).expect("alloc b");
        heap.deallocate(a);

        let stats = heap.stats();
        assert_eq!(stats.used_blocks, 1);
        assert_eq!(stats.used_bytes, 200);
        assert_eq!(stats.free_blocks, 2);
        assert!(stats.largest_free >= 100);
        assert_eq!(
            stats.used_bytes + stats.free_bytes,
            MIB - HEAP_HEADER_SIZE - (stats.used_blocks + stats.free_blocks) * BLOCK_HEADER_SIZE
        );
    }

    #[test]
    fn test_randomized_alloc_free_upholds_invariants() {
        let dir = TempDir::new().unwrap();
        let heap = open_heap(&dir, MIB);
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut live: Vec<u64> = Vec::new();

        for round in 0..500 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let size = rng.gen_range(1..2000);
                if let Some(payload) = heap.allocate(size) {
                    live.push(payload);
                }
            } else {
                let index = rng.gen_range(0..live.len());
                heap.deallocate(live.swap_remove(index));
            }
            if round % 25 == 0 {
                assert_invariants(&heap);
            }
        }
        assert_invariants(&heap);

        // Freeing everything must collapse the heap back to one block.
        for payload in live.drain(..) {
            heap.deallocate(payload);
        }
        let free: Vec<_> = heap.free_blocks().collect();
        assert_eq!(
            free,
            vec![(
                HEAP_HEADER_SIZE + BLOCK_HEADER_SIZE,
                MIB - HEAP_HEADER_SIZE - BLOCK_HEADER_SIZE
            )]
        );
    }

    #[test]
    fn test_concurrent_allocation() {
        use std::sync::Arc;
        use std::thread;

        let dir = TempDir::new().unwrap();
        let heap = Arc::new(open_heap(&dir, 8 * MIB));

        let mut handles = vec![];
        for _ in 0..4 {
            let heap = Arc::clone(&heap);
            handles.push(thread::spawn(move || {
                let mut payloads = vec![];
                for i in 0..200 {
                    if let Some(payload) = heap.allocate(64 + (i % 7) * 10) {
                        payloads.push(payload);
                    }
                }
                for payload in &payloads[..payloads.len() / 2] {
                    heap.deallocate(*payload);
                }
                payloads.len()
            }));
        }
        for handle in handles {
            assert!(handle.join().unwrap() > 0);
        }
        assert_invariants(&heap);
    }
}
