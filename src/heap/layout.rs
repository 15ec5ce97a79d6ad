use std::ptr;

/// Size of the heap header at offset 0: `free_head` and `used_head`.
pub const HEAP_HEADER_SIZE: u64 = 16;

/// Size of a block header: `prev`, `next`, `data_size`. The payload
/// follows immediately.
pub const BLOCK_HEADER_SIZE: u64 = 24;

/// The null offset. The heap header occupies offset 0, so no block can
/// ever live there.
pub const NULL_OFFSET: u64 = 0;

/// A free block is split on allocation only when the leftover payload
/// would be at least this large; otherwise the caller gets the whole
/// (slightly oversized) block and a tiny fragment is avoided.
pub(crate) const SPLIT_SLACK: u64 = 100;

const FREE_HEAD: u64 = 0;
const USED_HEAD: u64 = 8;
const BLOCK_PREV: u64 = 0;
const BLOCK_NEXT: u64 = 8;
const BLOCK_DATA_SIZE: u64 = 16;

/// Selects one of the two intrusive lists rooted in the heap header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ListId {
    Free,
    Used,
}

impl ListId {
    fn head_offset(self) -> u64 {
        match self {
            ListId::Free => FREE_HEAD,
            ListId::Used => USED_HEAD,
        }
    }
}

/// Raw view of the mapped heap file. All fields are little-endian `u64`s
/// at fixed offsets; blocks are not aligned (a split places the tail
/// block right after the requested payload), so access goes through
/// unaligned byte copies.
///
/// List and header fields must only be mutated while holding the heap
/// mutex; payload bytes are written only between allocation and
/// publication of a blob, and read only while a live blob guards them.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Mapping {
    base: *mut u8,
    len: u64,
}

// The pointer targets the mmap'd region, which outlives every Mapping
// copy (the Heap owns the mmap). See the access rules above.
unsafe impl Send for Mapping {}

impl Mapping {
    pub fn new(base: *mut u8, len: u64) -> Self {
        Self { base, len }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    fn read_u64(&self, offset: u64) -> u64 {
        debug_assert!(offset + 8 <= self.len, "read at {offset} out of bounds");
        let mut buf = [0u8; 8];
        unsafe {
            ptr::copy_nonoverlapping(self.base.add(offset as usize), buf.as_mut_ptr(), 8);
        }
        u64::from_le_bytes(buf)
    }

    fn write_u64(&self, offset: u64, value: u64) {
        debug_assert!(offset + 8 <= self.len, "write at {offset} out of bounds");
        let buf = value.to_le_bytes();
        unsafe {
            ptr::copy_nonoverlapping(buf.as_ptr(), self.base.add(offset as usize), 8);
        }
    }

    pub fn head(&self, list: ListId) -> u64 {
        self.read_u64(list.head_offset())
    }

    pub fn set_head(&self, list: ListId, block: u64) {
        self.write_u64(list.head_offset(), block);
    }

    pub fn block_prev(&self, block: u64) -> u64 {
        self.read_u64(block + BLOCK_PREV)
    }

    pub fn set_block_prev(&self, block: u64, prev: u64) {
        self.write_u64(block + BLOCK_PREV, prev);
    }

    pub fn block_next(&self, block: u64) -> u64 {
        self.read_u64(block + BLOCK_NEXT)
    }

    pub fn set_block_next(&self, block: u64, next: u64) {
        self.write_u64(block + BLOCK_NEXT, next);
    }

    pub fn block_size(&self, block: u64) -> u64 {
        self.read_u64(block + BLOCK_DATA_SIZE)
    }

    pub fn set_block_size(&self, block: u64, size: u64) {
        self.write_u64(block + BLOCK_DATA_SIZE, size);
    }

    /// First byte past the block's payload; the next block starts here.
    pub fn block_end(&self, block: u64) -> u64 {
        Self::payload_of(block) + self.block_size(block)
    }

    pub fn payload_of(block: u64) -> u64 {
        block + BLOCK_HEADER_SIZE
    }

    pub fn block_of(payload: u64) -> u64 {
        payload - BLOCK_HEADER_SIZE
    }

    pub fn payload_ptr(&self, payload: u64) -> *mut u8 {
        debug_assert!(payload <= self.len);
        unsafe { self.base.add(payload as usize) }
    }

    /// Copies `data` into the payload at `payload`. The caller must own
    /// the containing block and must not have published it yet.
    pub fn write_payload(&self, payload: u64, data: &[u8]) {
        assert!(
            payload + data.len() as u64 <= self.len,
            "payload write at {payload} out of bounds"
        );
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.base.add(payload as usize), data.len());
        }
    }
}
