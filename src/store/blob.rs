use std::mem::ManuallyDrop;
use std::ptr;
use std::slice;
use std::sync::Arc;

use crate::heap::Heap;

/// A published key-value payload: `key, 0x00, value, 0x00` inside a
/// used-list block. Dropping the handle returns the allocation to the
/// heap, which is how overwritten blobs are reclaimed once the last
/// reader lets go; [`Blob::persist`] is the shutdown path that keeps the
/// bytes allocated on disk instead.
#[derive(Debug)]
pub(crate) struct Blob {
    heap: Arc<Heap>,
    payload: u64,
    len: u64,
}

impl Blob {
    /// Allocates a block and serializes `key\0value\0` into it. Returns
    /// None when the heap has no block large enough.
    pub fn write(heap: &Arc<Heap>, key: &[u8], value: &[u8]) -> Option<Blob> {
        let len = key.len() as u64 + 1 + value.len() as u64 + 1;
        let payload = heap.allocate(len)?;

        let mut buf = Vec::with_capacity(len as usize);
        buf.extend_from_slice(key);
        buf.push(0);
        buf.extend_from_slice(value);
        buf.push(0);
        heap.write_payload(payload, &buf);

        Some(Blob {
            heap: Arc::clone(heap),
            payload,
            len,
        })
    }

    /// Wraps a payload recovered from the used list. Returns None without
    /// touching the allocation when the payload is not a well-formed
    /// `key\0value\0` blob within its block.
    pub fn from_used_block(heap: &Arc<Heap>, payload: u64, data_size: u64) -> Option<Blob> {
        let bytes =
            unsafe { slice::from_raw_parts(heap.payload_ptr(payload), data_size as usize) };
        let key_end = bytes.iter().position(|&b| b == 0)?;
        if key_end == 0 {
            return None;
        }
        bytes[key_end + 1..].iter().position(|&b| b == 0)?;

        Some(Blob {
            heap: Arc::clone(heap),
            payload,
            len: data_size,
        })
    }

    /// The key bytes, up to the first NUL.
    pub fn key(&self) -> &[u8] {
        let bytes = self.bytes();
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        &bytes[..end]
    }

    /// The value bytes, between the first and second NUL. The block may
    /// be oversized when the allocator skipped a split, so the
    /// terminating NUL delimits the value, not the block size.
    pub fn value(&self) -> &[u8] {
        let bytes = self.bytes();
        let key_end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        let rest = bytes.get(key_end + 1..).unwrap_or(&[]);
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        &rest[..end]
    }

    /// Drops the handle without returning the allocation to the heap:
    /// the block stays on the used list for the next open to recover.
    pub fn persist(self: Box<Self>) {
        let mut this = ManuallyDrop::new(*self);
        unsafe { ptr::drop_in_place(&mut this.heap) }
    }

    fn bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.heap.payload_ptr(self.payload), self.len as usize) }
    }
}

impl Drop for Blob {
    fn drop(&mut self) {
        // A deallocation deferred past the owning store's shutdown must
        // not touch the file: it may have been reopened since. The block
        // stays on the used list and the next open's recovery reclaims
        // it.
        if !self.heap.is_retired() {
            self.heap.deallocate(self.payload);
        }
    }
}
