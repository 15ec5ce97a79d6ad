use std::path::PathBuf;

/// Default heap file, created in the working directory.
pub const DEFAULT_HEAP_FILE: &str = "kvstore.bin";

/// Default heap size: 512 MiB. The size is fixed at file creation and
/// reopening honors the file's existing size.
pub const DEFAULT_HEAP_SIZE: u64 = 512 * 1024 * 1024;

/// Default hash table slot count: prime near 200000 keys at a 0.75 load
/// factor. The table never resizes; collisions chain.
pub const DEFAULT_TABLE_SLOTS: usize = 266671;

/// Configuration for the KV store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path of the memory-mapped heap file
    pub path: PathBuf,

    /// Heap file size in bytes, applied only when the file is created
    /// (default: 512 MiB; tests commonly use 64 MiB)
    pub heap_size: u64,

    /// Number of hash table slots, fixed for the store's lifetime
    /// (default: 266671)
    pub table_slots: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_HEAP_FILE),
            heap_size: DEFAULT_HEAP_SIZE,
            table_slots: DEFAULT_TABLE_SLOTS,
        }
    }
}

impl StoreConfig {
    /// Create a new config with the given heap file path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set the heap file size used when creating a fresh file
    pub fn heap_size(mut self, size: u64) -> Self {
        self.heap_size = size;
        self
    }

    /// Set the hash table slot count
    pub fn table_slots(mut self, slots: usize) -> Self {
        self.table_slots = slots;
        self
    }
}
