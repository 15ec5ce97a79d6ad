pub mod heap;
pub mod layout;

pub use heap::{BlockIter, Heap, HeapStats};
pub use layout::{BLOCK_HEADER_SIZE, HEAP_HEADER_SIZE, NULL_OFFSET};
