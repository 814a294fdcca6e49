pub mod chunk;
pub mod directory;
pub mod global;
pub mod heap;
pub mod pool;

pub use directory::TagDirectory;
pub use global::TaggedAlloc;
pub use heap::{Heap, HEAP};
pub use pool::PoolStats;
