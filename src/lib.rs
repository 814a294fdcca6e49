//! A call-site-partitioned allocator for fuzzing.
//!
//! Every allocation call site (identified by a 16-bit tag assigned by the
//! instrumentation) gets its own pool, mapped at an address whose top bits
//! *are* the pool's tag. Any pointer therefore leads back to the call site
//! that allocated it with one shift and one table load, which is what
//! [`on_dereference`] does on every instrumented access.

#[cfg(not(all(target_os = "linux", target_pointer_width = "64")))]
compile_error!("tagpool needs 64-bit Linux: pools are placed with MAP_FIXED_NOREPLACE");

pub mod alloc;
pub mod api;
pub mod config;
pub mod deref;
pub mod error;
pub mod externc;
pub mod os;
pub mod sync;
pub mod tag;
pub mod util;

pub use alloc::{Heap, PoolStats, TagDirectory, TaggedAlloc, HEAP};
pub use api::{
    aligned_allocate, allocate, allocate_tagged, on_dereference, release, resize, resize_tagged,
    set_feedback_map, usable_size, zero_allocate, zero_allocate_tagged,
};
pub use deref::{CounterPolicy, Recorder};
pub use error::{AlignmentError, CorruptionKind, PoolError};
pub use tag::{get_pool_tag, Tag, DEFAULT_TAG};
