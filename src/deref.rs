//! Dereference feedback: which call site's memory was touched from where.
//!
//! Every instrumented load or store reports the pointer and its own return
//! address. The pointer's pool tag leads back to the allocating call site,
//! and the pair is hashed into a byte map of counters that the fuzzer reads
//! as coverage.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::{
    eputln,
    tag::{Tag, DEFAULT_TAG},
};

/// The classic AFL map size
pub const DEFAULT_MAP_SIZE: usize = 1 << 16;

/// What happens when a counter is bumped past 255
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CounterPolicy {
    /// Wrap to 0, like AFL's edge counters
    #[default]
    Wrapping = 0,
    /// Stick at 255
    Saturating = 1,
}

impl CounterPolicy {
    #[inline(always)]
    fn bump(self, count: u8) -> u8 {
        match self {
            Self::Wrapping => count.wrapping_add(1),
            Self::Saturating => count.saturating_add(1),
        }
    }
}

/// Map index for a dereference of `call_site`'s memory from
/// `return_address`, before truncation to the map size.
#[inline(always)]
pub fn feedback_index(call_site: Tag, return_address: usize) -> usize {
    let def_site = (call_site - DEFAULT_TAG) as usize;
    (def_site.wrapping_mul(3) ^ return_address).wrapping_sub(return_address)
}

/// User-space addresses fit in the low 48 bits
const ADDR_BITS: u32 = 48;
const ADDR_MASK: usize = (1 << ADDR_BITS) - 1;
/// `log2(len)` lives in the six bits above the address
const LEN_LOG2_MASK: usize = 0x3f;
const SATURATING: usize = 1 << (usize::BITS - 1);

/// An installed map: address, `log2` of its length and the counter policy
/// in one word. Loading it once gives a map and a mask that belong together.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Feedback(usize);

impl Feedback {
    const NONE: Self = Self(0);

    /// `None` if `map` doesn't fit in [`ADDR_BITS`]
    fn pack(map: *mut u8, len_log2: u32, policy: CounterPolicy) -> Option<Self> {
        let addr = map as usize;
        if addr & !ADDR_MASK != 0 {
            return None;
        }
        let policy = match policy {
            CounterPolicy::Wrapping => 0,
            CounterPolicy::Saturating => SATURATING,
        };
        Some(Self(addr | ((len_log2 as usize & LEN_LOG2_MASK) << ADDR_BITS) | policy))
    }

    #[inline(always)]
    fn map(self) -> *mut u8 {
        (self.0 & ADDR_MASK) as *mut u8
    }

    #[inline(always)]
    fn mask(self) -> usize {
        (1usize << ((self.0 >> ADDR_BITS) & LEN_LOG2_MASK)) - 1
    }

    #[inline(always)]
    fn policy(self) -> CounterPolicy {
        if self.0 & SATURATING != 0 {
            CounterPolicy::Saturating
        } else {
            CounterPolicy::Wrapping
        }
    }
}

/// Owns the pointer to the counter map, which lives outside the allocator
pub struct Recorder {
    feedback: AtomicUsize,
}

impl Recorder {
    pub const fn new() -> Self {
        Self {
            feedback: AtomicUsize::new(Feedback::NONE.0),
        }
    }

    fn feedback(&self, order: Ordering) -> Feedback {
        Feedback(self.feedback.load(order))
    }

    /// Start recording into `len` counters at `map`. A null `map` or a zero
    /// `len` stops recording. `len` is rounded down to a power of two.
    ///
    /// Installing again swaps map, length and policy in one store, so a
    /// concurrent [`Recorder::record`] writes into either the old map or
    /// the new one, never one map indexed by the other's length.
    ///
    /// # Safety
    /// `map` must be valid for writes of `len` bytes for as long as it is
    /// installed, and a replaced map must stay valid until every thread
    /// that may be inside `record` has returned from it.
    pub unsafe fn install(&self, map: *mut u8, len: usize, policy: CounterPolicy) {
        if map.is_null() || len == 0 {
            self.uninstall();
            return;
        }
        match Feedback::pack(map, len.ilog2(), policy) {
            Some(feedback) => self.feedback.store(feedback.0, Ordering::Release),
            None => {
                eputln!("tagpool: feedback map at {:p} is out of range, not recording", map);
                self.uninstall();
            }
        }
    }

    /// Stop recording
    pub fn uninstall(&self) {
        self.feedback.store(Feedback::NONE.0, Ordering::Release);
    }

    pub fn is_installed(&self) -> bool {
        !self.feedback(Ordering::Relaxed).map().is_null()
    }

    pub fn policy(&self) -> CounterPolicy {
        self.feedback(Ordering::Relaxed).policy()
    }

    /// Bump the counter for `(call_site, return_address)`. Does nothing for
    /// [`DEFAULT_TAG`] or while no map is installed.
    #[inline]
    pub fn record(&self, call_site: Tag, return_address: usize) {
        if call_site == DEFAULT_TAG {
            return;
        }
        let feedback = self.feedback(Ordering::Acquire);
        let map = feedback.map();
        if map.is_null() {
            return;
        }
        let index = feedback_index(call_site, return_address) & feedback.mask();
        // SAFETY: `install()`'s contract keeps `map[..=mask]` writable, and
        // AtomicU8 has the layout of u8. Load and store rather than an RMW:
        // lost updates between threads are fine, a locked add per
        // dereference is not.
        let counter = unsafe { &*map.add(index).cast::<AtomicU8>() };
        let count = counter.load(Ordering::Relaxed);
        counter.store(feedback.policy().bump(count), Ordering::Relaxed);
    }
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}
