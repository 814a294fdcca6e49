use std::sync::atomic::{AtomicU16, Ordering};

use crate::{
    sync::{RawMutex, RawMutexGuard},
    tag::{Tag, DEFAULT_TAG, NUM_TAGS},
};

/// The two-way mapping between call-site tags and pool tags.
///
/// Both tables are plain arrays indexed by tag, so every lookup is a single
/// load and every `u16` is in range. Entries are written under the
/// directory lock and read without it: a binding is published by storing
/// the reverse entry first, then the forward entry with `Release`.
pub struct TagDirectory {
    call_site_to_pool: [AtomicU16; NUM_TAGS],
    pool_to_call_site: [AtomicU16; NUM_TAGS],
    lock: RawMutex,
}

impl TagDirectory {
    pub const fn new() -> Self {
        Self {
            call_site_to_pool: [const { AtomicU16::new(0) }; NUM_TAGS],
            pool_to_call_site: [const { AtomicU16::new(0) }; NUM_TAGS],
            lock: RawMutex::new(),
        }
    }

    /// The pool serving `call_site`, if it has one yet
    #[inline]
    pub fn resolve_pool(&self, call_site: Tag) -> Option<Tag> {
        match self.call_site_to_pool[call_site as usize].load(Ordering::Acquire) {
            0 => None,
            pool => Some(pool),
        }
    }

    /// The call site `pool` serves. [`DEFAULT_TAG`] for tags no pool has.
    #[inline]
    pub fn resolve_call_site(&self, pool: Tag) -> Tag {
        self.pool_to_call_site[pool as usize].load(Ordering::Acquire)
    }

    /// Does `pool` belong to a live pool of this directory?
    ///
    /// The reverse table alone can't tell: a default-tag pool maps back to
    /// 0 just like an unused entry. Going there and back again can.
    #[inline]
    pub fn is_bound(&self, pool: Tag) -> bool {
        pool != 0 && self.resolve_pool(self.resolve_call_site(pool)) == Some(pool)
    }

    /// Record that `pool` serves `call_site`. Call with the lock held, once
    /// per call site.
    pub fn bind(&self, call_site: Tag, pool: Tag) {
        debug_assert!(pool != 0);
        debug_assert!(self.resolve_pool(call_site).is_none(), "call site bound twice");
        self.pool_to_call_site[pool as usize].store(call_site, Ordering::Relaxed);
        self.call_site_to_pool[call_site as usize].store(pool, Ordering::Release);
    }

    /// Forget `call_site`'s pool, returning it. Call with the lock held.
    pub fn unbind(&self, call_site: Tag) -> Option<Tag> {
        let pool = self.resolve_pool(call_site)?;
        self.call_site_to_pool[call_site as usize].store(0, Ordering::Release);
        self.pool_to_call_site[pool as usize].store(DEFAULT_TAG, Ordering::Release);
        Some(pool)
    }

    /// Serialize binding and unbinding
    pub fn lock(&self) -> RawMutexGuard<'_> {
        self.lock.guard()
    }

    /// Every `(call_site, pool)` pair currently bound
    pub fn bindings(&self) -> impl Iterator<Item = (Tag, Tag)> + '_ {
        (0..=Tag::MAX).filter_map(move |call_site| Some((call_site, self.resolve_pool(call_site)?)))
    }
}

impl Default for TagDirectory {
    fn default() -> Self {
        Self::new()
    }
}
