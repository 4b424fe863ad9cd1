//! Thread-safe SwissTable variant.
//!
//! Same probing algorithm as the single-threaded table, different slot
//! protocol. Control bytes are atomics; an insert claims a slot by CAS-ing
//! Empty/Deleted to Busy, publishes key and value, then release-stores the
//! tag. There is no mirrored tail (the two stores of a mirrored pair
//! cannot be made atomic together), so groups that would read past the end
//! fall back to per-byte loads with wrap-around.
//!
//! Keys are `u64` because the publication protocol needs atomic key cells.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

use crate::probe::{probe_group, split_hash, BUSY, DELETED, EMPTY, GROUP};
use crate::{Key, TableError};

/// Retry budget multiplier: a contended insert may re-examine each slot
/// this many times before reporting the table full.
const RETRY_BUDGET_PER_SLOT: usize = 8;

/// Fixed-capacity concurrent hash map from `u64` to a `V` pointer.
pub struct HashMapMt<V> {
    ctrl: Box<[AtomicU8]>,
    keys: Box<[AtomicU64]>,
    values: Box<[AtomicPtr<V>]>,
    capacity: usize,
    len: CachePadded<AtomicUsize>,
}

// SAFETY: value pointers are stored opaquely and handed back as-is; the
// pointees are shared across threads by the caller.
unsafe impl<V: Send> Send for HashMapMt<V> {}
unsafe impl<V: Sync> Sync for HashMapMt<V> {}

impl<V> HashMapMt<V> {
    /// Create a table with `capacity` slots (power of two, at least 16).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity >= GROUP,
            "table capacity must be a power of two of at least 16"
        );
        Self {
            ctrl: (0..capacity).map(|_| AtomicU8::new(EMPTY)).collect(),
            keys: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
            values: (0..capacity)
                .map(|_| AtomicPtr::new(std::ptr::null_mut()))
                .collect(),
            capacity,
            len: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Look the key up.
    ///
    /// Candidate masks are built from relaxed loads; every candidate (and
    /// the first observed Empty) is re-verified with an acquire load before
    /// it is trusted, pairing with the inserter's release publication.
    #[must_use]
    pub fn find(&self, key: u64) -> Option<NonNull<V>> {
        let (tag, home) = split_hash(key.hash(), self.capacity);
        let mask = self.capacity - 1;

        let mut scanned = 0;
        while scanned < self.capacity {
            let group_at = (home + scanned) & mask;
            let masks = self.load_group(group_at, tag);

            let mut candidates = masks.matches;
            while candidates != 0 {
                let bit = candidates.trailing_zeros() as usize;
                let idx = (group_at + bit) & mask;
                // Acquire re-check synchronizes with the slot's publisher.
                if self.ctrl[idx].load(Ordering::Acquire) == tag
                    && self.keys[idx].load(Ordering::Relaxed) == key
                {
                    return NonNull::new(self.values[idx].load(Ordering::Acquire));
                }
                candidates &= candidates - 1;
            }

            if masks.empties != 0 {
                // The relaxed Empty may be stale; confirm before giving up.
                let bit = masks.empties.trailing_zeros() as usize;
                let idx = (group_at + bit) & mask;
                if self.ctrl[idx].load(Ordering::Acquire) == EMPTY {
                    return None;
                }
                // No longer Empty: keep probing.
            }
            scanned += GROUP;
        }
        None
    }

    /// Insert the key.
    ///
    /// A slot observed Busy is never skipped, since it may publish this
    /// very key; the probe retries the same slot after a spin hint. Retries
    /// draw from a budget proportional to capacity; exhausting it reports
    /// [`TableError::CapacityExhausted`].
    pub fn insert(&self, key: u64, value: NonNull<V>) -> Result<(), TableError> {
        self.insert_inner(key, value, false)
    }

    /// Insert the key, overwriting the value if the key is present.
    pub fn insert_or_assign(&self, key: u64, value: NonNull<V>) -> Result<(), TableError> {
        self.insert_inner(key, value, true)
    }

    fn insert_inner(&self, key: u64, value: NonNull<V>, assign: bool) -> Result<(), TableError> {
        let (tag, home) = split_hash(key.hash(), self.capacity);
        let mask = self.capacity - 1;
        let mut budget = self.capacity * RETRY_BUDGET_PER_SLOT;

        let mut i = 0;
        while i < self.capacity {
            let pos = (home + i) & mask;
            let c = self.ctrl[pos].load(Ordering::Acquire);

            if c == tag && self.keys[pos].load(Ordering::Relaxed) == key {
                if assign {
                    self.values[pos].store(value.as_ptr(), Ordering::Release);
                    return Ok(());
                }
                return Err(TableError::DuplicateKey);
            }

            if c == EMPTY || c == DELETED {
                match self.ctrl[pos].compare_exchange(
                    c,
                    BUSY,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.keys[pos].store(key, Ordering::Relaxed);
                        self.values[pos].store(value.as_ptr(), Ordering::Release);
                        // Publishing the tag makes key and value visible to
                        // any acquire reader of this control byte.
                        self.ctrl[pos].store(tag, Ordering::Release);
                        self.len.fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    }
                    Err(_) => {
                        // Lost the race for this slot; re-examine it.
                        budget -= 1;
                        if budget == 0 {
                            return Err(TableError::CapacityExhausted);
                        }
                        continue;
                    }
                }
            }

            if c == BUSY {
                // May hold our key once published; do not skip.
                std::hint::spin_loop();
                budget -= 1;
                if budget == 0 {
                    return Err(TableError::CapacityExhausted);
                }
                continue;
            }

            // A different tag (or a same-tag different key): probe on.
            i += 1;
        }
        Err(TableError::CapacityExhausted)
    }

    /// Remove the key, leaving a reclaimable tombstone. Returns whether the
    /// key was present.
    pub fn erase(&self, key: u64) -> bool {
        let (tag, home) = split_hash(key.hash(), self.capacity);
        let mask = self.capacity - 1;

        for i in 0..self.capacity {
            let pos = (home + i) & mask;
            let c = self.ctrl[pos].load(Ordering::Acquire);

            if c == EMPTY {
                return false;
            }
            if c == tag && self.keys[pos].load(Ordering::Acquire) == key {
                let old = self.values[pos].swap(std::ptr::null_mut(), Ordering::AcqRel);
                self.ctrl[pos].store(DELETED, Ordering::Release);
                if !old.is_null() {
                    self.len.fetch_sub(1, Ordering::Relaxed);
                }
                return true;
            }
        }
        false
    }

    /// Live entry count (eventually consistent under concurrency).
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// True when no entries are live.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot count.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reset every slot to Empty, the only way a Deleted slot becomes
    /// Empty again. Callers must quiesce concurrent access first.
    pub fn clear(&self) {
        for pos in 0..self.capacity {
            self.values[pos].store(std::ptr::null_mut(), Ordering::Relaxed);
            self.keys[pos].store(0, Ordering::Relaxed);
            self.ctrl[pos].store(EMPTY, Ordering::Relaxed);
        }
        self.len.store(0, Ordering::Relaxed);
    }

    /// Visit each published entry as `(slot, key, value)`, in slot order.
    /// Empty, Deleted, and Busy slots are skipped.
    pub fn for_each(&self, mut f: impl FnMut(usize, u64, NonNull<V>)) {
        for pos in 0..self.capacity {
            let c = self.ctrl[pos].load(Ordering::Acquire);
            if c & 0x80 == 0 {
                let key = self.keys[pos].load(Ordering::Acquire);
                if let Some(value) = NonNull::new(self.values[pos].load(Ordering::Acquire)) {
                    f(pos, key, value);
                }
            }
        }
    }

    /// Build the per-group masks, SIMD in-bounds and per-byte at the wrap.
    #[inline]
    fn load_group(&self, group_at: usize, tag: u8) -> crate::probe::GroupMasks {
        if group_at + GROUP <= self.capacity {
            // SAFETY: 16 in-bounds control bytes. Reading atomics through a
            // plain SIMD load has relaxed semantics; every byte the result
            // acts on is re-verified with an acquire load.
            unsafe { probe_group(self.ctrl.as_ptr().add(group_at).cast::<u8>(), tag) }
        } else {
            let mask = self.capacity - 1;
            let mut masks = crate::probe::GroupMasks {
                matches: 0,
                empties: 0,
            };
            for k in 0..GROUP {
                let c = self.ctrl[(group_at + k) & mask].load(Ordering::Relaxed);
                masks.matches |= u16::from(c == tag) << k;
                masks.empties |= u16::from(c == EMPTY) << k;
            }
            masks
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leak<V>(v: V) -> NonNull<V> {
        NonNull::from(Box::leak(Box::new(v)))
    }

    #[test]
    fn insert_find_erase_round_trip() {
        let map: HashMapMt<u32> = HashMapMt::new(64);
        let v = leak(11u32);
        map.insert(77, v).expect("insert");
        assert_eq!(map.find(77), Some(v));
        assert_eq!(map.len(), 1);

        assert!(map.erase(77));
        assert_eq!(map.find(77), None);
        assert!(!map.erase(77));
        assert!(map.is_empty());
    }

    #[test]
    fn duplicate_insert_is_rejected_and_assign_overwrites() {
        let map: HashMapMt<u32> = HashMapMt::new(16);
        let a = leak(1u32);
        let b = leak(2u32);
        map.insert(5, a).expect("insert");
        assert_eq!(map.insert(5, b), Err(TableError::DuplicateKey));
        map.insert_or_assign(5, b).expect("assign");
        assert_eq!(map.find(5), Some(b));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn deleted_slots_are_reclaimed() {
        let map: HashMapMt<u32> = HashMapMt::new(16);
        let v = leak(3u32);
        for key in 0..16u64 {
            map.insert(key, v).expect("fill");
        }
        assert_eq!(map.insert(100, v), Err(TableError::CapacityExhausted));

        assert!(map.erase(9));
        map.insert(100, v).expect("reclaim tombstone");
        assert_eq!(map.find(100), Some(v));
        assert_eq!(map.find(9), None);
        assert_eq!(map.len(), 16);
    }

    #[test]
    fn wrap_groups_stay_findable() {
        // Capacity 16 forces most probes through the per-byte wrap path.
        let map: HashMapMt<u32> = HashMapMt::new(16);
        let v = leak(8u32);
        for key in 500..516u64 {
            map.insert(key, v).expect("fill");
        }
        for key in 500..516u64 {
            assert_eq!(map.find(key), Some(v), "key {key}");
        }
        assert_eq!(map.find(999), None);
    }

    #[test]
    fn for_each_visits_only_published_entries() {
        let map: HashMapMt<u32> = HashMapMt::new(32);
        let v = leak(1u32);
        for key in [3u64, 9, 27] {
            map.insert(key, v).expect("insert");
        }
        map.erase(9);

        let mut seen = Vec::new();
        map.for_each(|_, key, _| seen.push(key));
        seen.sort_unstable();
        assert_eq!(seen, vec![3, 27]);
    }

    #[test]
    fn clear_is_the_only_path_back_to_empty() {
        let map: HashMapMt<u32> = HashMapMt::new(16);
        let v = leak(1u32);
        map.insert(1, v).expect("insert");
        map.erase(1);
        // Tombstoned, not empty: a later find must keep probing past it.
        map.insert(1, v).expect("reinsert over tombstone");
        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.find(1), None);
    }
}
