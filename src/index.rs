//! Pointer index keyed by 128-bit identifiers.
//!
//! A [`HashIndex`] maps a `(u64, u64)` key pair to the address of a referent
//! plus a small type tag. The table is an array of power-of-two buckets, each
//! a chain of 64-byte cache lines holding eight packed entries; the head line
//! lives inline in the bucket array. Each entry stores 16 secondary hash bits
//! so most non-matching candidates are rejected without touching the
//! referent.
//!
//! The index is single-threaded; callers synchronize externally.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr::NonNull;

/// Bytes per cache line; one bucket head or overflow line occupies exactly
/// this much.
pub const BYTES_PER_CACHE_LINE: usize = 64;

/// Packed entries per cache line.
pub const ENTRIES_PER_CACHE_LINE: usize = BYTES_PER_CACHE_LINE / 8;

/// Maximum number of type tag bits an index may reserve.
pub const MAX_TYPE_BITS: u8 = 8;

const POINTER_MASK: u64 = 0x0000_7fff_ffff_ffff;

/// Implemented by everything stored in a [`HashIndex`]; the index reads the
/// key pair back out of the referent to resolve secondary-hash collisions.
pub trait Referent {
    fn key1(&self) -> u64;
    fn key2(&self) -> u64;
}

/// One packed index entry.
///
/// Bits, MSB to LSB: 16 secondary hash, 1 chain flag, `type_bits` tag,
/// `47 - type_bits` pointer. The all-zero value is an empty entry. A chain
/// entry repurposes the pointer field to name the next cache line of the
/// bucket and may only sit in the last slot of a non-terminal line.
#[derive(Clone, Copy)]
struct Entry {
    value: u64,
}

struct UnpackedEntry {
    hash: u64,
    chain: bool,
    tag: u8,
    ptr: u64,
}

impl Entry {
    #[inline]
    fn clear(&mut self) {
        self.value = 0;
    }

    fn unpack(&self, type_bits: u8) -> UnpackedEntry {
        let value = self.value;
        let tag = if type_bits != 0 {
            ((value >> (47 - type_bits)) & ((1u64 << type_bits) - 1)) as u8
        } else {
            0
        };
        UnpackedEntry {
            hash: value >> 48,
            chain: (value >> 47) & 1 == 1,
            tag,
            ptr: value & (POINTER_MASK >> type_bits),
        }
    }

    fn pack(&mut self, hash: u64, chain: bool, ptr: u64, tag: u8, type_bits: u8) {
        if ptr == 0 {
            debug_assert!(hash == 0 && !chain);
        }
        assert!(type_bits <= MAX_TYPE_BITS, "too many type bits");
        assert!(
            type_bits == 0 || u64::from(tag) < (1u64 << type_bits),
            "tag {} does not fit in {} type bits",
            tag,
            type_bits,
        );
        assert!(
            ptr & !(POINTER_MASK >> type_bits) == 0,
            "pointer {:#x} cannot fit in {} bits; stack address?",
            ptr,
            47 - type_bits,
        );
        debug_assert!(hash <= 0xffff);

        let tag_field = if type_bits != 0 {
            u64::from(tag) << (47 - type_bits)
        } else {
            0
        };
        self.value = (hash << 48) | (u64::from(chain) << 47) | tag_field | ptr;
    }

    fn set_referent(&mut self, hash: u64, ptr: u64, tag: u8, type_bits: u8) {
        debug_assert!(ptr != 0);
        self.pack(hash, false, ptr, tag, type_bits);
    }

    fn set_chain(&mut self, line: u64, type_bits: u8) {
        debug_assert!(line != 0);
        self.pack(0, true, line, 0, type_bits);
    }

    #[inline]
    fn is_available(&self, type_bits: u8) -> bool {
        self.unpack(type_bits).ptr == 0
    }

    #[inline]
    fn hash_matches(&self, hash: u64, type_bits: u8) -> bool {
        let ue = self.unpack(type_bits);
        !ue.chain && ue.ptr != 0 && ue.hash == hash
    }

    fn chain_pointer(&self, type_bits: u8) -> Option<NonNull<CacheLine>> {
        let ue = self.unpack(type_bits);
        if !ue.chain {
            return None;
        }
        NonNull::new(ue.ptr as *mut CacheLine)
    }
}

#[repr(C, align(64))]
struct CacheLine {
    entries: [Entry; ENTRIES_PER_CACHE_LINE],
}

const _: () = assert!(std::mem::size_of::<CacheLine>() == BYTES_PER_CACHE_LINE);

/// Performance counters kept by the index.
#[derive(Default)]
pub struct PerfCounters {
    lookup_calls: Cell<u64>,
    hash_collisions: Cell<u64>,
    lookup_chains_followed: Cell<u64>,
    insert_chains_followed: Cell<u64>,
}

impl PerfCounters {
    /// Number of entry lookups performed.
    pub fn lookup_calls(&self) -> u64 {
        self.lookup_calls.get()
    }

    /// Times a probed entry matched on secondary hash but the referent's
    /// keys disagreed.
    pub fn hash_collisions(&self) -> u64 {
        self.hash_collisions.get()
    }

    /// Chain pointers followed across all lookups.
    pub fn lookup_chains_followed(&self) -> u64 {
        self.lookup_chains_followed.get()
    }

    /// Chain pointers followed while inserting.
    pub fn insert_chains_followed(&self) -> u64 {
        self.insert_chains_followed.get()
    }

    /// Zero all counters.
    pub fn reset(&self) {
        self.lookup_calls.set(0);
        self.hash_collisions.set(0);
        self.lookup_chains_followed.set(0);
        self.insert_chains_followed.set(0);
    }
}

/// A map from `(u64, u64)` keys to tagged referent addresses.
pub struct HashIndex<T: Referent> {
    buckets: NonNull<CacheLine>,
    num_buckets: u64,
    type_bits: u8,
    counters: PerfCounters,
    _marker: PhantomData<*const T>,
}

impl<T: Referent> HashIndex<T> {
    /// Create an index with `num_buckets` buckets (rounded down to a power
    /// of two) and `type_bits` bits of per-entry tag (0..=8).
    ///
    /// # Panics
    /// Panics if `num_buckets` is 0 or `type_bits` exceeds
    /// [`MAX_TYPE_BITS`].
    pub fn new(num_buckets: u64, type_bits: u8) -> Self {
        assert!(num_buckets > 0, "hash index needs at least one bucket");
        assert!(type_bits <= MAX_TYPE_BITS, "too many type bits");
        let num_buckets = nearest_power_of_two(num_buckets);

        let layout = Self::buckets_layout(num_buckets);
        let buckets = unsafe {
            let ptr = alloc_zeroed(layout);
            assert!(!ptr.is_null(), "bucket allocation failed");
            NonNull::new_unchecked(ptr as *mut CacheLine)
        };

        Self {
            buckets,
            num_buckets,
            type_bits,
            counters: PerfCounters::default(),
            _marker: PhantomData,
        }
    }

    fn buckets_layout(num_buckets: u64) -> Layout {
        Layout::from_size_align(
            num_buckets as usize * BYTES_PER_CACHE_LINE,
            BYTES_PER_CACHE_LINE,
        )
        .unwrap()
    }

    /// Number of buckets allocated to the index.
    #[inline]
    pub fn num_buckets(&self) -> u64 {
        self.num_buckets
    }

    /// Read-only view of the performance counters.
    pub fn perf_counters(&self) -> &PerfCounters {
        &self.counters
    }

    /// Find the referent for a key, if present.
    pub fn lookup(&self, key1: u64, key2: u64) -> Option<(NonNull<T>, u8)> {
        let (bucket, secondary) = self.find_bucket(key1, key2);
        let entry = self.lookup_entry(bucket, secondary, key1, key2)?;
        let ue = unsafe { entry.as_ref() }.unpack(self.type_bits);
        Some((NonNull::new(ue.ptr as *mut T)?, ue.tag))
    }

    /// Insert a referent, replacing any existing entry for the same key.
    /// Returns the replaced referent and tag, if any.
    ///
    /// # Safety
    /// `referent` must stay valid, at a stable address, with stable keys,
    /// until it is removed from the index or the index is dropped; `lookup`
    /// dereferences it to resolve collisions.
    pub unsafe fn insert_or_replace(
        &mut self,
        referent: NonNull<T>,
        tag: u8,
    ) -> Option<(NonNull<T>, u8)> {
        let (key1, key2) = {
            let r = unsafe { referent.as_ref() };
            (r.key1(), r.key2())
        };
        let (bucket, secondary) = self.find_bucket(key1, key2);

        if let Some(mut entry) = self.lookup_entry(bucket, secondary, key1, key2) {
            let entry = unsafe { entry.as_mut() };
            let old = entry.unpack(self.type_bits);
            entry.set_referent(
                secondary,
                referent.as_ptr() as u64,
                tag,
                self.type_bits,
            );
            return Some((NonNull::new(old.ptr as *mut T)?, old.tag));
        }

        let mut line = bucket;
        loop {
            let entries = unsafe { &mut line.as_mut().entries };
            for entry in entries.iter_mut() {
                if entry.is_available(self.type_bits) {
                    entry.set_referent(
                        secondary,
                        referent.as_ptr() as u64,
                        tag,
                        self.type_bits,
                    );
                    return None;
                }
            }

            let last = &mut entries[ENTRIES_PER_CACHE_LINE - 1];
            match last.chain_pointer(self.type_bits) {
                Some(next) => line = next,
                None => {
                    // Terminal line is full: chain a fresh line, migrating
                    // the displaced last entry into its first slot.
                    let fresh = Self::allocate_line();
                    unsafe {
                        (*fresh.as_ptr()).entries[0] = *last;
                    }
                    last.set_chain(fresh.as_ptr() as u64, self.type_bits);
                    line = fresh;
                }
            }
            self.counters
                .insert_chains_followed
                .set(self.counters.insert_chains_followed.get() + 1);
        }
    }

    /// Remove the entry for a key, returning its referent and tag.
    pub fn remove(&mut self, key1: u64, key2: u64) -> Option<(NonNull<T>, u8)> {
        let (bucket, secondary) = self.find_bucket(key1, key2);
        let mut entry = self.lookup_entry(bucket, secondary, key1, key2)?;
        let entry = unsafe { entry.as_mut() };
        let ue = entry.unpack(self.type_bits);
        entry.clear();
        Some((NonNull::new(ue.ptr as *mut T)?, ue.tag))
    }

    /// Invoke `callback` on every live referent in one bucket. Returns the
    /// number of callbacks fired.
    pub fn for_each_in_bucket<F>(&self, bucket_index: u64, mut callback: F) -> u64
    where
        F: FnMut(NonNull<T>, u8),
    {
        assert!(bucket_index < self.num_buckets);
        let mut calls = 0;
        let mut line =
            unsafe { NonNull::new_unchecked(self.buckets.as_ptr().add(bucket_index as usize)) };
        loop {
            let entries = unsafe { &line.as_ref().entries };
            for entry in entries.iter() {
                if !entry.is_available(self.type_bits)
                    && entry.chain_pointer(self.type_bits).is_none()
                {
                    let ue = entry.unpack(self.type_bits);
                    if let Some(ptr) = NonNull::new(ue.ptr as *mut T) {
                        callback(ptr, ue.tag);
                        calls += 1;
                    }
                }
            }
            match entries[ENTRIES_PER_CACHE_LINE - 1].chain_pointer(self.type_bits) {
                Some(next) => line = next,
                None => return calls,
            }
        }
    }

    /// Invoke `callback` on every live referent in the index. Returns the
    /// number of callbacks fired.
    pub fn for_each<F>(&self, mut callback: F) -> u64
    where
        F: FnMut(NonNull<T>, u8),
    {
        let mut calls = 0;
        for bucket in 0..self.num_buckets {
            calls += self.for_each_in_bucket(bucket, &mut callback);
        }
        calls
    }

    fn allocate_line() -> NonNull<CacheLine> {
        let layout = Layout::from_size_align(BYTES_PER_CACHE_LINE, BYTES_PER_CACHE_LINE).unwrap();
        unsafe {
            let ptr = alloc_zeroed(layout);
            assert!(!ptr.is_null(), "cache line allocation failed");
            NonNull::new_unchecked(ptr as *mut CacheLine)
        }
    }

    /// Bucket head line and 16 secondary hash bits for a key.
    fn find_bucket(&self, key1: u64, key2: u64) -> (NonNull<CacheLine>, u64) {
        let hash_value = hash64(key1) ^ hash64(key2);
        let bucket_hash = hash_value & 0x0000_ffff_ffff_ffff;
        let secondary = hash_value >> 48;
        let index = (bucket_hash & (self.num_buckets - 1)) as usize;
        let line = unsafe { NonNull::new_unchecked(self.buckets.as_ptr().add(index)) };
        (line, secondary)
    }

    /// Walk a bucket's chain for the entry matching a key. The secondary
    /// hash rejects most candidates; survivors are confirmed against the
    /// referent's own keys.
    fn lookup_entry(
        &self,
        bucket: NonNull<CacheLine>,
        secondary: u64,
        key1: u64,
        key2: u64,
    ) -> Option<NonNull<Entry>> {
        self.counters
            .lookup_calls
            .set(self.counters.lookup_calls.get() + 1);

        let mut line = bucket;
        loop {
            let entries = unsafe { &line.as_ref().entries };
            for (i, entry) in entries.iter().enumerate() {
                if entry.hash_matches(secondary, self.type_bits) {
                    let ue = entry.unpack(self.type_bits);
                    let referent = unsafe { &*(ue.ptr as *const T) };
                    if referent.key1() == key1 && referent.key2() == key2 {
                        let ptr = unsafe {
                            NonNull::new_unchecked(line.as_ref().entries.as_ptr().add(i) as *mut Entry)
                        };
                        return Some(ptr);
                    }
                    self.counters
                        .hash_collisions
                        .set(self.counters.hash_collisions.get() + 1);
                }
            }

            match entries[ENTRIES_PER_CACHE_LINE - 1].chain_pointer(self.type_bits) {
                Some(next) => {
                    self.counters
                        .lookup_chains_followed
                        .set(self.counters.lookup_chains_followed.get() + 1);
                    line = next;
                }
                None => return None,
            }
        }
    }
}

impl<T: Referent> Drop for HashIndex<T> {
    fn drop(&mut self) {
        let line_layout =
            Layout::from_size_align(BYTES_PER_CACHE_LINE, BYTES_PER_CACHE_LINE).unwrap();
        for bucket in 0..self.num_buckets {
            let head = unsafe { &*self.buckets.as_ptr().add(bucket as usize) };
            let mut next =
                head.entries[ENTRIES_PER_CACHE_LINE - 1].chain_pointer(self.type_bits);
            while let Some(line) = next {
                next = unsafe { line.as_ref() }.entries[ENTRIES_PER_CACHE_LINE - 1]
                    .chain_pointer(self.type_bits);
                unsafe { dealloc(line.as_ptr() as *mut u8, line_layout) };
            }
        }
        unsafe {
            dealloc(
                self.buckets.as_ptr() as *mut u8,
                Self::buckets_layout(self.num_buckets),
            );
        }
    }
}

/// Largest power of two less than or equal to `n`.
fn nearest_power_of_two(n: u64) -> u64 {
    if n & (n - 1) == 0 {
        n
    } else {
        1 << (63 - n.leading_zeros())
    }
}

/// 64-bit mixing hash (Thomas Wang's hash64shift).
pub(crate) fn hash64(mut key: u64) -> u64 {
    key = (!key).wrapping_add(key << 21);
    key ^= key >> 24;
    key = key.wrapping_add(key << 3).wrapping_add(key << 8);
    key ^= key >> 14;
    key = key.wrapping_add(key << 2).wrapping_add(key << 4);
    key ^= key >> 28;
    key = key.wrapping_add(key << 31);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Obj {
        key1: u64,
        key2: u64,
        value: u32,
    }

    impl Referent for Obj {
        fn key1(&self) -> u64 {
            self.key1
        }
        fn key2(&self) -> u64 {
            self.key2
        }
    }

    fn boxed(key1: u64, key2: u64, value: u32) -> Box<Obj> {
        Box::new(Obj { key1, key2, value })
    }

    fn ptr_of(obj: &Obj) -> NonNull<Obj> {
        NonNull::from(obj)
    }

    #[test]
    fn test_nearest_power_of_two() {
        assert_eq!(nearest_power_of_two(1), 1);
        assert_eq!(nearest_power_of_two(2), 2);
        assert_eq!(nearest_power_of_two(3), 2);
        assert_eq!(nearest_power_of_two(1024), 1024);
        assert_eq!(nearest_power_of_two(1025), 1024);
    }

    #[test]
    fn test_round_trip() {
        let mut index: HashIndex<Obj> = HashIndex::new(64, 0);
        let a = boxed(1, 2, 10);

        unsafe {
            assert!(index.insert_or_replace(ptr_of(&a), 0).is_none());
        }
        let (found, tag) = index.lookup(1, 2).unwrap();
        assert_eq!(unsafe { found.as_ref() }.value, 10);
        assert_eq!(tag, 0);

        let (removed, _) = index.remove(1, 2).unwrap();
        assert_eq!(removed, ptr_of(&a));
        assert!(index.lookup(1, 2).is_none());
        assert!(index.remove(1, 2).is_none());
    }

    #[test]
    fn test_replace_returns_old() {
        let mut index: HashIndex<Obj> = HashIndex::new(64, 0);
        let a = boxed(7, 8, 1);
        let b = boxed(7, 8, 2);

        unsafe {
            assert!(index.insert_or_replace(ptr_of(&a), 0).is_none());
            let (old, _) = index.insert_or_replace(ptr_of(&b), 0).unwrap();
            assert_eq!(old, ptr_of(&a));
        }
        let (found, _) = index.lookup(7, 8).unwrap();
        assert_eq!(unsafe { found.as_ref() }.value, 2);
    }

    #[test]
    fn test_type_tags() {
        let mut index: HashIndex<Obj> = HashIndex::new(16, 3);
        let a = boxed(3, 4, 30);

        unsafe {
            index.insert_or_replace(ptr_of(&a), 5);
        }
        let (_, tag) = index.lookup(3, 4).unwrap();
        assert_eq!(tag, 5);
        let (_, tag) = index.remove(3, 4).unwrap();
        assert_eq!(tag, 5);
    }

    #[test]
    #[should_panic(expected = "tag")]
    fn test_tag_overflow_panics() {
        let mut index: HashIndex<Obj> = HashIndex::new(16, 2);
        let a = boxed(3, 4, 30);
        unsafe {
            index.insert_or_replace(ptr_of(&a), 4);
        }
    }

    #[test]
    fn test_chain_overflow_in_one_bucket() {
        // One bucket so every key lands in it; 17 referents force the head
        // line to spill into two overflow lines.
        let mut index: HashIndex<Obj> = HashIndex::new(1, 0);
        let objs: Vec<Box<Obj>> = (0..17).map(|i| boxed(i, i * 31, i as u32)).collect();

        for obj in &objs {
            unsafe {
                assert!(index.insert_or_replace(ptr_of(obj), 0).is_none());
            }
        }

        for obj in &objs {
            let (found, _) = index.lookup(obj.key1, obj.key2).unwrap();
            assert_eq!(unsafe { found.as_ref() }.value, obj.value);
        }

        let mut seen = Vec::new();
        let calls = index.for_each_in_bucket(0, |ptr, _| {
            seen.push(unsafe { ptr.as_ref() }.value);
        });
        assert_eq!(calls, 17);
        seen.sort_unstable();
        assert_eq!(seen, (0..17).collect::<Vec<u32>>());
    }

    #[test]
    fn test_for_each_visits_once_after_deletions() {
        let mut index: HashIndex<Obj> = HashIndex::new(4, 0);
        let objs: Vec<Box<Obj>> = (0..40).map(|i| boxed(i, 1000 + i, i as u32)).collect();

        for obj in &objs {
            unsafe {
                index.insert_or_replace(ptr_of(obj), 0);
            }
        }
        for obj in objs.iter().step_by(3) {
            index.remove(obj.key1, obj.key2).unwrap();
        }

        let expected: Vec<u32> = (0..40u32).filter(|i| i % 3 != 0).collect();
        let mut seen = Vec::new();
        let calls = index.for_each(|ptr, _| {
            seen.push(unsafe { ptr.as_ref() }.value);
        });
        assert_eq!(calls as usize, expected.len());
        seen.sort_unstable();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_secondary_hash_collision_counter() {
        // One bucket, so a collision only needs matching top-16 hash bits.
        let mut index: HashIndex<Obj> = HashIndex::new(1, 0);
        let a = boxed(1, 1, 100);
        let a_secondary = (hash64(1) ^ hash64(1)) >> 48;

        let mut bk2 = 2u64;
        loop {
            if (hash64(1) ^ hash64(bk2)) >> 48 == a_secondary && bk2 != 1 {
                break;
            }
            bk2 += 1;
        }
        let b = boxed(1, bk2, 200);

        unsafe {
            index.insert_or_replace(ptr_of(&a), 0);
            index.insert_or_replace(ptr_of(&b), 0);
        }

        index.perf_counters().reset();
        let (found, _) = index.lookup(1, bk2).unwrap();
        assert_eq!(unsafe { found.as_ref() }.value, 200);
        // The probe touched A first: same secondary hash, different keys.
        assert_eq!(index.perf_counters().hash_collisions(), 1);
        assert_eq!(index.perf_counters().lookup_calls(), 1);

        index.perf_counters().reset();
        let (found, _) = index.lookup(1, 1).unwrap();
        assert_eq!(unsafe { found.as_ref() }.value, 100);
        assert_eq!(index.perf_counters().hash_collisions(), 0);
    }
}
