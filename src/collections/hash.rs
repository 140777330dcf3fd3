//! Open-chaining hash map allocated from a shared memory pool.
//!
//! Keys are pointers (pool offsets), strings (stored NUL-terminated in the
//! pool; lookups compare contents) or integers. Values are raw 8-byte
//! slots — ids or offsets. Optional auto-free releases key and/or value
//! allocations on removal and destruction.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::shm::{Pool, SharedPtr};

/// Smallest bucket count.
pub const HASH_MIN_SIZE: u32 = 11;

/// Bucket counts used as the table grows, roughly tripling each step.
const SPACED_PRIMES: &[u32] = &[
    11, 37, 109, 331, 1093, 3271, 9811, 29443, 88339, 265003, 795007, 2385031,
];

/// Key interpretation of a hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum KeyKind {
    /// Keys are pool offsets compared by value.
    Ptr = 0,
    /// Keys are NUL-terminated strings in the pool, compared by content.
    Str = 1,
    /// Keys are integers.
    Int = 2,
}

impl KeyKind {
    fn from_u32(v: u32) -> Self {
        match v {
            1 => KeyKind::Str,
            2 => KeyKind::Int,
            _ => KeyKind::Ptr,
        }
    }
}

/// A lookup key, owned by the caller.
#[derive(Clone, Copy, Debug)]
pub enum KeyRef<'a> {
    /// Pointer key (pool offset).
    Ptr(u32),
    /// String key.
    Str(&'a str),
    /// Integer key.
    Int(u64),
}

/// In-segment state, embeddable in shared structures.
#[repr(C)]
#[derive(Default)]
pub struct HashState {
    key_kind: AtomicU32,
    size: AtomicU32,
    nnodes: AtomicU32,
    /// Offset of the bucket array (`size` u32 node offsets).
    buckets: AtomicU32,
    free_keys: AtomicU32,
    free_values: AtomicU32,
}

#[repr(C)]
#[derive(Default)]
struct HashNode {
    key: AtomicU64,
    value: AtomicU64,
    next: AtomicU32,
}

/// Handle to a shared hash.
#[derive(Clone)]
pub struct SharedHash {
    pool: Pool,
    state: SharedPtr<HashState>,
}

impl SharedHash {
    /// Allocate a new hash.
    pub fn new(pool: &Pool, kind: KeyKind, size: u32) -> Result<Self> {
        let state = pool.alloc_value_labeled(HashState::default(), "hash")?;
        let hash = Self {
            pool: pool.clone(),
            state,
        };

        let size = size.max(HASH_MIN_SIZE);
        let buckets = pool.allocate_labeled(size as usize * 4, "hash buckets")?;
        unsafe {
            pool.bytes_mut(buckets, size as usize * 4).fill(0);
        }

        let shared = hash.state();
        shared.key_kind.store(kind as u32, Ordering::Release);
        shared.size.store(size, Ordering::Release);
        shared.buckets.store(buckets.raw(), Ordering::Release);

        Ok(hash)
    }

    /// Wrap a state embedded in a larger shared structure.
    ///
    /// # Safety
    ///
    /// `state` must address an initialized `HashState` inside `pool`.
    pub unsafe fn from_state(pool: &Pool, state: SharedPtr<HashState>) -> Self {
        Self {
            pool: pool.clone(),
            state,
        }
    }

    /// The state offset, for embedding into shared structures.
    pub fn state_ptr(&self) -> SharedPtr<HashState> {
        self.state
    }

    fn state(&self) -> &HashState {
        unsafe { self.pool.get(self.state) }
    }

    /// Free keys and/or values (as pool offsets) when entries are removed,
    /// replaced or the hash is destroyed.
    pub fn set_autofree(&self, free_keys: bool, free_values: bool) {
        let state = self.state();
        state.free_keys.store(free_keys as u32, Ordering::Release);
        state.free_values.store(free_values as u32, Ordering::Release);
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.state().nnodes.load(Ordering::Acquire) as usize
    }

    /// Whether the hash is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a new entry; fails with `Busy` if the key exists.
    pub fn insert(&self, key: KeyRef<'_>, value: u64) -> Result<()> {
        if self.find(key).is_some() {
            return Err(Error::Busy);
        }
        self.insert_new(key, value)?;
        self.maybe_resize();
        Ok(())
    }

    /// Insert or replace; returns the previous value if any.
    pub fn replace(&self, key: KeyRef<'_>, value: u64) -> Result<Option<u64>> {
        if let Some((_, node_ptr)) = self.find(key) {
            let node = unsafe { self.pool.get(node_ptr) };
            let old = node.value.swap(value, Ordering::AcqRel);
            if self.state().free_values.load(Ordering::Acquire) != 0 && old != 0 {
                let _ = self.pool.deallocate(SharedPtr::from_raw(old as u32));
                return Ok(None);
            }
            return Ok(Some(old));
        }

        self.insert_new(key, value)?;
        self.maybe_resize();
        Ok(None)
    }

    /// Look up a value.
    pub fn lookup(&self, key: KeyRef<'_>) -> Option<u64> {
        self.find(key)
            .map(|(_, node)| unsafe { self.pool.get(node) }.value.load(Ordering::Acquire))
    }

    /// Remove an entry, returning its value unless auto-freed.
    pub fn remove(&self, key: KeyRef<'_>) -> Result<Option<u64>> {
        let state = self.state();
        let (bucket, target) = match self.find(key) {
            Some(found) => found,
            None => return Err(Error::ItemNotFound(format!("{key:?}"))),
        };

        // Unlink from the chain.
        let head = self.bucket_get(bucket);
        if head == target.raw() {
            let next = unsafe { self.pool.get(target) }.next.load(Ordering::Acquire);
            self.bucket_set(bucket, next);
        } else {
            let mut cursor = SharedPtr::<HashNode>::from_raw(head);
            while !cursor.is_null() {
                let node = unsafe { self.pool.get(cursor) };
                let next = node.next.load(Ordering::Acquire);
                if next == target.raw() {
                    let after = unsafe { self.pool.get(target) }.next.load(Ordering::Acquire);
                    node.next.store(after, Ordering::Release);
                    break;
                }
                cursor = SharedPtr::from_raw(next);
            }
        }

        state.nnodes.fetch_sub(1, Ordering::AcqRel);

        let node = unsafe { self.pool.get(target) };
        let stored_key = node.key.load(Ordering::Acquire);
        let value = node.value.load(Ordering::Acquire);

        if state.free_keys.load(Ordering::Acquire) != 0 && stored_key != 0 {
            let _ = self.pool.deallocate(SharedPtr::from_raw(stored_key as u32));
        }
        let value = if state.free_values.load(Ordering::Acquire) != 0 {
            if value != 0 {
                let _ = self.pool.deallocate(SharedPtr::from_raw(value as u32));
            }
            None
        } else {
            Some(value)
        };

        self.pool.deallocate(target.cast())?;
        Ok(value)
    }

    /// Visit every entry; the callback returns `false` to stop early.
    pub fn iterate(&self, mut f: impl FnMut(u64, u64) -> bool) {
        let state = self.state();
        let size = state.size.load(Ordering::Acquire);

        'outer: for bucket in 0..size {
            let mut cursor = SharedPtr::<HashNode>::from_raw(self.bucket_get(bucket));
            while !cursor.is_null() {
                let node = unsafe { self.pool.get(cursor) };
                let next = SharedPtr::from_raw(node.next.load(Ordering::Acquire));
                if !f(
                    node.key.load(Ordering::Acquire),
                    node.value.load(Ordering::Acquire),
                ) {
                    break 'outer;
                }
                cursor = next;
            }
        }
    }

    /// Release every node, honoring auto-free, then the bucket array.
    pub fn destroy(self) -> Result<()> {
        let state = self.state();
        let size = state.size.load(Ordering::Acquire);
        let free_keys = state.free_keys.load(Ordering::Acquire) != 0;
        let free_values = state.free_values.load(Ordering::Acquire) != 0;

        for bucket in 0..size {
            let mut cursor = SharedPtr::<HashNode>::from_raw(self.bucket_get(bucket));
            while !cursor.is_null() {
                let node = unsafe { self.pool.get(cursor) };
                let next = SharedPtr::from_raw(node.next.load(Ordering::Acquire));

                let key = node.key.load(Ordering::Acquire);
                let value = node.value.load(Ordering::Acquire);
                if free_keys && key != 0 {
                    let _ = self.pool.deallocate(SharedPtr::from_raw(key as u32));
                }
                if free_values && value != 0 {
                    let _ = self.pool.deallocate(SharedPtr::from_raw(value as u32));
                }

                self.pool.deallocate(cursor.cast())?;
                cursor = next;
            }
        }

        let buckets = state.buckets.swap(0, Ordering::AcqRel);
        if buckets != 0 {
            self.pool.deallocate(SharedPtr::from_raw(buckets))?;
        }
        self.pool.deallocate(self.state.cast())
    }

    // ----------------------------------------------------------------

    fn kind(&self) -> KeyKind {
        KeyKind::from_u32(self.state().key_kind.load(Ordering::Acquire))
    }

    fn hash_of(&self, key: KeyRef<'_>) -> u64 {
        match key {
            KeyRef::Ptr(p) => p as u64,
            KeyRef::Int(i) => i,
            KeyRef::Str(s) => str_hash(s.as_bytes()),
        }
    }

    fn stored_hash(&self, stored: u64) -> u64 {
        match self.kind() {
            KeyKind::Ptr | KeyKind::Int => stored,
            KeyKind::Str => {
                let s = self.pool.read_str(SharedPtr::from_raw(stored as u32));
                str_hash(s.as_bytes())
            }
        }
    }

    fn matches(&self, key: KeyRef<'_>, stored: u64) -> bool {
        match (self.kind(), key) {
            (KeyKind::Ptr, KeyRef::Ptr(p)) => stored == p as u64,
            (KeyKind::Int, KeyRef::Int(i)) => stored == i,
            (KeyKind::Str, KeyRef::Str(s)) => {
                self.pool.read_str(SharedPtr::from_raw(stored as u32)) == s
            }
            _ => false,
        }
    }

    /// Find the node for `key`, returning (bucket, node).
    fn find(&self, key: KeyRef<'_>) -> Option<(u32, SharedPtr<HashNode>)> {
        let size = self.state().size.load(Ordering::Acquire);
        let bucket = (self.hash_of(key) % size as u64) as u32;

        let mut cursor = SharedPtr::<HashNode>::from_raw(self.bucket_get(bucket));
        while !cursor.is_null() {
            let node = unsafe { self.pool.get(cursor) };
            if self.matches(key, node.key.load(Ordering::Acquire)) {
                return Some((bucket, cursor));
            }
            cursor = SharedPtr::from_raw(node.next.load(Ordering::Acquire));
        }
        None
    }

    fn insert_new(&self, key: KeyRef<'_>, value: u64) -> Result<()> {
        let stored_key = match (self.kind(), key) {
            (KeyKind::Ptr, KeyRef::Ptr(p)) => p as u64,
            (KeyKind::Int, KeyRef::Int(i)) => i,
            (KeyKind::Str, KeyRef::Str(s)) => self.pool.alloc_str(s)?.raw() as u64,
            _ => return Err(Error::InvalidArg("key does not match the hash key kind")),
        };

        let state = self.state();
        let size = state.size.load(Ordering::Acquire);
        let bucket = (self.hash_of(key) % size as u64) as u32;

        let node = HashNode::default();
        node.key.store(stored_key, Ordering::Relaxed);
        node.value.store(value, Ordering::Relaxed);
        node.next.store(self.bucket_get(bucket), Ordering::Relaxed);

        let ptr = self.pool.alloc_value_labeled(node, "hash node")?;
        self.bucket_set(bucket, ptr.raw());
        state.nnodes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn bucket_get(&self, bucket: u32) -> u32 {
        let buckets = self.state().buckets.load(Ordering::Acquire);
        unsafe {
            self.pool
                .base()
                .add(buckets as usize + bucket as usize * 4)
                .cast::<u32>()
                .read()
        }
    }

    fn bucket_set(&self, bucket: u32, off: u32) {
        let buckets = self.state().buckets.load(Ordering::Acquire);
        unsafe {
            self.pool
                .base()
                .add(buckets as usize + bucket as usize * 4)
                .cast::<u32>()
                .write(off)
        }
    }

    /// Grow the bucket array when the load factor reaches 3.
    fn maybe_resize(&self) {
        let state = self.state();
        let size = state.size.load(Ordering::Acquire);
        let nnodes = state.nnodes.load(Ordering::Acquire);

        if nnodes < size.saturating_mul(3) {
            return;
        }
        let Some(&new_size) = SPACED_PRIMES.iter().find(|&&p| p > size) else {
            return;
        };

        let Ok(new_buckets) = self
            .pool
            .allocate_labeled(new_size as usize * 4, "hash buckets")
        else {
            // Growth is an optimization; chains just get longer.
            return;
        };
        unsafe {
            self.pool.bytes_mut(new_buckets, new_size as usize * 4).fill(0);
        }

        let old_buckets = state.buckets.load(Ordering::Acquire);
        let old_size = size;

        // Rehash every node into the new array.
        for bucket in 0..old_size {
            let mut cursor = SharedPtr::<HashNode>::from_raw(self.bucket_get(bucket));
            while !cursor.is_null() {
                let node = unsafe { self.pool.get(cursor) };
                let next = SharedPtr::from_raw(node.next.load(Ordering::Acquire));

                let rehashed =
                    (self.stored_hash(node.key.load(Ordering::Acquire)) % new_size as u64) as usize;
                unsafe {
                    let slot = self
                        .pool
                        .base()
                        .add(new_buckets.raw() as usize + rehashed * 4)
                        .cast::<u32>();
                    node.next.store(slot.read(), Ordering::Release);
                    slot.write(cursor.raw());
                }

                cursor = next;
            }
        }

        state.buckets.store(new_buckets.raw(), Ordering::Release);
        state.size.store(new_size, Ordering::Release);
        let _ = self.pool.deallocate(SharedPtr::from_raw(old_buckets));
    }
}

/// djb2, the classic string hash.
fn str_hash(bytes: &[u8]) -> u64 {
    let mut h: u64 = 5381;
    for &b in bytes {
        h = h.wrapping_mul(33).wrapping_add(b as u64);
    }
    h
}
