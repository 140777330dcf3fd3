//! Growable array allocated from a shared memory pool.
//!
//! Elements are stored by value in 8-byte slots, so anything that round
//! trips through a `u64` — ids, offsets, [`SharedPtr`]s — can be held.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Error, Result};
use crate::shm::{Pool, SharedPtr};

/// Element conversion to the vector's raw slot type.
pub trait VectorItem: Copy {
    /// Encode into a slot.
    fn to_raw(self) -> u64;
    /// Decode from a slot.
    fn from_raw(raw: u64) -> Self;
}

impl VectorItem for u64 {
    fn to_raw(self) -> u64 {
        self
    }
    fn from_raw(raw: u64) -> Self {
        raw
    }
}

impl VectorItem for u32 {
    fn to_raw(self) -> u64 {
        self as u64
    }
    fn from_raw(raw: u64) -> Self {
        raw as u32
    }
}

impl<T> VectorItem for SharedPtr<T> {
    fn to_raw(self) -> u64 {
        self.raw() as u64
    }
    fn from_raw(raw: u64) -> Self {
        SharedPtr::from_raw(raw as u32)
    }
}

/// In-segment state, embeddable in shared structures.
#[repr(C)]
#[derive(Default)]
pub struct VectorState {
    elements: AtomicU32,
    count: AtomicU32,
    capacity: AtomicU32,
}

/// Typed handle to a shared vector.
pub struct SharedVector<T: VectorItem> {
    pool: Pool,
    state: SharedPtr<VectorState>,
    _marker: PhantomData<T>,
}

impl<T: VectorItem> Clone for SharedVector<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            state: self.state,
            _marker: PhantomData,
        }
    }
}

impl<T: VectorItem> SharedVector<T> {
    /// Allocate a new vector with the given initial capacity.
    pub fn new(pool: &Pool, capacity: usize) -> Result<Self> {
        let state = pool.alloc_value_labeled(VectorState::default(), "vector")?;
        let vector = Self {
            pool: pool.clone(),
            state,
            _marker: PhantomData,
        };
        vector.reserve(capacity.max(1))?;
        Ok(vector)
    }

    /// Wrap a state embedded in a larger shared structure, allocating the
    /// element storage if needed.
    ///
    /// # Safety
    ///
    /// `state` must address an initialized `VectorState` inside `pool`.
    pub unsafe fn from_state(pool: &Pool, state: SharedPtr<VectorState>) -> Self {
        Self {
            pool: pool.clone(),
            state,
            _marker: PhantomData,
        }
    }

    fn state(&self) -> &VectorState {
        unsafe { self.pool.get(self.state) }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.state().count.load(Ordering::Acquire) as usize
    }

    /// Whether the vector is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append an element.
    pub fn add(&self, item: T) -> Result<()> {
        let count = self.len();
        self.ensure(count + 1)?;
        self.write_slot(count, item.to_raw());
        self.state().count.store(count as u32 + 1, Ordering::Release);
        Ok(())
    }

    /// Insert an element at `index`, shifting the tail up.
    pub fn insert(&self, item: T, index: usize) -> Result<()> {
        let count = self.len();
        if index > count {
            return Err(Error::InvalidArg("vector insert index out of bounds"));
        }
        self.ensure(count + 1)?;

        for i in (index..count).rev() {
            let raw = self.read_slot(i);
            self.write_slot(i + 1, raw);
        }
        self.write_slot(index, item.to_raw());
        self.state().count.store(count as u32 + 1, Ordering::Release);
        Ok(())
    }

    /// Move the element at `from` to position `to`.
    pub fn move_item(&self, from: usize, to: usize) -> Result<()> {
        let count = self.len();
        if from >= count || to >= count {
            return Err(Error::InvalidArg("vector move index out of bounds"));
        }

        let item = self.read_slot(from);
        if from < to {
            for i in from..to {
                let raw = self.read_slot(i + 1);
                self.write_slot(i, raw);
            }
        } else {
            for i in (to..from).rev() {
                let raw = self.read_slot(i);
                self.write_slot(i + 1, raw);
            }
        }
        self.write_slot(to, item);
        Ok(())
    }

    /// Remove and return the element at `index`, shifting the tail down.
    pub fn remove(&self, index: usize) -> Result<T> {
        let count = self.len();
        if index >= count {
            return Err(Error::InvalidArg("vector remove index out of bounds"));
        }

        let item = self.read_slot(index);
        for i in index..count - 1 {
            let raw = self.read_slot(i + 1);
            self.write_slot(i, raw);
        }
        self.state().count.store(count as u32 - 1, Ordering::Release);
        Ok(T::from_raw(item))
    }

    /// The element at `index`.
    pub fn at(&self, index: usize) -> Option<T> {
        if index >= self.len() {
            return None;
        }
        Some(T::from_raw(self.read_slot(index)))
    }

    /// Index of the first element equal to `item`, searching most recently
    /// added first.
    pub fn index_of(&self, item: T) -> Option<usize> {
        let raw = item.to_raw();
        (0..self.len()).rev().find(|&i| self.read_slot(i) == raw)
    }

    /// Whether `item` is contained.
    pub fn contains(&self, item: T) -> bool {
        self.index_of(item).is_some()
    }

    /// Snapshot the contents.
    pub fn to_vec(&self) -> Vec<T> {
        (0..self.len()).map(|i| T::from_raw(self.read_slot(i))).collect()
    }

    /// Release the element storage. The state itself is released with the
    /// structure that embeds it.
    pub fn destroy(self) -> Result<()> {
        let elements = self.state().elements.swap(0, Ordering::AcqRel);
        if elements != 0 {
            self.pool.deallocate(SharedPtr::from_raw(elements))?;
        }
        self.state().count.store(0, Ordering::Release);
        self.state().capacity.store(0, Ordering::Release);
        Ok(())
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        let capacity = self.state().capacity.load(Ordering::Acquire) as usize;
        if needed <= capacity {
            return Ok(());
        }
        self.reserve((capacity * 2).max(needed).max(4))
    }

    fn reserve(&self, capacity: usize) -> Result<()> {
        let state = self.state();
        let old = state.elements.load(Ordering::Acquire);
        let new = if old == 0 {
            self.pool.allocate_labeled(capacity * 8, "vector elements")?
        } else {
            self.pool
                .reallocate(SharedPtr::from_raw(old), capacity * 8)?
        };
        state.elements.store(new.raw(), Ordering::Release);
        state.capacity.store(capacity as u32, Ordering::Release);
        Ok(())
    }

    fn read_slot(&self, index: usize) -> u64 {
        let elements = self.state().elements.load(Ordering::Acquire);
        unsafe {
            self.pool
                .base()
                .add(elements as usize + index * 8)
                .cast::<u64>()
                .read()
        }
    }

    fn write_slot(&self, index: usize, raw: u64) {
        let elements = self.state().elements.load(Ordering::Acquire);
        unsafe {
            self.pool
                .base()
                .add(elements as usize + index * 8)
                .cast::<u64>()
                .write(raw)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::FusionConfig;

    fn test_pool() -> (tempfile::TempDir, Pool) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fusion.vec.pool");
        let pool = Pool::create(&path, "vec", 1, 1024 * 1024, &FusionConfig::default(), 1).unwrap();
        (dir, pool)
    }

    #[test]
    fn test_add_and_growth() {
        let (_dir, pool) = test_pool();
        let vector: SharedVector<u64> = SharedVector::new(&pool, 2).unwrap();

        for i in 0..100u64 {
            vector.add(i).unwrap();
        }
        assert_eq!(vector.len(), 100);
        for i in 0..100u64 {
            assert_eq!(vector.at(i as usize), Some(i));
        }

        vector.destroy().unwrap();
    }

    #[test]
    fn test_insert_remove_move() {
        let (_dir, pool) = test_pool();
        let vector: SharedVector<u32> = SharedVector::new(&pool, 4).unwrap();

        vector.add(1).unwrap();
        vector.add(3).unwrap();
        vector.insert(2, 1).unwrap();
        assert_eq!(vector.to_vec(), vec![1, 2, 3]);

        vector.move_item(0, 2).unwrap();
        assert_eq!(vector.to_vec(), vec![2, 3, 1]);

        assert_eq!(vector.remove(1).unwrap(), 3);
        assert_eq!(vector.to_vec(), vec![2, 1]);

        vector.destroy().unwrap();
    }

    #[test]
    fn test_contains_and_index_of() {
        let (_dir, pool) = test_pool();
        let vector: SharedVector<u32> = SharedVector::new(&pool, 4).unwrap();

        vector.add(10).unwrap();
        vector.add(20).unwrap();

        assert!(vector.contains(10));
        assert!(!vector.contains(30));
        assert_eq!(vector.index_of(20), Some(1));

        vector.destroy().unwrap();
    }

    #[test]
    fn test_out_of_bounds() {
        let (_dir, pool) = test_pool();
        let vector: SharedVector<u32> = SharedVector::new(&pool, 4).unwrap();

        assert!(vector.remove(0).is_err());
        assert!(vector.insert(1, 5).is_err());
        assert_eq!(vector.at(0), None);

        vector.destroy().unwrap();
    }
}
