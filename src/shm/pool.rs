//! Shared memory pool: lifecycle wrapper around one segment and one heap.
//!
//! A pool has a local half (this process's attachment: mapping, fd, role)
//! and a shared half (`PoolShared`) living at offset 0 of the segment,
//! replicated by the mapping into every attached process. The shared half
//! carries the pool skirmish, so any fusionee can allocate after taking the
//! lock.
//!
//! Pointers into the pool are [`SharedPtr`] values: typed, pool-relative
//! byte offsets. The local address is computed on access, which keeps every
//! in-segment structure valid no matter where each process maps the
//! segment.

use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::conf::FusionConfig;
use crate::error::{Error, Result};
use crate::shm::heap::{self, Heap};
use crate::shm::segment::Segment;
use crate::sync::skirmish::SkirmishState;

const POOL_MAGIC: u64 = 0x4655_5350_4f4f_4c31; // "FUSPOOL1"
const POOL_VERSION: u32 = 1;
const POOL_NAME_LEN: usize = 64;

/// Statistics of a pool's heap.
pub type PoolStats = heap::HeapStats;

/// A typed, pool-relative pointer.
///
/// The null value is offset 0 (the pool header lives there, so no
/// allocation can ever produce it).
#[repr(transparent)]
pub struct SharedPtr<T> {
    off: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SharedPtr<T> {
    /// The null pointer.
    pub const fn null() -> Self {
        Self {
            off: 0,
            _marker: PhantomData,
        }
    }

    /// Construct from a raw offset (e.g. received over the wire).
    pub const fn from_raw(off: u32) -> Self {
        Self {
            off,
            _marker: PhantomData,
        }
    }

    /// The raw offset.
    pub const fn raw(&self) -> u32 {
        self.off
    }

    /// Whether this is the null pointer.
    pub const fn is_null(&self) -> bool {
        self.off == 0
    }

    /// Reinterpret the target type.
    pub const fn cast<U>(&self) -> SharedPtr<U> {
        SharedPtr {
            off: self.off,
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for SharedPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for SharedPtr<T> {}

impl<T> PartialEq for SharedPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.off == other.off
    }
}
impl<T> Eq for SharedPtr<T> {}

impl<T> std::hash::Hash for SharedPtr<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.off.hash(state);
    }
}

impl<T> std::fmt::Debug for SharedPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedPtr<{}>({:#x})", std::any::type_name::<T>(), self.off)
    }
}

/// Shared half of the pool, at offset 0 of the segment.
#[repr(C)]
struct PoolShared {
    magic: AtomicU64,
    version: AtomicU32,
    pool_id: AtomicU32,
    debug: AtomicU32,
    _pad: u32,
    /// Pool lock; guards the heap and the debug allocation list.
    lock: SkirmishState,
    /// Head of the debug allocation descriptor list.
    allocs_head: AtomicU32,
    /// Offset of the user's root structure (e.g. the world header).
    user_root: AtomicU32,
    name: [u8; POOL_NAME_LEN],
}

/// Descriptor placed in front of every allocation when debug tracking is
/// on.
#[repr(C)]
struct AllocDesc {
    next: u32,
    bytes: u32,
    fusion_id: u32,
    label: [u8; 36],
}

const DESC_SIZE: usize = std::mem::size_of::<AllocDesc>();

fn heap_off() -> usize {
    let end = std::mem::size_of::<PoolShared>();
    (end + 63) & !63
}

struct PoolInner {
    segment: Segment,
    heap: Heap,
    fusion_id: u32,
    debug: bool,
}

// SAFETY: the segment is shared memory; the heap handle is just the mapping
// base. Mutation is guarded by the in-segment pool skirmish.
unsafe impl Send for PoolInner {}
unsafe impl Sync for PoolInner {}

/// Handle to a shared memory pool. Cheap to clone.
#[derive(Clone)]
pub struct Pool(Arc<PoolInner>);

impl Pool {
    /// Create a new pool backed by a fresh segment file.
    ///
    /// The file is sized to `max_size` up front; tmpfs commits pages only
    /// when touched.
    pub fn create(
        path: &Path,
        name: &str,
        pool_id: u32,
        max_size: usize,
        conf: &FusionConfig,
        fusion_id: u32,
    ) -> Result<Self> {
        let mode = if conf.secure_fusion { 0o640 } else { 0o660 };
        let segment = Segment::create(path, max_size, conf.shmfile_gid, mode)?;

        let heap = unsafe { Heap::init(segment.as_ptr(), heap_off(), max_size)? };

        let pool = Self(Arc::new(PoolInner {
            segment,
            heap,
            fusion_id,
            debug: conf.debug_shm,
        }));

        let shared = pool.shared();
        shared.pool_id.store(pool_id, Ordering::Release);
        shared.debug.store(conf.debug_shm as u32, Ordering::Release);

        // The name array is written once here, before any other process can
        // attach.
        let name_bytes = name.as_bytes();
        let len = name_bytes.len().min(POOL_NAME_LEN - 1);
        unsafe {
            let dst = pool.base().add(std::mem::offset_of!(PoolShared, name));
            std::ptr::copy_nonoverlapping(name_bytes.as_ptr(), dst, len);
        }

        shared.version.store(POOL_VERSION, Ordering::Release);
        shared.magic.store(POOL_MAGIC, Ordering::Release);

        tracing::debug!(name, pool_id, max_size, "created shared memory pool");

        Ok(pool)
    }

    /// Attach to an existing pool.
    ///
    /// `writable` is false for secure-fusion slaves; allocation attempts
    /// then fail with `AccessDenied`.
    pub fn attach(path: &Path, max_size: usize, writable: bool, fusion_id: u32) -> Result<Self> {
        let segment = Segment::attach(path, max_size, writable)?;
        let heap = unsafe { Heap::open(segment.as_ptr(), heap_off())? };

        let pool = Self(Arc::new(PoolInner {
            segment,
            heap,
            fusion_id,
            debug: false,
        }));

        let shared = pool.shared();
        if shared.magic.load(Ordering::Acquire) != POOL_MAGIC {
            return Err(Error::Init("pool magic mismatch".into()));
        }
        let version = shared.version.load(Ordering::Acquire);
        if version != POOL_VERSION {
            return Err(Error::VersionMismatch {
                ours: POOL_VERSION,
                theirs: version,
            });
        }

        Ok(pool)
    }

    /// The pool's id within its world.
    pub fn id(&self) -> u32 {
        self.shared().pool_id.load(Ordering::Acquire)
    }

    /// The pool's name.
    pub fn name(&self) -> String {
        let shared = self.shared();
        let len = shared.name.iter().position(|&b| b == 0).unwrap_or(POOL_NAME_LEN);
        String::from_utf8_lossy(&shared.name[..len]).into_owned()
    }

    /// Whether this attachment may mutate the pool.
    pub fn writable(&self) -> bool {
        self.0.segment.writable()
    }

    /// Allocate `size` bytes.
    pub fn allocate(&self, size: usize) -> Result<SharedPtr<u8>> {
        self.allocate_labeled(size, "")
    }

    /// Allocate `size` bytes with a debug label.
    pub fn allocate_labeled(&self, size: usize, label: &str) -> Result<SharedPtr<u8>> {
        if !self.writable() {
            return Err(Error::AccessDenied);
        }

        self.lock_state().prevail()?;
        let result = self.allocate_locked(size, label);
        self.lock_state().dismiss()?;
        result
    }

    fn allocate_locked(&self, size: usize, label: &str) -> Result<SharedPtr<u8>> {
        let tracked = self.debug_enabled();
        let off = if tracked {
            let off = self.0.heap.allocate(size + DESC_SIZE)?;
            self.track(off, size, label);
            off + DESC_SIZE as u32
        } else {
            self.0.heap.allocate(size)?
        };
        Ok(SharedPtr::from_raw(off))
    }

    /// Resize an allocation; the returned pointer may differ.
    pub fn reallocate(&self, ptr: SharedPtr<u8>, size: usize) -> Result<SharedPtr<u8>> {
        if !self.writable() {
            return Err(Error::AccessDenied);
        }
        if ptr.is_null() {
            return self.allocate(size);
        }

        self.lock_state().prevail()?;
        let result = (|| {
            if self.debug_enabled() {
                let desc_off = ptr.raw() - DESC_SIZE as u32;
                self.untrack(desc_off);
                let new_off = self.0.heap.reallocate(desc_off, size + DESC_SIZE)?;
                self.track(new_off, size, "realloc");
                Ok(SharedPtr::from_raw(new_off + DESC_SIZE as u32))
            } else {
                Ok(SharedPtr::from_raw(self.0.heap.reallocate(ptr.raw(), size)?))
            }
        })();
        self.lock_state().dismiss()?;
        result
    }

    /// Return an allocation to the heap.
    pub fn deallocate(&self, ptr: SharedPtr<u8>) -> Result<()> {
        if !self.writable() {
            return Err(Error::AccessDenied);
        }
        if ptr.is_null() {
            return Ok(());
        }

        self.lock_state().prevail()?;
        let result = if self.debug_enabled() {
            let desc_off = ptr.raw() - DESC_SIZE as u32;
            self.untrack(desc_off);
            self.0.heap.free(desc_off)
        } else {
            self.0.heap.free(ptr.raw())
        };
        self.lock_state().dismiss()?;
        result
    }

    /// Allocate and move `value` into the pool.
    pub fn alloc_value<T>(&self, value: T) -> Result<SharedPtr<T>> {
        self.alloc_value_labeled(value, std::any::type_name::<T>())
    }

    /// Allocate and move `value` into the pool with a debug label.
    pub fn alloc_value_labeled<T>(&self, value: T, label: &str) -> Result<SharedPtr<T>> {
        let size = std::mem::size_of::<T>().max(1);
        debug_assert!(std::mem::align_of::<T>() <= size.next_power_of_two());

        let ptr = self.allocate_labeled(size, label)?;
        unsafe {
            self.base().add(ptr.raw() as usize).cast::<T>().write(value);
        }
        Ok(ptr.cast())
    }

    /// Copy a string into the pool, NUL-terminated.
    pub fn alloc_str(&self, s: &str) -> Result<SharedPtr<u8>> {
        let bytes = s.as_bytes();
        let ptr = self.allocate_labeled(bytes.len() + 1, "str")?;
        unsafe {
            let dst = self.base().add(ptr.raw() as usize);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
            *dst.add(bytes.len()) = 0;
        }
        Ok(ptr)
    }

    /// Read a NUL-terminated string previously stored with
    /// [`alloc_str`](Self::alloc_str).
    ///
    /// Returns an empty string for null pointers.
    pub fn read_str(&self, ptr: SharedPtr<u8>) -> String {
        if ptr.is_null() {
            return String::new();
        }
        let mut bytes = Vec::new();
        let mut off = ptr.raw() as usize;
        let end = self.0.segment.len();
        unsafe {
            while off < end {
                let b = *self.base().add(off);
                if b == 0 {
                    break;
                }
                bytes.push(b);
                off += 1;
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Reference a value inside the pool.
    ///
    /// # Safety
    ///
    /// `ptr` must address a live, properly initialized `T` allocated from
    /// this pool. Aliasing across processes is unchecked; `T` must be
    /// either atomic-only or protected by a skirmish.
    pub unsafe fn get<T>(&self, ptr: SharedPtr<T>) -> &T {
        debug_assert!(!ptr.is_null());
        unsafe { &*self.base().add(ptr.raw() as usize).cast::<T>() }
    }

    /// Mutably reference a value inside the pool.
    ///
    /// # Safety
    ///
    /// As [`get`](Self::get); additionally the caller must hold the
    /// skirmish protecting this value.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut<T>(&self, ptr: SharedPtr<T>) -> &mut T {
        debug_assert!(!ptr.is_null());
        unsafe { &mut *self.base().add(ptr.raw() as usize).cast::<T>() }
    }

    /// View raw bytes inside the pool.
    ///
    /// # Safety
    ///
    /// The range must lie within a live allocation of this pool.
    pub unsafe fn bytes(&self, ptr: SharedPtr<u8>, len: usize) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base().add(ptr.raw() as usize), len) }
    }

    /// Mutably view raw bytes inside the pool.
    ///
    /// # Safety
    ///
    /// As [`bytes`](Self::bytes), and the caller must hold the protecting
    /// skirmish.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self, ptr: SharedPtr<u8>, len: usize) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.base().add(ptr.raw() as usize), len) }
    }

    /// The pool skirmish, guarding the heap and everything callers choose
    /// to protect with it.
    pub fn lock(&self) -> &SkirmishState {
        self.lock_state()
    }

    /// Publish the offset of the pool's root structure.
    ///
    /// Used by the world to anchor its shared header so attaching
    /// processes can find it.
    pub fn set_user_root(&self, ptr: SharedPtr<u8>) {
        self.shared().user_root.store(ptr.raw(), Ordering::Release);
    }

    /// The published root offset, null if none was set.
    pub fn user_root(&self) -> SharedPtr<u8> {
        SharedPtr::from_raw(self.shared().user_root.load(Ordering::Acquire))
    }

    /// Current allocation statistics.
    pub fn stats(&self) -> PoolStats {
        self.0.heap.stats()
    }

    /// Log all surviving tracked allocations.
    ///
    /// Only meaningful when the pool was created with `debug_shm`.
    pub fn dump_leaks(&self) {
        if !self.debug_enabled() {
            return;
        }
        if self.lock_state().prevail().is_err() {
            return;
        }

        let mut total = 0u64;
        let mut count = 0u32;
        let mut off = self.shared().allocs_head.load(Ordering::Acquire);
        while off != 0 {
            let desc = unsafe { &*self.base().add(off as usize).cast::<AllocDesc>() };
            let label_len = desc.label.iter().position(|&b| b == 0).unwrap_or(desc.label.len());
            tracing::warn!(
                bytes = desc.bytes,
                offset = off + DESC_SIZE as u32,
                fusion_id = desc.fusion_id,
                label = %String::from_utf8_lossy(&desc.label[..label_len]),
                "shared memory allocation remaining"
            );
            total += desc.bytes as u64;
            count += 1;
            off = desc.next;
        }

        if count > 0 {
            tracing::warn!(count, total, pool = %self.name(), "shared memory leaks");
        }

        let _ = self.lock_state().dismiss();
    }

    /// Unlink the backing file (creator only).
    pub fn destroy(&self) {
        if self.0.debug {
            self.dump_leaks();
        }
        self.0.segment.unlink();
    }

    #[inline]
    pub(crate) fn base(&self) -> *mut u8 {
        self.0.segment.as_ptr()
    }

    pub(crate) fn lock_state(&self) -> &SkirmishState {
        unsafe {
            &*self
                .base()
                .add(std::mem::offset_of!(PoolShared, lock))
                .cast::<SkirmishState>()
        }
    }

    fn shared(&self) -> &PoolShared {
        unsafe { &*self.base().cast::<PoolShared>() }
    }

    fn debug_enabled(&self) -> bool {
        self.shared().debug.load(Ordering::Acquire) != 0
    }

    fn track(&self, desc_off: u32, bytes: usize, label: &str) {
        let head = self.shared().allocs_head.load(Ordering::Acquire);
        let desc = unsafe { &mut *self.base().add(desc_off as usize).cast::<AllocDesc>() };
        desc.next = head;
        desc.bytes = bytes as u32;
        desc.fusion_id = self.0.fusion_id;
        desc.label = [0; 36];
        let len = label.len().min(35);
        desc.label[..len].copy_from_slice(&label.as_bytes()[..len]);
        self.shared().allocs_head.store(desc_off, Ordering::Release);
    }

    fn untrack(&self, desc_off: u32) {
        let shared = self.shared();
        let mut prev: u32 = 0;
        let mut off = shared.allocs_head.load(Ordering::Acquire);
        while off != 0 {
            let next = unsafe { &*self.base().add(off as usize).cast::<AllocDesc>() }.next;
            if off == desc_off {
                if prev == 0 {
                    shared.allocs_head.store(next, Ordering::Release);
                } else {
                    unsafe { &mut *self.base().add(prev as usize).cast::<AllocDesc>() }.next = next;
                }
                return;
            }
            prev = off;
            off = next;
        }
        tracing::error!(offset = desc_off, "freeing unknown shared memory chunk");
    }
}
