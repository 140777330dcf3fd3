//! Block-based allocator living inside a shared segment.
//!
//! The heap divides its region into blocks of fixed size. Large requests
//! receive one or more whole blocks from an address-ordered free-cluster
//! list searched next-fit; small requests receive a fragment of a block,
//! with fragment sizes rounded up to powers of two and all fragments of one
//! block sharing a size class. A block returns to the cluster list only
//! when its last fragment is freed.
//!
//! # In-segment layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ HeapHeader (validated by magic + version at attach)          │
//! ├──────────────────────────────────────────────────────────────┤
//! │ BlockInfo[0..=n]  (entry 0 anchors the free-cluster list)    │
//! ├──────────────────────────────────────────────────────────────┤
//! │ block #1 │ block #2 │ ...                        │ block #n  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything is addressed by segment-relative byte offsets or block
//! numbers; the layout is valid identically in every attached process no
//! matter where the segment is mapped. Free fragments chain through a
//! `u32` next-offset stored in the fragment itself, so the minimum fragment
//! size is 8 bytes.
//!
//! The block table is sized for the segment's full extent at init time (the
//! mapping is fixed-size and tmpfs commits pages lazily), so fresh core is
//! handed out by bumping a watermark.
//!
//! All state mutation must happen under the owning pool's skirmish; the
//! header's magic and version are atomics so attachment can validate them
//! before any lock exists. Header and table fields are accessed through raw
//! pointers only — the same bytes are visible to every attached process, so
//! no Rust reference may claim them exclusively across a call.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{Error, Result};

/// log2 of the block size.
pub(crate) const BLOCK_LOG: usize = 12;

/// Size of a whole block.
pub(crate) const BLOCK_SIZE: usize = 1 << BLOCK_LOG;

/// Smallest fragment class: room for the free-chain link.
const MIN_FRAG_LOG: u32 = 3;

const HEAP_MAGIC: u64 = 0x4655_5348_4541_5031; // "FUSHEAP1"
const HEAP_VERSION: u32 = 1;

/// Whole blocks needed to hold `size` bytes.
#[inline]
fn blockify(size: usize) -> u32 {
    ((size + BLOCK_SIZE - 1) / BLOCK_SIZE) as u32
}

#[inline]
fn align_up(v: usize, a: usize) -> usize {
    (v + a - 1) & !(a - 1)
}

/// Fragment class for a small request: ceil(log2(size)), clamped to the
/// minimum fragment size.
#[inline]
fn frag_log(size: usize) -> u32 {
    let log = size.next_power_of_two().trailing_zeros();
    log.max(MIN_FRAG_LOG)
}

/// Per-block bookkeeping.
///
/// `frag_log == 0` marks a whole-block allocation or a member of the free
/// cluster list; a positive value is the log2 of the fragment size served
/// from this block.
#[repr(C)]
#[derive(Clone, Copy)]
struct BlockInfo {
    frag_log: u32,
    /// Fragmented block: number of free fragments.
    nfree: u32,
    /// Busy run or free cluster: length in blocks.
    size: u32,
    /// Free-cluster list links (block numbers, address-ordered; entry 0 is
    /// the anchor).
    next: u32,
    prev: u32,
    _pad: u32,
}

/// Heap metadata stored at a fixed offset inside the segment.
#[repr(C)]
pub(crate) struct HeapHeader {
    magic: AtomicU64,
    version: AtomicU32,

    /// Table geometry, fixed at init.
    block_count: u32,
    table_off: u32,
    base_off: u32,
    /// Bytes available for blocks.
    total: u32,

    /// Core watermark: offset of the next fresh block run.
    brk: u32,
    /// One past the highest block number handed out by the watermark.
    limit: u32,
    /// Circular search position in the cluster list.
    index: u32,

    /// Offset of the first free fragment per class.
    frag_head: [u32; BLOCK_LOG],
    /// Blocks currently split for each class.
    frag_blocks: [u32; BLOCK_LOG],

    /// Diagnostics counters.
    chunks_used: u32,
    chunks_free: u32,
    bytes_used: u64,
    bytes_free: u64,
}

/// Space the header occupies in the segment.
pub(crate) fn header_size() -> usize {
    std::mem::size_of::<HeapHeader>()
}

/// Allocation statistics, maintained on every operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes currently allocated.
    pub bytes_used: u64,
    /// Bytes currently on free lists.
    pub bytes_free: u64,
    /// Allocated chunks.
    pub chunks_used: u32,
    /// Free chunks (clusters + fragments).
    pub chunks_free: u32,
    /// Bytes of core handed out so far (`bytes_used + bytes_free`).
    pub core: u64,
    /// Total bytes the heap can ever hand out.
    pub total: u64,
}

macro_rules! hdr_get {
    ($heap:expr, $field:ident) => {
        unsafe { (*$heap.hdr()).$field }
    };
}

macro_rules! hdr_set {
    ($heap:expr, $field:ident, $value:expr) => {
        unsafe { (*$heap.hdr()).$field = $value }
    };
}

/// Handle to a heap inside a mapped segment.
///
/// Holds no state of its own beyond the mapping base; all bookkeeping lives
/// in the segment.
pub(crate) struct Heap {
    base: *mut u8,
    hdr_off: u32,
}

impl Heap {
    /// Initialize a heap covering `[hdr_off, seg_len)` of the segment.
    ///
    /// # Safety
    ///
    /// `base` must point to a writable mapping of at least `seg_len` bytes
    /// and the region must not be concurrently accessed.
    pub(crate) unsafe fn init(base: *mut u8, hdr_off: usize, seg_len: usize) -> Result<Self> {
        let table_off = align_up(hdr_off + header_size(), 8);

        // Solve for the block count: table (n + 1 entries) + n blocks must
        // fit, with the block area aligned to the block size.
        let info = std::mem::size_of::<BlockInfo>();
        let mut count = (seg_len.saturating_sub(table_off)) / (BLOCK_SIZE + info);
        let base_off = loop {
            if count == 0 {
                return Err(Error::InvalidArg("segment too small for a heap"));
            }
            let candidate = align_up(table_off + (count + 1) * info, BLOCK_SIZE);
            if candidate + count * BLOCK_SIZE <= seg_len {
                break candidate;
            }
            count -= 1;
        };

        let heap = Self {
            base,
            hdr_off: hdr_off as u32,
        };

        // The segment arrives zeroed from ftruncate; only the non-zero
        // fields need storing.
        hdr_set!(heap, block_count, count as u32 + 1);
        hdr_set!(heap, table_off, table_off as u32);
        hdr_set!(heap, base_off, base_off as u32);
        hdr_set!(heap, total, (count * BLOCK_SIZE) as u32);
        hdr_set!(heap, brk, base_off as u32);
        unsafe {
            (*heap.hdr()).version.store(HEAP_VERSION, Ordering::Release);
            (*heap.hdr()).magic.store(HEAP_MAGIC, Ordering::Release);
        }

        Ok(heap)
    }

    /// Open an already initialized heap, validating magic and version.
    ///
    /// # Safety
    ///
    /// `base` must point to a mapping containing a heap at `hdr_off`.
    pub(crate) unsafe fn open(base: *mut u8, hdr_off: usize) -> Result<Self> {
        let heap = Self {
            base,
            hdr_off: hdr_off as u32,
        };

        let (magic, version) = unsafe {
            (
                (*heap.hdr()).magic.load(Ordering::Acquire),
                (*heap.hdr()).version.load(Ordering::Acquire),
            )
        };
        if magic != HEAP_MAGIC {
            return Err(Error::Init("heap magic mismatch".into()));
        }
        if version != HEAP_VERSION {
            return Err(Error::VersionMismatch {
                ours: HEAP_VERSION,
                theirs: version,
            });
        }

        Ok(heap)
    }

    /// Allocate `size` bytes, returning the segment-relative offset.
    ///
    /// The caller must hold the pool skirmish.
    pub(crate) fn allocate(&self, size: usize) -> Result<u32> {
        if size == 0 {
            return Err(Error::InvalidArg("allocation size must be greater than 0"));
        }

        if size <= BLOCK_SIZE / 2 {
            self.alloc_fragment(size)
        } else {
            self.alloc_blocks(blockify(size))
        }
    }

    /// Resize the allocation at `off`, returning the (possibly moved) offset.
    pub(crate) fn reallocate(&self, off: u32, size: usize) -> Result<u32> {
        if size == 0 {
            self.free(off)?;
            return Err(Error::InvalidArg("reallocation to size 0 frees"));
        }

        let block = self.block_of(off);
        let log = self.info_get(block).frag_log;

        if log == 0 {
            // Whole-block allocation; maybe shrink it into a fragment.
            if size <= BLOCK_SIZE / 2 {
                if let Ok(new_off) = self.alloc_fragment(size) {
                    unsafe { self.copy(off, new_off, size) };
                    self.free(off)?;
                    return Ok(new_off);
                }
            }

            let blocks = blockify(size);
            let old = self.info_get(block).size;

            if blocks < old {
                // Return the excess to the free list.
                let tail = block + blocks;
                self.info_update(tail, |info| {
                    info.frag_log = 0;
                    info.size = old - blocks;
                });
                self.info_update(block, |info| info.size = blocks);
                self.free(self.addr_of(tail))?;
                Ok(off)
            } else if blocks == old {
                Ok(off)
            } else {
                // Won't fit in place. Free first so adjacent space can be
                // grown into, then re-allocate; the contents survive the
                // free untouched.
                self.free(off)?;
                match self.alloc_blocks(blocks) {
                    Ok(new_off) => {
                        if new_off != off {
                            unsafe { self.copy(off, new_off, old as usize * BLOCK_SIZE) };
                        }
                        Ok(new_off)
                    }
                    Err(err) => {
                        // Un-free the region we just released; the next-fit
                        // index makes this land on the same blocks.
                        let index = hdr_get!(self, index);
                        if index == block {
                            let _ = self.alloc_blocks(old);
                        } else if index < block {
                            let spacer = self.alloc_blocks(block - index);
                            let _ = self.alloc_blocks(old);
                            if let Ok(spacer) = spacer {
                                let _ = self.free(spacer);
                            }
                        }
                        Err(err)
                    }
                }
            }
        } else {
            // Fragment: same class stays in place.
            if size > (1usize << (log - 1)) && size <= (1usize << log) {
                Ok(off)
            } else {
                let new_off = self.allocate(size)?;
                unsafe { self.copy(off, new_off, size.min(1 << log)) };
                self.free(off)?;
                Ok(new_off)
            }
        }
    }

    /// Return the allocation at `off` to the heap.
    pub(crate) fn free(&self, off: u32) -> Result<()> {
        if off < hdr_get!(self, base_off) || off >= hdr_get!(self, brk) {
            return Err(Error::Bug("free of an offset outside the heap"));
        }

        let block = self.block_of(off);
        let log = self.info_get(block).frag_log;

        if log == 0 {
            self.free_blocks(block)
        } else {
            self.free_fragment(off, block, log)
        }
    }

    /// Current statistics.
    pub(crate) fn stats(&self) -> HeapStats {
        HeapStats {
            bytes_used: hdr_get!(self, bytes_used),
            bytes_free: hdr_get!(self, bytes_free),
            chunks_used: hdr_get!(self, chunks_used),
            chunks_free: hdr_get!(self, chunks_free),
            core: (hdr_get!(self, brk) - hdr_get!(self, base_off)) as u64,
            total: hdr_get!(self, total) as u64,
        }
    }

    // ----------------------------------------------------------------
    // fragments
    // ----------------------------------------------------------------

    fn alloc_fragment(&self, size: usize) -> Result<u32> {
        let log = frag_log(size) as usize;

        let head = hdr_get!(self, frag_head)[log];
        if head != 0 {
            // Pop the first free fragment of this class.
            let next = unsafe { self.read_link(head) };
            self.frag_head_set(log, next);

            let block = self.block_of(head);
            self.info_update(block, |info| info.nfree -= 1);

            self.stats_update(1, -1, 1 << log, -(1i64 << log));

            Ok(head)
        } else {
            // No free fragment of this class: split a fresh block.
            let off = self.alloc_blocks(1)?;
            let block = self.block_of(off);
            let per = (BLOCK_SIZE >> log) as u32;

            let counted = hdr_get!(self, frag_blocks)[log];
            self.frag_blocks_set(log, counted + 1);

            // Link all fragments but the first into the class list.
            for i in 1..per {
                let frag = off + (i << log);
                unsafe { self.write_link(frag, hdr_get!(self, frag_head)[log]) };
                self.frag_head_set(log, frag);
            }

            self.info_update(block, |info| {
                info.frag_log = log as u32;
                info.nfree = per - 1;
            });

            let moved = (BLOCK_SIZE - (1 << log)) as i64;
            self.stats_update(0, (per - 1) as i64, -moved, moved);

            Ok(off)
        }
    }

    fn free_fragment(&self, off: u32, block: u32, log: u32) -> Result<()> {
        let log = log as usize;
        let per = (BLOCK_SIZE >> log) as u32;
        let nfree = self.info_get(block).nfree;

        self.stats_update(-1, 1, -(1i64 << log), 1 << log);

        if nfree == per - 1 && hdr_get!(self, frag_blocks)[log] > 1 {
            // Last fragment of the block: pull its siblings out of the
            // class list and hand the whole block back.
            self.frag_blocks_set(log, hdr_get!(self, frag_blocks)[log] - 1);

            let start = self.addr_of(block);
            let end = start + BLOCK_SIZE as u32;

            let mut cursor = hdr_get!(self, frag_head)[log];
            let mut prev: u32 = 0;
            while cursor != 0 {
                let next = unsafe { self.read_link(cursor) };
                if cursor >= start && cursor < end {
                    if prev == 0 {
                        self.frag_head_set(log, next);
                    } else {
                        unsafe { self.write_link(prev, next) };
                    }
                } else {
                    prev = cursor;
                }
                cursor = next;
            }

            self.info_update(block, |info| {
                info.frag_log = 0;
                info.nfree = 0;
                info.size = 1;
            });

            self.stats_update(1, -(per as i64), BLOCK_SIZE as i64, -(BLOCK_SIZE as i64));

            self.free_blocks(block)
        } else {
            unsafe { self.write_link(off, hdr_get!(self, frag_head)[log]) };
            self.frag_head_set(log, off);
            self.info_update(block, |info| info.nfree = nfree + 1);
            Ok(())
        }
    }

    // ----------------------------------------------------------------
    // whole blocks
    // ----------------------------------------------------------------

    fn alloc_blocks(&self, blocks: u32) -> Result<u32> {
        // Search the cluster list in a circle starting at the last place
        // visited.
        let start = hdr_get!(self, index);
        let mut block = start;
        loop {
            if self.info_get(block).size >= blocks {
                break;
            }
            block = self.info_get(block).next;
            if block != start {
                continue;
            }

            // Looped around: fresh core. If the final cluster touches the
            // watermark we only need the difference.
            let last = self.info_get(0).prev;
            let last_blocks = self.info_get(last).size;
            if hdr_get!(self, limit) != 0
                && last != 0
                && last + last_blocks == hdr_get!(self, limit)
                && hdr_get!(self, brk) == self.addr_of(last + last_blocks)
                && self
                    .morecore((blocks - last_blocks) as usize * BLOCK_SIZE)
                    .is_ok()
            {
                let last = self.info_get(0).prev;
                self.info_update(last, |info| info.size += blocks - last_blocks);
                self.stats_update(0, 0, 0, ((blocks - last_blocks) as usize * BLOCK_SIZE) as i64);
                continue;
            }

            let off = self.morecore(blocks as usize * BLOCK_SIZE)?;
            let block = self.block_of(off);
            self.info_update(block, |info| {
                info.frag_log = 0;
                info.size = blocks;
            });
            self.stats_update(1, 0, (blocks as usize * BLOCK_SIZE) as i64, 0);
            return Ok(off);
        }

        // Found a suitable cluster; carve what we need off its front.
        let off = self.addr_of(block);
        let found = self.info_get(block);

        if found.size > blocks {
            let rest = block + blocks;
            self.info_update(rest, |info| {
                info.frag_log = 0;
                info.size = found.size - blocks;
                info.next = found.next;
                info.prev = found.prev;
            });
            self.info_update(found.next, |info| info.prev = rest);
            self.info_update(found.prev, |info| info.next = rest);
            hdr_set!(self, index, rest);
        } else {
            self.info_update(found.next, |info| info.prev = found.prev);
            self.info_update(found.prev, |info| info.next = found.next);
            hdr_set!(self, index, found.next);
            self.stats_update(0, -1, 0, 0);
        }

        self.info_update(block, |info| {
            info.frag_log = 0;
            info.size = blocks;
        });
        let bytes = (blocks as usize * BLOCK_SIZE) as i64;
        self.stats_update(1, 0, bytes, -bytes);

        Ok(off)
    }

    fn free_blocks(&self, mut block: u32) -> Result<()> {
        let size = self.info_get(block).size;

        let bytes = (size as usize * BLOCK_SIZE) as i64;
        self.stats_update(-1, 0, -bytes, bytes);

        // Find the free cluster preceding this block; the list is kept in
        // address order, anchored at entry 0.
        let mut i = hdr_get!(self, index);
        if i > block {
            while i > block {
                i = self.info_get(i).prev;
            }
        } else {
            loop {
                i = self.info_get(i).next;
                if i == 0 || i >= block {
                    break;
                }
            }
            i = self.info_get(i).prev;
        }

        if i != 0 && i + self.info_get(i).size == block {
            // Coalesce with the predecessor.
            self.info_update(i, |info| info.size += size);
            block = i;
        } else {
            let next = self.info_get(i).next;
            self.info_update(block, |info| {
                info.size = size;
                info.next = next;
                info.prev = i;
            });
            self.info_update(i, |info| info.next = block);
            self.info_update(next, |info| info.prev = block);
            self.stats_update(0, 1, 0, 0);
        }

        // Coalesce with the successor.
        let merged = self.info_get(block);
        let next = merged.next;
        if next != 0 && block + merged.size == next {
            let next_info = self.info_get(next);
            self.info_update(block, |info| {
                info.size += next_info.size;
                info.next = next_info.next;
            });
            self.info_update(next_info.next, |info| info.prev = block);
            self.stats_update(0, -1, 0, 0);
        }

        hdr_set!(self, index, block);
        Ok(())
    }

    /// Hand out fresh core from the watermark.
    fn morecore(&self, bytes: usize) -> Result<u32> {
        let end = hdr_get!(self, base_off) as usize + hdr_get!(self, total) as usize;
        let brk = hdr_get!(self, brk);

        if brk as usize + bytes > end {
            return Err(Error::OutOfSharedMemory);
        }

        hdr_set!(self, brk, brk + bytes as u32);
        let limit = self.block_of(brk + bytes as u32);
        hdr_set!(self, limit, limit);
        Ok(brk)
    }

    // ----------------------------------------------------------------
    // raw access
    // ----------------------------------------------------------------

    #[inline]
    fn addr_of(&self, block: u32) -> u32 {
        hdr_get!(self, base_off) + (block - 1) * BLOCK_SIZE as u32
    }

    #[inline]
    fn block_of(&self, off: u32) -> u32 {
        (off - hdr_get!(self, base_off)) / BLOCK_SIZE as u32 + 1
    }

    #[inline]
    fn hdr(&self) -> *mut HeapHeader {
        unsafe { self.base.add(self.hdr_off as usize).cast::<HeapHeader>() }
    }

    #[inline]
    fn info_ptr(&self, block: u32) -> *mut BlockInfo {
        debug_assert!(block < hdr_get!(self, block_count));
        unsafe {
            self.base
                .add(hdr_get!(self, table_off) as usize)
                .cast::<BlockInfo>()
                .add(block as usize)
        }
    }

    #[inline]
    fn info_get(&self, block: u32) -> BlockInfo {
        unsafe { *self.info_ptr(block) }
    }

    #[inline]
    fn info_update(&self, block: u32, f: impl FnOnce(&mut BlockInfo)) {
        let ptr = self.info_ptr(block);
        let mut info = unsafe { *ptr };
        f(&mut info);
        unsafe { *ptr = info };
    }

    #[inline]
    fn frag_head_set(&self, log: usize, off: u32) {
        unsafe { (*self.hdr()).frag_head[log] = off };
    }

    #[inline]
    fn frag_blocks_set(&self, log: usize, count: u32) {
        unsafe { (*self.hdr()).frag_blocks[log] = count };
    }

    fn stats_update(&self, chunks_used: i64, chunks_free: i64, bytes_used: i64, bytes_free: i64) {
        unsafe {
            let hdr = self.hdr();
            (*hdr).chunks_used = ((*hdr).chunks_used as i64 + chunks_used) as u32;
            (*hdr).chunks_free = ((*hdr).chunks_free as i64 + chunks_free) as u32;
            (*hdr).bytes_used = ((*hdr).bytes_used as i64 + bytes_used) as u64;
            (*hdr).bytes_free = ((*hdr).bytes_free as i64 + bytes_free) as u64;
        }
    }

    unsafe fn read_link(&self, off: u32) -> u32 {
        unsafe { self.base.add(off as usize).cast::<u32>().read_unaligned() }
    }

    unsafe fn write_link(&self, off: u32, link: u32) {
        unsafe {
            self.base
                .add(off as usize)
                .cast::<u32>()
                .write_unaligned(link)
        }
    }

    unsafe fn copy(&self, from: u32, to: u32, len: usize) {
        unsafe {
            std::ptr::copy(
                self.base.add(from as usize),
                self.base.add(to as usize),
                len,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestHeap {
        _buf: Vec<u64>,
        heap: Heap,
    }

    fn test_heap(len: usize) -> TestHeap {
        let mut buf = vec![0u64; len / 8];
        let base = buf.as_mut_ptr().cast::<u8>();
        let heap = unsafe { Heap::init(base, 0, len).unwrap() };
        TestHeap { _buf: buf, heap }
    }

    fn settled(stats: HeapStats) -> bool {
        stats.bytes_used + stats.bytes_free == stats.core
    }

    #[test]
    fn test_init_and_open() {
        let mut buf = vec![0u64; 64 * 1024 / 8];
        let base = buf.as_mut_ptr().cast::<u8>();
        unsafe { Heap::init(base, 0, 64 * 1024).unwrap() };
        let heap = unsafe { Heap::open(base, 0).unwrap() };
        assert_eq!(heap.stats().bytes_used, 0);
        assert!(heap.stats().total >= 8 * BLOCK_SIZE as u64);
    }

    #[test]
    fn test_open_rejects_garbage() {
        let mut buf = vec![0u64; 8192 / 8];
        let base = buf.as_mut_ptr().cast::<u8>();
        assert!(unsafe { Heap::open(base, 0) }.is_err());
    }

    #[test]
    fn test_large_alloc_free_roundtrip() {
        let t = test_heap(512 * 1024);
        let a = t.heap.allocate(3 * BLOCK_SIZE).unwrap();
        let b = t.heap.allocate(2 * BLOCK_SIZE).unwrap();

        let stats = t.heap.stats();
        assert_eq!(stats.bytes_used, 5 * BLOCK_SIZE as u64);
        assert!(settled(stats));

        t.heap.free(a).unwrap();
        t.heap.free(b).unwrap();

        let stats = t.heap.stats();
        assert_eq!(stats.bytes_used, 0);
        assert!(settled(stats));
    }

    #[test]
    fn test_fragments_share_a_block() {
        let t = test_heap(512 * 1024);

        let a = t.heap.allocate(100).unwrap(); // 128-byte class
        let b = t.heap.allocate(100).unwrap();
        assert_eq!(t.heap.block_of(a), t.heap.block_of(b));
        assert_eq!((b - a) % 128, 0);

        let stats = t.heap.stats();
        assert_eq!(stats.bytes_used, 256);
        assert!(settled(stats));

        t.heap.free(a).unwrap();
        // Freed fragment is reused before the block is split further.
        let c = t.heap.allocate(100).unwrap();
        assert_eq!(c, a);

        t.heap.free(b).unwrap();
        t.heap.free(c).unwrap();
        assert_eq!(t.heap.stats().bytes_used, 0);
    }

    #[test]
    fn test_last_fragment_returns_block() {
        let t = test_heap(512 * 1024);

        // Two fragment blocks of the same class must exist before one is
        // handed back whole.
        let frags_per_block = BLOCK_SIZE / 2048;
        let mut first = Vec::new();
        let mut second = Vec::new();
        for _ in 0..frags_per_block {
            first.push(t.heap.allocate(2048).unwrap());
        }
        for _ in 0..frags_per_block {
            second.push(t.heap.allocate(2048).unwrap());
        }

        for off in second {
            t.heap.free(off).unwrap();
        }

        let stats = t.heap.stats();
        assert_eq!(stats.bytes_used, (frags_per_block * 2048) as u64);
        assert!(settled(stats));

        for off in first {
            t.heap.free(off).unwrap();
        }
        assert_eq!(t.heap.stats().bytes_used, 0);
    }

    #[test]
    fn test_coalescing_reclaims_middle_hole() {
        // Mirrors the master/pool scenario: allocate three runs, free two
        // adjacent ones, and the coalesced hole must satisfy a request as
        // large as both together.
        let t = test_heap(64 * BLOCK_SIZE);

        let a = t.heap.allocate(4 * BLOCK_SIZE).unwrap();
        let b = t.heap.allocate(4 * BLOCK_SIZE).unwrap();
        let c = t.heap.allocate(4 * BLOCK_SIZE).unwrap();

        t.heap.free(b).unwrap();
        t.heap.free(c).unwrap();

        // 8 contiguous blocks exist again right after `a`.
        let big = t.heap.allocate(8 * BLOCK_SIZE).unwrap();
        assert_eq!(big, b);

        t.heap.free(a).unwrap();
        t.heap.free(big).unwrap();
        assert!(settled(t.heap.stats()));
    }

    #[test]
    fn test_exhaustion_is_distinct() {
        let t = test_heap(16 * BLOCK_SIZE);
        let total = t.heap.stats().total as usize;

        let _a = t.heap.allocate(total).unwrap();
        match t.heap.allocate(BLOCK_SIZE) {
            Err(Error::OutOfSharedMemory) => {}
            other => panic!("expected OutOfSharedMemory, got {other:?}"),
        }
    }

    #[test]
    fn test_realloc_in_place_shrink_and_grow() {
        let t = test_heap(64 * BLOCK_SIZE);

        let a = t.heap.allocate(4 * BLOCK_SIZE).unwrap();
        unsafe { t.heap.base.add(a as usize).write(0xAB) };

        // Shrink in place.
        let b = t.heap.reallocate(a, 2 * BLOCK_SIZE).unwrap();
        assert_eq!(a, b);
        assert_eq!(unsafe { t.heap.base.add(b as usize).read() }, 0xAB);

        // Grow back into the space just released.
        let c = t.heap.reallocate(b, 4 * BLOCK_SIZE).unwrap();
        assert_eq!(c, a);
        assert_eq!(unsafe { t.heap.base.add(c as usize).read() }, 0xAB);

        t.heap.free(c).unwrap();
        assert!(settled(t.heap.stats()));
    }

    #[test]
    fn test_realloc_fragment_class_change() {
        let t = test_heap(64 * BLOCK_SIZE);

        let a = t.heap.allocate(64).unwrap();
        unsafe { t.heap.base.add(a as usize).write(0x5A) };

        // Same class: stays put.
        let b = t.heap.reallocate(a, 40).unwrap();
        assert_eq!(a, b);

        // Larger class: moves, contents follow.
        let c = t.heap.reallocate(b, 300).unwrap();
        assert_ne!(b, c);
        assert_eq!(unsafe { t.heap.base.add(c as usize).read() }, 0x5A);

        t.heap.free(c).unwrap();
        assert!(settled(t.heap.stats()));
    }

    #[test]
    fn test_free_outside_heap_is_a_bug() {
        let t = test_heap(16 * BLOCK_SIZE);
        assert!(matches!(t.heap.free(1), Err(Error::Bug(_))));
    }

    #[test]
    fn test_used_plus_free_equals_core_after_churn() {
        let t = test_heap(256 * BLOCK_SIZE);
        let mut live = Vec::new();

        for round in 0..6 {
            for i in 0..40 {
                let size = match (round + i) % 4 {
                    0 => 24,
                    1 => 700,
                    2 => BLOCK_SIZE + 100,
                    _ => 3 * BLOCK_SIZE,
                };
                live.push(t.heap.allocate(size).unwrap());
            }
            // Free every other allocation.
            let mut keep = Vec::new();
            for (i, off) in live.drain(..).enumerate() {
                if i % 2 == 0 {
                    t.heap.free(off).unwrap();
                } else {
                    keep.push(off);
                }
            }
            live = keep;
            assert!(settled(t.heap.stats()));
        }

        for off in live {
            t.heap.free(off).unwrap();
        }
        let stats = t.heap.stats();
        assert_eq!(stats.bytes_used, 0);
        assert!(settled(stats));
    }
}
