//! Shared memory for Fusion.
//!
//! This module provides the layered shared-memory substrate:
//!
//! - [`tmpfs`]: discovery of a writable tmpfs-class mount for the backing
//!   files.
//! - [`segment`]: a file-backed mapping created by the master and attached
//!   by slaves.
//! - [`heap`]: the block-based allocator living *inside* a segment, with an
//!   in-segment layout that is valid identically in every attached process.
//! - [`pool`]: the lifecycle wrapper combining one segment and one heap,
//!   plus debug allocation tracking.
//!
//! All in-segment references are pool-relative byte offsets ([`SharedPtr`]),
//! never absolute addresses: attaching processes may map the segment at
//! different bases.

mod segment;
mod tmpfs;

pub mod heap;
pub mod pool;

pub use pool::{Pool, PoolStats, SharedPtr};
pub use segment::Segment;
pub use tmpfs::tmpfs_dir;
