//! Growable containers stored inside a shared memory pool.
//!
//! Neither container synchronizes internally: callers guard them with the
//! skirmish protecting the embedding structure, the way every shared
//! collection in this crate is used.

pub mod hash;
pub mod vector;

pub use hash::{KeyKind, KeyRef, SharedHash};
pub use vector::{SharedVector, VectorItem};
