//! Cross-process synchronization primitives.
//!
//! - [`futex`]: thin wait/wake wrapper over a shared 32-bit word.
//! - [`skirmish`]: the recursive cross-process lock built on top of it,
//!   including the condition-variable pair and the sorted multi-lock.

pub(crate) mod futex;
pub mod skirmish;

pub use skirmish::{Skirmish, SkirmishState};
