//! # Fusion
//!
//! Multi-process shared-state substrate: the IPC core of a display-server
//! platform. A group of cooperating processes ("fusionees") shares typed
//! objects — surfaces, palettes, window stacks — with cross-process
//! reference counting, mutual exclusion, change notification and remote
//! procedure execution, all built on raw shared-memory segments.
//!
//! ## Building blocks
//!
//! - **Shared memory** ([`shm`]): a block-based allocator inside a
//!   memory-mapped segment, with a layout valid identically in every
//!   attached process, wrapped by pool lifecycle management.
//! - **World** ([`world`]): the process group — membership, master/slave
//!   roles, and one dispatch thread delivering inbound messages.
//! - **Arena** ([`arena`]): named-pointer bootstrap so joining processes
//!   recover the structures the master published.
//! - **Skirmish** ([`sync`]): a recursive cross-process lock with
//!   wait/notify and abandoned-lock recovery.
//! - **Ref** ([`refs`]): a cross-process counted handle with
//!   notify-on-zero and ownership hand-off.
//! - **Reactor** ([`reactor`]): publish/subscribe dispatch to local and
//!   processor-independent listeners.
//! - **Call** ([`call`]): single-writer RPC with per-caller admission
//!   control.
//! - **Object / Object Pool** ([`object`]): the Ref + Skirmish + Reactor
//!   composite every higher-level shared type is made of.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use fusion::prelude::*;
//!
//! let world = World::enter(0, ABI_VERSION, EnterRole::Any, FusionConfig::default())?;
//!
//! let (arena, outcome) = Arena::enter(&world, "core",
//!     |arena| { /* master: publish shared fields */ Ok(()) },
//!     |arena| { /* slave: look them up */ Ok(()) },
//! )?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod arena;
pub mod call;
pub mod collections;
pub mod conf;
pub mod error;
pub mod object;
pub mod reactor;
pub mod refs;
pub mod shm;
pub mod sync;
pub mod world;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::arena::{Arena, EnterOutcome};
    pub use crate::call::{Call, CallArgs, CallHandlerResult};
    pub use crate::conf::FusionConfig;
    pub use crate::error::{Error, Result};
    pub use crate::object::{Object, ObjectPool};
    pub use crate::reactor::{ReactionResult, Reactor};
    pub use crate::refs::Ref;
    pub use crate::shm::{Pool, SharedPtr};
    pub use crate::sync::Skirmish;
    pub use crate::world::{EnterRole, World};
}

pub use error::{Error, Result};
