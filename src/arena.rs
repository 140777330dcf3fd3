//! Arena: bootstrap mechanism for named shared structures.
//!
//! The first process to enter an arena with a given name runs the caller's
//! `init` function, which publishes named pointers into shared memory;
//! every subsequent process runs `join`, looking the same names up. The
//! arena's ref counts entered processes, so the last one out runs the
//! shutdown path.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::collections::{KeyKind, KeyRef, SharedHash};
use crate::error::{Error, Result};
use crate::refs::{Ref, RefState};
use crate::shm::SharedPtr;
use crate::sync::skirmish::SkirmishState;
use crate::world::World;

/// In-segment state of an arena.
#[repr(C)]
#[derive(Default)]
struct ArenaState {
    next: AtomicU32,
    lock: SkirmishState,
    ref_: RefState,
    name: AtomicU32,
    fields: AtomicU32,
}

/// Handle to an entered arena.
pub struct Arena {
    world: World,
    state: SharedPtr<ArenaState>,
}

/// Outcome of [`Arena::enter`]: whether this process established or joined
/// the arena, plus the value the init/join function returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnterOutcome {
    /// This process ran `init` and published the shared fields.
    Established,
    /// This process ran `join`.
    Joined,
}

impl Arena {
    /// Enter the arena `name`, creating it if needed.
    ///
    /// The first process in runs `init`; later processes run `join`. An
    /// error returned by `init` tears the fresh arena down again; an error
    /// from `join` only releases this process's entry.
    pub fn enter(
        world: &World,
        name: &str,
        init: impl FnOnce(&Arena) -> Result<()>,
        join: impl FnOnce(&Arena) -> Result<()>,
    ) -> Result<(Arena, EnterOutcome)> {
        let state = lock_arena(world, name, true)?;
        let arena = Arena {
            world: world.clone(),
            state,
        };

        // First one in establishes, everyone else joins.
        let reference = arena.reference();
        let establishing = match reference.zero_trylock() {
            Ok(()) => {
                reference.unlock()?;
                true
            }
            Err(Error::Busy) => false,
            Err(err) => {
                arena.shared().lock.dismiss()?;
                return Err(err);
            }
        };

        tracing::debug!(
            name,
            establishing,
            "entering arena"
        );

        reference.up(false)?;

        let result = if establishing { init(&arena) } else { join(&arena) };

        if let Err(err) = result {
            reference.down(false)?;

            if establishing {
                // A failed init leaves nothing behind.
                arena.teardown()?;
                return Err(err);
            }

            arena.shared().lock.dismiss()?;
            return Err(err);
        }

        arena.shared().lock.dismiss()?;

        let outcome = if establishing {
            EnterOutcome::Established
        } else {
            EnterOutcome::Joined
        };
        Ok((arena, outcome))
    }

    /// Publish a named pointer into the arena.
    pub fn add_shared_field(&self, name: &str, data: SharedPtr<u8>) -> Result<()> {
        let shared = self.shared();
        shared.lock.prevail()?;

        let result = self
            .fields()
            .replace(KeyRef::Str(name), data.raw() as u64)
            .map(|_| ());

        shared.lock.dismiss()?;
        result
    }

    /// Look up a previously published pointer.
    ///
    /// An unpublished name fails with `ItemNotFound`, distinct from any
    /// allocation failure.
    pub fn get_shared_field(&self, name: &str) -> Result<SharedPtr<u8>> {
        let shared = self.shared();
        shared.lock.prevail()?;

        let found = self.fields().lookup(KeyRef::Str(name));

        shared.lock.dismiss()?;

        match found {
            Some(off) => Ok(SharedPtr::from_raw(off as u32)),
            None => Err(Error::ItemNotFound(name.to_string())),
        }
    }

    /// Leave the arena.
    ///
    /// The last process out runs `shutdown` and frees the arena; everyone
    /// else runs `leave`. Exiting without a `leave` function while other
    /// processes remain fails with `Busy`. With `emergency` set the
    /// callbacks are told to skip graceful negotiation.
    pub fn exit(
        self,
        shutdown: impl FnOnce(&Arena, bool) -> Result<()>,
        leave: Option<impl FnOnce(&Arena, bool) -> Result<()>>,
        emergency: bool,
    ) -> Result<()> {
        let shared = self.shared();
        shared.lock.prevail()?;

        let reference = self.reference();
        reference.down(false)?;

        match reference.zero_trylock() {
            Ok(()) => {
                // We are the last; shut the arena down.
                let result = shutdown(&self, emergency);
                reference.unlock()?;
                self.teardown()?;
                result
            }
            Err(Error::Busy) => {
                let Some(leave) = leave else {
                    reference.up(false)?;
                    shared.lock.dismiss()?;
                    return Err(Error::Busy);
                };
                let result = leave(&self, emergency);
                shared.lock.dismiss()?;
                result
            }
            Err(err) => {
                shared.lock.dismiss()?;
                Err(err)
            }
        }
    }

    /// The arena's name.
    pub fn name(&self) -> String {
        let name = self.shared().name.load(Ordering::Acquire);
        self.world
            .main_pool()
            .read_str(SharedPtr::from_raw(name))
    }

    /// The world this arena belongs to.
    pub fn world(&self) -> &World {
        &self.world
    }

    fn shared(&self) -> &ArenaState {
        unsafe { self.world.main_pool().get(self.state) }
    }

    fn reference(&self) -> Ref {
        let off = self.state.raw() + std::mem::offset_of!(ArenaState, ref_) as u32;
        unsafe { Ref::from_state(self.world.clone(), SharedPtr::from_raw(off)) }
    }

    fn fields(&self) -> SharedHash {
        let off = self.shared().fields.load(Ordering::Acquire);
        unsafe { SharedHash::from_state(self.world.main_pool(), SharedPtr::from_raw(off)) }
    }

    /// Destroy the arena and unlink it from the world's list. The arena
    /// lock must be held; it is destroyed in the process.
    fn teardown(&self) -> Result<()> {
        let pool = self.world.main_pool().clone();
        let shared = self.shared();

        self.fields().destroy()?;
        self.reference().destroy()?;

        // Unlink from the world's arena list before the state goes away.
        let world_shared = self.world.shared();
        world_shared.arenas_lock.prevail()?;

        let mut prev: u32 = 0;
        let mut cursor = world_shared.arenas_head.load(Ordering::Acquire);
        while cursor != 0 {
            let node = unsafe { pool.get(SharedPtr::<ArenaState>::from_raw(cursor)) };
            let next = node.next.load(Ordering::Acquire);
            if cursor == self.state.raw() {
                if prev == 0 {
                    world_shared.arenas_head.store(next, Ordering::Release);
                } else {
                    unsafe { pool.get(SharedPtr::<ArenaState>::from_raw(prev)) }
                        .next
                        .store(next, Ordering::Release);
                }
                break;
            }
            prev = cursor;
            cursor = next;
        }

        world_shared.arenas_lock.dismiss()?;

        let name = shared.name.swap(0, Ordering::AcqRel);
        if name != 0 {
            pool.deallocate(SharedPtr::from_raw(name))?;
        }

        shared.lock.destroy();
        pool.deallocate(self.state.cast())
    }
}

/// Find the arena `name` in the world's list and return it locked,
/// creating it when missing and `add` is set.
fn lock_arena(world: &World, name: &str, add: bool) -> Result<SharedPtr<ArenaState>> {
    let pool = world.main_pool().clone();
    let shared = world.shared();

    shared.arenas_lock.prevail()?;

    let result = (|| {
        let mut cursor = shared.arenas_head.load(Ordering::Acquire);
        while cursor != 0 {
            let ptr = SharedPtr::<ArenaState>::from_raw(cursor);
            let node = unsafe { pool.get(ptr) };

            node.lock.prevail()?;

            if pool.read_str(SharedPtr::from_raw(node.name.load(Ordering::Acquire))) == name {
                // Check for an orphaned arena: entered count zero but still
                // listed.
                let reference =
                    unsafe { Ref::from_state(world.clone(), SharedPtr::from_raw(
                        cursor + std::mem::offset_of!(ArenaState, ref_) as u32,
                    )) };
                if reference.zero_trylock().is_ok() {
                    tracing::error!(name, "orphaned arena");
                    reference.unlock()?;
                }

                return Ok(ptr);
            }

            node.lock.dismiss()?;
            cursor = node.next.load(Ordering::Acquire);
        }

        if !add {
            return Err(Error::ItemNotFound(name.to_string()));
        }

        create_arena(world, name)
    })();

    shared.arenas_lock.dismiss()?;
    result
}

/// Allocate a fresh arena, prepend it to the world's list and return it
/// locked.
fn create_arena(world: &World, name: &str) -> Result<SharedPtr<ArenaState>> {
    let pool = world.main_pool().clone();

    let state = pool.alloc_value_labeled(ArenaState::default(), "arena")?;
    let node = unsafe { pool.get(state) };

    Ref::init_state(world, &node.ref_);

    let name_ptr = pool.alloc_str(name)?;
    node.name.store(name_ptr.raw(), Ordering::Release);

    let fields = SharedHash::new(&pool, KeyKind::Str, crate::collections::hash::HASH_MIN_SIZE)?;
    fields.set_autofree(true, false);
    node.fields.store(fields.state_ptr().raw(), Ordering::Release);

    let shared = world.shared();
    node.next
        .store(shared.arenas_head.load(Ordering::Acquire), Ordering::Release);
    shared.arenas_head.store(state.raw(), Ordering::Release);

    // Returned locked, like an existing arena.
    node.lock.prevail()?;

    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::FusionConfig;
    use crate::world::EnterRole;

    fn test_world() -> (tempfile::TempDir, World) {
        let dir = tempfile::tempdir().unwrap();
        let mut conf = FusionConfig::default();
        conf.tmpfs = Some(dir.path().to_path_buf());
        conf.socket_dir = Some(dir.path().to_path_buf());
        conf.main_pool_size = 2 * 1024 * 1024;
        let world = World::enter(0, 1, EnterRole::Master, conf).unwrap();
        (dir, world)
    }

    #[test]
    fn test_first_entrant_establishes() {
        let (_dir, world) = test_world();

        let (arena, outcome) = Arena::enter(
            &world,
            "core",
            |arena| {
                let pool = arena.world().main_pool();
                let data = pool.alloc_str("surface data").unwrap();
                arena.add_shared_field("surfaces", data)
            },
            |_arena| panic!("must not join a fresh arena"),
        )
        .unwrap();
        assert_eq!(outcome, EnterOutcome::Established);

        // Second entry joins and sees the published field.
        let (second, outcome) = Arena::enter(
            &world,
            "core",
            |_arena| panic!("must not establish twice"),
            |arena| {
                arena.get_shared_field("surfaces").map(|_| ())
            },
        )
        .unwrap();
        assert_eq!(outcome, EnterOutcome::Joined);

        second
            .exit(
                |_, _| panic!("not the last"),
                Some(|_: &Arena, _| Ok(())),
                false,
            )
            .unwrap();
        arena
            .exit(|_, _| Ok(()), None::<fn(&Arena, bool) -> Result<()>>, false)
            .unwrap();

        world.exit(false).unwrap();
    }

    #[test]
    fn test_unpublished_field_is_item_not_found() {
        let (_dir, world) = test_world();

        let (arena, _) = Arena::enter(&world, "lookup", |_| Ok(()), |_| Ok(())).unwrap();

        match arena.get_shared_field("nonexistent") {
            Err(Error::ItemNotFound(name)) => assert_eq!(name, "nonexistent"),
            other => panic!("expected ItemNotFound, got {other:?}"),
        }

        arena
            .exit(|_, _| Ok(()), None::<fn(&Arena, bool) -> Result<()>>, false)
            .unwrap();
        world.exit(false).unwrap();
    }

    #[test]
    fn test_failed_init_tears_down() {
        let (_dir, world) = test_world();
        let used_before = world.main_pool().stats().bytes_used;

        let result = Arena::enter(
            &world,
            "doomed",
            |_arena| Err(Error::InvalidArg("init refused")),
            |_arena| Ok(()),
        );
        assert!(result.is_err());

        // Nothing left behind; the next entrant establishes again.
        assert_eq!(world.main_pool().stats().bytes_used, used_before);

        let (arena, outcome) = Arena::enter(&world, "doomed", |_| Ok(()), |_| Ok(())).unwrap();
        assert_eq!(outcome, EnterOutcome::Established);

        arena
            .exit(|_, _| Ok(()), None::<fn(&Arena, bool) -> Result<()>>, false)
            .unwrap();
        world.exit(false).unwrap();
    }

    #[test]
    fn test_exit_without_leave_while_occupied_is_busy() {
        let (_dir, world) = test_world();

        let (first, _) = Arena::enter(&world, "busy", |_| Ok(()), |_| Ok(())).unwrap();
        let (second, _) = Arena::enter(&world, "busy", |_| Ok(()), |_| Ok(())).unwrap();

        // The first holder cannot shut down while the second remains.
        let result = first.exit(
            |_, _| Ok(()),
            None::<fn(&Arena, bool) -> Result<()>>,
            false,
        );
        assert!(matches!(result, Err(Error::Busy)));

        // A plain leave still works while the other entry remains.
        second
            .exit(
                |_, _| panic!("not the last"),
                Some(|_: &Arena, _| Ok(())),
                false,
            )
            .unwrap();

        world.exit(false).unwrap();
    }
}
