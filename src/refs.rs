//! Ref: cross-process counted handle with zero-notification.
//!
//! A ref keeps two counts — local (per-holder) and global (cross-process,
//! used for in-flight message accounting) — behind an internal skirmish.
//! `zero_trylock` succeeds only when the count is exactly zero and leaves
//! the ref locked, so a destructor can run without racing a concurrent
//! `up`. A watch is a one-shot call executed exactly when the count
//! transitions to zero.
//!
//! `throw`/`catch` hand a count from a dying holder to a named catcher
//! without the total ever bouncing through zero: the thrower parks its
//! count, the catcher takes its own reference and then claims the parked
//! one.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::call::Call;
use crate::error::{self, Error, Result};
use crate::shm::SharedPtr;
use crate::sync::skirmish::SkirmishState;
use crate::world::World;

/// In-segment state of a ref, embeddable in shared structures.
#[repr(C)]
#[derive(Default)]
pub struct RefState {
    lock: SkirmishState,
    local: AtomicI32,
    global: AtomicI32,
    destroyed: AtomicU32,
    /// Fusion id entitled to catch the parked count, 0 if none.
    catcher: AtomicU32,
    watch_call: AtomicU32,
    watch_owner: AtomicU32,
    watch_arg: AtomicI32,
    /// Debug id for the reference trace filter.
    id: AtomicU32,
}

/// Handle to a ref living in the world's main pool.
#[derive(Clone)]
pub struct Ref {
    world: World,
    state: SharedPtr<RefState>,
}

impl Ref {
    /// Allocate a new ref in the world's main pool.
    pub fn new(world: &World, name: &str) -> Result<Self> {
        let state = world
            .main_pool()
            .alloc_value_labeled(RefState::default(), name)?;

        let reference = Self {
            world: world.clone(),
            state,
        };
        reference.state().id.store(world.next_ref_id(), Ordering::Release);
        Ok(reference)
    }

    /// Wrap a ref state embedded in a larger shared structure.
    ///
    /// # Safety
    ///
    /// `state` must address an initialized `RefState` in the world's main
    /// pool.
    pub unsafe fn from_state(world: World, state: SharedPtr<RefState>) -> Self {
        Self { world, state }
    }

    /// Initialize an embedded state (id assignment included).
    pub(crate) fn init_state(world: &World, state: &RefState) {
        state.id.store(world.next_ref_id(), Ordering::Release);
    }

    /// The state's offset, for embedding into wire messages.
    pub fn state_ptr(&self) -> SharedPtr<RefState> {
        self.state
    }

    fn state(&self) -> &RefState {
        unsafe { self.world.main_pool().get(self.state) }
    }

    fn trace(&self, what: &str, state: &RefState) {
        let filter = self.world.conf().trace_ref;
        if filter != 0 && state.id.load(Ordering::Relaxed) == filter {
            tracing::info!(
                id = filter,
                local = state.local.load(Ordering::Relaxed),
                global = state.global.load(Ordering::Relaxed),
                "ref {what}"
            );
        }
    }

    /// Increment the count.
    pub fn up(&self, global: bool) -> Result<()> {
        let state = self.state();
        state.lock.prevail()?;

        if state.destroyed.load(Ordering::Acquire) != 0 {
            state.lock.dismiss()?;
            return Err(Error::Destroyed);
        }

        if global {
            state.global.fetch_add(1, Ordering::Relaxed);
        } else {
            state.local.fetch_add(1, Ordering::Relaxed);
        }
        self.trace("up", state);

        state.lock.dismiss()
    }

    /// Decrement the count; fires the watch when zero is reached.
    ///
    /// Going below zero is an invariant violation, reported as a bug
    /// (and trapped per configuration), never silently clamped.
    pub fn down(&self, global: bool) -> Result<()> {
        let state = self.state();
        state.lock.prevail()?;

        let counter = if global { &state.global } else { &state.local };
        if counter.load(Ordering::Relaxed) <= 0 {
            state.lock.dismiss()?;
            return Err(error::bug(
                "ref count decremented below zero",
                self.world.conf().trap_on_bug,
            ));
        }

        counter.fetch_sub(1, Ordering::Relaxed);
        self.trace("down", state);

        let total =
            state.local.load(Ordering::Relaxed) + state.global.load(Ordering::Relaxed);

        let watch = if total == 0 && state.destroyed.load(Ordering::Acquire) == 0 {
            let call_id = state.watch_call.load(Ordering::Acquire);
            if call_id != 0 {
                Some((
                    call_id,
                    state.watch_owner.load(Ordering::Acquire),
                    state.watch_arg.load(Ordering::Acquire),
                ))
            } else {
                None
            }
        } else {
            None
        };

        state.lock.dismiss()?;

        // The watch fires outside the ref lock; it is one-shot by
        // definition of the zero transition.
        if let Some((call_id, owner, arg)) = watch {
            let call = Call::from_parts(&self.world, call_id, owner);
            if let Err(err) = call.execute_oneway(arg, &[]) {
                tracing::warn!(call_id, %err, "ref watch call failed");
            }
        }

        Ok(())
    }

    /// Unreliable snapshot of the total count (no locking).
    pub fn stat(&self) -> i32 {
        let state = self.state();
        state.local.load(Ordering::Relaxed) + state.global.load(Ordering::Relaxed)
    }

    /// Succeeds only if the count is exactly zero, leaving the ref locked
    /// so a destructor can run without racing a concurrent `up`.
    pub fn zero_trylock(&self) -> Result<()> {
        let state = self.state();
        state.lock.prevail()?;

        if state.destroyed.load(Ordering::Acquire) != 0 {
            state.lock.dismiss()?;
            return Err(Error::Destroyed);
        }

        let total =
            state.local.load(Ordering::Relaxed) + state.global.load(Ordering::Relaxed);
        if total != 0 {
            state.lock.dismiss()?;
            return Err(Error::Busy);
        }

        Ok(())
    }

    /// Release the lock taken by [`zero_trylock`](Self::zero_trylock).
    pub fn unlock(&self) -> Result<()> {
        self.state().lock.dismiss()
    }

    /// Register a one-shot call executed exactly when the count reaches
    /// zero.
    pub fn watch(&self, call: &Call, arg: i32) -> Result<()> {
        let state = self.state();
        state.lock.prevail()?;

        let result = (|| {
            if state.destroyed.load(Ordering::Acquire) != 0 {
                return Err(Error::Destroyed);
            }
            let total =
                state.local.load(Ordering::Relaxed) + state.global.load(Ordering::Relaxed);
            if total == 0 {
                return Err(Error::Bug("watch installed on a ref already at zero"));
            }
            if state.watch_call.load(Ordering::Acquire) != 0 {
                return Err(Error::Busy);
            }

            state.watch_owner.store(call.owner(), Ordering::Release);
            state.watch_arg.store(arg, Ordering::Release);
            state.watch_call.store(call.id(), Ordering::Release);
            Ok(())
        })();

        state.lock.dismiss()?;
        result
    }

    /// Park one count for `catcher`, so ownership transfer never bounces
    /// through zero.
    pub fn throw(&self, catcher: u32) -> Result<()> {
        let state = self.state();
        state.lock.prevail()?;

        let result = if state.catcher.load(Ordering::Acquire) != 0 {
            Err(Error::Busy)
        } else {
            state.catcher.store(catcher, Ordering::Release);
            Ok(())
        };

        state.lock.dismiss()?;
        result
    }

    /// Claim a parked count. The catcher must hold its own reference
    /// first (take `up`, then `catch`), releasing the thrower's.
    pub fn catch_ref(&self) -> Result<()> {
        let state = self.state();
        state.lock.prevail()?;

        let result = (|| {
            if state.catcher.load(Ordering::Acquire) != self.world.fusion_id() {
                return Err(Error::AccessDenied);
            }
            if state.local.load(Ordering::Relaxed) <= 1 {
                // The catcher's own reference must be in place before the
                // thrower's is released, or the count would touch zero.
                return Err(Error::Bug("catch without a prior reference"));
            }
            state.catcher.store(0, Ordering::Release);
            state.local.fetch_sub(1, Ordering::Relaxed);
            Ok(())
        })();

        state.lock.dismiss()?;
        result
    }

    /// Add `from`'s local count to this ref (object re-parenting).
    pub fn inherit(&self, from: &Ref) -> Result<()> {
        // Two refs are locked in a fixed offset order to avoid deadlock.
        let (first, second) = if self.state.raw() <= from.state.raw() {
            (self.state(), from.state())
        } else {
            (from.state(), self.state())
        };

        first.lock.prevail()?;
        if !std::ptr::eq(first, second) {
            if let Err(err) = second.lock.prevail() {
                let _ = first.lock.dismiss();
                return Err(err);
            }
        }

        let inherited = from.state().local.load(Ordering::Relaxed);
        self.state().local.fetch_add(inherited, Ordering::Relaxed);

        if !std::ptr::eq(first, second) {
            second.lock.dismiss()?;
        }
        first.lock.dismiss()
    }

    /// Mark destroyed; further `up`s fail. The backing allocation is
    /// released by the owner of the embedding structure.
    pub fn destroy(&self) -> Result<()> {
        let state = self.state();
        state.destroyed.store(1, Ordering::Release);
        Ok(())
    }
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
    fn test_up_down_balance() {
        let (_dir, world) = test_world();
        let r = Ref::new(&world, "balance").unwrap();

        for _ in 0..5 {
            r.up(false).unwrap();
        }
        for _ in 0..2 {
            r.up(true).unwrap();
        }
        assert_eq!(r.stat(), 7);

        for _ in 0..5 {
            r.down(false).unwrap();
        }
        for _ in 0..2 {
            r.down(true).unwrap();
        }
        assert_eq!(r.stat(), 0);

        world.exit(false).unwrap();
    }

    #[test]
    fn test_down_past_zero_is_a_bug() {
        let (_dir, world) = test_world();
        let r = Ref::new(&world, "underflow").unwrap();

        r.up(false).unwrap();
        r.down(false).unwrap();
        assert!(matches!(r.down(false), Err(Error::Bug(_))));

        world.exit(false).unwrap();
    }

    #[test]
    fn test_zero_trylock_blocks_up() {
        let (_dir, world) = test_world();
        let r = Ref::new(&world, "zero").unwrap();

        r.up(false).unwrap();
        assert!(matches!(r.zero_trylock(), Err(Error::Busy)));

        r.down(false).unwrap();
        r.zero_trylock().unwrap();

        // While zero-locked, a concurrent up blocks rather than racing the
        // destructor; from this thread the lock is recursive, so verify
        // with a second thread.
        let contender = r.clone();
        let handle = std::thread::spawn(move || contender.up(false));
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!handle.is_finished());

        r.unlock().unwrap();
        handle.join().unwrap().unwrap();
        assert_eq!(r.stat(), 1);

        r.down(false).unwrap();
        world.exit(false).unwrap();
    }

    #[test]
    fn test_watch_fires_once_at_zero() {
        let (_dir, world) = test_world();
        use std::sync::atomic::AtomicU32;
        use std::sync::Arc;

        let fired = Arc::new(AtomicU32::new(0));
        let fired_in_handler = Arc::clone(&fired);
        let call = Call::new(&world, move |_world, args| {
            fired_in_handler.fetch_add(1, Ordering::SeqCst);
            crate::call::CallHandlerResult::Return(args.arg)
        })
        .unwrap();

        let r = Ref::new(&world, "watched").unwrap();
        r.up(false).unwrap();
        r.up(false).unwrap();
        r.watch(&call, 42).unwrap();

        r.down(false).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        r.down(false).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        world.exit(false).unwrap();
    }

    #[test]
    fn test_throw_catch_keeps_count_alive() {
        let (_dir, world) = test_world();
        let r = Ref::new(&world, "thrown").unwrap();

        r.up(false).unwrap();
        // Master throws to itself here; the point is the ordering.
        r.throw(world.fusion_id()).unwrap();

        r.up(false).unwrap();
        r.catch_ref().unwrap();

        assert_eq!(r.stat(), 1);
        r.down(false).unwrap();

        world.exit(false).unwrap();
    }

    #[test]
    fn test_inherit_copies_local_count() {
        let (_dir, world) = test_world();
        let a = Ref::new(&world, "a").unwrap();
        let b = Ref::new(&world, "b").unwrap();

        b.up(false).unwrap();
        b.up(false).unwrap();
        a.up(false).unwrap();

        a.inherit(&b).unwrap();
        assert_eq!(a.stat(), 3);

        world.exit(false).unwrap();
    }

    #[test]
    fn test_destroyed_ref_rejects_up() {
        let (_dir, world) = test_world();
        let r = Ref::new(&world, "destroyed").unwrap();

        r.up(false).unwrap();
        r.destroy().unwrap();
        assert!(matches!(r.up(false), Err(Error::Destroyed)));

        world.exit(false).unwrap();
    }
}
