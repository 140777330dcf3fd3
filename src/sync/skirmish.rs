//! Skirmish: the recursive cross-process mutual-exclusion lock.
//!
//! The lock is an explicit state machine — owner identity plus a recursion
//! count — with the futex word serving as the sleep/wake channel.
//! Cross-process futexes are not natively reentrant, so recursion is never
//! delegated to the underlying primitive.
//!
//! The futex word holds the owner's thread id (zero when free) plus a
//! waiters bit, robust-mutex style. A skirmish held by a process that dies
//! is force-unlocked by the next lock attempt: contenders probe the
//! recorded owner's liveness and steal an abandoned lock with a CAS on the
//! exact observed word, so a concurrent legitimate acquisition can never be
//! clobbered.
//!
//! `wait`/`notify` form a condition-variable pair usable only while the
//! lock is held; `wait` fully releases the lock (whatever the recursion
//! depth) and restores the depth on wake-up.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::shm::{Pool, SharedPtr};
use crate::sync::futex;

/// High bit of the word: at least one contender sleeps on the futex.
const WAITERS: u32 = 0x8000_0000;

/// Linux thread ids fit in 30 bits (`pid_max` caps at 2^22 by default).
const OWNER_MASK: u32 = !WAITERS;

/// How often a sleeping contender re-probes the owner's liveness.
const LIVENESS_POLL: Duration = Duration::from_millis(100);

#[inline]
fn own_tid() -> u32 {
    rustix::thread::gettid().as_raw_nonzero().get() as u32
}

/// In-memory state of a skirmish.
///
/// Lives either inside a shared pool (the general case) or in
/// process-private memory ("local" mode — secure fusion and
/// single-application builds, where cross-process contention is
/// structurally impossible). All fields are atomics, so shared references
/// into the mapping are sound.
#[repr(C)]
#[derive(Default)]
pub struct SkirmishState {
    /// Owner tid | WAITERS, zero when free; the lock futex word.
    word: AtomicU32,
    /// Recursion count of the current holder.
    count: AtomicU32,
    /// Notify generation; the `wait` futex word.
    cond: AtomicU32,
    destroyed: AtomicU32,
}

impl SkirmishState {
    #[inline]
    fn holder(&self) -> u32 {
        self.word.load(Ordering::Acquire) & OWNER_MASK
    }

    /// Blocking lock.
    pub fn prevail(&self) -> Result<()> {
        let tid = own_tid();

        loop {
            if self.destroyed.load(Ordering::Acquire) != 0 {
                return Err(Error::Destroyed);
            }

            let current = self.word.load(Ordering::Acquire);

            if current == 0 {
                if self
                    .word
                    .compare_exchange(0, tid, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    self.count.store(1, Ordering::Release);
                    return Ok(());
                }
                continue;
            }

            if current & OWNER_MASK == tid {
                self.count.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }

            // Announce ourselves before sleeping.
            let observed = if current & WAITERS == 0 {
                match self.word.compare_exchange(
                    current,
                    current | WAITERS,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => current | WAITERS,
                    Err(_) => continue,
                }
            } else {
                current
            };

            // Abandoned-lock recovery: steal from a dead holder with a CAS
            // on the exact observed word, so a live acquisition in between
            // makes the steal fail harmlessly.
            let owner = observed & OWNER_MASK;
            if !futex::process_alive(owner) {
                if self
                    .word
                    .compare_exchange(observed, tid | WAITERS, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    tracing::warn!(owner, "skirmish holder died, lock recovered");
                    self.count.store(1, Ordering::Release);
                    return Ok(());
                }
                continue;
            }

            match futex::wait(&self.word, observed, Some(LIVENESS_POLL)) {
                // Timeout only re-runs the liveness probe.
                Ok(()) | Err(Error::Timeout) => {}
                Err(err) => return Err(err),
            }
        }
    }

    /// Non-blocking try-lock: `Busy` if another holder has it.
    pub fn swoop(&self) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) != 0 {
            return Err(Error::Destroyed);
        }

        let tid = own_tid();
        let current = self.word.load(Ordering::Acquire);

        if current & OWNER_MASK == tid && current != 0 {
            self.count.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        if current == 0
            && self
                .word
                .compare_exchange(0, tid, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            self.count.store(1, Ordering::Release);
            return Ok(());
        }

        Err(Error::Busy)
    }

    /// Unlock; fully releases only when the recursion count reaches zero.
    pub fn dismiss(&self) -> Result<()> {
        if self.holder() != own_tid() {
            return Err(Error::Bug("skirmish dismissed by a non-holder"));
        }

        let count = self.count.load(Ordering::Relaxed);
        if count > 1 {
            self.count.store(count - 1, Ordering::Relaxed);
            return Ok(());
        }

        self.count.store(0, Ordering::Release);
        if self.word.swap(0, Ordering::Release) & WAITERS != 0 {
            futex::wake_one(&self.word);
        }
        Ok(())
    }

    /// Current recursion count.
    ///
    /// Unsynchronized snapshot; only meaningful to the holder itself.
    pub fn lock_count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Release the lock and sleep until [`notify`](Self::notify) or timeout,
    /// then re-acquire with the previous recursion count.
    ///
    /// Must be called while holding the lock.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        if self.holder() != own_tid() {
            return Err(Error::Bug("skirmish wait without holding the lock"));
        }

        let depth = self.count.load(Ordering::Relaxed);

        // The generation is read while still holding the lock; a notify
        // between release and sleep bumps it and the futex wait returns
        // immediately.
        let generation = self.cond.load(Ordering::Acquire);

        self.count.store(0, Ordering::Release);
        if self.word.swap(0, Ordering::Release) & WAITERS != 0 {
            futex::wake_one(&self.word);
        }

        let waited = futex::wait(&self.cond, generation, timeout);

        self.prevail()?;
        self.count.store(depth, Ordering::Release);

        waited
    }

    /// Wake all current `wait`ers.
    pub fn notify(&self) -> Result<()> {
        self.cond.fetch_add(1, Ordering::AcqRel);
        futex::wake_all(&self.cond);
        Ok(())
    }

    /// Mark destroyed and wake everyone out.
    pub fn destroy(&self) {
        self.destroyed.store(1, Ordering::Release);
        self.cond.fetch_add(1, Ordering::AcqRel);
        futex::wake_all(&self.cond);
        futex::wake_all(&self.word);
    }
}

enum Target {
    Shared {
        pool: Pool,
        state: SharedPtr<SkirmishState>,
    },
    Local(Arc<SkirmishState>),
}

/// Handle to a skirmish.
///
/// Cheap to clone; clones address the same lock.
pub struct Skirmish {
    target: Target,
}

impl Clone for Skirmish {
    fn clone(&self) -> Self {
        let target = match &self.target {
            Target::Shared { pool, state } => Target::Shared {
                pool: pool.clone(),
                state: *state,
            },
            Target::Local(state) => Target::Local(Arc::clone(state)),
        };
        Self { target }
    }
}

impl Skirmish {
    /// Create a new skirmish allocated from the given pool.
    pub fn new(pool: &Pool, name: &str) -> Result<Self> {
        let state = pool.alloc_value_labeled(SkirmishState::default(), name)?;
        Ok(Self {
            target: Target::Shared {
                pool: pool.clone(),
                state,
            },
        })
    }

    /// Create a process-local skirmish.
    ///
    /// Same state machine, same invariants; the state just lives in private
    /// memory, so no other process can contend.
    pub fn new_local(_name: &str) -> Self {
        Self {
            target: Target::Local(Arc::new(SkirmishState::default())),
        }
    }

    /// Wrap a skirmish state embedded in a larger shared structure.
    ///
    /// # Safety
    ///
    /// `state` must address an initialized `SkirmishState` inside `pool`.
    pub unsafe fn from_state(pool: &Pool, state: SharedPtr<SkirmishState>) -> Self {
        Self {
            target: Target::Shared {
                pool: pool.clone(),
                state,
            },
        }
    }

    /// Offset of the state for pool-backed skirmishes, so another
    /// attachment can re-wrap the same lock; `None` for local mode.
    pub fn state_off(&self) -> Option<u32> {
        match &self.target {
            Target::Shared { state, .. } => Some(state.raw()),
            Target::Local(_) => None,
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> &SkirmishState {
        match &self.target {
            Target::Shared { pool, state } => unsafe { pool.get(*state) },
            Target::Local(state) => state,
        }
    }

    /// Ordering key for the sorted multi-lock: stable across every process
    /// in the world (pool id + offset for shared locks; locals sort last by
    /// local address since they cannot deadlock across processes).
    fn order_key(&self) -> (u8, u64) {
        match &self.target {
            Target::Shared { pool, state } => (0, ((pool.id() as u64) << 32) | state.raw() as u64),
            Target::Local(state) => (1, Arc::as_ptr(state) as u64),
        }
    }

    /// Blocking lock.
    pub fn prevail(&self) -> Result<()> {
        self.state().prevail()
    }

    /// Non-blocking try-lock.
    pub fn swoop(&self) -> Result<()> {
        self.state().swoop()
    }

    /// Unlock.
    pub fn dismiss(&self) -> Result<()> {
        self.state().dismiss()
    }

    /// Current recursion count (unsynchronized snapshot).
    pub fn lock_count(&self) -> u32 {
        self.state().lock_count()
    }

    /// Condition wait; see [`SkirmishState::wait`].
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        self.state().wait(timeout)
    }

    /// Wake all waiters.
    pub fn notify(&self) -> Result<()> {
        self.state().notify()
    }

    /// Destroy the lock, waking everyone out with `Destroyed`.
    ///
    /// The backing allocation is released with the structure that embeds
    /// it.
    pub fn destroy(&self) {
        self.state().destroy()
    }
}

/// Acquire a set of skirmishes in a fixed global order.
///
/// Always locking a set in ascending (pool, offset) order makes deadlock
/// cycles between multi-lock callers impossible.
pub fn prevail_multi(skirmishes: &[&Skirmish]) -> Result<()> {
    let mut sorted: SmallVec<[&Skirmish; 8]> = skirmishes.iter().copied().collect();
    sorted.sort_by_key(|s| s.order_key());

    for (i, skirmish) in sorted.iter().enumerate() {
        if let Err(err) = skirmish.prevail() {
            for locked in &sorted[..i] {
                let _ = locked.dismiss();
            }
            return Err(err);
        }
    }
    Ok(())
}

/// Release a set previously acquired with [`prevail_multi`].
pub fn dismiss_multi(skirmishes: &[&Skirmish]) -> Result<()> {
    let mut sorted: SmallVec<[&Skirmish; 8]> = skirmishes.iter().copied().collect();
    sorted.sort_by_key(|s| s.order_key());

    for skirmish in sorted.iter().rev() {
        skirmish.dismiss()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn test_recursive_prevail_dismiss() {
        let lock = Skirmish::new_local("test");

        lock.prevail().unwrap();
        lock.prevail().unwrap();
        lock.prevail().unwrap();
        assert_eq!(lock.lock_count(), 3);

        lock.dismiss().unwrap();
        lock.dismiss().unwrap();
        assert_eq!(lock.lock_count(), 1);

        lock.dismiss().unwrap();
        assert_eq!(lock.lock_count(), 0);
    }

    #[test]
    fn test_swoop_busy_while_held_elsewhere() {
        let lock = Skirmish::new_local("busy");
        let contender = lock.clone();

        lock.prevail().unwrap();

        let handle = std::thread::spawn(move || contender.swoop());
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(Error::Busy)));

        lock.dismiss().unwrap();
    }

    #[test]
    fn test_n_dismisses_release_for_other_thread() {
        let lock = Skirmish::new_local("count");
        let other = lock.clone();

        lock.prevail().unwrap();
        lock.prevail().unwrap();

        let handle = std::thread::spawn(move || {
            other.prevail().unwrap();
            other.dismiss().unwrap();
        });

        std::thread::sleep(Duration::from_millis(20));
        lock.dismiss().unwrap();
        // Still held once: the other thread must still be blocked.
        std::thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());

        lock.dismiss().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_dismiss_by_non_holder_is_a_bug() {
        let lock = Skirmish::new_local("foreign");
        let other = lock.clone();

        lock.prevail().unwrap();
        let result = std::thread::spawn(move || other.dismiss()).join().unwrap();
        assert!(matches!(result, Err(Error::Bug(_))));
        lock.dismiss().unwrap();
    }

    #[test]
    fn test_mutual_exclusion_under_contention() {
        let lock = Skirmish::new_local("contended");
        let counter = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = lock.clone();
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        lock.prevail().unwrap();
                        // Non-atomic read-modify-write protected by the lock.
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                        lock.dismiss().unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 8 * 500);
    }

    #[test]
    fn test_wait_notify() {
        let lock = Skirmish::new_local("cond");
        let waiter_lock = lock.clone();
        let ready = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&ready);

        let waiter = std::thread::spawn(move || {
            waiter_lock.prevail().unwrap();
            waiter_lock.prevail().unwrap();
            seen.store(1, Ordering::Release);
            waiter_lock.wait(Some(Duration::from_secs(5))).unwrap();
            // Recursion depth restored after wake-up.
            assert_eq!(waiter_lock.lock_count(), 2);
            waiter_lock.dismiss().unwrap();
            waiter_lock.dismiss().unwrap();
        });

        while ready.load(Ordering::Acquire) == 0 {
            std::thread::yield_now();
        }
        std::thread::sleep(Duration::from_millis(20));

        lock.prevail().unwrap();
        lock.notify().unwrap();
        lock.dismiss().unwrap();

        waiter.join().unwrap();
    }

    #[test]
    fn test_wait_timeout() {
        let lock = Skirmish::new_local("timeout");
        lock.prevail().unwrap();
        let err = lock.wait(Some(Duration::from_millis(20))).unwrap_err();
        assert!(matches!(err, Error::Timeout));
        // The lock is re-acquired even on timeout.
        assert_eq!(lock.lock_count(), 1);
        lock.dismiss().unwrap();
    }

    #[test]
    fn test_multi_lock_orders_consistently() {
        let a = Skirmish::new_local("a");
        let b = Skirmish::new_local("b");

        // Two threads locking the pair in opposite declaration order must
        // not deadlock.
        let (a1, b1) = (a.clone(), b.clone());
        let (a2, b2) = (a.clone(), b.clone());

        let t1 = std::thread::spawn(move || {
            for _ in 0..200 {
                prevail_multi(&[&a1, &b1]).unwrap();
                dismiss_multi(&[&a1, &b1]).unwrap();
            }
        });
        let t2 = std::thread::spawn(move || {
            for _ in 0..200 {
                prevail_multi(&[&b2, &a2]).unwrap();
                dismiss_multi(&[&b2, &a2]).unwrap();
            }
        });

        t1.join().unwrap();
        t2.join().unwrap();
    }

    #[test]
    fn test_destroy_wakes_contenders() {
        let lock = Skirmish::new_local("destroyed");
        let contender = lock.clone();

        lock.prevail().unwrap();
        let handle = std::thread::spawn(move || contender.prevail());

        std::thread::sleep(Duration::from_millis(20));
        lock.destroy();

        let result = handle.join().unwrap();
        assert!(matches!(result, Err(Error::Destroyed)));
    }
}
