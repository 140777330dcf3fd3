//! Futex wait/wake on a shared word.
//!
//! Waiters in different processes block on a word inside a `MAP_SHARED`
//! mapping; the kernel keys non-private futexes by the backing page, so
//! wake-ups work even though each process maps the segment at a different
//! address.

use std::sync::atomic::AtomicU32;
use std::time::Duration;

use rustix::thread::futex;

use crate::error::{Error, Result};

/// Wait until `word` no longer holds `expected`, a wake-up arrives, or the
/// timeout expires.
///
/// Returns `Ok` on wake-ups and on the value-already-changed and
/// interrupted-by-signal cases: the caller re-checks its predicate in a
/// loop either way.
pub(crate) fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> Result<()> {
    let timespec = timeout.map(|d| rustix::time::Timespec {
        tv_sec: d.as_secs() as i64,
        tv_nsec: d.subsec_nanos() as i64,
    });

    match futex::wait(word, futex::Flags::empty(), expected, timespec.as_ref()) {
        Ok(()) => Ok(()),
        Err(rustix::io::Errno::AGAIN) | Err(rustix::io::Errno::INTR) => Ok(()),
        Err(rustix::io::Errno::TIMEDOUT) => Err(Error::Timeout),
        Err(err) => Err(err.into()),
    }
}

/// Wake one waiter blocked on `word`.
pub(crate) fn wake_one(word: &AtomicU32) {
    let _ = futex::wake(word, futex::Flags::empty(), 1);
}

/// Wake every waiter blocked on `word`.
pub(crate) fn wake_all(word: &AtomicU32) {
    let _ = futex::wake(word, futex::Flags::empty(), i32::MAX as u32);
}

/// Whether the process with the given pid still exists.
///
/// Used for abandoned-lock recovery: a contender probing a recorded owner.
pub(crate) fn process_alive(pid: u32) -> bool {
    match rustix::process::Pid::from_raw(pid as i32) {
        Some(pid) => match rustix::process::test_kill_process(pid) {
            Ok(()) => true,
            // EPERM still proves existence.
            Err(rustix::io::Errno::PERM) => true,
            Err(_) => false,
        },
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_wait_returns_when_value_differs() {
        let word = AtomicU32::new(5);
        // Expected value does not match: must not block.
        wait(&word, 4, None).unwrap();
    }

    #[test]
    fn test_wait_timeout() {
        let word = AtomicU32::new(1);
        let err = wait(&word, 1, Some(Duration::from_millis(10))).unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[test]
    fn test_wake_unblocks_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let waiter = {
            let word = Arc::clone(&word);
            std::thread::spawn(move || {
                while word.load(Ordering::Acquire) == 0 {
                    wait(&word, 0, Some(Duration::from_secs(5))).unwrap();
                }
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        word.store(1, Ordering::Release);
        wake_all(&word);
        waiter.join().unwrap();
    }

    #[test]
    fn test_own_process_is_alive() {
        let pid = rustix::process::getpid().as_raw_nonzero().get() as u32;
        assert!(process_alive(pid));
    }
}
