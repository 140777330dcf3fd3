//! Integration tests for world membership, calls and reactors.
//!
//! A second attachment of the same world inside the test process stands in
//! for a slave fusionee: it binds its own socket, runs its own dispatch
//! thread and maps the shared pool at its own base address, exercising the
//! same code paths a separate process would.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fusion::arena::{Arena, EnterOutcome};
use fusion::call::{Call, CallHandlerResult};
use fusion::conf::FusionConfig;
use fusion::error::Error;
use fusion::reactor::{ReactionResult, Reactor};
use fusion::sync::skirmish::Skirmish;
use fusion::world::{EnterRole, World};

fn test_conf(dir: &tempfile::TempDir) -> FusionConfig {
    let mut conf = FusionConfig::default();
    conf.tmpfs = Some(dir.path().to_path_buf());
    conf.socket_dir = Some(dir.path().to_path_buf());
    conf.main_pool_size = 4 * 1024 * 1024;
    conf
}

fn enter_pair(dir: &tempfile::TempDir) -> (World, World) {
    let conf = test_conf(dir);
    let master = World::enter(0, 1, EnterRole::Master, conf.clone()).unwrap();
    let slave = World::enter(0, 1, EnterRole::Slave, conf).unwrap();
    (master, slave)
}

#[test]
fn test_master_slave_roles() {
    let dir = tempfile::tempdir().unwrap();
    let (master, slave) = enter_pair(&dir);

    assert!(master.is_master());
    assert!(!slave.is_master());
    assert_eq!(master.fusion_id(), 1);
    assert_ne!(slave.fusion_id(), 1);

    // The master slot is taken.
    match World::enter(0, 1, EnterRole::Master, test_conf(&dir)) {
        Err(Error::Init(_)) => {}
        other => panic!("expected Init error, got {other:?}"),
    }

    slave.exit(false).unwrap();
    master.exit(false).unwrap();
}

#[test]
fn test_abi_mismatch_is_a_hard_join_failure() {
    let dir = tempfile::tempdir().unwrap();
    let conf = test_conf(&dir);

    let master = World::enter(0, 7, EnterRole::Master, conf.clone()).unwrap();

    match World::enter(0, 8, EnterRole::Slave, conf) {
        Err(Error::VersionMismatch { ours: 8, theirs: 7 }) => {}
        other => panic!("expected VersionMismatch, got {other:?}"),
    }

    master.exit(false).unwrap();
}

#[test]
fn test_arena_bootstrap_across_attachments() {
    let dir = tempfile::tempdir().unwrap();
    let (master, slave) = enter_pair(&dir);

    let (master_arena, outcome) = Arena::enter(
        &master,
        "core",
        |arena| {
            let data = arena.world().main_pool().alloc_str("window stack v1")?;
            arena.add_shared_field("windows", data)
        },
        |_| panic!("master must establish"),
    )
    .unwrap();
    assert_eq!(outcome, EnterOutcome::Established);

    // The slave joins and recovers the published pointer through its own
    // mapping.
    let (slave_arena, outcome) = Arena::enter(
        &slave,
        "core",
        |_| panic!("slave must join"),
        |_| Ok(()),
    )
    .unwrap();
    assert_eq!(outcome, EnterOutcome::Joined);

    let field = slave_arena.get_shared_field("windows").unwrap();
    assert_eq!(slave.main_pool().read_str(field), "window stack v1");

    slave_arena
        .exit(
            |_, _| panic!("not the last"),
            Some(|_: &Arena, _| Ok(())),
            false,
        )
        .unwrap();
    master_arena
        .exit(
            |_, _| Ok(()),
            None::<fn(&Arena, bool) -> fusion::Result<()>>,
            false,
        )
        .unwrap();

    slave.exit(false).unwrap();
    master.exit(false).unwrap();
}

#[test]
fn test_blocking_call_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let (master, slave) = enter_pair(&dir);

    let call = Call::new(&master, |_world, args| {
        CallHandlerResult::Return(args.arg * 2)
    })
    .unwrap();

    // Hand the registration to the "other process".
    let remote = Call::init_from(&slave, call.id(), call.owner());
    assert_eq!(remote.execute(21, b"payload").unwrap(), 42);

    slave.exit(false).unwrap();
    master.exit(false).unwrap();
}

#[test]
fn test_concurrent_blocking_calls_with_retained_replies() {
    let dir = tempfile::tempdir().unwrap();
    let (master, slave) = enter_pair(&dir);

    const CALLERS: usize = 6;

    // The handler retains every request; a replier thread answers them in
    // reverse arrival order, so replies must be matched by serial, not by
    // ordering.
    let retained: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&retained);

    let call = Call::new(&master, move |_world, args| {
        seen.lock().unwrap().push(args.serial);
        CallHandlerResult::Retain
    })
    .unwrap();

    let replier_call = call.clone();
    let replier_retained = Arc::clone(&retained);
    let replier = std::thread::spawn(move || {
        loop {
            let serials: Vec<u32> = {
                let queue = replier_retained.lock().unwrap();
                if queue.len() < CALLERS {
                    drop(queue);
                    std::thread::sleep(Duration::from_millis(10));
                    continue;
                }
                queue.iter().rev().copied().collect()
            };

            for serial in serials {
                // The retained entry appears shortly after the handler
                // returns; retry until the reply goes through.
                loop {
                    match replier_call.call_return(serial, serial as i32 + 1000) {
                        Ok(()) => break,
                        Err(Error::IdNotFound(_)) => {
                            std::thread::sleep(Duration::from_millis(5))
                        }
                        Err(err) => panic!("call_return failed: {err}"),
                    }
                }
            }
            break;
        }
    });

    let handles: Vec<_> = (0..CALLERS)
        .map(|i| {
            let remote = Call::init_from(&slave, call.id(), call.owner());
            std::thread::spawn(move || {
                let serial = remote.execute_queued(i as i32, &[]).unwrap();
                let value = remote.fetch_reply(serial).unwrap();
                // Each caller gets the reply for its own serial.
                assert_eq!(value, serial as i32 + 1000);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    replier.join().unwrap();

    slave.exit(false).unwrap();
    master.exit(false).unwrap();
}

#[test]
fn test_call_quota_limits_outstanding_calls() {
    let dir = tempfile::tempdir().unwrap();
    let (master, slave) = enter_pair(&dir);

    // Retain without replying, so calls stay outstanding.
    let call = Call::new(&master, |_world, _args| CallHandlerResult::Retain).unwrap();
    call.set_quota(slave.fusion_id(), 2).unwrap();

    let remote = Call::init_from(&slave, call.id(), call.owner());

    let first = remote.execute_queued(1, &[]).unwrap();
    let second = remote.execute_queued(2, &[]).unwrap();

    // Give the master's dispatch thread time to account for both.
    std::thread::sleep(Duration::from_millis(100));

    let third = remote.execute_queued(3, &[]).unwrap();
    match remote.fetch_reply(third) {
        Err(Error::LimitExceeded) => {}
        other => panic!("expected LimitExceeded, got {other:?}"),
    }

    // Draining both slots makes room again.
    call.call_return(first, 0).unwrap();
    remote.fetch_reply(first).unwrap();
    call.call_return(second, 0).unwrap();
    remote.fetch_reply(second).unwrap();

    let fourth = remote.execute_queued(4, &[]).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    call.call_return(fourth, 0).unwrap();
    remote.fetch_reply(fourth).unwrap();

    slave.exit(false).unwrap();
    master.exit(false).unwrap();
}

#[test]
fn test_call_to_dead_owner() {
    let dir = tempfile::tempdir().unwrap();
    let (master, slave) = enter_pair(&dir);

    let call = Call::new(&slave, |_world, _args| CallHandlerResult::Return(0)).unwrap();
    let remote = Call::init_from(&master, call.id(), call.owner());

    slave.exit(false).unwrap();

    match remote.execute(0, &[]) {
        Err(Error::Dead) | Err(Error::Timeout) => {}
        other => panic!("expected Dead or Timeout, got {other:?}"),
    }

    master.exit(false).unwrap();
}

#[test]
fn test_reactor_delivers_across_attachments() {
    let dir = tempfile::tempdir().unwrap();
    let (master, slave) = enter_pair(&dir);

    let reactor = Reactor::new(&master, 128, "surface updates").unwrap();

    // Hand the reactor to the slave through an arena field.
    let (master_arena, _) = Arena::enter(
        &master,
        "reactors",
        |arena| arena.add_shared_field("surface updates", reactor.state_ptr().cast()),
        |_| panic!("must establish"),
    )
    .unwrap();

    let (slave_arena, _) =
        Arena::enter(&slave, "reactors", |_| panic!("must join"), |_| Ok(())).unwrap();

    let field = slave_arena.get_shared_field("surface updates").unwrap();
    let slave_reactor = unsafe { Reactor::from_state(&slave, field.cast()) };

    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    let _reaction = slave_reactor
        .attach(move |msg| {
            assert_eq!(msg, b"flip");
            counter.fetch_add(1, Ordering::SeqCst);
            ReactionResult::Ok
        })
        .unwrap();

    // Master dispatches; the slave's dispatch thread delivers.
    reactor.dispatch(b"flip", false, None).unwrap();

    let mut waited = 0;
    while received.load(Ordering::SeqCst) == 0 && waited < 200 {
        std::thread::sleep(Duration::from_millis(10));
        waited += 1;
    }
    assert_eq!(received.load(Ordering::SeqCst), 1);

    slave_arena
        .exit(
            |_, _| panic!("not the last"),
            Some(|_: &Arena, _| Ok(())),
            false,
        )
        .unwrap();
    master_arena
        .exit(
            |_, _| Ok(()),
            None::<fn(&Arena, bool) -> fusion::Result<()>>,
            false,
        )
        .unwrap();

    reactor.free().unwrap();
    slave.exit(false).unwrap();
    master.exit(false).unwrap();
}

#[test]
fn test_skirmish_excludes_across_attachments() {
    let dir = tempfile::tempdir().unwrap();
    let (master, slave) = enter_pair(&dir);

    let lock = Skirmish::new(master.main_pool(), "shared counter").unwrap();
    let counter_ptr = master.main_pool().alloc_value(0u64).unwrap();

    // The slave addresses the same lock through its own mapping.
    let slave_lock = unsafe {
        Skirmish::from_state(
            slave.main_pool(),
            fusion::shm::SharedPtr::from_raw(lock_state_off(&lock)),
        )
    };

    let rounds = 400;
    let master_pool = master.main_pool().clone();
    let slave_pool = slave.main_pool().clone();
    let master_counter = counter_ptr;
    let slave_counter = counter_ptr;

    let m = {
        let lock = lock.clone();
        std::thread::spawn(move || {
            for _ in 0..rounds {
                lock.prevail().unwrap();
                unsafe {
                    *master_pool.get_mut(master_counter) += 1;
                }
                lock.dismiss().unwrap();
            }
        })
    };
    let s = std::thread::spawn(move || {
        for _ in 0..rounds {
            slave_lock.prevail().unwrap();
            unsafe {
                *slave_pool.get_mut(slave_counter) += 1;
            }
            slave_lock.dismiss().unwrap();
        }
    });

    m.join().unwrap();
    s.join().unwrap();

    assert_eq!(unsafe { *master.main_pool().get(counter_ptr) }, 2 * rounds);

    slave.exit(false).unwrap();
    master.exit(false).unwrap();
}

#[test]
fn test_leave_callback_fires_on_slave_exit() {
    let dir = tempfile::tempdir().unwrap();
    let (master, slave) = enter_pair(&dir);
    let slave_id = slave.fusion_id();

    let left: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&left);
    master.set_leave_callback(move |fusion_id| {
        sink.lock().unwrap().push(fusion_id);
    });

    slave.exit(false).unwrap();

    let mut waited = 0;
    while left.lock().unwrap().is_empty() && waited < 200 {
        std::thread::sleep(Duration::from_millis(10));
        waited += 1;
    }
    assert_eq!(*left.lock().unwrap(), vec![slave_id]);

    master.exit(false).unwrap();
}

/// Offset of a pool-backed skirmish's state, for re-wrapping through a
/// second attachment.
fn lock_state_off(lock: &Skirmish) -> u32 {
    lock.state_off().expect("pool-backed skirmish")
}
