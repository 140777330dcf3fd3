//! The World: process group membership, bootstrap, and message dispatch.
//!
//! A world is identified by a small index. The first process to bind the
//! master socket name becomes master, creates the world's main shared
//! memory pool and publishes the shared world header inside it; every
//! later process attaches as a slave under an auto-generated fusion id and
//! announces itself to the master.
//!
//! Each world runs exactly one dispatch thread per process, draining the
//! fusionee's datagram socket and delivering calls, call replies and
//! reactor messages to local handlers.

pub(crate) mod dispatch;
pub mod protocol;

use std::collections::HashMap;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use crate::call::CallHandlerEntry;
use crate::conf::{ForkAction, FusionConfig};
use crate::error::{Error, Result};
use crate::reactor::ReactorNode;
use crate::shm::{tmpfs_dir, Pool, SharedPtr};
use crate::sync::skirmish::SkirmishState;
use self::protocol::WireMessage;

/// The master's fusion id.
pub const FUSION_ID_MASTER: u32 = 1;

/// Highest usable world index.
pub const MAX_WORLDS: u32 = 8;

const WORLD_MAGIC: u64 = 0x4655_5357_4f52_4c44; // "FUSWORLD"

/// How long a joining slave waits for the master's acknowledgement.
const ENTER_TIMEOUT: Duration = Duration::from_secs(2);

/// Maximum number of shared memory pools per world.
pub const MAX_POOLS: usize = 16;

/// Role requested when entering a world.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EnterRole {
    /// Become master if the slot is free, slave otherwise.
    #[default]
    Any,
    /// Fail unless we become master.
    Master,
    /// Never become master.
    Slave,
}

/// Descriptor of a registered pool, for slave attachment.
#[repr(C)]
pub(crate) struct PoolDesc {
    pub(crate) active: AtomicU32,
    pub(crate) pool_id: AtomicU32,
    pub(crate) max_size: AtomicU32,
}

/// Shared world header, allocated in the main pool and published through
/// the pool's user-root slot.
#[repr(C)]
pub(crate) struct WorldShared {
    pub(crate) magic: AtomicU64,
    pub(crate) abi: AtomicU32,
    pub(crate) index: AtomicU32,

    pub(crate) next_call_id: AtomicU32,
    pub(crate) next_reactor_id: AtomicU32,
    pub(crate) next_ref_id: AtomicU32,
    pub(crate) next_pool_id: AtomicU32,

    pub(crate) fusionee_count: AtomicU32,

    /// Offset of the platform root structure (set by the master).
    pub(crate) world_root: AtomicU32,

    /// Guards the arena list.
    pub(crate) arenas_lock: SkirmishState,
    pub(crate) arenas_head: AtomicU32,

    /// Default lock for reactor global reactions.
    pub(crate) reactor_globals: SkirmishState,

    /// Guards the pool table.
    pub(crate) pools_lock: SkirmishState,
    pub(crate) pools: [PoolDesc; MAX_POOLS],
}

/// One member of the world, tracked by the master.
#[derive(Clone, Copy, Debug)]
pub struct Fusionee {
    /// The member's fusion id.
    pub fusion_id: u32,
    /// The member's process id.
    pub pid: u32,
}

type Cleanup = Box<dyn Fn() + Send>;
type LeaveCallback = Box<dyn Fn(u32) + Send>;
type Deferred = Box<dyn FnOnce() + Send>;

pub(crate) struct WorldInner {
    pub(crate) conf: FusionConfig,
    index: u32,
    pub(crate) fusion_id: u32,
    socket: UnixDatagram,
    socket_dir: PathBuf,
    socket_path: PathBuf,
    pool: Pool,
    shared: SharedPtr<WorldShared>,

    pub(crate) stop: AtomicBool,
    dispatch_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    dispatcher_tid: AtomicU32,

    // Call machinery.
    next_serial: AtomicU32,
    pub(crate) call_handlers: RwLock<HashMap<u32, Arc<CallHandlerEntry>>>,
    pending: Mutex<HashMap<u32, Option<(u8, i32)>>>,
    pending_cond: Condvar,
    pub(crate) retained: Mutex<HashMap<u32, (u32, u32)>>,
    pub(crate) quotas: Mutex<HashMap<(u32, u32), u32>>,
    pub(crate) outstanding: Mutex<HashMap<(u32, u32), u32>>,

    // Reactor machinery.
    pub(crate) reactor_nodes: RwLock<HashMap<u32, Arc<ReactorNode>>>,

    // Master-side member table.
    fusionees: Mutex<Vec<Fusionee>>,
    leave_callback: Mutex<Option<LeaveCallback>>,

    fork_action: Mutex<ForkAction>,

    cleanups: Mutex<Vec<(u64, Cleanup)>>,
    next_cleanup_id: AtomicU64,

    deferred_tx: Mutex<Option<std::sync::mpsc::Sender<Deferred>>>,
    deferred_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

/// Handle to an entered world. Cheap to clone; all clones address the same
/// membership.
#[derive(Clone)]
pub struct World(pub(crate) Arc<WorldInner>);

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("index", &self.0.index)
            .field("fusion_id", &self.0.fusion_id)
            .finish_non_exhaustive()
    }
}

impl World {
    /// Enter a world, becoming master or slave according to `role`.
    ///
    /// An ABI version mismatch between fusionees is a hard join failure.
    pub fn enter(index: u32, abi_version: u32, role: EnterRole, conf: FusionConfig) -> Result<Self> {
        if index >= MAX_WORLDS {
            return Err(Error::InvalidArg("world index exceeds maximum"));
        }

        let role = if conf.force_slave { EnterRole::Slave } else { role };

        let base = conf
            .socket_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("/tmp"));
        let socket_dir = base.join(format!(".fusion-{index}"));
        create_socket_dir(&socket_dir, &conf)?;

        // Whoever binds the master name is the master.
        let (socket, fusion_id, socket_path) = bind_socket(&socket_dir, role)?;
        let master = fusion_id == FUSION_ID_MASTER;

        tracing::debug!(index, fusion_id, master, "entering world");

        let core_path = tmpfs_dir(&conf).join(format!("fusion.{index}.core"));

        let (pool, shared) = if master {
            let pool = Pool::create(
                &core_path,
                "fusion main pool",
                0,
                conf.main_pool_size,
                &conf,
                fusion_id,
            )?;

            let shared = pool.alloc_value_labeled(
                WorldSharedInit {
                    abi: abi_version,
                    index,
                }
                .build(),
                "world shared",
            )?;
            pool.set_user_root(shared.cast());
            (pool, shared)
        } else {
            let writable = !conf.secure_fusion;
            let pool = Pool::attach(&core_path, conf.main_pool_size, writable, fusion_id).map_err(
                |err| {
                    let _ = std::fs::remove_file(&socket_path);
                    err
                },
            )?;

            let shared: SharedPtr<WorldShared> = pool.user_root().cast();
            if shared.is_null() {
                let _ = std::fs::remove_file(&socket_path);
                return Err(Error::Init("world header not published".into()));
            }

            let header = unsafe { pool.get(shared) };
            if header.magic.load(Ordering::Acquire) != WORLD_MAGIC {
                let _ = std::fs::remove_file(&socket_path);
                return Err(Error::Init("world magic mismatch".into()));
            }
            let abi = header.abi.load(Ordering::Acquire);
            if abi != abi_version {
                let _ = std::fs::remove_file(&socket_path);
                return Err(Error::VersionMismatch {
                    ours: abi_version,
                    theirs: abi,
                });
            }
            (pool, shared)
        };

        let world = World(Arc::new(WorldInner {
            conf,
            index,
            fusion_id,
            socket,
            socket_dir,
            socket_path,
            pool,
            shared,
            stop: AtomicBool::new(false),
            dispatch_thread: Mutex::new(None),
            dispatcher_tid: AtomicU32::new(0),
            next_serial: AtomicU32::new(1),
            call_handlers: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            pending_cond: Condvar::new(),
            retained: Mutex::new(HashMap::new()),
            quotas: Mutex::new(HashMap::new()),
            outstanding: Mutex::new(HashMap::new()),
            reactor_nodes: RwLock::new(HashMap::new()),
            fusionees: Mutex::new(Vec::new()),
            leave_callback: Mutex::new(None),
            fork_action: Mutex::new(ForkAction::default()),
            cleanups: Mutex::new(Vec::new()),
            next_cleanup_id: AtomicU64::new(1),
            deferred_tx: Mutex::new(None),
            deferred_thread: Mutex::new(None),
        }));

        if master {
            world.0.fusionees.lock().unwrap().push(Fusionee {
                fusion_id: FUSION_ID_MASTER,
                pid: own_pid(),
            });
            world.shared().fusionee_count.store(1, Ordering::Release);
        } else {
            world.join_handshake()?;
        }

        world.spawn_dispatch();
        if world.0.conf.defer_destructors {
            world.spawn_deferred();
        }

        Ok(world)
    }

    /// Leave the world.
    ///
    /// With `emergency` set, graceful negotiation with the master is
    /// skipped and the dispatch thread is abandoned instead of joined.
    pub fn exit(self, emergency: bool) -> Result<()> {
        tracing::debug!(
            fusion_id = self.fusion_id(),
            emergency,
            "exiting world"
        );

        if !self.is_master() && !emergency {
            let _ = self.send_to(
                FUSION_ID_MASTER,
                &WireMessage::Leave {
                    fusion_id: self.fusion_id(),
                },
            );
        }

        self.0.stop.store(true, Ordering::Release);
        let _ = self.send_to(self.fusion_id(), &WireMessage::Wakeup);

        if let Some(handle) = self.0.dispatch_thread.lock().unwrap().take() {
            if emergency {
                drop(handle);
            } else {
                let _ = handle.join();
            }
        }

        // Stop the deferred-destructor thread by dropping its sender.
        *self.0.deferred_tx.lock().unwrap() = None;
        if let Some(handle) = self.0.deferred_thread.lock().unwrap().take() {
            if emergency {
                drop(handle);
            } else {
                let _ = handle.join();
            }
        }

        let _ = std::fs::remove_file(&self.0.socket_path);

        if self.is_master() {
            self.0.pool.destroy();
            let _ = std::fs::remove_dir(&self.0.socket_dir);
        }

        Ok(())
    }

    /// This process's fusion id within the world.
    pub fn fusion_id(&self) -> u32 {
        self.0.fusion_id
    }

    /// The world index.
    pub fn index(&self) -> u32 {
        self.0.index
    }

    /// Whether this process is the world's master.
    pub fn is_master(&self) -> bool {
        self.0.fusion_id == FUSION_ID_MASTER
    }

    /// The world's main shared memory pool.
    pub fn main_pool(&self) -> &Pool {
        &self.0.pool
    }

    /// The configuration this world was entered with.
    pub fn conf(&self) -> &FusionConfig {
        &self.0.conf
    }

    /// Kernel thread id of the dispatch thread, 0 before it runs.
    pub fn dispatcher_tid(&self) -> u32 {
        self.0.dispatcher_tid.load(Ordering::Acquire)
    }

    /// Publish the platform root structure (master only).
    pub fn set_root(&self, root: SharedPtr<u8>) -> Result<()> {
        if !self.is_master() {
            return Err(Error::AccessDenied);
        }
        self.shared().world_root.store(root.raw(), Ordering::Release);
        Ok(())
    }

    /// The published platform root.
    pub fn root(&self) -> SharedPtr<u8> {
        SharedPtr::from_raw(self.shared().world_root.load(Ordering::Acquire))
    }

    /// Current members, as known to the master.
    pub fn fusionees(&self) -> Vec<Fusionee> {
        self.0.fusionees.lock().unwrap().clone()
    }

    /// Send a signal to one fusionee (master only); `fusion_id` 0 targets
    /// every slave.
    pub fn kill(&self, fusion_id: u32, signal: rustix::process::Signal) -> Result<()> {
        if !self.is_master() {
            return Err(Error::AccessDenied);
        }

        let members = self.0.fusionees.lock().unwrap().clone();
        for member in members {
            if member.fusion_id == FUSION_ID_MASTER {
                continue;
            }
            if fusion_id != 0 && member.fusion_id != fusion_id {
                continue;
            }
            if let Some(pid) = rustix::process::Pid::from_raw(member.pid as i32) {
                let _ = rustix::process::kill_process(pid, signal);
            }
        }
        Ok(())
    }

    /// Drain pending outbound traffic.
    ///
    /// Datagram sends complete synchronously, so there is nothing to wait
    /// for; the call exists as the synchronization point collaborators
    /// invoke between mutation and hand-off.
    pub fn sync(&self) -> Result<()> {
        Ok(())
    }

    /// Register a callback run when a slave leaves the world.
    pub fn set_leave_callback(&self, callback: impl Fn(u32) + Send + 'static) {
        *self.0.leave_callback.lock().unwrap() = Some(Box::new(callback));
    }

    /// The action a forked child should take.
    pub fn fork_action(&self) -> ForkAction {
        *self.0.fork_action.lock().unwrap()
    }

    /// Set the action a forked child should take.
    pub fn set_fork_action(&self, action: ForkAction) {
        *self.0.fork_action.lock().unwrap() = action;
    }

    /// Create an additional shared memory pool (registered in the world's
    /// pool table so slaves can attach it).
    pub fn create_pool(&self, name: &str, max_size: usize) -> Result<Pool> {
        let shared = self.shared();
        shared.pools_lock.prevail()?;

        let result = (|| {
            let slot = shared
                .pools
                .iter()
                .position(|d| d.active.load(Ordering::Acquire) == 0)
                .ok_or(Error::LimitExceeded)?;

            let pool_id = shared.next_pool_id.fetch_add(1, Ordering::AcqRel);
            let path = self.pool_path(pool_id);
            let pool = Pool::create(&path, name, pool_id, max_size, &self.0.conf, self.fusion_id())?;

            let desc = &shared.pools[slot];
            desc.pool_id.store(pool_id, Ordering::Release);
            desc.max_size.store(max_size as u32, Ordering::Release);
            desc.active.store(1, Ordering::Release);

            Ok(pool)
        })();

        shared.pools_lock.dismiss()?;
        result
    }

    /// Attach a pool created by another fusionee.
    pub fn attach_pool(&self, pool_id: u32) -> Result<Pool> {
        let shared = self.shared();
        shared.pools_lock.prevail()?;

        let result = (|| {
            let desc = shared
                .pools
                .iter()
                .find(|d| {
                    d.active.load(Ordering::Acquire) != 0
                        && d.pool_id.load(Ordering::Acquire) == pool_id
                })
                .ok_or(Error::IdNotFound(pool_id))?;

            let max_size = desc.max_size.load(Ordering::Acquire) as usize;
            let writable = !self.0.conf.secure_fusion || self.is_master();
            Pool::attach(&self.pool_path(pool_id), max_size, writable, self.fusion_id())
        })();

        shared.pools_lock.dismiss()?;
        result
    }

    /// Add a callback run after every dispatched message; returns a handle
    /// for removal.
    pub fn dispatch_cleanup_add(&self, cleanup: impl Fn() + Send + 'static) -> u64 {
        let id = self.0.next_cleanup_id.fetch_add(1, Ordering::Relaxed);
        self.0
            .cleanups
            .lock()
            .unwrap()
            .push((id, Box::new(cleanup)));
        id
    }

    /// Remove a dispatch cleanup callback.
    pub fn dispatch_cleanup_remove(&self, id: u64) {
        self.0.cleanups.lock().unwrap().retain(|(i, _)| *i != id);
    }

    /// Hand work to the deferred-destructor thread, or run it inline when
    /// deferral is off.
    pub(crate) fn defer_or_run(&self, work: Deferred) {
        let sent = {
            let tx = self.0.deferred_tx.lock().unwrap();
            match tx.as_ref() {
                Some(tx) => tx.send(work).map_err(|e| e.0).err(),
                None => Some(work),
            }
        };
        if let Some(work) = sent {
            work();
        }
    }

    // ----------------------------------------------------------------
    // crate-internal plumbing
    // ----------------------------------------------------------------

    pub(crate) fn shared(&self) -> &WorldShared {
        unsafe { self.0.pool.get(self.0.shared) }
    }

    pub(crate) fn shared_ptr_raw(&self) -> u32 {
        self.0.shared.raw()
    }

    pub(crate) fn next_serial(&self) -> u32 {
        self.0.next_serial.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_call_id(&self) -> u32 {
        self.shared().next_call_id.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn next_reactor_id(&self) -> u32 {
        self.shared().next_reactor_id.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn next_ref_id(&self) -> u32 {
        self.shared().next_ref_id.fetch_add(1, Ordering::AcqRel)
    }

    /// Serialize and send a message to the given fusionee's socket.
    pub(crate) fn send_to(&self, fusion_id: u32, msg: &WireMessage) -> Result<()> {
        let bytes = protocol::encode(msg)?;
        let path = self.0.socket_dir.join(format!("{fusion_id:x}"));
        match self.0.socket.send_to(&bytes, &path) {
            Ok(_) => Ok(()),
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
                ) =>
            {
                Err(Error::Dead)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Park until a call reply for `serial` arrives.
    pub(crate) fn wait_reply(&self, serial: u32, timeout: Duration) -> Result<(u8, i32)> {
        let deadline = std::time::Instant::now() + timeout;
        let mut pending = self.0.pending.lock().unwrap();
        loop {
            match pending.get(&serial) {
                Some(Some(reply)) => {
                    let reply = *reply;
                    pending.remove(&serial);
                    return Ok(reply);
                }
                Some(None) => {}
                None => return Err(Error::Bug("waiting for an unregistered call serial")),
            }

            let now = std::time::Instant::now();
            if now >= deadline {
                pending.remove(&serial);
                return Err(Error::Timeout);
            }
            let (guard, _) = self
                .0
                .pending_cond
                .wait_timeout(pending, deadline - now)
                .unwrap();
            pending = guard;
        }
    }

    /// Register interest in a reply before sending the request.
    pub(crate) fn register_pending(&self, serial: u32) {
        self.0.pending.lock().unwrap().insert(serial, None);
    }

    /// Drop interest (send failed).
    pub(crate) fn unregister_pending(&self, serial: u32) {
        self.0.pending.lock().unwrap().remove(&serial);
    }

    /// Complete a pending reply and wake its waiter.
    pub(crate) fn complete_pending(&self, serial: u32, status: u8, value: i32) {
        let mut pending = self.0.pending.lock().unwrap();
        if let Some(slot) = pending.get_mut(&serial) {
            *slot = Some((status, value));
            self.0.pending_cond.notify_all();
        } else {
            tracing::debug!(serial, "dropping reply for unknown call serial");
        }
    }

    pub(crate) fn run_cleanups(&self) {
        let cleanups = self.0.cleanups.lock().unwrap();
        for (_, cleanup) in cleanups.iter() {
            cleanup();
        }
    }

    pub(crate) fn add_fusionee(&self, fusion_id: u32, pid: u32) {
        let mut members = self.0.fusionees.lock().unwrap();
        if members.iter().all(|m| m.fusion_id != fusion_id) {
            members.push(Fusionee { fusion_id, pid });
            self.shared().fusionee_count.fetch_add(1, Ordering::AcqRel);
            tracing::debug!(fusion_id, pid, "fusionee entered");
        }
    }

    pub(crate) fn remove_fusionee(&self, fusion_id: u32) {
        let mut members = self.0.fusionees.lock().unwrap();
        let before = members.len();
        members.retain(|m| m.fusion_id != fusion_id);
        if members.len() != before {
            self.shared().fusionee_count.fetch_sub(1, Ordering::AcqRel);
            tracing::debug!(fusion_id, "fusionee left");
            drop(members);
            if let Some(callback) = self.0.leave_callback.lock().unwrap().as_ref() {
                callback(fusion_id);
            }
        }
    }

    // ----------------------------------------------------------------
    // startup helpers
    // ----------------------------------------------------------------

    fn join_handshake(&self) -> Result<()> {
        self.send_to(
            FUSION_ID_MASTER,
            &WireMessage::Enter {
                fusion_id: self.fusion_id(),
                pid: own_pid(),
            },
        )
        .map_err(|_| Error::Init("no master to join".into()))?;

        self.0
            .socket
            .set_read_timeout(Some(ENTER_TIMEOUT))
            .map_err(Error::Io)?;

        let mut buf = vec![0u8; self.max_message_size()];
        loop {
            let len = match self.0.socket.recv(&mut buf) {
                Ok(len) => len,
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    return Err(Error::Init("master did not acknowledge join".into()));
                }
                Err(err) => return Err(err.into()),
            };

            match protocol::decode(&buf[..len]) {
                Ok(WireMessage::EnterAck { ok: true }) => break,
                Ok(WireMessage::EnterAck { ok: false }) => {
                    return Err(Error::Init("master rejected join".into()));
                }
                Ok(other) => {
                    tracing::debug!(?other, "message before join acknowledgement, dropped");
                }
                Err(_) => {}
            }
        }

        self.0.socket.set_read_timeout(None).map_err(Error::Io)?;
        Ok(())
    }

    fn spawn_dispatch(&self) {
        let world = self.clone();
        let handle = std::thread::Builder::new()
            .name(format!("fusion-dispatch-{}", self.index()))
            .spawn(move || dispatch::dispatch_loop(world))
            .expect("spawning the dispatch thread");
        *self.0.dispatch_thread.lock().unwrap() = Some(handle);
    }

    fn spawn_deferred(&self) {
        let (tx, rx) = std::sync::mpsc::channel::<Deferred>();
        *self.0.deferred_tx.lock().unwrap() = Some(tx);

        let handle = std::thread::Builder::new()
            .name(format!("fusion-deferred-{}", self.index()))
            .spawn(move || {
                while let Ok(work) = rx.recv() {
                    work();
                }
            })
            .expect("spawning the deferred-destructor thread");
        *self.0.deferred_thread.lock().unwrap() = Some(handle);
    }

    pub(crate) fn max_message_size(&self) -> usize {
        self.0.conf.call_max_data as usize + 256
    }

    fn pool_path(&self, pool_id: u32) -> PathBuf {
        tmpfs_dir(&self.0.conf).join(format!("fusion.{}.{}", self.index(), pool_id))
    }
}

impl WorldInner {
    pub(crate) fn socket_recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.socket.recv(buf)
    }
}

struct WorldSharedInit {
    abi: u32,
    index: u32,
}

impl WorldSharedInit {
    fn build(self) -> WorldShared {
        let shared = WorldShared {
            magic: AtomicU64::new(0),
            abi: AtomicU32::new(self.abi),
            index: AtomicU32::new(self.index),
            next_call_id: AtomicU32::new(1),
            next_reactor_id: AtomicU32::new(1),
            next_ref_id: AtomicU32::new(1),
            next_pool_id: AtomicU32::new(1),
            fusionee_count: AtomicU32::new(0),
            world_root: AtomicU32::new(0),
            arenas_lock: SkirmishState::default(),
            arenas_head: AtomicU32::new(0),
            reactor_globals: SkirmishState::default(),
            pools_lock: SkirmishState::default(),
            pools: std::array::from_fn(|_| PoolDesc {
                active: AtomicU32::new(0),
                pool_id: AtomicU32::new(0),
                max_size: AtomicU32::new(0),
            }),
        };
        shared.magic.store(WORLD_MAGIC, Ordering::Release);
        shared
    }
}

fn own_pid() -> u32 {
    rustix::process::getpid().as_raw_nonzero().get() as u32
}

fn create_socket_dir(dir: &Path, conf: &FusionConfig) -> Result<()> {
    match std::fs::create_dir_all(dir) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(err) => return Err(err.into()),
    }

    let _ = rustix::fs::chmod(dir, rustix::fs::Mode::from_raw_mode(0o775));
    if let Some(gid) = conf.shmfile_gid {
        let _ = rustix::fs::chown(dir, None, Some(unsafe { rustix::fs::Gid::from_raw(gid) }));
    }
    Ok(())
}

/// Bind this process's socket, deciding mastership: whoever binds the
/// master name first is the master; everyone else auto-generates a slave
/// id by binding successive names.
fn bind_socket(dir: &Path, role: EnterRole) -> Result<(UnixDatagram, u32, PathBuf)> {
    let master_path = dir.join(format!("{FUSION_ID_MASTER:x}"));

    if role != EnterRole::Slave {
        match UnixDatagram::bind(&master_path) {
            Ok(socket) => {
                let _ = rustix::fs::chmod(&master_path, rustix::fs::Mode::from_raw_mode(0o660));
                return Ok((socket, FUSION_ID_MASTER, master_path));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                if role == EnterRole::Master {
                    return Err(Error::Init(format!(
                        "master socket already bound: {}",
                        master_path.display()
                    )));
                }
            }
            Err(err) => return Err(err.into()),
        }
    } else if !master_path.exists() {
        return Err(Error::Init("slave role requested but no master".into()));
    }

    for id in (FUSION_ID_MASTER + 1)..u32::MAX {
        let path = dir.join(format!("{id:x}"));
        match UnixDatagram::bind(&path) {
            Ok(socket) => {
                let _ = rustix::fs::chmod(&path, rustix::fs::Mode::from_raw_mode(0o660));
                return Ok((socket, id, path));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(err) => return Err(err.into()),
        }
    }

    Err(Error::Init("no free fusion id".into()))
}
