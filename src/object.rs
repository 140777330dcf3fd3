//! Objects and object pools: the Ref + Skirmish + Reactor composite.
//!
//! Every higher-level shared type (surface, palette, window stack, ...) is
//! an object: a shared allocation that starts with an [`ObjectHeader`]
//! carrying one ref, a reactor for change notification, and pool
//! bookkeeping guarded by the pool's skirmish.
//!
//! Lifecycle: `create` (initializing, one reference held, destruction
//! watch installed) → `activate` (visible to lookups) → references reach
//! zero → the pool's watcher call runs the destructor exactly once → the
//! storage returns to the pool. An object whose destructor runs while
//! holders still exist at pool shutdown is reported as a zombie.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::call::{Call, CallArgs, CallHandlerResult, CallState};
use crate::collections::vector::VectorState;
use crate::collections::{KeyKind, KeyRef, SharedHash, SharedVector};
use crate::error::{Error, Result};
use crate::reactor::{Reactor, ReactorState};
use crate::refs::{Ref, RefState};
use crate::shm::SharedPtr;
use crate::sync::skirmish::SkirmishState;
use crate::world::World;

/// Lifecycle state of an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ObjectState {
    /// Created but not yet visible to lookups.
    Init = 1,
    /// Activated.
    Active = 2,
    /// Destructor pending or running.
    Deinit = 3,
}

impl ObjectState {
    fn from_u32(v: u32) -> Self {
        match v {
            2 => ObjectState::Active,
            3 => ObjectState::Deinit,
            _ => ObjectState::Init,
        }
    }
}

/// Header at the start of every pooled object.
#[repr(C)]
#[derive(Default)]
pub struct ObjectHeader {
    state: AtomicU32,
    id: AtomicU32,
    /// Fusion id of the creator.
    identity: AtomicU32,
    ref_: RefState,
    reactor: AtomicU32,
    /// Back pointer to the pool, cleared when the object is removed.
    pool: AtomicU32,
    /// Lazily created string-keyed property hash.
    properties: AtomicU32,
    owners: VectorState,
}

/// Payload offset within an object allocation.
const PAYLOAD_OFF: usize = (std::mem::size_of::<ObjectHeader>() + 15) & !15;

/// Space an object needs for its header and a payload of `payload_size`
/// bytes; pass the result to [`ObjectPool::create`].
pub const fn object_size(payload_size: usize) -> usize {
    PAYLOAD_OFF + payload_size
}

#[repr(C)]
#[derive(Default)]
struct ObjectPoolShared {
    lock: SkirmishState,
    call: CallState,
    objects: AtomicU32,
    id_pool: AtomicU32,
    object_size: AtomicU32,
    message_size: AtomicU32,
    name: AtomicU32,
    secure: AtomicU32,
}

/// Destructor callback: the object and whether it is a zombie (holders
/// remained at pool shutdown). Storage is reclaimed by the pool after the
/// callback returns.
pub type ObjectDestructor = Arc<dyn Fn(&Object, bool) + Send + Sync>;

/// Handle to a pooled object. Cheap to clone; does not itself hold a
/// reference count.
#[derive(Clone)]
pub struct Object {
    world: World,
    ptr: SharedPtr<ObjectHeader>,
}

impl Object {
    fn header(&self) -> &ObjectHeader {
        unsafe { self.world.main_pool().get(self.ptr) }
    }

    /// The object's id within its pool.
    pub fn id(&self) -> u32 {
        self.header().id.load(Ordering::Acquire)
    }

    /// Lifecycle state.
    pub fn state(&self) -> ObjectState {
        ObjectState::from_u32(self.header().state.load(Ordering::Acquire))
    }

    /// Fusion id of the creating process.
    pub fn identity(&self) -> u32 {
        self.header().identity.load(Ordering::Acquire)
    }

    /// The object's reference.
    pub fn reference(&self) -> Ref {
        let off = self.ptr.raw() + std::mem::offset_of!(ObjectHeader, ref_) as u32;
        unsafe { Ref::from_state(self.world.clone(), SharedPtr::from_raw(off)) }
    }

    /// The object's reactor.
    pub fn reactor(&self) -> Reactor {
        let off = self.header().reactor.load(Ordering::Acquire);
        unsafe { Reactor::from_state(&self.world, SharedPtr::<ReactorState>::from_raw(off)) }
    }

    /// Take a reference.
    pub fn ref_up(&self) -> Result<()> {
        self.reference().up(false)
    }

    /// Drop a reference; the last drop triggers the destructor.
    pub fn unref(&self) -> Result<()> {
        self.reference().down(false)
    }

    /// Make the object visible to lookups.
    pub fn activate(&self) -> Result<()> {
        self.header()
            .state
            .store(ObjectState::Active as u32, Ordering::Release);
        Ok(())
    }

    /// Take over a thrown reference: up then catch, so the count never
    /// bounces through zero.
    pub fn catch(&self) -> Result<()> {
        let reference = self.reference();
        reference.up(false)?;
        if let Err(err) = reference.catch_ref() {
            tracing::error!(id = self.id(), %err, "failed to catch object reference");
            reference.down(false)?;
            return Err(err);
        }
        Ok(())
    }

    /// The object's offset, for publishing through an arena field or a
    /// call payload.
    pub fn as_ptr(&self) -> SharedPtr<ObjectHeader> {
        self.ptr
    }

    /// Reconstruct a handle from a published offset.
    ///
    /// # Safety
    ///
    /// `ptr` must address a live object in the world's main pool.
    pub unsafe fn from_ptr(world: World, ptr: SharedPtr<ObjectHeader>) -> Self {
        Self { world, ptr }
    }

    /// Access the payload following the header.
    ///
    /// # Safety
    ///
    /// `T` must match the payload layout the pool was created for, and the
    /// payload must be initialized.
    pub unsafe fn payload<T>(&self) -> &T {
        unsafe {
            &*self
                .world
                .main_pool()
                .base()
                .add(self.ptr.raw() as usize + PAYLOAD_OFF)
                .cast::<T>()
        }
    }

    /// Mutable payload access.
    ///
    /// # Safety
    ///
    /// As [`payload`](Self::payload); the caller must hold whatever lock
    /// protects the payload.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn payload_mut<T>(&self) -> &mut T {
        unsafe {
            &mut *self
                .world
                .main_pool()
                .base()
                .add(self.ptr.raw() as usize + PAYLOAD_OFF)
                .cast::<T>()
        }
    }

    /// Set a string-keyed property, returning a previous value.
    pub fn set_property(&self, key: &str, value: u64) -> Result<Option<u64>> {
        let pool = self.world.main_pool().clone();
        let header = self.header();

        let hash = if header.properties.load(Ordering::Acquire) == 0 {
            let hash = SharedHash::new(&pool, KeyKind::Str, crate::collections::hash::HASH_MIN_SIZE)?;
            hash.set_autofree(true, false);
            header
                .properties
                .store(hash.state_ptr().raw(), Ordering::Release);
            hash
        } else {
            unsafe {
                SharedHash::from_state(
                    &pool,
                    SharedPtr::from_raw(header.properties.load(Ordering::Acquire)),
                )
            }
        };

        hash.replace(KeyRef::Str(key), value)
    }

    /// Look up a property.
    pub fn property(&self, key: &str) -> Option<u64> {
        let off = self.header().properties.load(Ordering::Acquire);
        if off == 0 {
            return None;
        }
        let hash =
            unsafe { SharedHash::from_state(self.world.main_pool(), SharedPtr::from_raw(off)) };
        hash.lookup(KeyRef::Str(key))
    }

    /// Remove a property, returning its value.
    pub fn remove_property(&self, key: &str) -> Option<u64> {
        let off = self.header().properties.load(Ordering::Acquire);
        if off == 0 {
            return None;
        }
        let hash =
            unsafe { SharedHash::from_state(self.world.main_pool(), SharedPtr::from_raw(off)) };
        hash.remove(KeyRef::Str(key)).ok().flatten()
    }

    /// Record a fusionee as an owner of this object.
    pub fn add_owner(&self, owner: u32) -> Result<()> {
        let owners = self.owners();
        if owners.contains(owner) {
            return Ok(());
        }
        owners.add(owner)
    }

    /// Check whether `owner` may act on this object.
    ///
    /// With `succeed_if_not_owned`, an object nobody claimed passes the
    /// check.
    pub fn check_owner(&self, owner: u32, succeed_if_not_owned: bool) -> Result<()> {
        let owners = self.owners();
        if succeed_if_not_owned && owners.is_empty() {
            return Ok(());
        }
        if owners.contains(owner) {
            Ok(())
        } else {
            Err(Error::AccessDenied)
        }
    }

    /// Destroy an object that never became active, or was already removed
    /// from its pool.
    pub fn destroy(self) -> Result<()> {
        debug_assert_ne!(self.state(), ObjectState::Active);

        let header = self.header();
        header
            .state
            .store(ObjectState::Deinit as u32, Ordering::Release);

        // Remove from the pool if still linked.
        let pool_off = header.pool.swap(0, Ordering::AcqRel);
        if pool_off != 0 {
            let shared = unsafe {
                self.world
                    .main_pool()
                    .get(SharedPtr::<ObjectPoolShared>::from_raw(pool_off))
            };
            shared.lock.prevail()?;
            let objects = unsafe {
                SharedHash::from_state(
                    self.world.main_pool(),
                    SharedPtr::from_raw(shared.objects.load(Ordering::Acquire)),
                )
            };
            let _ = objects.remove(KeyRef::Int(self.id() as u64));
            shared.lock.dismiss()?;
        }

        self.destroy_storage()
    }

    fn owners(&self) -> SharedVector<u32> {
        let off = self.ptr.raw() + std::mem::offset_of!(ObjectHeader, owners) as u32;
        unsafe { SharedVector::from_state(self.world.main_pool(), SharedPtr::from_raw(off)) }
    }

    /// Release every allocation belonging to this object.
    fn destroy_storage(&self) -> Result<()> {
        let pool = self.world.main_pool().clone();
        let header = self.header();

        self.owners().destroy()?;

        let properties = header.properties.swap(0, Ordering::AcqRel);
        if properties != 0 {
            let hash = unsafe { SharedHash::from_state(&pool, SharedPtr::from_raw(properties)) };
            hash.destroy()?;
        }

        self.reference().destroy()?;
        self.reactor().free()?;

        pool.deallocate(self.ptr.cast())
    }
}

/// A pool of objects of one type.
pub struct ObjectPool {
    world: World,
    shared: SharedPtr<ObjectPoolShared>,
    call: Call,
    destructor: ObjectDestructor,
}

impl ObjectPool {
    /// Create a pool.
    ///
    /// `object_size` covers header plus payload (see
    /// [`object_size`](crate::object::object_size)); `message_size` bounds
    /// notifications dispatched through object reactors; `destructor` runs
    /// exactly once per object when its references reach zero.
    pub fn create(
        world: &World,
        name: &str,
        object_size: usize,
        message_size: usize,
        destructor: impl Fn(&Object, bool) + Send + Sync + 'static,
    ) -> Result<Self> {
        if object_size < std::mem::size_of::<ObjectHeader>() {
            return Err(Error::InvalidArg("object size smaller than the header"));
        }

        let pool = world.main_pool().clone();
        let shared = pool.alloc_value_labeled(ObjectPoolShared::default(), name)?;
        let state = unsafe { pool.get(shared) };

        state
            .object_size
            .store(object_size as u32, Ordering::Release);
        state
            .message_size
            .store(message_size as u32, Ordering::Release);
        state
            .secure
            .store(world.conf().secure_fusion as u32, Ordering::Release);
        state
            .name
            .store(pool.alloc_str(name)?.raw(), Ordering::Release);

        let objects = SharedHash::new(&pool, KeyKind::Int, 17)?;
        state
            .objects
            .store(objects.state_ptr().raw(), Ordering::Release);

        let destructor: ObjectDestructor = Arc::new(destructor);

        // Destruction watch: runs in the pool-creating process whenever an
        // object's references reach zero.
        let watcher_world = world.clone();
        let watcher_shared = shared;
        let watcher_destructor = Arc::clone(&destructor);
        let call = Call::new(world, move |_caller_world, args: CallArgs<'_>| {
            reference_watcher(
                &watcher_world,
                watcher_shared,
                &watcher_destructor,
                args.arg as u32,
            );
            CallHandlerResult::Return(0)
        })?;

        state.call.store_from(&call);

        tracing::debug!(name, object_size, "object pool created");

        Ok(Self {
            world: world.clone(),
            shared,
            call,
            destructor,
        })
    }

    fn state(&self) -> &ObjectPoolShared {
        unsafe { self.world.main_pool().get(self.shared) }
    }

    /// The pool's name.
    pub fn name(&self) -> String {
        let off = self.state().name.load(Ordering::Acquire);
        self.world.main_pool().read_str(SharedPtr::from_raw(off))
    }

    fn objects(&self) -> SharedHash {
        unsafe {
            SharedHash::from_state(
                self.world.main_pool(),
                SharedPtr::from_raw(self.state().objects.load(Ordering::Acquire)),
            )
        }
    }

    /// Create an object in `Init` state, holding one reference.
    pub fn create_object(&self) -> Result<Object> {
        let pool = self.world.main_pool().clone();
        let state = self.state();

        state.lock.prevail()?;

        let result = (|| {
            let size = state.object_size.load(Ordering::Acquire) as usize;
            let ptr = pool.allocate_labeled(size, "object")?;
            unsafe { pool.bytes_mut(ptr, size).fill(0) };

            let object = Object {
                world: self.world.clone(),
                ptr: ptr.cast(),
            };

            let header = object.header();
            header
                .state
                .store(ObjectState::Init as u32, Ordering::Release);
            let id = state.id_pool.fetch_add(1, Ordering::AcqRel) + 1;
            header.id.store(id, Ordering::Release);
            header
                .identity
                .store(self.world.fusion_id(), Ordering::Release);
            header.pool.store(self.shared.raw(), Ordering::Release);

            Ref::init_state(&self.world, &header.ref_);
            let reference = object.reference();
            reference.up(false)?;
            reference.watch(&self.call, id as i32)?;

            let reactor = Reactor::new(
                &self.world,
                state.message_size.load(Ordering::Acquire) as usize,
                &self.name(),
            )?;
            reactor.set_lock_only(SharedPtr::from_raw(
                self.shared.raw() + std::mem::offset_of!(ObjectPoolShared, lock) as u32,
            ))?;
            header
                .reactor
                .store(reactor.state_ptr().raw(), Ordering::Release);

            self.objects().insert(KeyRef::Int(id as u64), ptr.raw() as u64)?;

            tracing::debug!(pool = %self.name(), id, "object created");

            Ok(object)
        })();

        state.lock.dismiss()?;
        result
    }

    /// Look up an active object and take a reference on it.
    ///
    /// An object whose count already reached zero concurrently is reported
    /// as `Dead`.
    pub fn get(&self, id: u32) -> Result<Object> {
        let state = self.state();
        state.lock.prevail()?;

        let result = (|| {
            let off = self
                .objects()
                .lookup(KeyRef::Int(id as u64))
                .ok_or(Error::IdNotFound(id))?;

            let object = Object {
                world: self.world.clone(),
                ptr: SharedPtr::from_raw(off as u32),
            };

            if object.reference().stat() <= 0 {
                return Err(Error::Dead);
            }
            object.ref_up()?;
            Ok(object)
        })();

        state.lock.dismiss()?;
        result
    }

    /// Look up an object without touching its reference count.
    pub fn lookup(&self, id: u32) -> Result<Object> {
        let state = self.state();
        state.lock.prevail()?;

        let result = self
            .objects()
            .lookup(KeyRef::Int(id as u64))
            .map(|off| Object {
                world: self.world.clone(),
                ptr: SharedPtr::from_raw(off as u32),
            })
            .ok_or(Error::IdNotFound(id));

        state.lock.dismiss()?;
        result
    }

    /// Visit every object; the callback returns `false` to stop.
    pub fn enum_objects(&self, mut f: impl FnMut(&Object) -> bool) -> Result<()> {
        let state = self.state();
        state.lock.prevail()?;

        self.objects().iterate(|_id, off| {
            let object = Object {
                world: self.world.clone(),
                ptr: SharedPtr::from_raw(off as u32),
            };
            f(&object)
        });

        state.lock.dismiss()
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.objects().len()
    }

    /// Whether the pool has no objects.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroy the pool: survivors get their destructor with the zombie
    /// flag when holders remain.
    pub fn destroy(self) -> Result<()> {
        let pool = self.world.main_pool().clone();
        let state = self.state();

        state.lock.prevail()?;

        self.call.destroy()?;

        let mut survivors = Vec::new();
        self.objects().iterate(|id, off| {
            survivors.push((id as u32, off as u32));
            true
        });

        for (id, off) in survivors {
            let object = Object {
                world: self.world.clone(),
                ptr: SharedPtr::from_raw(off),
            };

            let refs = object.reference().stat();
            let zombie = refs > 0;
            if zombie && self.world.conf().shutdown_info {
                tracing::warn!(
                    pool = %self.name(),
                    id,
                    refs,
                    "zombie object at pool destruction"
                );
            }

            object
                .header()
                .state
                .store(ObjectState::Deinit as u32, Ordering::Release);
            object.header().pool.store(0, Ordering::Release);

            (self.destructor)(&object, zombie);
            object.destroy_storage()?;
        }

        self.objects().destroy()?;

        let name = state.name.swap(0, Ordering::AcqRel);
        if name != 0 {
            pool.deallocate(SharedPtr::from_raw(name))?;
        }

        state.lock.dismiss()?;
        state.lock.destroy();
        pool.deallocate(self.shared.cast())
    }
}

/// The pool's destruction watch, invoked when an object's references reach
/// zero.
fn reference_watcher(
    world: &World,
    shared: SharedPtr<ObjectPoolShared>,
    destructor: &ObjectDestructor,
    object_id: u32,
) {
    let pool = world.main_pool().clone();
    let state = unsafe { pool.get(shared) };

    if state.lock.prevail().is_err() {
        return;
    }

    let objects = unsafe {
        SharedHash::from_state(
            &pool,
            SharedPtr::from_raw(state.objects.load(Ordering::Acquire)),
        )
    };

    let Some(off) = objects.lookup(KeyRef::Int(object_id as u64)) else {
        tracing::error!(object_id, "reference watch for an unknown object");
        let _ = state.lock.dismiss();
        return;
    };

    let object = Object {
        world: world.clone(),
        ptr: SharedPtr::from_raw(off as u32),
    };

    // Re-check under the zero lock: a concurrent `get` may have revived
    // the object between the zero transition and this call.
    match object.reference().zero_trylock() {
        Ok(()) => {}
        Err(Error::Destroyed) => {
            let _ = objects.remove(KeyRef::Int(object_id as u64));
            let _ = state.lock.dismiss();
            return;
        }
        Err(_) => {
            let _ = state.lock.dismiss();
            return;
        }
    }

    if object.state() == ObjectState::Init {
        tracing::warn!(object_id, "won't destroy an incomplete object");
        let _ = objects.remove(KeyRef::Int(object_id as u64));
        let _ = object.reference().unlock();
        let _ = state.lock.dismiss();
        return;
    }

    object
        .header()
        .state
        .store(ObjectState::Deinit as u32, Ordering::Release);
    object.header().pool.store(0, Ordering::Release);
    let _ = objects.remove(KeyRef::Int(object_id as u64));

    let _ = state.lock.dismiss();

    // The destructor runs outside the pool lock, optionally on the
    // deferred thread so the dispatch loop never runs user code.
    let destructor = Arc::clone(destructor);
    let world_for_deferred = world.clone();
    let ptr = object.ptr;
    world.defer_or_run(Box::new(move || {
        let object = Object {
            world: world_for_deferred,
            ptr,
        };
        destructor(&object, false);
        if let Err(err) = object.destroy_storage() {
            tracing::error!(%err, "releasing object storage failed");
        }
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::FusionConfig;
    use crate::world::EnterRole;
    use std::sync::atomic::AtomicUsize;

    fn test_world() -> (tempfile::TempDir, World) {
        let dir = tempfile::tempdir().unwrap();
        let mut conf = FusionConfig::default();
        conf.tmpfs = Some(dir.path().to_path_buf());
        conf.socket_dir = Some(dir.path().to_path_buf());
        conf.main_pool_size = 4 * 1024 * 1024;
        let world = World::enter(0, 1, EnterRole::Master, conf).unwrap();
        (dir, world)
    }

    #[repr(C)]
    struct SurfacePayload {
        width: u32,
        height: u32,
    }

    #[test]
    fn test_destructor_runs_once_after_last_release() {
        let (_dir, world) = test_world();

        let destroyed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&destroyed);

        let pool = ObjectPool::create(
            &world,
            "surfaces",
            object_size(std::mem::size_of::<SurfacePayload>()),
            64,
            move |_object, zombie| {
                assert!(!zombie);
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

        let object = pool.create_object().unwrap();
        object.activate().unwrap();

        // Two holders.
        object.ref_up().unwrap();
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);

        object.unref().unwrap();
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);

        // Second release triggers the destructor exactly once.
        object.unref().unwrap();
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);

        assert!(pool.is_empty());
        pool.destroy().unwrap();
        world.exit(false).unwrap();
    }

    #[test]
    fn test_payload_survives_until_destruction() {
        let (_dir, world) = test_world();

        let pool = ObjectPool::create(
            &world,
            "surfaces",
            object_size(std::mem::size_of::<SurfacePayload>()),
            64,
            |_object, _zombie| {},
        )
        .unwrap();

        let object = pool.create_object().unwrap();
        unsafe {
            let payload = object.payload_mut::<SurfacePayload>();
            payload.width = 1920;
            payload.height = 1080;
        }
        object.activate().unwrap();

        let found = pool.get(object.id()).unwrap();
        let payload = unsafe { found.payload::<SurfacePayload>() };
        assert_eq!(payload.width, 1920);
        assert_eq!(payload.height, 1080);
        found.unref().unwrap();

        object.unref().unwrap();
        pool.destroy().unwrap();
        world.exit(false).unwrap();
    }

    #[test]
    fn test_get_unknown_and_dead() {
        let (_dir, world) = test_world();

        let pool = ObjectPool::create(
            &world,
            "windows",
            object_size(8),
            32,
            |_object, _zombie| {},
        )
        .unwrap();

        assert!(matches!(pool.get(99), Err(Error::IdNotFound(99))));

        let object = pool.create_object().unwrap();
        object.activate().unwrap();
        let id = object.id();
        object.unref().unwrap();

        // Destroyed by the watcher; the id is gone.
        assert!(matches!(pool.get(id), Err(Error::IdNotFound(_))));

        pool.destroy().unwrap();
        world.exit(false).unwrap();
    }

    #[test]
    fn test_zombie_reported_at_pool_destroy() {
        let (_dir, world) = test_world();

        let zombies = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&zombies);

        let pool = ObjectPool::create(
            &world,
            "leaky",
            object_size(8),
            32,
            move |_object, zombie| {
                if zombie {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        )
        .unwrap();

        let object = pool.create_object().unwrap();
        object.activate().unwrap();
        // Reference deliberately not dropped.

        pool.destroy().unwrap();
        assert_eq!(zombies.load(Ordering::SeqCst), 1);

        world.exit(false).unwrap();
    }

    #[test]
    fn test_properties_and_owners() {
        let (_dir, world) = test_world();

        let pool = ObjectPool::create(
            &world,
            "props",
            object_size(8),
            32,
            |_object, _zombie| {},
        )
        .unwrap();

        let object = pool.create_object().unwrap();
        object.activate().unwrap();

        assert_eq!(object.property("depth"), None);
        object.set_property("depth", 32).unwrap();
        assert_eq!(object.property("depth"), Some(32));
        assert_eq!(object.remove_property("depth"), Some(32));
        assert_eq!(object.property("depth"), None);

        object.add_owner(7).unwrap();
        object.check_owner(7, false).unwrap();
        assert!(matches!(object.check_owner(8, false), Err(Error::AccessDenied)));
        // Nobody owns a fresh object: the permissive check passes.
        let fresh = pool.create_object().unwrap();
        fresh.activate().unwrap();
        fresh.check_owner(8, true).unwrap();

        fresh.unref().unwrap();
        object.unref().unwrap();
        pool.destroy().unwrap();
        world.exit(false).unwrap();
    }

    #[test]
    fn test_reactor_notifies_on_object_change() {
        let (_dir, world) = test_world();

        let pool = ObjectPool::create(
            &world,
            "notified",
            object_size(8),
            64,
            |_object, _zombie| {},
        )
        .unwrap();

        let object = pool.create_object().unwrap();
        object.activate().unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let reactor = object.reactor();
        let _reaction = reactor
            .attach(move |msg| {
                assert_eq!(msg, b"resized");
                counter.fetch_add(1, Ordering::SeqCst);
                crate::reactor::ReactionResult::Ok
            })
            .unwrap();

        reactor.dispatch(b"resized", true, None).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        object.unref().unwrap();
        pool.destroy().unwrap();
        world.exit(false).unwrap();
    }
}
