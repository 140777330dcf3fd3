//! Reactor: publish/subscribe dispatch for shared objects.
//!
//! Listeners come in two kinds. *Local reactions* are per-process
//! closures, registered in a local table; the shared listener list only
//! records which fusionees listen on which channel, so dispatch carries a
//! reactor id over the wire, never a function pointer. *Global reactions*
//! are processor-independent: addressed by a static index into the
//! globals table the dispatching process passes to `dispatch`, with a
//! shared context pointer, and always run synchronously in the
//! dispatching process.
//!
//! Dispatch order: globals first, then local reactions — directly when
//! the reactor is in direct mode, otherwise marshalled through the wire
//! so they execute in their owning process. A reaction may answer `Ok`
//! (stay attached), `Remove` (detach itself) or `Drop` (stop processing
//! the remaining reactions for this message). Detaching a reaction during
//! a dispatch pass is safe: entries are tombstoned and reclaimed after
//! the pass.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::call::{Call, CallState};
use crate::error::{Error, Result};
use crate::refs::Ref;
use crate::shm::SharedPtr;
use crate::sync::skirmish::SkirmishState;
use crate::world::protocol::WireMessage;
use crate::world::World;

/// What a reaction wants after being invoked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReactionResult {
    /// Stay attached.
    Ok,
    /// Detach this reaction.
    Remove,
    /// Stop processing remaining reactions for this message.
    Drop,
}

/// A global reaction entry point, selected by its static index.
pub type GlobalReactionFn = fn(&World, &[u8], SharedPtr<u8>) -> ReactionResult;

/// In-segment state of a reactor.
#[repr(C)]
#[derive(Default)]
pub struct ReactorState {
    id: AtomicU32,
    msg_size: AtomicU32,
    direct: AtomicU32,
    destroyed: AtomicU32,

    listeners_lock: SkirmishState,
    listeners_head: AtomicU32,

    /// Offset of the skirmish guarding the global reaction list.
    globals_lock: AtomicU32,
    globals_head: AtomicU32,

    /// Optional dispatch-complete call.
    call: CallState,
}

/// Shared listener record: one fusionee listening on one channel.
#[repr(C)]
#[derive(Default)]
struct ListenerNode {
    next: AtomicU32,
    fusion_id: AtomicU32,
    channel: AtomicU32,
    refs: AtomicU32,
}

/// Shared global-reaction record.
#[repr(C)]
#[derive(Default)]
struct GlobalNode {
    next: AtomicU32,
    index: AtomicU32,
    ctx: AtomicU32,
    attached: AtomicU32,
}

/// Handle to an attached local reaction.
pub struct Reaction {
    reactor_id: u32,
    token: u64,
    attached: Arc<AtomicBool>,
    channel: u32,
}

/// Handle to an attached global reaction.
pub struct GlobalReaction {
    node: SharedPtr<GlobalNode>,
}

type ReactionFn = Arc<dyn Fn(&[u8]) -> ReactionResult + Send + Sync>;

struct LocalEntry {
    token: u64,
    channel: u32,
    attached: Arc<AtomicBool>,
    func: ReactionFn,
}

/// Per-process reactions of one reactor.
pub(crate) struct ReactorNode {
    state: SharedPtr<ReactorState>,
    entries: Mutex<Vec<LocalEntry>>,
    next_token: AtomicU64,
}

/// Handle to a reactor. Cheap to clone.
#[derive(Clone)]
pub struct Reactor {
    world: World,
    state: SharedPtr<ReactorState>,
}

impl Reactor {
    /// Create a new reactor in the world's main pool.
    ///
    /// `msg_size` is the fixed size limit for dispatched messages.
    pub fn new(world: &World, msg_size: usize, name: &str) -> Result<Self> {
        let state = world
            .main_pool()
            .alloc_value_labeled(ReactorState::default(), name)?;

        let reactor = Self {
            world: world.clone(),
            state,
        };

        let shared = reactor.state();
        shared.msg_size.store(msg_size as u32, Ordering::Release);
        shared.direct.store(1, Ordering::Release);
        shared
            .globals_lock
            .store(world.reactor_globals_lock_off(), Ordering::Release);
        shared.id.store(world.next_reactor_id(), Ordering::Release);

        Ok(reactor)
    }

    /// Wrap an existing reactor state.
    ///
    /// # Safety
    ///
    /// `state` must address an initialized `ReactorState` in the world's
    /// main pool.
    pub unsafe fn from_state(world: &World, state: SharedPtr<ReactorState>) -> Self {
        Self {
            world: world.clone(),
            state,
        }
    }

    /// The reactor's id.
    pub fn id(&self) -> u32 {
        self.state().id.load(Ordering::Acquire)
    }

    /// The state offset, for embedding in shared structures.
    pub fn state_ptr(&self) -> SharedPtr<ReactorState> {
        self.state
    }

    fn state(&self) -> &ReactorState {
        unsafe { self.world.main_pool().get(self.state) }
    }

    /// Attach a local reaction on channel 0.
    pub fn attach(
        &self,
        func: impl Fn(&[u8]) -> ReactionResult + Send + Sync + 'static,
    ) -> Result<Reaction> {
        self.attach_channel(0, func)
    }

    /// Attach a local reaction on the given channel.
    pub fn attach_channel(
        &self,
        channel: u32,
        func: impl Fn(&[u8]) -> ReactionResult + Send + Sync + 'static,
    ) -> Result<Reaction> {
        let state = self.state();
        if state.destroyed.load(Ordering::Acquire) != 0 {
            return Err(Error::Destroyed);
        }

        let id = self.id();
        let node = self.world.reactor_node(id, self.state);

        let token = node.next_token.fetch_add(1, Ordering::Relaxed);
        let attached = Arc::new(AtomicBool::new(true));

        node.entries.lock().unwrap().push(LocalEntry {
            token,
            channel,
            attached: Arc::clone(&attached),
            func: Arc::new(func),
        });

        self.listener_retain(channel)?;

        Ok(Reaction {
            reactor_id: id,
            token,
            attached,
            channel,
        })
    }

    /// Detach a local reaction.
    ///
    /// If a dispatch pass is currently delivering to this reaction in
    /// another thread, it will not be invoked again once this returns.
    pub fn detach(&self, reaction: Reaction) -> Result<()> {
        reaction.attached.store(false, Ordering::Release);

        if let Some(node) = self.world.reactor_node_get(reaction.reactor_id) {
            node.entries
                .lock()
                .unwrap()
                .retain(|e| e.token != reaction.token);
        }

        self.listener_release(reaction.channel)
    }

    /// Attach a global reaction by its static index, with a shared
    /// context pointer.
    pub fn attach_global(&self, index: u32, ctx: SharedPtr<u8>) -> Result<GlobalReaction> {
        let node = GlobalNode::default();
        node.index.store(index, Ordering::Relaxed);
        node.ctx.store(ctx.raw(), Ordering::Relaxed);
        node.attached.store(1, Ordering::Relaxed);

        let lock = self.globals_lock();
        lock.prevail()?;

        let result = (|| {
            let ptr = self
                .world
                .main_pool()
                .alloc_value_labeled(node, "global reaction")?;
            let state = self.state();
            unsafe { self.world.main_pool().get(ptr) }
                .next
                .store(state.globals_head.load(Ordering::Acquire), Ordering::Release);
            state.globals_head.store(ptr.raw(), Ordering::Release);
            Ok(GlobalReaction { node: ptr })
        })();

        lock.dismiss()?;
        result
    }

    /// Detach a global reaction.
    pub fn detach_global(&self, reaction: GlobalReaction) -> Result<()> {
        let lock = self.globals_lock();
        lock.prevail()?;

        let node = unsafe { self.world.main_pool().get(reaction.node) };
        if node.attached.swap(0, Ordering::AcqRel) != 0 {
            self.unlink_global(reaction.node);
            let _ = self.world.main_pool().deallocate(reaction.node.cast());
        }

        lock.dismiss()
    }

    /// Dispatch on channel 0.
    pub fn dispatch(
        &self,
        msg: &[u8],
        self_included: bool,
        globals: Option<&[GlobalReactionFn]>,
    ) -> Result<()> {
        self.dispatch_channel(0, msg, self_included, globals)
    }

    /// Dispatch a message to every listener of the given channel.
    pub fn dispatch_channel(
        &self,
        channel: u32,
        msg: &[u8],
        self_included: bool,
        globals: Option<&[GlobalReactionFn]>,
    ) -> Result<()> {
        let state = self.state();
        if state.destroyed.load(Ordering::Acquire) != 0 {
            return Err(Error::Destroyed);
        }
        if msg.len() > state.msg_size.load(Ordering::Acquire) as usize {
            return Err(Error::InvalidArg("message exceeds reactor message size"));
        }
        if msg.len() > self.world.conf().call_max_data as usize {
            return Err(Error::LimitExceeded);
        }

        let id = self.id();

        // Dispatch-complete accounting: one global count per receiver,
        // watched by the reactor's call.
        let dispatch_ref = if state.call.call_id() != 0 {
            let r = Ref::new(&self.world, "dispatch ref")?;
            r.up(true)?;
            let call = Call::from_state(&self.world, &state.call)?;
            r.watch(&call, 0)?;
            Some(r)
        } else {
            None
        };

        // Global reactions always run first, in the dispatching process.
        if channel == 0 && state.globals_head.load(Ordering::Acquire) != 0 {
            match globals {
                Some(globals) => self.process_globals(msg, globals)?,
                None => {
                    tracing::error!(
                        reactor = id,
                        "global reactions exist but no globals were passed to dispatch"
                    );
                }
            }
        }

        // Local reactions of this process, delivered directly when the
        // reactor is in direct mode.
        let mut include_self = self_included;
        if include_self && state.direct.load(Ordering::Acquire) != 0 {
            process_message(&self.world, id, channel, msg);
            include_self = false;
        }

        // Fan out to listening fusionees.
        state.listeners_lock.prevail()?;

        let walked = (|| -> Result<()> {
            let pool = self.world.main_pool().clone();
            let mut prev: SharedPtr<ListenerNode> = SharedPtr::null();
            let mut cursor =
                SharedPtr::<ListenerNode>::from_raw(state.listeners_head.load(Ordering::Acquire));
            while !cursor.is_null() {
                let node = unsafe { pool.get(cursor) };
                let next = SharedPtr::from_raw(node.next.load(Ordering::Acquire));
                let fusion_id = node.fusion_id.load(Ordering::Acquire);

                if node.channel.load(Ordering::Acquire) == channel
                    && (include_self || fusion_id != self.world.fusion_id())
                {
                    if let Some(r) = &dispatch_ref {
                        r.up(true)?;
                    }

                    let sent = self.world.send_to(
                        fusion_id,
                        &WireMessage::Reactor {
                            reactor_id: id,
                            channel,
                            ref_off: dispatch_ref
                                .as_ref()
                                .map(|r| r.state_ptr().raw())
                                .unwrap_or(0),
                            payload: msg.to_vec(),
                        },
                    );

                    if matches!(sent, Err(Error::Dead)) {
                        tracing::debug!(fusion_id, "removing dead listener");
                        if let Some(r) = &dispatch_ref {
                            r.down(true)?;
                        }
                        if prev.is_null() {
                            state.listeners_head.store(next.raw(), Ordering::Release);
                        } else {
                            unsafe { pool.get(prev) }
                                .next
                                .store(next.raw(), Ordering::Release);
                        }
                        let _ = pool.deallocate(cursor.cast());
                        cursor = next;
                        continue;
                    }
                }

                prev = cursor;
                cursor = next;
            }
            Ok(())
        })();

        state.listeners_lock.dismiss()?;
        walked?;

        if let Some(r) = dispatch_ref {
            r.down(true)?;
            if r.zero_trylock().is_ok() {
                let _ = r.destroy();
                let _ = self.world.main_pool().deallocate(r.state_ptr().cast());
            }
        }

        Ok(())
    }

    /// Route local delivery through the wire instead of invoking reactions
    /// directly from `dispatch`.
    pub fn set_direct(&self, direct: bool) -> Result<()> {
        self.state().direct.store(direct as u32, Ordering::Release);
        Ok(())
    }

    /// Install a call signalled when a dispatch has been processed by
    /// every receiver.
    pub fn set_dispatch_callback(&self, call: &Call) -> Result<()> {
        if self.state().destroyed.load(Ordering::Acquire) != 0 {
            return Err(Error::Destroyed);
        }
        self.state().call.store_from(call);
        Ok(())
    }

    /// Replace the lock guarding global reactions, taking the old lock to
    /// keep lock/unlock pairs matched.
    pub fn set_lock(&self, lock: SharedPtr<SkirmishState>) -> Result<()> {
        let old = self.globals_lock();
        old.prevail()?;
        self.state().globals_lock.store(lock.raw(), Ordering::Release);
        old.dismiss()
    }

    /// Replace the globals lock without acquiring the old one (init-time
    /// only).
    pub fn set_lock_only(&self, lock: SharedPtr<SkirmishState>) -> Result<()> {
        self.state().globals_lock.store(lock.raw(), Ordering::Release);
        Ok(())
    }

    /// Mark the reactor destroyed; further attaches and dispatches fail.
    pub fn destroy(&self) -> Result<()> {
        if self.state().destroyed.swap(1, Ordering::AcqRel) != 0 {
            return Err(Error::Destroyed);
        }
        Ok(())
    }

    /// Release the reactor's shared allocations.
    pub fn free(&self) -> Result<()> {
        let state = self.state();
        state.destroyed.store(1, Ordering::Release);

        let pool = self.world.main_pool().clone();

        let mut cursor = SharedPtr::<ListenerNode>::from_raw(state.listeners_head.swap(0, Ordering::AcqRel));
        while !cursor.is_null() {
            let next = SharedPtr::from_raw(unsafe { pool.get(cursor) }.next.load(Ordering::Acquire));
            let _ = pool.deallocate(cursor.cast());
            cursor = next;
        }

        let mut cursor = SharedPtr::<GlobalNode>::from_raw(state.globals_head.swap(0, Ordering::AcqRel));
        while !cursor.is_null() {
            let next = SharedPtr::from_raw(unsafe { pool.get(cursor) }.next.load(Ordering::Acquire));
            let _ = pool.deallocate(cursor.cast());
            cursor = next;
        }

        self.world.reactor_node_remove(self.id());
        pool.deallocate(self.state.cast())
    }

    // ----------------------------------------------------------------

    fn globals_lock(&self) -> &SkirmishState {
        let off = self.state().globals_lock.load(Ordering::Acquire);
        unsafe {
            self.world
                .main_pool()
                .get(SharedPtr::<SkirmishState>::from_raw(off))
        }
    }

    fn process_globals(&self, msg: &[u8], globals: &[GlobalReactionFn]) -> Result<()> {
        let state = self.state();

        // Remember the lock across the walk; a concurrent lock
        // replacement must not unbalance lock/unlock.
        let lock_off = state.globals_lock.load(Ordering::Acquire);
        let lock = unsafe {
            self.world
                .main_pool()
                .get(SharedPtr::<SkirmishState>::from_raw(lock_off))
        };

        lock.prevail()?;

        if state.globals_lock.load(Ordering::Acquire) != lock_off {
            tracing::warn!("reactor globals lock replaced during dispatch");
        }

        let pool = self.world.main_pool().clone();
        let mut cursor = SharedPtr::<GlobalNode>::from_raw(state.globals_head.load(Ordering::Acquire));
        while !cursor.is_null() {
            let node = unsafe { pool.get(cursor) };
            let next = SharedPtr::from_raw(node.next.load(Ordering::Acquire));

            if node.attached.load(Ordering::Acquire) != 0 {
                let index = node.index.load(Ordering::Acquire) as usize;
                if index < globals.len() {
                    let ctx = SharedPtr::from_raw(node.ctx.load(Ordering::Acquire));
                    if globals[index](&self.world, msg, ctx) == ReactionResult::Remove {
                        node.attached.store(0, Ordering::Release);
                        self.unlink_global(cursor);
                        let _ = pool.deallocate(cursor.cast());
                    }
                } else {
                    tracing::warn!(index, "global reaction index out of bounds");
                }
            }

            cursor = next;
        }

        lock.dismiss()
    }

    /// Unlink a global node; the globals lock must be held.
    fn unlink_global(&self, target: SharedPtr<GlobalNode>) {
        let state = self.state();
        let pool = self.world.main_pool();

        let mut prev: SharedPtr<GlobalNode> = SharedPtr::null();
        let mut cursor = SharedPtr::<GlobalNode>::from_raw(state.globals_head.load(Ordering::Acquire));
        while !cursor.is_null() {
            let next = SharedPtr::from_raw(unsafe { pool.get(cursor) }.next.load(Ordering::Acquire));
            if cursor == target {
                if prev.is_null() {
                    state.globals_head.store(next.raw(), Ordering::Release);
                } else {
                    unsafe { pool.get(prev) }.next.store(next.raw(), Ordering::Release);
                }
                return;
            }
            prev = cursor;
            cursor = next;
        }
    }

    /// Record this fusionee as a listener of `channel`.
    fn listener_retain(&self, channel: u32) -> Result<()> {
        let state = self.state();
        let pool = self.world.main_pool();
        let fusion_id = self.world.fusion_id();

        state.listeners_lock.prevail()?;

        let result = (|| {
            let mut cursor = SharedPtr::<ListenerNode>::from_raw(state.listeners_head.load(Ordering::Acquire));
            while !cursor.is_null() {
                let node = unsafe { pool.get(cursor) };
                if node.fusion_id.load(Ordering::Acquire) == fusion_id
                    && node.channel.load(Ordering::Acquire) == channel
                {
                    node.refs.fetch_add(1, Ordering::AcqRel);
                    return Ok(());
                }
                cursor = SharedPtr::from_raw(node.next.load(Ordering::Acquire));
            }

            let node = ListenerNode::default();
            node.fusion_id.store(fusion_id, Ordering::Relaxed);
            node.channel.store(channel, Ordering::Relaxed);
            node.refs.store(1, Ordering::Relaxed);
            node.next
                .store(state.listeners_head.load(Ordering::Acquire), Ordering::Relaxed);

            let ptr = pool.alloc_value_labeled(node, "reactor listener")?;
            state.listeners_head.store(ptr.raw(), Ordering::Release);
            Ok(())
        })();

        state.listeners_lock.dismiss()?;
        result
    }

    /// Drop one listener count for this fusionee on `channel`.
    fn listener_release(&self, channel: u32) -> Result<()> {
        let state = self.state();
        let pool = self.world.main_pool();
        let fusion_id = self.world.fusion_id();

        state.listeners_lock.prevail()?;

        let mut prev: SharedPtr<ListenerNode> = SharedPtr::null();
        let mut cursor = SharedPtr::<ListenerNode>::from_raw(state.listeners_head.load(Ordering::Acquire));
        while !cursor.is_null() {
            let node = unsafe { pool.get(cursor) };
            let next = SharedPtr::from_raw(node.next.load(Ordering::Acquire));

            if node.fusion_id.load(Ordering::Acquire) == fusion_id
                && node.channel.load(Ordering::Acquire) == channel
            {
                if node.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
                    if prev.is_null() {
                        state.listeners_head.store(next.raw(), Ordering::Release);
                    } else {
                        unsafe { pool.get(prev) }.next.store(next.raw(), Ordering::Release);
                    }
                    let _ = pool.deallocate(cursor.cast());
                }
                break;
            }

            prev = cursor;
            cursor = next;
        }

        state.listeners_lock.dismiss()
    }
}

/// Deliver a reactor message to this process's local reactions.
///
/// Runs on the dispatch thread for wire deliveries and inline for direct
/// dispatch. The entry snapshot plus per-entry attached flags give the
/// detach-during-dispatch guarantee: a reaction detached mid-pass is
/// never invoked again within the same pass.
pub(crate) fn process_message(world: &World, reactor_id: u32, channel: u32, msg: &[u8]) {
    let Some(node) = world.reactor_node_get(reactor_id) else {
        return;
    };

    let snapshot: Vec<(u64, Arc<AtomicBool>, ReactionFn)> = node
        .entries
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.channel == channel)
        .map(|e| (e.token, Arc::clone(&e.attached), Arc::clone(&e.func)))
        .collect();

    for (token, attached, func) in snapshot {
        if !attached.load(Ordering::Acquire) {
            continue;
        }

        match func(msg) {
            ReactionResult::Ok => {}
            ReactionResult::Remove => {
                attached.store(false, Ordering::Release);
                node.entries.lock().unwrap().retain(|e| e.token != token);

                // Keep the shared listener accounting in step.
                let reactor = unsafe { Reactor::from_state(world, node.state) };
                let _ = reactor.listener_release(channel);
            }
            ReactionResult::Drop => break,
        }
    }
}

impl ReactorNode {
    pub(crate) fn new(state: SharedPtr<ReactorState>) -> Self {
        Self {
            state,
            entries: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(1),
        }
    }
}

impl World {
    pub(crate) fn reactor_node(&self, reactor_id: u32, state: SharedPtr<ReactorState>) -> Arc<ReactorNode> {
        let mut nodes = self.0.reactor_nodes.write().unwrap();
        Arc::clone(
            nodes
                .entry(reactor_id)
                .or_insert_with(|| Arc::new(ReactorNode::new(state))),
        )
    }

    pub(crate) fn reactor_node_get(&self, reactor_id: u32) -> Option<Arc<ReactorNode>> {
        self.0.reactor_nodes.read().unwrap().get(&reactor_id).cloned()
    }

    pub(crate) fn reactor_node_remove(&self, reactor_id: u32) {
        self.0.reactor_nodes.write().unwrap().remove(&reactor_id);
    }

    pub(crate) fn reactor_globals_lock_off(&self) -> u32 {
        self.shared_ptr_raw() + std::mem::offset_of!(crate::world::WorldShared, reactor_globals) as u32
    }
}

#[allow(clippy::needless_range_loop)]
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
        conf.main_pool_size = 2 * 1024 * 1024;
        let world = World::enter(0, 1, EnterRole::Master, conf).unwrap();
        (dir, world)
    }

    #[test]
    fn test_each_reaction_invoked_once_in_attach_order() {
        let (_dir, world) = test_world();
        let reactor = Reactor::new(&world, 64, "order").unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut reactions = Vec::new();
        for i in 0..4 {
            let order = Arc::clone(&order);
            reactions.push(
                reactor
                    .attach(move |_msg| {
                        order.lock().unwrap().push(i);
                        ReactionResult::Ok
                    })
                    .unwrap(),
            );
        }

        reactor.dispatch(b"ping", true, None).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);

        for r in reactions {
            reactor.detach(r).unwrap();
        }
        reactor.free().unwrap();
        world.exit(false).unwrap();
    }

    #[test]
    fn test_remove_detaches_for_next_dispatch() {
        let (_dir, world) = test_world();
        let reactor = Reactor::new(&world, 64, "remove").unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let _reaction = reactor
            .attach(move |_msg| {
                counter.fetch_add(1, Ordering::SeqCst);
                ReactionResult::Remove
            })
            .unwrap();

        reactor.dispatch(b"one", true, None).unwrap();
        reactor.dispatch(b"two", true, None).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        reactor.free().unwrap();
        world.exit(false).unwrap();
    }

    #[test]
    fn test_drop_stops_remaining_reactions() {
        let (_dir, world) = test_world();
        let reactor = Reactor::new(&world, 64, "drop").unwrap();

        let hits = Arc::new(AtomicUsize::new(0));

        let first = Arc::clone(&hits);
        let _a = reactor
            .attach(move |_msg| {
                first.fetch_add(1, Ordering::SeqCst);
                ReactionResult::Drop
            })
            .unwrap();

        let second = Arc::clone(&hits);
        let _b = reactor
            .attach(move |_msg| {
                second.fetch_add(100, Ordering::SeqCst);
                ReactionResult::Ok
            })
            .unwrap();

        reactor.dispatch(b"msg", true, None).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        reactor.free().unwrap();
        world.exit(false).unwrap();
    }

    #[test]
    fn test_channels_are_independent() {
        let (_dir, world) = test_world();
        let reactor = Reactor::new(&world, 64, "channels").unwrap();

        let zero_hits = Arc::new(AtomicUsize::new(0));
        let one_hits = Arc::new(AtomicUsize::new(0));

        let c0 = Arc::clone(&zero_hits);
        let _r0 = reactor
            .attach_channel(0, move |_| {
                c0.fetch_add(1, Ordering::SeqCst);
                ReactionResult::Ok
            })
            .unwrap();

        let c1 = Arc::clone(&one_hits);
        let _r1 = reactor
            .attach_channel(1, move |_| {
                c1.fetch_add(1, Ordering::SeqCst);
                ReactionResult::Ok
            })
            .unwrap();

        reactor.dispatch_channel(1, b"only one", true, None).unwrap();
        assert_eq!(zero_hits.load(Ordering::SeqCst), 0);
        assert_eq!(one_hits.load(Ordering::SeqCst), 1);

        reactor.free().unwrap();
        world.exit(false).unwrap();
    }

    #[test]
    fn test_message_size_limit() {
        let (_dir, world) = test_world();
        let reactor = Reactor::new(&world, 8, "small").unwrap();

        let too_big = [0u8; 64];
        assert!(matches!(
            reactor.dispatch(&too_big, true, None),
            Err(Error::InvalidArg(_))
        ));

        reactor.free().unwrap();
        world.exit(false).unwrap();
    }

    #[test]
    fn test_globals_run_before_locals() {
        let (_dir, world) = test_world();
        let reactor = Reactor::new(&world, 64, "globals").unwrap();

        static GLOBAL_SEEN: AtomicUsize = AtomicUsize::new(0);

        fn global_listener(_world: &World, _msg: &[u8], _ctx: SharedPtr<u8>) -> ReactionResult {
            GLOBAL_SEEN.store(1, Ordering::SeqCst);
            ReactionResult::Ok
        }

        let globals: &[GlobalReactionFn] = &[global_listener];

        let local_saw_global = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&local_saw_global);
        let _r = reactor
            .attach(move |_msg| {
                seen.store(GLOBAL_SEEN.load(Ordering::SeqCst), Ordering::SeqCst);
                ReactionResult::Ok
            })
            .unwrap();

        let _g = reactor.attach_global(0, SharedPtr::null()).unwrap();

        reactor.dispatch(b"x", true, Some(globals)).unwrap();

        // The local reaction observed the global's side effect: globals ran
        // first.
        assert_eq!(local_saw_global.load(Ordering::SeqCst), 1);

        reactor.free().unwrap();
        world.exit(false).unwrap();
    }
}
