//! Call: single-writer cross-process procedure invocation.
//!
//! A call registers a handler in the owning process. Function pointers are
//! meaningless across address spaces, so the registration that other
//! processes see is only a numeric call id plus the owner's fusion id
//! ([`CallState`], embeddable in shared structures); the handler itself
//! lives in the owner's per-process table and dispatch carries the id.
//!
//! Execution modes: one-way (no reply), blocking (caller suspends until
//! the reply or a timeout), and queued (reply delivered asynchronously,
//! fetched by serial). A handler answers [`CallHandlerResult::Return`]
//! to reply immediately or [`CallHandlerResult::Retain`] to defer the
//! reply until [`Call::call_return`].
//!
//! Admission control: each caller has a per-call quota of outstanding
//! invocations, checked in the owning process before the handler runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Error, Result};
use crate::world::protocol::{ExecMode, WireMessage, CALL_DENIED, CALL_LIMIT, CALL_NO_HANDLER, CALL_OK};
use crate::world::World;

/// Arguments handed to a call handler.
pub struct CallArgs<'a> {
    /// Fusion id of the caller.
    pub caller: u32,
    /// Optional call parameter.
    pub arg: i32,
    /// Optional payload.
    pub payload: &'a [u8],
    /// Serial for deferred replies.
    pub serial: u32,
}

/// What the handler wants done with the reply.
pub enum CallHandlerResult {
    /// Reply now with this value.
    Return(i32),
    /// Defer; the owner will reply later via [`Call::call_return`].
    Retain,
}

/// A registered handler.
pub(crate) struct CallHandlerEntry {
    pub(crate) func: Box<dyn Fn(&World, CallArgs<'_>) -> CallHandlerResult + Send + Sync>,
}

/// Shared registration of a call: what other processes need in order to
/// invoke it. Embeddable in shared structures.
#[repr(C)]
#[derive(Default)]
pub struct CallState {
    call_id: AtomicU32,
    owner: AtomicU32,
}

impl CallState {
    /// The registered call id (0 = not initialized).
    pub fn call_id(&self) -> u32 {
        self.call_id.load(Ordering::Acquire)
    }

    /// Fusion id of the owning process.
    pub fn owner(&self) -> u32 {
        self.owner.load(Ordering::Acquire)
    }

    /// Fill from an initialized call.
    pub fn store_from(&self, call: &Call) {
        self.owner.store(call.owner, Ordering::Release);
        self.call_id.store(call.call_id, Ordering::Release);
    }

    /// Clear the registration.
    pub fn clear(&self) {
        self.call_id.store(0, Ordering::Release);
        self.owner.store(0, Ordering::Release);
    }
}

/// Handle to a call. Cheap to clone.
#[derive(Clone)]
pub struct Call {
    world: World,
    call_id: u32,
    owner: u32,
}

impl Call {
    /// Register a handler owned by the current process.
    pub fn new(
        world: &World,
        handler: impl Fn(&World, CallArgs<'_>) -> CallHandlerResult + Send + Sync + 'static,
    ) -> Result<Self> {
        let call_id = world.next_call_id();

        world.0.call_handlers.write().unwrap().insert(
            call_id,
            Arc::new(CallHandlerEntry {
                func: Box::new(handler),
            }),
        );

        tracing::debug!(call_id, owner = world.fusion_id(), "call registered");

        Ok(Self {
            world: world.clone(),
            call_id,
            owner: world.fusion_id(),
        })
    }

    /// Reconstruct a handle from a shared registration.
    pub fn from_state(world: &World, state: &CallState) -> Result<Self> {
        let call_id = state.call_id();
        if call_id == 0 {
            return Err(Error::Destroyed);
        }
        Ok(Self {
            world: world.clone(),
            call_id,
            owner: state.owner(),
        })
    }

    /// Reconstruct a handle from a call id and owner received out of band
    /// (an arena field, a call payload).
    pub fn init_from(world: &World, call_id: u32, owner: u32) -> Self {
        Self {
            world: world.clone(),
            call_id,
            owner,
        }
    }

    pub(crate) fn from_parts(world: &World, call_id: u32, owner: u32) -> Self {
        Self::init_from(world, call_id, owner)
    }

    /// The call id.
    pub fn id(&self) -> u32 {
        self.call_id
    }

    /// Fusion id of the owning process.
    pub fn owner(&self) -> u32 {
        self.owner
    }

    /// Fire-and-forget execution.
    pub fn execute_oneway(&self, arg: i32, payload: &[u8]) -> Result<()> {
        self.check_payload(payload)?;

        if self.owner == self.world.fusion_id() {
            let serial = self.world.next_serial();
            self.invoke_local(serial, arg, payload, ExecMode::Oneway);
            return Ok(());
        }

        self.world.send_to(
            self.owner,
            &WireMessage::Call {
                serial: self.world.next_serial(),
                caller: self.world.fusion_id(),
                call_id: self.call_id,
                arg,
                mode: ExecMode::Oneway as u8,
                payload: payload.to_vec(),
            },
        )
    }

    /// Blocking execution: suspends the calling thread until the owner
    /// replies or the configured call timeout expires.
    ///
    /// Only the calling thread is suspended; the dispatch thread stays
    /// free to deliver the reply.
    pub fn execute(&self, arg: i32, payload: &[u8]) -> Result<i32> {
        let serial = self.execute_queued(arg, payload)?;
        self.fetch_reply(serial)
    }

    /// Queued execution: returns the serial; the reply is fetched later
    /// with [`fetch_reply`](Self::fetch_reply).
    pub fn execute_queued(&self, arg: i32, payload: &[u8]) -> Result<u32> {
        self.check_payload(payload)?;

        let serial = self.world.next_serial();
        self.world.register_pending(serial);

        if self.owner == self.world.fusion_id() {
            self.invoke_local(serial, arg, payload, ExecMode::Blocking);
            return Ok(serial);
        }

        let sent = self.world.send_to(
            self.owner,
            &WireMessage::Call {
                serial,
                caller: self.world.fusion_id(),
                call_id: self.call_id,
                arg,
                mode: ExecMode::Blocking as u8,
                payload: payload.to_vec(),
            },
        );

        if let Err(err) = sent {
            self.world.unregister_pending(serial);
            return Err(err);
        }

        Ok(serial)
    }

    /// Wait for the reply to a queued execution.
    pub fn fetch_reply(&self, serial: u32) -> Result<i32> {
        let (status, value) = self.world.wait_reply(serial, self.world.conf().call_timeout)?;
        match status {
            CALL_OK => Ok(value),
            CALL_NO_HANDLER => Err(Error::Destroyed),
            CALL_LIMIT => Err(Error::LimitExceeded),
            CALL_DENIED => Err(Error::AccessDenied),
            _ => Err(Error::Bug("unknown call reply status")),
        }
    }

    /// Send a deferred reply for a retained call (owner side).
    pub fn call_return(&self, serial: u32, value: i32) -> Result<()> {
        if self.owner != self.world.fusion_id() {
            return Err(Error::AccessDenied);
        }

        let (caller, call_id) = self
            .world
            .0
            .retained
            .lock()
            .unwrap()
            .remove(&serial)
            .ok_or(Error::IdNotFound(serial))?;

        debug_assert_eq!(call_id, self.call_id);
        finish_outstanding(&self.world, call_id, caller);

        if caller == self.world.fusion_id() {
            self.world.complete_pending(serial, CALL_OK, value);
            Ok(())
        } else {
            self.world.send_to(
                caller,
                &WireMessage::CallReturn {
                    serial,
                    status: CALL_OK,
                    value,
                },
            )
        }
    }

    /// Limit the number of outstanding calls a given caller may have
    /// against this call (owner side).
    pub fn set_quota(&self, fusion_id: u32, limit: u32) -> Result<()> {
        if self.owner != self.world.fusion_id() {
            return Err(Error::AccessDenied);
        }
        self.world
            .0
            .quotas
            .lock()
            .unwrap()
            .insert((self.call_id, fusion_id), limit);
        Ok(())
    }

    /// Unregister the handler. Remote executions afterwards fail with
    /// `Destroyed`.
    pub fn destroy(&self) -> Result<()> {
        if self.owner != self.world.fusion_id() {
            return Err(Error::AccessDenied);
        }
        self.world
            .0
            .call_handlers
            .write()
            .unwrap()
            .remove(&self.call_id);
        Ok(())
    }

    fn check_payload(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.world.conf().call_max_data as usize {
            return Err(Error::LimitExceeded);
        }
        Ok(())
    }

    /// Owner calling its own call: the handler runs directly on the
    /// calling thread.
    fn invoke_local(&self, serial: u32, arg: i32, payload: &[u8], mode: ExecMode) {
        let handler = self
            .world
            .0
            .call_handlers
            .read()
            .unwrap()
            .get(&self.call_id)
            .cloned();

        let caller = self.world.fusion_id();
        match handler {
            None => {
                if mode != ExecMode::Oneway {
                    self.world.complete_pending(serial, CALL_NO_HANDLER, 0);
                }
            }
            Some(entry) => {
                let result = (entry.func)(
                    &self.world,
                    CallArgs {
                        caller,
                        arg,
                        payload,
                        serial,
                    },
                );
                match result {
                    CallHandlerResult::Return(value) => {
                        if mode != ExecMode::Oneway {
                            self.world.complete_pending(serial, CALL_OK, value);
                        }
                    }
                    CallHandlerResult::Retain => {
                        if mode != ExecMode::Oneway {
                            self.world
                                .0
                                .retained
                                .lock()
                                .unwrap()
                                .insert(serial, (caller, self.call_id));
                        }
                    }
                }
            }
        }
    }
}

/// Deliver an inbound call execution (dispatch thread).
pub(crate) fn handle_incoming(
    world: &World,
    serial: u32,
    caller: u32,
    call_id: u32,
    arg: i32,
    mode: u8,
    payload: &[u8],
) {
    let mode = match ExecMode::try_from(mode) {
        Ok(mode) => mode,
        Err(_) => {
            tracing::warn!(mode, "dropping call with unknown execution mode");
            return;
        }
    };

    let expects_reply = mode != ExecMode::Oneway;

    // Admission control before the handler runs.
    if expects_reply {
        let limit = world
            .0
            .quotas
            .lock()
            .unwrap()
            .get(&(call_id, caller))
            .copied()
            .unwrap_or(world.conf().call_max_num);

        let mut outstanding = world.0.outstanding.lock().unwrap();
        let count = outstanding.entry((call_id, caller)).or_insert(0);
        if *count >= limit {
            drop(outstanding);
            tracing::warn!(call_id, caller, limit, "call quota exceeded");
            let _ = world.send_to(
                caller,
                &WireMessage::CallReturn {
                    serial,
                    status: CALL_LIMIT,
                    value: 0,
                },
            );
            return;
        }
        *count += 1;
    }

    let handler = world
        .0
        .call_handlers
        .read()
        .unwrap()
        .get(&call_id)
        .cloned();

    let Some(entry) = handler else {
        if expects_reply {
            finish_outstanding(world, call_id, caller);
            let _ = world.send_to(
                caller,
                &WireMessage::CallReturn {
                    serial,
                    status: CALL_NO_HANDLER,
                    value: 0,
                },
            );
        }
        return;
    };

    let result = (entry.func)(
        world,
        CallArgs {
            caller,
            arg,
            payload,
            serial,
        },
    );

    match result {
        CallHandlerResult::Return(value) => {
            if expects_reply {
                finish_outstanding(world, call_id, caller);
                let _ = world.send_to(
                    caller,
                    &WireMessage::CallReturn {
                        serial,
                        status: CALL_OK,
                        value,
                    },
                );
            }
        }
        CallHandlerResult::Retain => {
            if expects_reply {
                world
                    .0
                    .retained
                    .lock()
                    .unwrap()
                    .insert(serial, (caller, call_id));
            }
        }
    }
}

fn finish_outstanding(world: &World, call_id: u32, caller: u32) {
    let mut outstanding = world.0.outstanding.lock().unwrap();
    if let Some(count) = outstanding.get_mut(&(call_id, caller)) {
        *count = count.saturating_sub(1);
    }
}
