//! The per-world dispatch thread.
//!
//! One thread per process drains the fusionee's datagram socket and
//! delivers inbound messages: join/leave bookkeeping (master), call
//! executions, call replies, and reactor fan-out. Handler execution for
//! different messages is unordered; delivery to a single reactor preserves
//! the attach/detach-consistent ordering implemented in the reactor
//! itself.
//!
//! A blocking call suspends only the calling thread — replies are matched
//! by serial and handed to the parked caller, so the dispatch thread stays
//! free to deliver them.

use std::sync::atomic::Ordering;

use crate::call;
use crate::reactor;
use crate::refs::Ref;
use crate::shm::SharedPtr;
use crate::world::protocol::{self, WireMessage};
use crate::world::World;

pub(crate) fn dispatch_loop(world: World) {
    world
        .0
        .dispatcher_tid
        .store(rustix::thread::gettid().as_raw_nonzero().get() as u32, Ordering::Release);

    tracing::debug!(fusion_id = world.fusion_id(), "dispatch loop running");

    let mut buf = vec![0u8; world.max_message_size()];

    loop {
        if world.0.stop.load(Ordering::Acquire) {
            break;
        }

        let len = match recv(&world, &mut buf) {
            Ok(len) => len,
            Err(stop) => {
                if stop {
                    break;
                }
                continue;
            }
        };

        let msg = match protocol::decode(&buf[..len]) {
            Ok(msg) => msg,
            Err(_) => {
                tracing::warn!(len, "dropping undecodable message");
                continue;
            }
        };

        if world.0.stop.load(Ordering::Acquire) {
            break;
        }

        process(&world, msg);

        world.run_cleanups();
    }

    tracing::debug!(fusion_id = world.fusion_id(), "dispatch loop done");
}

fn recv(world: &World, buf: &mut [u8]) -> std::result::Result<usize, bool> {
    match world.0.socket_recv(buf) {
        Ok(len) => Ok(len),
        Err(err) if err.kind() == std::io::ErrorKind::Interrupted => Err(false),
        Err(err) => {
            tracing::error!(%err, "dispatch socket receive failed");
            Err(true)
        }
    }
}

fn process(world: &World, msg: WireMessage) {
    match msg {
        WireMessage::Enter { fusion_id, pid } => {
            if !world.is_master() {
                tracing::error!("ENTER request received, but we are not master");
                return;
            }
            if fusion_id == world.fusion_id() {
                tracing::error!("ENTER request received from ourselves");
                return;
            }
            world.add_fusionee(fusion_id, pid);
            let _ = world.send_to(fusion_id, &WireMessage::EnterAck { ok: true });
        }

        WireMessage::EnterAck { .. } => {
            // Only meaningful during the join handshake; late duplicates
            // are dropped.
        }

        WireMessage::Leave { fusion_id } => {
            if !world.is_master() {
                tracing::error!("LEAVE request received, but we are not master");
                return;
            }
            if fusion_id == world.fusion_id() {
                tracing::error!("LEAVE request received from ourselves");
                return;
            }
            world.remove_fusionee(fusion_id);
        }

        WireMessage::Call {
            serial,
            caller,
            call_id,
            arg,
            mode,
            payload,
        } => {
            call::handle_incoming(world, serial, caller, call_id, arg, mode, &payload);
        }

        WireMessage::CallReturn {
            serial,
            status,
            value,
        } => {
            world.complete_pending(serial, status, value);
        }

        WireMessage::Reactor {
            reactor_id,
            channel,
            ref_off,
            payload,
        } => {
            reactor::process_message(world, reactor_id, channel, &payload);

            // Dispatch-complete accounting: drop our share of the ref and
            // reap it when we are the last receiver.
            if ref_off != 0 {
                let dispatch_ref =
                    unsafe { Ref::from_state(world.clone(), SharedPtr::from_raw(ref_off)) };
                let _ = dispatch_ref.down(true);
                if dispatch_ref.zero_trylock().is_ok() {
                    let _ = dispatch_ref.destroy();
                    let _ = world.main_pool().deallocate(SharedPtr::from_raw(ref_off));
                }
            }
        }

        WireMessage::Wakeup => {}
    }
}
