//! Wire protocol between fusionees.
//!
//! Messages are serialized with rkyv and exchanged over unix datagram
//! sockets — one socket per fusionee, named by its hex fusion id inside the
//! world's socket directory. Datagrams preserve message boundaries, so no
//! framing beyond the serialized bytes is needed.

use crate::error::{Error, Result};

/// Call reply status: success.
pub const CALL_OK: u8 = 0;
/// Call reply status: no handler registered for the call id.
pub const CALL_NO_HANDLER: u8 = 1;
/// Call reply status: the caller's quota was exceeded.
pub const CALL_LIMIT: u8 = 2;
/// Call reply status: permission check failed.
pub const CALL_DENIED: u8 = 3;

/// How a call execution behaves on the caller side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecMode {
    /// Fire and forget; no reply is ever sent.
    Oneway = 0,
    /// Caller suspends until the reply arrives or times out.
    Blocking = 1,
    /// Reply is delivered asynchronously and fetched by serial.
    Queued = 2,
}

impl TryFrom<u8> for ExecMode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ExecMode::Oneway),
            1 => Ok(ExecMode::Blocking),
            2 => Ok(ExecMode::Queued),
            _ => Err(Error::InvalidArg("unknown call execution mode")),
        }
    }
}

/// A message between fusionees.
#[derive(Clone, Debug, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub enum WireMessage {
    /// Slave announces itself to the master.
    Enter {
        /// Fusion id the slave bound its socket under.
        fusion_id: u32,
        /// Slave's process id, for liveness probing and kill.
        pid: u32,
    },

    /// Master's answer to `Enter`.
    EnterAck {
        /// False when the join was rejected.
        ok: bool,
    },

    /// Fusionee leaves the world.
    Leave {
        /// Leaving fusionee.
        fusion_id: u32,
    },

    /// Execute a call in the receiving (owning) process.
    Call {
        /// Matches the reply to the request.
        serial: u32,
        /// Fusion id of the caller.
        caller: u32,
        /// Registered call id.
        call_id: u32,
        /// Optional call parameter.
        arg: i32,
        /// Execution mode (`ExecMode`).
        mode: u8,
        /// Optional payload.
        payload: Vec<u8>,
    },

    /// Reply to a `Call`.
    CallReturn {
        /// Serial of the originating call.
        serial: u32,
        /// One of the `CALL_*` status codes.
        status: u8,
        /// Handler return value.
        value: i32,
    },

    /// Reactor message fan-out.
    Reactor {
        /// Target reactor.
        reactor_id: u32,
        /// Dispatch channel.
        channel: u32,
        /// Offset of the dispatch-complete ref in the root pool, 0 if
        /// none.
        ref_off: u32,
        /// The dispatched message.
        payload: Vec<u8>,
    },

    /// No-op used to wake the dispatch loop (e.g. for shutdown).
    Wakeup,
}

/// Serialize a message for sending.
pub fn encode(msg: &WireMessage) -> Result<Vec<u8>> {
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(msg)
        .map_err(|_| Error::InvalidArg("message serialization failed"))?;
    Ok(bytes.to_vec())
}

/// Deserialize a received datagram.
pub fn decode(buf: &[u8]) -> Result<WireMessage> {
    // Copy to an aligned buffer for rkyv.
    let mut aligned = rkyv::util::AlignedVec::<16>::new();
    aligned.extend_from_slice(buf);

    rkyv::from_bytes::<WireMessage, rkyv::rancor::Error>(&aligned)
        .map_err(|_| Error::InvalidArg("message deserialization failed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_variants() {
        let messages = vec![
            WireMessage::Enter {
                fusion_id: 2,
                pid: 4242,
            },
            WireMessage::EnterAck { ok: true },
            WireMessage::Leave { fusion_id: 2 },
            WireMessage::Call {
                serial: 7,
                caller: 2,
                call_id: 3,
                arg: -5,
                mode: ExecMode::Blocking as u8,
                payload: vec![1, 2, 3],
            },
            WireMessage::CallReturn {
                serial: 7,
                status: CALL_OK,
                value: 99,
            },
            WireMessage::Reactor {
                reactor_id: 11,
                channel: 0,
                ref_off: 0,
                payload: b"surface changed".to_vec(),
            },
            WireMessage::Wakeup,
        ];

        for msg in messages {
            let bytes = encode(&msg).unwrap();
            let decoded = decode(&bytes).unwrap();
            // Just verify it decodes without panic and matches the debug
            // representation.
            assert_eq!(format!("{msg:?}"), format!("{decoded:?}"));
        }
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode(&[0xFF, 0x01, 0x02]).is_err());
    }

    #[test]
    fn test_exec_mode_conversion() {
        assert_eq!(ExecMode::try_from(0).unwrap(), ExecMode::Oneway);
        assert_eq!(ExecMode::try_from(1).unwrap(), ExecMode::Blocking);
        assert_eq!(ExecMode::try_from(2).unwrap(), ExecMode::Queued);
        assert!(ExecMode::try_from(9).is_err());
    }
}
