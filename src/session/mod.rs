//! NFSv4.1 session layer (RFC 8881 section 2.10).
//!
//! NFSv4.1 turns the stateless-looking ONC RPC transport into one with
//! exactly-once semantics. After EXCHANGE_ID a client creates sessions; every
//! COMPOUND then starts with SEQUENCE naming a session, a slot and a sequence
//! ID, which lets the server detect retransmissions and replay cached replies.
//!
//! Building blocks, leaves first:
//!
//! - `slot_table`: per-channel slots and the sequencing algorithm.
//! - `binder`: which connection serves which session, in which direction.
//! - `record`: a session record owning its slot tables.
//! - `client`: a client record owning its sessions and lease.
//! - `grace`: the post-restart reclaim window.
//! - `manager`: [`SessionManager`], the composition root the RPC dispatcher
//!   talks to.
//! - `reaper`: the periodic lease expiry sweep.

use std::fmt;

use rand::RngCore;

use crate::protocol::xdr::nfs4::{sessionid4, NFS4_SESSIONID_SIZE};

mod binder;
mod client;
mod error;
mod grace;
mod manager;
mod reaper;
mod record;
mod slot_table;

pub use binder::{
    grant_direction, BindOutcome, Binding, BoundDirection, ConnectionBinder, ConnectionCounts,
    ConnectionInfo, RequestedDirection, Transport, UnbindReason,
};
pub use client::{ClientRecord, ExchangeIdResult};
pub use error::{Result, SessionError};
pub use grace::{GracePeriodManager, GraceStatus, ReclaimOutcome};
pub use manager::{BindConnResult, ReapStats, SequenceArgs, SequenceResult, SessionManager};
pub use reaper::{spawn_reaper, ReaperHandle};
pub use record::{Channel, ChannelAttrs, CreateSessionArgs, CreateSessionReply, Session};
pub use slot_table::{SlotTable, SlotTableStatus, SlotVerdict};

/// Server-assigned client identifier (`clientid4`).
pub type ClientId = u64;

/// Server-assigned connection identifier, unique for the process lifetime.
pub type ConnectionId = u64;

/// Opaque 16-byte session identifier.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SessionId(pub sessionid4);

impl SessionId {
    /// Draws a new identifier from the thread-local CSPRNG.
    pub fn random() -> Self {
        let mut id = [0_u8; NFS4_SESSIONID_SIZE];
        rand::rng().fill_bytes(&mut id);
        Self(id)
    }

    pub fn as_bytes(&self) -> &sessionid4 {
        &self.0
    }
}

impl From<sessionid4> for SessionId {
    fn from(id: sessionid4) -> Self {
        Self(id)
    }
}

impl From<SessionId> for sessionid4 {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({self})")
    }
}
