//! Client records created by EXCHANGE_ID.

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::xdr::nfs4::verifier4;
use crate::session::error::{Result, SessionError};
use crate::session::{ClientId, CreateSessionReply, SessionId};

/// EXCHANGE_ID result handed back to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeIdResult {
    pub client_id: ClientId,
    /// Sequence ID the client must use on its next CREATE_SESSION.
    pub sequence_id: u32,
    pub confirmed: bool,
}

/// Verdict of the per-client CREATE_SESSION slot.
#[derive(Debug)]
pub(crate) enum CreateSessionSequence {
    New,
    Replay(CreateSessionReply),
}

/// The single sequencing slot guarding CREATE_SESSION (RFC 8881 section 18.36.4).
#[derive(Debug, Clone, Default)]
pub(crate) struct CreateSessionSlot {
    sequence: u32,
    reply: Option<CreateSessionReply>,
}

/// One client identity and everything it owns.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub id: ClientId,
    /// Opaque `co_ownerid` supplied by the client.
    pub owner: Vec<u8>,
    /// `co_verifier`; changes when the client reboots.
    pub verifier: verifier4,
    /// Set by the first successful CREATE_SESSION.
    pub confirmed: bool,
    pub reclaim_complete: bool,
    pub lease_expiry: Instant,
    pub sessions: HashSet<SessionId>,
    pub(crate) create_session: CreateSessionSlot,
}

impl ClientRecord {
    pub(crate) fn new(
        id: ClientId,
        owner: Vec<u8>,
        verifier: verifier4,
        lease_time: Duration,
    ) -> Self {
        Self {
            id,
            owner,
            verifier,
            confirmed: false,
            reclaim_complete: false,
            lease_expiry: Instant::now() + lease_time,
            sessions: HashSet::new(),
            create_session: CreateSessionSlot::default(),
        }
    }

    /// Pushes the lease expiry `lease_time` into the future.
    pub fn renew(&mut self, lease_time: Duration) {
        self.lease_expiry = Instant::now() + lease_time;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.lease_expiry
    }

    /// The sequence ID the next CREATE_SESSION has to carry.
    pub fn next_create_session_sequence(&self) -> u32 {
        self.create_session.sequence.wrapping_add(1)
    }

    /// Checks a CREATE_SESSION sequence ID against the client's slot.
    pub(crate) fn check_create_session(&self, sequence: u32) -> Result<CreateSessionSequence> {
        let slot = &self.create_session;
        if sequence == slot.sequence.wrapping_add(1) {
            return Ok(CreateSessionSequence::New);
        }
        match &slot.reply {
            Some(reply) if sequence == slot.sequence => {
                Ok(CreateSessionSequence::Replay(reply.clone()))
            }
            _ => Err(SessionError::SeqMisordered { slot: 0, sequence }),
        }
    }

    /// Stores the reply of a successful CREATE_SESSION and returns the slot
    /// state it replaced.
    pub(crate) fn record_create_session(&mut self, reply: CreateSessionReply) -> CreateSessionSlot {
        let next = CreateSessionSlot { sequence: reply.sequence, reply: Some(reply) };
        std::mem::replace(&mut self.create_session, next)
    }
}
