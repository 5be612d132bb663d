//! Failure conditions of the session layer and their NFSv4.1 status codes.

use thiserror::Error;

use crate::protocol::xdr::nfs4::nfsstat4;
use crate::session::{ClientId, ConnectionId, SessionId};

/// Everything the session layer can refuse.
///
/// Variants are grouped the way callers react to them: ownership problems,
/// resource limits, sequencing violations and busy resources. Conditions that
/// only mean "already done" are not errors and never show up here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The session does not exist or belongs to another client.
    #[error("unknown session {0}")]
    BadSession(SessionId),

    /// The client ID does not exist (never issued, destroyed or reaped).
    #[error("unknown client ID {0:#x}")]
    StaleClientId(ClientId),

    /// The session already holds `limit` connections.
    #[error("session {session} already has {limit} connections bound")]
    ConnectionLimit { session: SessionId, limit: usize },

    /// The change would take away the session's only fore channel connection.
    #[error("connection {connection} is the last fore channel connection of session {session}")]
    LastForeConnection { session: SessionId, connection: ConnectionId },

    /// The slot index is outside the slot table.
    #[error("slot {slot} is outside the slot table (highest slot {highest})")]
    BadSlot { slot: u32, highest: u32 },

    /// The sequence ID is neither the next one nor a retry of the last one, or
    /// a new request arrived on a slot that is still busy.
    #[error("sequence ID {sequence} is misordered for slot {slot}")]
    SeqMisordered { slot: u32, sequence: u32 },

    /// A retry arrived while the original request is still executing.
    #[error("slot {slot} is still executing sequence ID {sequence}")]
    Delay { slot: u32, sequence: u32 },

    /// A retry arrived for a request whose reply was not cached.
    #[error("reply for slot {slot} sequence ID {sequence} was not cached")]
    RetryUncachedReply { slot: u32, sequence: u32 },

    /// A completion was reported for a slot with no request in flight.
    #[error("slot {slot} has no request in flight for sequence ID {sequence}")]
    SlotNotInUse { slot: u32, sequence: u32 },

    /// The client still owns sessions.
    #[error("client ID {client:#x} still owns {sessions} session(s)")]
    ClientIdBusy { client: ClientId, sessions: usize },

    /// The reply is larger than the channel allows to be cached.
    #[error("reply of {size} bytes exceeds the cached reply limit of {limit} bytes")]
    ReplyTooBigToCache { size: usize, limit: usize },
}

impl SessionError {
    /// Status code the dispatcher puts on the wire for this failure.
    pub fn status(&self) -> nfsstat4 {
        match self {
            SessionError::BadSession(_) => nfsstat4::NFS4ERR_BADSESSION,
            SessionError::StaleClientId(_) => nfsstat4::NFS4ERR_STALE_CLIENTID,
            SessionError::ConnectionLimit { .. } => nfsstat4::NFS4ERR_RESOURCE,
            SessionError::LastForeConnection { .. } => nfsstat4::NFS4ERR_INVAL,
            SessionError::BadSlot { .. } => nfsstat4::NFS4ERR_BADSLOT,
            SessionError::SeqMisordered { .. } => nfsstat4::NFS4ERR_SEQ_MISORDERED,
            SessionError::Delay { .. } => nfsstat4::NFS4ERR_DELAY,
            SessionError::RetryUncachedReply { .. } => nfsstat4::NFS4ERR_RETRY_UNCACHED_REP,
            SessionError::SlotNotInUse { .. } => nfsstat4::NFS4ERR_SERVERFAULT,
            SessionError::ClientIdBusy { .. } => nfsstat4::NFS4ERR_CLIENTID_BUSY,
            SessionError::ReplyTooBigToCache { .. } => nfsstat4::NFS4ERR_REP_TOO_BIG_TO_CACHE,
        }
    }
}

/// Result type used throughout the session layer.
pub type Result<T, E = SessionError> = std::result::Result<T, E>;
