//! The session manager ties clients, sessions, slot tables and connection
//! bindings together and is what the RPC dispatcher calls into.
//!
//! Locking: client and session existence lives in one registry mutex that is
//! only held for short lookups and updates. Slot tables and the grace tracker
//! are never locked while it is held. The binder is locked under it only to
//! open a new session, and the binder never calls back into the registry, so
//! the order is always registry before binder. Sessions are shared as
//! `Arc<Session>` and always looked up again by ID, so a concurrent destroy
//! never leaves a dangling reference in the registry.
//!
//! A destroyed session is closed in the binder as part of DESTROY_SESSION.
//! Binds racing with it either land before the close and are undone by it,
//! or come after and fail with `BadSession`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use metrics::counter;
use tokio::time::Instant;
use tracing::{debug, info, trace};
use tracing_attributes::instrument;

use crate::config::SessionConfig;
use crate::protocol::xdr::nfs4::{
    verifier4, SEQUENCE4args, SEQUENCE4resok, CREATE_SESSION4_FLAG_CONN_BACK_CHAN,
    CREATE_SESSION4_FLAG_CONN_RDMA, SEQ4_STATUS_CB_PATH_DOWN_SESSION,
};
use crate::session::binder::{
    BoundDirection, ConnectionBinder, ConnectionCounts, RequestedDirection, Transport,
};
use crate::session::client::{ClientRecord, CreateSessionSequence, ExchangeIdResult};
use crate::session::error::{Result, SessionError};
use crate::session::grace::{GracePeriodManager, GraceStatus, ReclaimOutcome};
use crate::session::record::{Channel, CreateSessionArgs, CreateSessionReply, Session};
use crate::session::slot_table::{SlotTableStatus, SlotVerdict};
use crate::session::{ClientId, ConnectionId, SessionId};

/// Decoded SEQUENCE (or CB_SEQUENCE) arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceArgs {
    pub session_id: SessionId,
    pub sequence_id: u32,
    pub slot_id: u32,
    /// Highest slot the client intends to use.
    pub highest_slot: u32,
    /// Whether the reply to this request should be cached.
    pub cache_this: bool,
}

impl From<&SEQUENCE4args> for SequenceArgs {
    fn from(args: &SEQUENCE4args) -> Self {
        Self {
            session_id: args.sa_sessionid.into(),
            sequence_id: args.sa_sequenceid,
            slot_id: args.sa_slotid,
            highest_slot: args.sa_highest_slotid,
            cache_this: args.sa_cachethis,
        }
    }
}

/// Outcome of a successful SEQUENCE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceResult {
    pub session_id: SessionId,
    pub slot_id: u32,
    pub sequence_id: u32,
    pub verdict: SlotVerdict,
    pub slots: SlotTableStatus,
    /// `SEQ4_STATUS_*` bits.
    pub status_flags: u32,
}

impl From<&SequenceResult> for SEQUENCE4resok {
    fn from(result: &SequenceResult) -> Self {
        Self {
            sr_sessionid: result.session_id.into(),
            sr_sequenceid: result.sequence_id,
            sr_slotid: result.slot_id,
            sr_highest_slotid: result.slots.highest_slot,
            sr_target_highest_slotid: result.slots.target_highest_slot,
            sr_status_flags: result.status_flags,
        }
    }
}

/// Outcome of BIND_CONN_TO_SESSION.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindConnResult {
    pub session_id: SessionId,
    pub direction: BoundDirection,
    /// The connection was already bound this way; nothing changed.
    pub already_bound: bool,
    /// RDMA mode is never granted.
    pub use_rdma: bool,
}

/// What one reaper sweep removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapStats {
    pub sessions: usize,
    pub clients: usize,
}

#[derive(Debug, Default)]
struct Registry {
    clients: HashMap<ClientId, ClientRecord>,
    /// Current incarnation for each owner.
    owners: HashMap<Vec<u8>, ClientId>,
    sessions: HashMap<SessionId, Arc<Session>>,
}

impl Registry {
    fn client_mut(&mut self, id: ClientId) -> Result<&mut ClientRecord> {
        self.clients.get_mut(&id).ok_or(SessionError::StaleClientId(id))
    }

    /// Looks up a session on behalf of `owner`; sessions of other clients are
    /// reported as unknown.
    fn owned_session(&self, id: SessionId, owner: ClientId) -> Result<&Arc<Session>> {
        self.sessions
            .get(&id)
            .filter(|session| session.client_id() == owner)
            .ok_or(SessionError::BadSession(id))
    }

    fn remove_client(&mut self, id: ClientId) -> Option<ClientRecord> {
        let record = self.clients.remove(&id)?;
        if self.owners.get(&record.owner) == Some(&id) {
            self.owners.remove(&record.owner);
        }
        Some(record)
    }

    fn new_session_id(&self) -> SessionId {
        loop {
            let id = SessionId::random();
            if !self.sessions.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Composition root of the NFSv4.1 session layer.
///
/// Constructed once at server start and shared with every connection task.
#[derive(Debug)]
pub struct SessionManager {
    config: SessionConfig,
    registry: Mutex<Registry>,
    binder: ConnectionBinder,
    grace: GracePeriodManager,
    /// High half of every client ID; changes on every restart so that IDs
    /// from a previous server instance are recognisably stale.
    boot_epoch: u64,
    next_client_id: AtomicU64,
    next_connection_id: AtomicU64,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        let boot_epoch =
            SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs() & 0xffff_ffff);
        Self {
            binder: ConnectionBinder::new(config.max_connections_per_session),
            grace: GracePeriodManager::new(config.grace_period),
            registry: Mutex::new(Registry::default()),
            boot_epoch,
            next_client_id: AtomicU64::new(1),
            next_connection_id: AtomicU64::new(1),
            config,
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().expect("unable to unlock session registry mutex")
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn binder(&self) -> &ConnectionBinder {
        &self.binder
    }

    pub fn grace(&self) -> &GracePeriodManager {
        &self.grace
    }

    pub fn grace_status(&self) -> GraceStatus {
        self.grace.status()
    }

    pub fn force_end_grace(&self) {
        self.grace.force_end();
    }

    fn allocate_client_id(&self) -> ClientId {
        let counter = self.next_client_id.fetch_add(1, Ordering::Relaxed) & 0xffff_ffff;
        (self.boot_epoch << 32) | counter
    }

    // Connections

    /// Registers an accepted connection and returns its ID.
    pub fn open_connection(&self, transport: Transport) -> ConnectionId {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        self.binder.register(id, transport);
        id
    }

    /// Handles a transport disconnect: the binding goes away at once, the
    /// session stays alive on its client's lease.
    pub fn close_connection(&self, conn: ConnectionId) {
        let Some(binding) = self.binder.connection_closed(conn) else {
            return;
        };
        if binding.direction.has_fore()
            && self.binder.counts_for_session(&binding.session).fore_capable() == 0
        {
            debug!(
                "Session {} has no fore channel connection left after connection {} closed",
                binding.session, conn
            );
        }
    }

    pub fn touch(&self, conn: ConnectionId) {
        self.binder.touch(conn);
    }

    pub fn mark_draining(&self, conn: ConnectionId) -> bool {
        self.binder.mark_draining(conn)
    }

    pub fn is_draining(&self, conn: ConnectionId) -> bool {
        self.binder.is_draining(conn)
    }

    pub fn set_max_connections_per_session(&self, limit: usize) {
        self.binder.set_max_connections_per_session(limit);
    }

    pub fn counts_for_session(&self, session: &SessionId) -> ConnectionCounts {
        self.binder.counts_for_session(session)
    }

    // Clients

    /// EXCHANGE_ID.
    ///
    /// The same owner and verifier get the same client ID back. A new
    /// verifier means the client rebooted: its old record is replaced unless
    /// it is confirmed and still owns sessions, in which case it is left to
    /// expire and the new incarnation gets a fresh record.
    pub fn exchange_id(&self, owner: &[u8], verifier: verifier4) -> ExchangeIdResult {
        let lease_time = self.config.lease_time;
        let mut registry = self.registry();

        if let Some(&existing) = registry.owners.get(owner) {
            let replace = match registry.clients.get_mut(&existing) {
                Some(record) if record.verifier == verifier => {
                    record.renew(lease_time);
                    return ExchangeIdResult {
                        client_id: record.id,
                        sequence_id: record.next_create_session_sequence(),
                        confirmed: record.confirmed,
                    };
                }
                Some(record) => !record.confirmed || record.sessions.is_empty(),
                None => false,
            };
            if replace {
                registry.remove_client(existing);
                self.grace.forget(existing);
                info!("Client {:#x} replaced by a new incarnation", existing);
            } else {
                registry.owners.remove(owner);
            }
        }

        let id = self.allocate_client_id();
        let record = ClientRecord::new(id, owner.to_vec(), verifier, lease_time);
        let sequence_id = record.next_create_session_sequence();
        registry.owners.insert(owner.to_vec(), id);
        registry.clients.insert(id, record);
        info!("Client {:#x} created", id);
        ExchangeIdResult { client_id: id, sequence_id, confirmed: false }
    }

    /// Creates an unconfirmed client for `owner` (EXCHANGE_ID with a zero
    /// verifier).
    pub fn create_client(&self, owner: &[u8]) -> ClientId {
        self.exchange_id(owner, [0; 8]).client_id
    }

    /// DESTROY_CLIENTID. Refused while the client owns sessions.
    pub fn destroy_client(&self, client: ClientId) -> Result<()> {
        {
            let mut registry = self.registry();
            let record = registry.client_mut(client)?;
            if !record.sessions.is_empty() {
                return Err(SessionError::ClientIdBusy { client, sessions: record.sessions.len() });
            }
            registry.remove_client(client);
        }
        self.grace.forget(client);
        info!("Client {:#x} destroyed", client);
        Ok(())
    }

    pub fn client(&self, client: ClientId) -> Option<ClientRecord> {
        self.registry().clients.get(&client).cloned()
    }

    /// RECLAIM_COMPLETE for the whole client.
    pub fn reclaim_complete(&self, client: ClientId) -> Result<ReclaimOutcome> {
        self.registry().client_mut(client)?.reclaim_complete = true;
        let outcome = self.grace.reclaim_complete(client);
        debug!("Reclaim complete for client {:#x}: {:?}", client, outcome);
        Ok(outcome)
    }

    // Sessions

    /// CREATE_SESSION arriving on `conn`.
    ///
    /// Replays of the client's last CREATE_SESSION return the cached reply.
    /// A new session gets clamped channel attributes, fresh slot tables and
    /// `conn` bound as fore channel (both directions if a back channel was
    /// asked for).
    #[instrument(skip(self, args), fields(client = args.client_id, seq = args.sequence))]
    pub fn create_session(
        &self,
        conn: ConnectionId,
        args: &CreateSessionArgs,
    ) -> Result<CreateSessionReply> {
        let back_channel = args.flags & CREATE_SESSION4_FLAG_CONN_BACK_CHAN != 0;
        if args.flags & CREATE_SESSION4_FLAG_CONN_RDMA != 0 || args.fore_attrs.rdma_ird.is_some() {
            debug!("RDMA requested by client {:#x}, declined", args.client_id);
        }
        let fore_attrs = args.fore_attrs.negotiate(&self.config.fore_channel_limits);
        let back_attrs = args.back_attrs.negotiate(&self.config.back_channel_limits);
        let flags = args.flags & CREATE_SESSION4_FLAG_CONN_BACK_CHAN;

        let (reply, previous_slot) = {
            let mut registry = self.registry();
            let record = registry.client_mut(args.client_id)?;
            if let CreateSessionSequence::Replay(reply) =
                record.check_create_session(args.sequence)?
            {
                debug!("CREATE_SESSION replay for client {:#x}", args.client_id);
                return Ok(reply);
            }

            let id = registry.new_session_id();
            let session = Session::new(
                id,
                args.client_id,
                flags,
                fore_attrs,
                back_attrs,
                back_channel,
                args,
            );
            let reply = CreateSessionReply {
                session_id: id,
                sequence: args.sequence,
                flags,
                fore_attrs,
                back_attrs,
            };
            registry.sessions.insert(id, Arc::new(session));
            self.binder.open_session(id);
            let record = registry.client_mut(args.client_id)?;
            record.sessions.insert(id);
            record.confirmed = true;
            record.renew(self.config.lease_time);
            let previous_slot = record.record_create_session(reply.clone());
            (reply, previous_slot)
        };

        let direction = if back_channel { BoundDirection::Both } else { BoundDirection::Fore };
        if let Err(e) = self.binder.bind_creator(conn, reply.session_id, direction) {
            {
                let mut registry = self.registry();
                registry.sessions.remove(&reply.session_id);
                if let Some(record) = registry.clients.get_mut(&args.client_id) {
                    record.sessions.remove(&reply.session_id);
                    record.create_session = previous_slot;
                }
            }
            self.binder.unbind_all(&reply.session_id);
            return Err(e);
        }

        info!(
            "Session {} created for client {:#x} ({} fore slots, back channel {})",
            reply.session_id, args.client_id, fore_attrs.max_requests, back_channel
        );
        counter!("nfs41_sessions_created_total").increment(1);
        Ok(reply)
    }

    /// DESTROY_SESSION on behalf of `client`.
    #[instrument(skip(self))]
    pub fn destroy_session(&self, session: SessionId, client: ClientId) -> Result<()> {
        {
            let mut registry = self.registry();
            registry.owned_session(session, client)?;
            registry.sessions.remove(&session);
            if let Some(record) = registry.clients.get_mut(&client) {
                record.sessions.remove(&session);
            }
        }
        self.binder.unbind_all(&session);
        info!("Session {} destroyed by client {:#x}", session, client);
        counter!("nfs41_sessions_destroyed_total").increment(1);
        Ok(())
    }

    pub fn session(&self, session: &SessionId) -> Option<Arc<Session>> {
        self.registry().sessions.get(session).cloned()
    }

    /// Session the connection is bound to, if any.
    pub fn session_for_connection(&self, conn: ConnectionId) -> Option<Arc<Session>> {
        let binding = self.binder.binding(conn)?;
        self.session(&binding.session)
    }

    fn lookup(&self, session: &SessionId) -> Result<Arc<Session>> {
        self.session(session).ok_or(SessionError::BadSession(*session))
    }

    /// BIND_CONN_TO_SESSION.
    ///
    /// Moving a connection to a session that is destroyed right afterwards
    /// leaves the connection unbound; its previous binding is not restored.
    pub fn bind_conn_to_session(
        &self,
        conn: ConnectionId,
        session: SessionId,
        requested: RequestedDirection,
        client: ClientId,
        use_rdma: bool,
    ) -> Result<BindConnResult> {
        self.registry().owned_session(session, client)?;
        if use_rdma {
            debug!("RDMA mode requested on connection {}, declined", conn);
        }

        let outcome = self.binder.bind(conn, session, requested)?;

        Ok(BindConnResult {
            session_id: session,
            direction: outcome.direction,
            already_bound: outcome.already_bound,
            use_rdma: false,
        })
    }

    /// Explicit unbind of `conn`; refused if it is its session's last fore
    /// channel connection.
    pub fn unbind_connection(&self, conn: ConnectionId) -> Result<()> {
        self.binder.unbind_checked(conn)?;
        Ok(())
    }

    /// SEQUENCE (fore channel) or CB_SEQUENCE bookkeeping (back channel)
    /// for a request received on `conn`.
    ///
    /// On success the owning client's lease is renewed and, for the fore
    /// channel, an unbound `conn` is bound to the session.
    pub fn sequence(
        &self,
        conn: ConnectionId,
        channel: Channel,
        args: &SequenceArgs,
    ) -> Result<SequenceResult> {
        let session = self.lookup(&args.session_id)?;
        let table = session
            .slot_table(channel)
            .ok_or(SessionError::BadSlot { slot: args.slot_id, highest: 0 })?;

        let verdict = table.validate_sequence(args.slot_id, args.sequence_id)?;
        if table.acknowledge_highest_slot(args.highest_slot) {
            info!(
                "Session {} {:?} slot table shrunk to {} slots",
                session.id(),
                channel,
                table.slot_count()
            );
        }
        if let SlotVerdict::Retry(_) = verdict {
            debug!(
                "Replaying cached reply for session {} slot {} seq {}",
                session.id(),
                args.slot_id,
                args.sequence_id
            );
            counter!("nfs41_reply_cache_hits_total").increment(1);
        }

        if let Some(record) = self.registry().clients.get_mut(&session.client_id()) {
            record.renew(self.config.lease_time);
        }

        if channel == Channel::Fore {
            self.bind_implicitly(conn, &session);
        }
        self.binder.touch(conn);

        let mut status_flags = 0;
        if session.has_back_channel()
            && self.binder.counts_for_session(&session.id()).back_capable() == 0
        {
            status_flags |= SEQ4_STATUS_CB_PATH_DOWN_SESSION;
        }

        trace!("Sequenced session {} slot {} seq {}", session.id(), args.slot_id, args.sequence_id);
        Ok(SequenceResult {
            session_id: session.id(),
            slot_id: args.slot_id,
            sequence_id: args.sequence_id,
            verdict,
            slots: table.status(),
            status_flags,
        })
    }

    /// Binds a connection that carries SEQUENCE for `session` without being
    /// bound anywhere (RFC 8881 section 2.10.3.1, SP4_NONE clients).
    fn bind_implicitly(&self, conn: ConnectionId, session: &Session) {
        match self.binder.bind_if_unbound(conn, session.id()) {
            Ok(Some(_)) => {
                debug!("Connection {} implicitly bound to session {}", conn, session.id())
            }
            Ok(None) => {}
            Err(e) => debug!("Connection {} left unbound: {}", conn, e),
        }
    }

    /// Records the reply of the request accepted by [`SessionManager::sequence`].
    pub fn complete_request(
        &self,
        session: &SessionId,
        channel: Channel,
        slot_id: u32,
        sequence_id: u32,
        cache_requested: bool,
        reply: &[u8],
    ) -> Result<()> {
        let session = self.lookup(session)?;
        let table = session
            .slot_table(channel)
            .ok_or(SessionError::BadSlot { slot: slot_id, highest: 0 })?;
        table.complete_slot_request(slot_id, sequence_id, cache_requested, reply)
    }

    /// Asks the client to use fewer slots on one channel. Returns the target
    /// actually stored.
    pub fn set_target_highest_slot(
        &self,
        session: &SessionId,
        channel: Channel,
        target: u32,
    ) -> Result<u32> {
        let session = self.lookup(session)?;
        let table = session
            .slot_table(channel)
            .ok_or(SessionError::BadSlot { slot: target, highest: 0 })?;
        Ok(table.set_target_highest_slot(target))
    }

    // Reaping

    /// Removes sessions of expired clients that have no connection left,
    /// then expired clients that own no session.
    pub fn reap_expired(&self) -> ReapStats {
        let now = Instant::now();
        let candidates: Vec<(ClientId, Vec<SessionId>)> = self
            .registry()
            .clients
            .values()
            .filter(|record| record.is_expired(now))
            .map(|record| (record.id, record.sessions.iter().copied().collect()))
            .collect();
        if candidates.is_empty() {
            return ReapStats::default();
        }

        let idle: Vec<(ClientId, Vec<SessionId>)> = candidates
            .into_iter()
            .map(|(client, sessions)| {
                let idle = sessions
                    .into_iter()
                    .filter(|s| self.binder.counts_for_session(s).total == 0)
                    .collect();
                (client, idle)
            })
            .collect();

        let mut stats = ReapStats::default();
        let mut reaped_sessions = Vec::new();
        let mut reaped_clients = Vec::new();
        {
            let mut registry = self.registry();
            for (client, sessions) in idle {
                // The lease may have been renewed since the scan.
                let Some(record) = registry.clients.get_mut(&client) else {
                    continue;
                };
                if !record.is_expired(now) {
                    continue;
                }
                for session in &sessions {
                    record.sessions.remove(session);
                }
                let empty = record.sessions.is_empty();
                for session in sessions {
                    if registry.sessions.remove(&session).is_some() {
                        reaped_sessions.push(session);
                    }
                }
                if empty {
                    registry.remove_client(client);
                    reaped_clients.push(client);
                }
            }
        }

        for session in &reaped_sessions {
            self.binder.unbind_all(session);
            info!("Session {} reaped after lease expiry", session);
        }
        for client in &reaped_clients {
            self.grace.forget(*client);
            info!("Client {:#x} reaped after lease expiry", client);
        }
        stats.sessions = reaped_sessions.len();
        stats.clients = reaped_clients.len();
        counter!("nfs41_sessions_destroyed_total").increment(stats.sessions as u64);
        stats
    }
}
