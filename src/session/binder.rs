//! Connection binding and trunking (RFC 8881 sections 2.10.3 and 18.34).
//!
//! A session may be served by several transport connections at once. Each
//! connection is bound to at most one session and carries the fore channel,
//! the back channel or both. The binder keeps the connection registry and the
//! binding table behind its own lock so that accepts, disconnects and rebinds
//! never contend with request sequencing.
//!
//! Policy enforced here:
//! - a session holds at most `max_connections_per_session` connections;
//! - an explicit change never takes away a session's last fore channel
//!   connection (a transport disconnect may, the session then waits for a
//!   new BIND_CONN_TO_SESSION);
//! - rebinding a connection to another session silently drops the old binding;
//! - only sessions opened with `open_session` and not yet closed by
//!   `unbind_all` accept binds.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use metrics::{counter, gauge};
use smallvec::SmallVec;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::protocol::xdr::nfs4::{channel_dir_from_client4, channel_dir_from_server4};
use crate::session::error::{Result, SessionError};
use crate::session::{ConnectionId, SessionId};

/// Transport a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    /// RDMA mode is accepted in requests but never granted.
    Rdma,
}

/// Direction asked for by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedDirection {
    Fore,
    Back,
    ForeOrBoth,
    BackOrBoth,
}

impl From<channel_dir_from_client4> for RequestedDirection {
    fn from(dir: channel_dir_from_client4) -> Self {
        match dir {
            channel_dir_from_client4::CDFC4_FORE => RequestedDirection::Fore,
            channel_dir_from_client4::CDFC4_BACK => RequestedDirection::Back,
            channel_dir_from_client4::CDFC4_FORE_OR_BOTH => RequestedDirection::ForeOrBoth,
            channel_dir_from_client4::CDFC4_BACK_OR_BOTH => RequestedDirection::BackOrBoth,
        }
    }
}

/// Direction a connection is bound in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundDirection {
    Fore,
    Back,
    Both,
}

impl BoundDirection {
    /// True if the connection carries fore channel requests.
    pub fn has_fore(self) -> bool {
        matches!(self, BoundDirection::Fore | BoundDirection::Both)
    }

    /// True if the connection carries back channel callbacks.
    pub fn has_back(self) -> bool {
        matches!(self, BoundDirection::Back | BoundDirection::Both)
    }
}

impl From<BoundDirection> for channel_dir_from_server4 {
    fn from(dir: BoundDirection) -> Self {
        match dir {
            BoundDirection::Fore => channel_dir_from_server4::CDFS4_FORE,
            BoundDirection::Back => channel_dir_from_server4::CDFS4_BACK,
            BoundDirection::Both => channel_dir_from_server4::CDFS4_BOTH,
        }
    }
}

/// The direction the server grants for each direction a client may ask for.
///
/// Single directions are granted as asked; both "or both" requests are
/// granted as both.
pub fn grant_direction(requested: RequestedDirection) -> BoundDirection {
    match requested {
        RequestedDirection::Fore => BoundDirection::Fore,
        RequestedDirection::Back => BoundDirection::Back,
        RequestedDirection::ForeOrBoth => BoundDirection::Both,
        RequestedDirection::BackOrBoth => BoundDirection::Both,
    }
}

/// Session and direction a connection is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub session: SessionId,
    pub direction: BoundDirection,
}

/// Snapshot of one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub transport: Transport,
    pub last_activity: Instant,
    pub draining: bool,
    pub binding: Option<Binding>,
}

impl ConnectionInfo {
    fn new(id: ConnectionId, transport: Transport) -> Self {
        Self { id, transport, last_activity: Instant::now(), draining: false, binding: None }
    }
}

/// Per-direction connection counts of a session. Each connection is counted
/// once, in the bucket of its own direction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionCounts {
    pub fore: usize,
    pub back: usize,
    pub both: usize,
    pub total: usize,
}

impl ConnectionCounts {
    /// Connections able to carry fore channel requests.
    pub fn fore_capable(&self) -> usize {
        self.fore + self.both
    }

    /// Connections able to carry callbacks.
    pub fn back_capable(&self) -> usize {
        self.back + self.both
    }
}

/// Result of a successful bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindOutcome {
    pub direction: BoundDirection,
    /// The connection was already bound to the session in this direction.
    pub already_bound: bool,
    /// Session the connection was moved away from, if any.
    pub previous: Option<SessionId>,
}

/// Why a binding went away, used as the metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnbindReason {
    Explicit,
    Disconnect,
    SessionDestroyed,
    Rebind,
}

impl UnbindReason {
    fn as_str(self) -> &'static str {
        match self {
            UnbindReason::Explicit => "explicit",
            UnbindReason::Disconnect => "disconnect",
            UnbindReason::SessionDestroyed => "session_destroyed",
            UnbindReason::Rebind => "rebind",
        }
    }
}

impl fmt::Display for UnbindReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type SessionConnections = SmallVec<[ConnectionId; 4]>;

/// Who is asking for a binding, which decides the checks applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindMode {
    /// BIND_CONN_TO_SESSION: the old session must keep a fore connection.
    Explicit,
    /// CREATE_SESSION: the old binding is dropped unconditionally.
    Creator,
    /// SEQUENCE on an unbound connection: an existing binding wins.
    Implicit,
}

#[derive(Debug)]
struct BinderState {
    connections: HashMap<ConnectionId, ConnectionInfo>,
    /// One entry per open session, present from `open_session` until
    /// `unbind_all`, even while no connection is bound.
    sessions: HashMap<SessionId, SessionConnections>,
    max_connections_per_session: usize,
}

impl BinderState {
    fn counts(&self, session: &SessionId) -> ConnectionCounts {
        let mut counts = ConnectionCounts::default();
        let Some(ids) = self.sessions.get(session) else {
            return counts;
        };
        for binding in ids.iter().filter_map(|id| self.connections.get(id)?.binding) {
            match binding.direction {
                BoundDirection::Fore => counts.fore += 1,
                BoundDirection::Back => counts.back += 1,
                BoundDirection::Both => counts.both += 1,
            }
            counts.total += 1;
        }
        counts
    }

    fn session_len(&self, session: &SessionId) -> usize {
        self.sessions.get(session).map_or(0, |ids| ids.len())
    }

    fn detach(&mut self, conn: ConnectionId) -> Option<Binding> {
        let binding = self.connections.get_mut(&conn)?.binding.take()?;
        if let Some(ids) = self.sessions.get_mut(&binding.session) {
            ids.retain(|id| *id != conn);
        }
        Some(binding)
    }

    /// Refuses a change that takes fore service away from `conn`'s session
    /// when `conn` is that session's only fore channel connection.
    fn check_fore_coverage(
        &self,
        conn: ConnectionId,
        current: Binding,
        next: Option<BoundDirection>,
    ) -> Result<()> {
        let loses_fore = current.direction.has_fore() && !next.is_some_and(|d| d.has_fore());
        if loses_fore && self.counts(&current.session).fore_capable() == 1 {
            return Err(SessionError::LastForeConnection {
                session: current.session,
                connection: conn,
            });
        }
        Ok(())
    }
}

/// Connection registry and connection-to-session binding table.
#[derive(Debug)]
pub struct ConnectionBinder {
    state: Mutex<BinderState>,
}

impl ConnectionBinder {
    pub fn new(max_connections_per_session: usize) -> Self {
        Self {
            state: Mutex::new(BinderState {
                connections: HashMap::new(),
                sessions: HashMap::new(),
                max_connections_per_session: max_connections_per_session.max(1),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BinderState> {
        self.state.lock().expect("unable to unlock connection binder mutex")
    }

    pub fn max_connections_per_session(&self) -> usize {
        self.state().max_connections_per_session
    }

    /// Changes the per-session limit. Existing bindings above a lowered limit
    /// are kept; only new binds are refused.
    pub fn set_max_connections_per_session(&self, limit: usize) {
        self.state().max_connections_per_session = limit.max(1);
    }

    /// Registers a freshly accepted connection. Registering a known
    /// connection is a no-op.
    pub fn register(&self, conn: ConnectionId, transport: Transport) {
        let live = {
            let mut state = self.state();
            state.connections.entry(conn).or_insert_with(|| ConnectionInfo::new(conn, transport));
            state.connections.len()
        };
        gauge!("nfs41_live_connections").set(live as f64);
    }

    /// Makes `session` available for binding. Called once when the session is
    /// created; [`ConnectionBinder::unbind_all`] closes it again.
    pub fn open_session(&self, session: SessionId) {
        self.state().sessions.entry(session).or_default();
    }

    /// Binds `conn` to `session` (BIND_CONN_TO_SESSION).
    ///
    /// Ownership of the session must have been checked by the caller. A
    /// session that is not open, or was closed by
    /// [`ConnectionBinder::unbind_all`] in the meantime, is refused with
    /// `BadSession` before the connection's current binding is touched. The
    /// granted direction follows [`grant_direction`]. Unknown connections are
    /// registered as TCP connections.
    pub fn bind(
        &self,
        conn: ConnectionId,
        session: SessionId,
        requested: RequestedDirection,
    ) -> Result<BindOutcome> {
        self.bind_with(conn, session, grant_direction(requested), BindMode::Explicit)
    }

    /// Binds the connection that created `session`. A previous binding of the
    /// connection is dropped even if that leaves the old session without fore
    /// service, as on a disconnect.
    pub(crate) fn bind_creator(
        &self,
        conn: ConnectionId,
        session: SessionId,
        direction: BoundDirection,
    ) -> Result<BindOutcome> {
        self.bind_with(conn, session, direction, BindMode::Creator)
    }

    /// Binds `conn` as fore channel connection of `session` unless it is
    /// already bound somewhere, in which case nothing changes and `None` is
    /// returned.
    pub(crate) fn bind_if_unbound(
        &self,
        conn: ConnectionId,
        session: SessionId,
    ) -> Result<Option<BindOutcome>> {
        match self.bind_with(conn, session, BoundDirection::Fore, BindMode::Implicit) {
            Ok(outcome) if outcome.already_bound => Ok(None),
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) => Err(e),
        }
    }

    fn bind_with(
        &self,
        conn: ConnectionId,
        session: SessionId,
        direction: BoundDirection,
        mode: BindMode,
    ) -> Result<BindOutcome> {
        let (outcome, previous_len, session_len) = {
            let mut state = self.state();
            if !state.sessions.contains_key(&session) {
                return Err(SessionError::BadSession(session));
            }
            let current = state
                .connections
                .entry(conn)
                .or_insert_with(|| ConnectionInfo::new(conn, Transport::Tcp))
                .binding;

            if let (BindMode::Implicit, Some(current)) = (mode, current) {
                return Ok(BindOutcome {
                    direction: current.direction,
                    already_bound: true,
                    previous: None,
                });
            }

            match current {
                Some(current) if current.session == session => {
                    if current.direction == direction {
                        return Ok(BindOutcome { direction, already_bound: true, previous: None });
                    }
                    state.check_fore_coverage(conn, current, Some(direction))?;
                }
                current => {
                    let limit = state.max_connections_per_session;
                    if state.session_len(&session) >= limit {
                        return Err(SessionError::ConnectionLimit { session, limit });
                    }
                    if let Some(current) = current {
                        if mode == BindMode::Explicit {
                            state.check_fore_coverage(conn, current, None)?;
                        }
                        state.detach(conn);
                    }
                    if let Some(ids) = state.sessions.get_mut(&session) {
                        ids.push(conn);
                    }
                }
            }

            if let Some(info) = state.connections.get_mut(&conn) {
                info.binding = Some(Binding { session, direction });
            }
            let previous = current.map(|b| b.session).filter(|s| *s != session);
            let previous_len = previous.map(|s| (s, state.session_len(&s)));
            let outcome = BindOutcome { direction, already_bound: false, previous };
            (outcome, previous_len, state.session_len(&session))
        };

        if let Some((previous, len)) = previous_len {
            info!("Connection {} moved from session {} to {}", conn, previous, session);
            counter!("nfs41_connection_unbinds_total", "reason" => UnbindReason::Rebind.as_str())
                .increment(1);
            gauge!("nfs41_session_connections", "session" => previous.to_string()).set(len as f64);
        }
        info!("Connection {} bound to session {} as {:?}", conn, session, direction);
        counter!("nfs41_connection_binds_total").increment(1);
        gauge!("nfs41_session_connections", "session" => session.to_string())
            .set(session_len as f64);
        Ok(outcome)
    }

    /// Removes the binding of `conn`, whatever the reason. Idempotent; the
    /// connection itself stays registered.
    pub fn unbind(&self, conn: ConnectionId, reason: UnbindReason) -> Option<Binding> {
        let (binding, remaining) = {
            let mut state = self.state();
            let binding = state.detach(conn)?;
            let remaining = state.session_len(&binding.session);
            (binding, remaining)
        };
        Self::report_unbind(conn, binding, reason, remaining);
        Some(binding)
    }

    /// Explicit unbind requested by an administrator or the client. Unlike
    /// [`ConnectionBinder::unbind`] it refuses to take away the session's
    /// last fore channel connection.
    pub fn unbind_checked(&self, conn: ConnectionId) -> Result<Option<Binding>> {
        let (binding, remaining) = {
            let mut state = self.state();
            let Some(current) = state.connections.get(&conn).and_then(|info| info.binding) else {
                return Ok(None);
            };
            state.check_fore_coverage(conn, current, None)?;
            state.detach(conn);
            (current, state.session_len(&current.session))
        };
        Self::report_unbind(conn, binding, UnbindReason::Explicit, remaining);
        Ok(Some(binding))
    }

    /// Removes every binding of `session` (DESTROY_SESSION) and closes it for
    /// further binds. Returns the connections that were bound.
    pub fn unbind_all(&self, session: &SessionId) -> Vec<ConnectionId> {
        let ids = {
            let mut state = self.state();
            let ids = state.sessions.remove(session).unwrap_or_default();
            for id in &ids {
                if let Some(info) = state.connections.get_mut(id) {
                    info.binding = None;
                }
            }
            ids
        };
        if !ids.is_empty() {
            info!("Unbound {} connection(s) from destroyed session {}", ids.len(), session);
            counter!(
                "nfs41_connection_unbinds_total",
                "reason" => UnbindReason::SessionDestroyed.as_str()
            )
            .increment(ids.len() as u64);
        }
        gauge!("nfs41_session_connections", "session" => session.to_string()).set(0.0);
        ids.into_vec()
    }

    /// Forgets a closed connection. Its binding is dropped immediately; the
    /// session survives even when this was its last fore channel connection.
    pub fn connection_closed(&self, conn: ConnectionId) -> Option<Binding> {
        let (binding, remaining, live) = {
            let mut state = self.state();
            let binding = state.detach(conn);
            let remaining = binding.map(|b| state.session_len(&b.session));
            state.connections.remove(&conn);
            (binding, remaining, state.connections.len())
        };
        gauge!("nfs41_live_connections").set(live as f64);
        if let (Some(binding), Some(remaining)) = (binding, remaining) {
            Self::report_unbind(conn, binding, UnbindReason::Disconnect, remaining);
        }
        binding
    }

    fn report_unbind(conn: ConnectionId, binding: Binding, reason: UnbindReason, remaining: usize) {
        info!("Connection {} unbound from session {} ({})", conn, binding.session, reason);
        counter!("nfs41_connection_unbinds_total", "reason" => reason.as_str()).increment(1);
        gauge!("nfs41_session_connections", "session" => binding.session.to_string())
            .set(remaining as f64);
    }

    /// Stops new requests on `conn` while in-flight ones finish. Returns false
    /// for unknown connections.
    pub fn mark_draining(&self, conn: ConnectionId) -> bool {
        let mut state = self.state();
        match state.connections.get_mut(&conn) {
            Some(info) => {
                debug!("Connection {} is draining", conn);
                info.draining = true;
                true
            }
            None => false,
        }
    }

    pub fn is_draining(&self, conn: ConnectionId) -> bool {
        self.state().connections.get(&conn).is_some_and(|info| info.draining)
    }

    /// Records activity on `conn`.
    pub fn touch(&self, conn: ConnectionId) {
        if let Some(info) = self.state().connections.get_mut(&conn) {
            info.last_activity = Instant::now();
        }
    }

    pub fn binding(&self, conn: ConnectionId) -> Option<Binding> {
        self.state().connections.get(&conn).and_then(|info| info.binding)
    }

    pub fn connection(&self, conn: ConnectionId) -> Option<ConnectionInfo> {
        self.state().connections.get(&conn).cloned()
    }

    pub fn counts_for_session(&self, session: &SessionId) -> ConnectionCounts {
        self.state().counts(session)
    }

    /// Connections currently bound to `session`, in bind order.
    pub fn connections_for_session(&self, session: &SessionId) -> Vec<ConnectionId> {
        self.state().sessions.get(session).map(|ids| ids.to_vec()).unwrap_or_default()
    }

    /// Number of registered (open) connections.
    pub fn live_connections(&self) -> usize {
        self.state().connections.len()
    }
}
