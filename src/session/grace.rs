//! Post-restart grace period (RFC 8881 section 8.4.2).
//!
//! Nothing of the session layer survives a restart, so clients re-establish
//! sessions from scratch. The grace period is the window in which they may
//! still reclaim locks and opens held before the restart; each client closes
//! its own reclaim phase with RECLAIM_COMPLETE.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

use crate::session::ClientId;

/// Snapshot of the grace window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraceStatus {
    pub active: bool,
    pub remaining: Duration,
}

impl GraceStatus {
    /// Remaining time rounded up to whole seconds, as shown by admin tools.
    pub fn remaining_seconds(&self) -> u64 {
        let secs = self.remaining.as_secs();
        if self.remaining.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }
}

/// Outcome of RECLAIM_COMPLETE. None of them is a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// First call for this client inside the grace window.
    Completed,
    /// The client already reported reclaim completion.
    AlreadyComplete,
    /// First call for this client, but the grace window is over so there was
    /// nothing left to reclaim.
    GraceInactive,
}

#[derive(Debug, Default)]
struct GraceState {
    ended_early: bool,
    end_logged: bool,
    completed: HashSet<ClientId>,
}

/// Tracks the grace window and per-client reclaim completion.
#[derive(Debug)]
pub struct GracePeriodManager {
    started: Instant,
    duration: Duration,
    state: Mutex<GraceState>,
}

impl GracePeriodManager {
    /// Starts a grace window of `duration` now.
    pub fn new(duration: Duration) -> Self {
        Self { started: Instant::now(), duration, state: Mutex::new(GraceState::default()) }
    }

    fn state(&self) -> MutexGuard<'_, GraceState> {
        self.state.lock().expect("unable to unlock grace period mutex")
    }

    fn remaining(&self, state: &GraceState) -> Duration {
        if state.ended_early {
            return Duration::ZERO;
        }
        self.duration.saturating_sub(self.started.elapsed())
    }

    pub fn status(&self) -> GraceStatus {
        let mut state = self.state();
        let remaining = self.remaining(&state);
        let active = !remaining.is_zero();
        if !active && !state.end_logged {
            state.end_logged = true;
            info!("Grace period over, {} client(s) completed reclaim", state.completed.len());
        }
        GraceStatus { active, remaining }
    }

    pub fn in_grace(&self) -> bool {
        self.status().active
    }

    /// Ends the grace period immediately (administrative action).
    pub fn force_end(&self) {
        let mut state = self.state();
        if !state.ended_early && !self.remaining(&state).is_zero() {
            info!("Grace period ended by administrator");
        }
        state.ended_early = true;
        state.end_logged = true;
    }

    /// Records RECLAIM_COMPLETE for `client`.
    pub fn reclaim_complete(&self, client: ClientId) -> ReclaimOutcome {
        let mut state = self.state();
        let active = !self.remaining(&state).is_zero();
        if !state.completed.insert(client) {
            return ReclaimOutcome::AlreadyComplete;
        }
        if active {
            ReclaimOutcome::Completed
        } else {
            ReclaimOutcome::GraceInactive
        }
    }

    pub fn has_completed(&self, client: ClientId) -> bool {
        self.state().completed.contains(&client)
    }

    /// Drops the reclaim record of a destroyed client.
    pub fn forget(&self, client: ClientId) {
        self.state().completed.remove(&client);
    }
}
