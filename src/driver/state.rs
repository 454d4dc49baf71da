//! Driver state machine.
//!
//! All session-scoped mutable state lives in one struct owned by the driver
//! task: the session handle, the latest snapshot, the busy flag guarding
//! trigger-iteration calls, and a liveness flag. Every transition checks
//! liveness first, so a call that resolves after teardown mutates nothing.

use crate::model::SessionSnapshot;

#[derive(Debug)]
pub(crate) struct DriverState {
    session_id: Option<String>,
    snapshot: Option<SessionSnapshot>,
    busy: bool,
    live: bool,
}

impl DriverState {
    pub fn new() -> Self {
        Self {
            session_id: None,
            snapshot: None,
            busy: false,
            live: true,
        }
    }

    /// Armed means both sub-loops may run: alive with an active session.
    pub fn is_armed(&self) -> bool {
        self.live && self.session_id.is_some()
    }

    pub fn busy(&self) -> bool {
        self.busy
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn snapshot(&self) -> Option<&SessionSnapshot> {
        self.snapshot.as_ref()
    }

    /// Store the handle issued by a successful start. Refused when a session
    /// is already active or the driver is shutting down.
    pub fn on_session_started(&mut self, session_id: String) -> bool {
        if !self.live || self.session_id.is_some() {
            return false;
        }
        self.session_id = Some(session_id);
        true
    }

    /// Replace the snapshot wholesale. Returns true when the new snapshot
    /// differs from the previous one (the idle timer rearms on change).
    pub fn apply_snapshot(&mut self, snapshot: SessionSnapshot) -> bool {
        if !self.is_armed() {
            return false;
        }
        let changed = self.snapshot.as_ref() != Some(&snapshot);
        self.snapshot = Some(snapshot);
        changed
    }

    /// Claim the busy flag for one trigger-iteration call. Returns the
    /// session handle when the call may go out, `None` when a call is already
    /// in flight or the driver is not armed.
    pub fn begin_iteration(&mut self) -> Option<String> {
        if !self.is_armed() || self.busy {
            return None;
        }
        self.busy = true;
        self.session_id.clone()
    }

    /// Release the busy flag after a trigger-iteration call resolved, success
    /// or failure. Returns true when the idle timer should rearm.
    pub fn finish_iteration(&mut self) -> bool {
        if !self.live {
            return false;
        }
        self.busy = false;
        self.session_id.is_some()
    }

    /// Drop the session handle, returning the loop to idle. The busy flag is
    /// left alone: an in-flight call still resolves through
    /// `finish_iteration`, which will decline to rearm.
    pub fn disarm(&mut self) -> Option<String> {
        self.session_id.take()
    }

    /// Teardown: after this, every transition is a no-op.
    pub fn shutdown(&mut self) {
        self.live = false;
    }
}
