//! # Coordinator
//!
//! The mutual-exclusion and coalescing protocol for reconciliation runs.
//!
//! A single tri-state value decides whether a run may start:
//!
//! ```text
//!            request                 request
//!   Idle ─────────────► Running ─────────────► RunningWithPendingChanges
//!    ▲                  │    ▲                          │
//!    │   finish (clean) │    └──────── begin_pass ──────┘
//!    └──────────────────┘
//!    ▲
//!    └────────── release (from any state)
//! ```
//!
//! The state lives inside the engine mutex, so a mutation and its request
//! happen in one critical section and two callers can never both see
//! `Idle`.

/// Coordination state of the managed file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncState {
    #[default]
    Idle,
    /// A run is active and has seen every change so far.
    Running,
    /// A run is active and a change arrived after its last snapshot.
    RunningWithPendingChanges,
}

/// Outcome of [`SyncState::request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileRequest {
    /// The state moved to `Running`; the caller must submit a run.
    Started,
    /// A run is in flight and will pick the change up.
    Coalesced,
    /// The executor refused the run and the state fell back to `Idle`.
    /// Never produced by [`SyncState::request`] itself.
    Rejected,
}

/// What the run loop does after committing a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// No change arrived during the pass; the run is over.
    Done,
    /// Changes arrived; run another pass.
    Again,
}

impl SyncState {
    /// True in both running states.
    pub fn is_updating(self) -> bool {
        self != SyncState::Idle
    }

    /// True when a change is waiting for the next pass.
    pub fn needs_update(self) -> bool {
        self == SyncState::RunningWithPendingChanges
    }

    /// Records that a change needs reconciling.
    pub fn request(&mut self) -> ReconcileRequest {
        match *self {
            SyncState::Idle => {
                *self = SyncState::Running;
                ReconcileRequest::Started
            }
            SyncState::Running | SyncState::RunningWithPendingChanges => {
                *self = SyncState::RunningWithPendingChanges;
                ReconcileRequest::Coalesced
            }
        }
    }

    /// Start of a pass: the snapshot about to be taken covers every change
    /// so far.
    pub fn begin_pass(&mut self) {
        if *self == SyncState::RunningWithPendingChanges {
            *self = SyncState::Running;
        }
    }

    /// End of a committed pass.
    pub fn finish_pass(&mut self) -> PassOutcome {
        match *self {
            SyncState::RunningWithPendingChanges => PassOutcome::Again,
            SyncState::Running | SyncState::Idle => {
                *self = SyncState::Idle;
                PassOutcome::Done
            }
        }
    }

    /// Leaves the running states unconditionally.
    pub fn release(&mut self) {
        *self = SyncState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_request_starts_a_run() {
        let mut state = SyncState::default();
        assert_eq!(state.request(), ReconcileRequest::Started);
        assert_eq!(state, SyncState::Running);
        assert!(state.is_updating());
        assert!(!state.needs_update());
    }

    #[test]
    fn requests_while_running_coalesce() {
        let mut state = SyncState::Running;
        for _ in 0..3 {
            assert_eq!(state.request(), ReconcileRequest::Coalesced);
        }
        assert_eq!(state, SyncState::RunningWithPendingChanges);
        assert!(state.needs_update());
    }

    #[test]
    fn clean_pass_returns_to_idle() {
        let mut state = SyncState::Running;
        state.begin_pass();
        assert_eq!(state.finish_pass(), PassOutcome::Done);
        assert_eq!(state, SyncState::Idle);
    }

    #[test]
    fn change_during_pass_loops_without_leaving_running() {
        let mut state = SyncState::RunningWithPendingChanges;
        state.begin_pass();
        assert_eq!(state, SyncState::Running);
        state.request();
        assert_eq!(state.finish_pass(), PassOutcome::Again);
        assert!(state.is_updating());
        state.begin_pass();
        assert_eq!(state.finish_pass(), PassOutcome::Done);
    }

    #[test]
    fn release_from_any_state() {
        for mut state in [
            SyncState::Idle,
            SyncState::Running,
            SyncState::RunningWithPendingChanges,
        ] {
            state.release();
            assert_eq!(state, SyncState::Idle);
        }
    }
}
