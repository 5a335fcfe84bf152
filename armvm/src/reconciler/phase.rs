//! Phases of a reconciliation pass.

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ReconcileError;
use crate::identity::ResourceIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    // create
    Precheck,
    BuildPayload,
    Creating,
    // update
    Planning,
    Disrupting,
    Updating,
    Restoring,
    Verifying,
    // delete
    Deleting,
    PostDeleteCleanup,
    VerifyingAbsence,
    Failed,
}

impl Phase {
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (Failed, _) => false,
            (_, Failed) => true,
            (Idle, Precheck | Planning | Disrupting | Deleting) => true,
            (Precheck, BuildPayload) => true,
            (BuildPayload, Creating) => true,
            (Creating, Verifying) => true,
            (Planning, Disrupting | Updating | Verifying) => true,
            (Disrupting, Updating | Deleting) => true,
            (Updating, Restoring | Verifying) => true,
            (Restoring, Verifying) => true,
            (Deleting, PostDeleteCleanup) => true,
            (PostDeleteCleanup, VerifyingAbsence) => true,
            (Verifying | VerifyingAbsence, Idle) => true,
            _ => false,
        }
    }
}

/// Tracks the phase of one pass and logs every transition.
pub(crate) struct Pass<'a> {
    id: &'a ResourceIdentity,
    operation: &'static str,
    phase: Phase,
    trail: Vec<Phase>,
}

impl<'a> Pass<'a> {
    pub(crate) fn begin(id: &'a ResourceIdentity, operation: &'static str) -> Self {
        debug!(vm = %id.name(), operation, "Starting pass");
        Self {
            id,
            operation,
            phase: Phase::Idle,
            trail: vec![Phase::Idle],
        }
    }

    #[cfg(test)]
    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    #[cfg(test)]
    pub(crate) fn trail(&self) -> &[Phase] {
        &self.trail
    }

    pub(crate) fn enter(&mut self, next: Phase) {
        debug_assert!(
            self.phase.can_transition_to(next),
            "invalid transition {:?} -> {:?}",
            self.phase,
            next
        );
        debug!(
            vm = %self.id.name(),
            operation = self.operation,
            from = ?self.phase,
            to = ?next,
            "Phase transition"
        );
        self.phase = next;
        self.trail.push(next);
    }

    /// End the pass successfully.
    pub(crate) fn finish(&mut self) {
        if self.phase != Phase::Idle {
            self.enter(Phase::Idle);
        }
    }

    /// End the pass with `error`, which is handed back to the caller.
    pub(crate) fn fail(&mut self, error: ReconcileError) -> ReconcileError {
        warn!(
            vm = %self.id.name(),
            operation = self.operation,
            phase = ?self.phase,
            trail = ?self.trail,
            error = %error,
            "Reconciliation failed"
        );
        self.enter(Phase::Failed);
        error
    }
}
