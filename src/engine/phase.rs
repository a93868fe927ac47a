//! engine::phase
//!
//! Operation phases, their legal transitions, and entry routing.
//!
//! # Routing
//!
//! Which branch an operation takes is decided once, at entry, from a small
//! set of [`EntryFlags`]. The decision is an explicit table ([`ROUTES`])
//! covering every flag combination, so adding a flag means adding rows
//! rather than another `if`.
//!
//! # Transitions
//!
//! ```text
//! Created -> ConfigUploading -> RunCreated -> Planning -> PlanReady
//!         -> PolicyPending -> Confirming -> Applying -> Applied
//! ```
//!
//! `Planned`, `Discarded`, `Errored` and `Canceled` end the remote path
//! early; `Delegated` ends the local path.

pub use crate::core::types::Phase;

use uuid::Uuid;

/// Facts about an operation that decide its route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryFlags {
    /// Local execution was forced by the environment.
    pub force_local: bool,
    /// The workspace executes runs remotely.
    pub remote_operations: bool,
    /// The version check rejected the local tool.
    pub version_rejected: bool,
}

/// Where an operation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Remote,
    Local,
    Reject,
}

/// One row of the routing table.
#[derive(Debug, Clone, Copy)]
pub struct RouteRow {
    pub flags: EntryFlags,
    pub route: Route,
}

const fn row(force_local: bool, remote_operations: bool, version_rejected: bool, route: Route) -> RouteRow {
    RouteRow {
        flags: EntryFlags {
            force_local,
            remote_operations,
            version_rejected,
        },
        route,
    }
}

/// Routing table, one row per flag combination.
pub const ROUTES: [RouteRow; 8] = [
    row(false, true, false, Route::Remote),
    row(false, true, true, Route::Remote),
    row(false, false, false, Route::Local),
    row(false, false, true, Route::Reject),
    row(true, true, false, Route::Local),
    row(true, true, true, Route::Reject),
    row(true, false, false, Route::Local),
    row(true, false, true, Route::Reject),
];

impl EntryFlags {
    pub fn route(&self) -> Route {
        ROUTES
            .iter()
            .find(|r| r.flags == *self)
            .map(|r| r.route)
            .unwrap_or(Route::Reject)
    }
}

/// Whether `from -> to` is a legal phase transition.
pub fn can_transition(from: Phase, to: Phase) -> bool {
    use Phase::*;

    if from.is_terminal() {
        return false;
    }
    // Any live phase can end in an error or a cancel.
    if matches!(to, Errored | Canceled) {
        return true;
    }
    match from {
        Created => matches!(to, ConfigUploading | RunCreated | Delegated),
        ConfigUploading => matches!(to, RunCreated),
        RunCreated => matches!(to, Planning | PlanReady),
        Planning => matches!(to, PlanReady | PolicyPending | Planned | Discarded),
        PlanReady => matches!(
            to,
            PolicyPending | Confirming | Applying | Planned | Discarded
        ),
        PolicyPending => matches!(to, Confirming | Applying | Planned | Discarded),
        Confirming => matches!(to, Applying | Discarded),
        Applying => matches!(to, Applied),
        Applied | Planned | Discarded | Errored | Canceled | Delegated => false,
    }
}

/// Current phase of one operation.
///
/// Only the operation task moves it. Illegal moves are logged as defects
/// and still applied, so the final result always names the real phase.
#[derive(Debug)]
pub struct PhaseTracker {
    operation_id: Uuid,
    phase: Phase,
}

impl PhaseTracker {
    pub fn new(operation_id: Uuid) -> Self {
        Self {
            operation_id,
            phase: Phase::Created,
        }
    }

    pub fn current(&self) -> Phase {
        self.phase
    }

    pub fn advance(&mut self, to: Phase) {
        if self.phase == to {
            return;
        }
        if can_transition(self.phase, to) {
            tracing::debug!(
                operation_id = %self.operation_id,
                from = %self.phase,
                to = %to,
                "phase transition"
            );
        } else {
            tracing::error!(
                operation_id = %self.operation_id,
                from = %self.phase,
                to = %to,
                "illegal phase transition"
            );
        }
        self.phase = to;
    }
}
