//! Session lifecycle state machine.
//!
//! Pure decision logic. Persistence of a transition is a conditional update
//! whose `from` set comes from [`sources_for`], so a transition attempted
//! from a terminal (or otherwise illegal) state simply matches no row.

use crate::models::SessionStatus;

/// Whether `from -> to` is a legal status transition.
pub fn can_transition(from: SessionStatus, to: SessionStatus) -> bool {
    use SessionStatus::*;

    matches!(
        (from, to),
        (Scheduled, Full)
            | (Scheduled, Canceled)
            | (Scheduled, Active)
            | (Full, Active)
            | (Full, Canceled)
            | (Active, Completed)
            | (Active, Canceled)
    )
}

/// Every status from which `to` may be entered.
pub fn sources_for(to: SessionStatus) -> Vec<SessionStatus> {
    SessionStatus::NON_TERMINAL
        .into_iter()
        .filter(|from| can_transition(*from, to))
        .collect()
}

/// What the fill-deadline does for a given roster size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FillDeadlineDecision {
    /// Roster is full: proceed, keep the completion timer.
    Activate,

    /// Roster is short: cancel and drop remaining timers.
    Cancel { reason: String },
}

pub fn fill_deadline_decision(size: i64, capacity: i64) -> FillDeadlineDecision {
    if size >= capacity {
        FillDeadlineDecision::Activate
    } else {
        FillDeadlineDecision::Cancel {
            reason: shortfall_reason(size, capacity),
        }
    }
}

/// Cancel reason recorded when the fill-deadline passes with an open roster.
pub fn shortfall_reason(size: i64, capacity: i64) -> String {
    format!("Insufficient players ({size}/{capacity})")
}
