use drip_core::{DripError, DripResult};

use crate::types::RunStatus;

/// Describes a single valid state transition for a sequence run.
#[derive(Debug, Clone, Copy)]
pub struct StateTransition {
    pub from: RunStatus,
    pub to: RunStatus,
    pub trigger: &'static str,
}

const TRANSITIONS: &[StateTransition] = &[
    // Active ->
    StateTransition {
        from: RunStatus::Active,
        to: RunStatus::Paused,
        trigger: "pause",
    },
    StateTransition {
        from: RunStatus::Active,
        to: RunStatus::Completed,
        trigger: "complete",
    },
    StateTransition {
        from: RunStatus::Active,
        to: RunStatus::Cancelled,
        trigger: "stop",
    },
    // Paused ->
    StateTransition {
        from: RunStatus::Paused,
        to: RunStatus::Active,
        trigger: "resume",
    },
    StateTransition {
        from: RunStatus::Paused,
        to: RunStatus::Cancelled,
        trigger: "stop",
    },
];

/// Guards the run lifecycle by enforcing the finite set of valid transitions.
/// Completed and Cancelled are terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunStateMachine;

impl RunStateMachine {
    pub fn transitions() -> &'static [StateTransition] {
        TRANSITIONS
    }

    /// Returns `true` if the given transition is allowed.
    pub fn can_transition(from: RunStatus, to: RunStatus) -> bool {
        TRANSITIONS.iter().any(|t| t.from == from && t.to == to)
    }

    /// Returns an `InvalidStateTransition` error if the transition is not permitted.
    pub fn ensure(from: RunStatus, to: RunStatus) -> DripResult<()> {
        if Self::can_transition(from, to) {
            Ok(())
        } else {
            Err(DripError::InvalidStateTransition {
                current: from.to_string(),
                requested: to.to_string(),
            })
        }
    }
}
