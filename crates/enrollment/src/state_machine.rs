use drip_core::error::{DripError, DripResult};

use crate::types::EnrollmentStatus;

/// Describes a single valid enrollment state transition.
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub from: EnrollmentStatus,
    pub to: EnrollmentStatus,
    pub trigger: &'static str,
}

/// Guards the enrollment lifecycle by enforcing a finite set of valid
/// state transitions. Illegal transitions are rejected with a descriptive
/// error, never silently ignored.
#[derive(Debug, Clone)]
pub struct EnrollmentStateMachine {
    transitions: Vec<StateTransition>,
}

impl EnrollmentStateMachine {
    pub fn new() -> Self {
        use EnrollmentStatus::*;

        let transitions = vec![
            // Active ->
            StateTransition { from: Active, to: Paused, trigger: "pause" },
            StateTransition { from: Active, to: Completed, trigger: "steps_exhausted" },
            StateTransition { from: Active, to: Responded, trigger: "response_received" },
            StateTransition { from: Active, to: Converted, trigger: "conversion" },
            StateTransition { from: Active, to: OptedOut, trigger: "opt_out" },
            StateTransition { from: Active, to: Bounced, trigger: "hard_bounce" },
            StateTransition { from: Active, to: Expired, trigger: "staleness" },
            // Paused ->
            StateTransition { from: Paused, to: Active, trigger: "resume" },
            StateTransition { from: Paused, to: Expired, trigger: "staleness" },
            // Responded / Bounced can still go stale.
            StateTransition { from: Responded, to: Expired, trigger: "staleness" },
            StateTransition { from: Bounced, to: Expired, trigger: "staleness" },
        ];

        Self { transitions }
    }

    /// Returns `true` if the given transition is allowed.
    pub fn can_transition(&self, from: EnrollmentStatus, to: EnrollmentStatus) -> bool {
        self.transitions.iter().any(|t| t.from == from && t.to == to)
    }

    /// Validates the transition, returning a descriptive error when it is
    /// not permitted.
    pub fn ensure(&self, from: EnrollmentStatus, to: EnrollmentStatus) -> DripResult<()> {
        if self.can_transition(from, to) {
            Ok(())
        } else {
            Err(DripError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            })
        }
    }

    /// All legal targets from a given state. Used by tests to exercise the
    /// machine exhaustively.
    pub fn targets_from(&self, from: EnrollmentStatus) -> Vec<EnrollmentStatus> {
        self.transitions
            .iter()
            .filter(|t| t.from == from)
            .map(|t| t.to)
            .collect()
    }
}

impl Default for EnrollmentStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use EnrollmentStatus::*;

    const ALL: [EnrollmentStatus; 8] =
        [Active, Paused, Completed, Responded, Converted, OptedOut, Bounced, Expired];

    #[test]
    fn test_every_state_has_an_enumerable_transition_set() {
        let machine = EnrollmentStateMachine::new();

        for from in ALL {
            let legal = machine.targets_from(from);
            for to in ALL {
                assert_eq!(
                    machine.can_transition(from, to),
                    legal.contains(&to),
                    "transition table inconsistent for {from} -> {to}",
                );
            }
        }
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        let machine = EnrollmentStateMachine::new();
        for from in [Completed, Converted, OptedOut, Expired] {
            assert!(machine.targets_from(from).is_empty(), "{from} must be terminal");
        }
    }

    #[test]
    fn test_resume_only_from_paused() {
        let machine = EnrollmentStateMachine::new();
        assert!(machine.can_transition(Paused, Active));
        for from in [Completed, Responded, Converted, OptedOut, Bounced, Expired] {
            assert!(!machine.can_transition(from, Active));
        }
    }

    #[test]
    fn test_illegal_transition_is_descriptive() {
        let machine = EnrollmentStateMachine::new();
        let err = machine.ensure(Completed, Active).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("completed"));
        assert!(msg.contains("active"));
    }

    #[test]
    fn test_staleness_reaches_everything_but_fully_terminal() {
        let machine = EnrollmentStateMachine::new();
        for from in [Active, Paused, Responded, Bounced] {
            assert!(machine.can_transition(from, Expired));
        }
        for from in [Completed, Converted, OptedOut] {
            assert!(!machine.can_transition(from, Expired));
        }
    }
}
