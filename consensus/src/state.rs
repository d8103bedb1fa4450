use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{ConsensusError, Result};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Role {
    #[default]
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
pub struct StateMachine {
    current: Role,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_state(&self) -> Role {
        self.current
    }

    pub fn is_leader(&self) -> bool {
        self.current == Role::Leader
    }

    pub fn set_state(&mut self, next: Role) -> Result<()> {
        if !Self::is_legal(self.current, next) {
            return Err(ConsensusError::IllegalTransition {
                from: self.current,
                to: next,
            });
        }
        if self.current != next {
            tracing::info!(from = %self.current, to = %next, "Role changed");
        }
        self.current = next;
        Ok(())
    }

    fn is_legal(from: Role, to: Role) -> bool {
        use Role::*;
        matches!(
            (from, to),
            (Follower, Follower)
                | (Follower, Candidate)
                | (Candidate, Candidate)
                | (Candidate, Leader)
                | (Candidate, Follower)
                | (Leader, Leader)
                | (Leader, Follower)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_as_follower() {
        assert_eq!(StateMachine::new().current_state(), Role::Follower);
    }

    #[test]
    fn full_cycle_is_legal() {
        let mut machine = StateMachine::new();
        machine.set_state(Role::Candidate).unwrap();
        machine.set_state(Role::Candidate).unwrap();
        machine.set_state(Role::Leader).unwrap();
        assert!(machine.is_leader());
        machine.set_state(Role::Follower).unwrap();
        assert_eq!(machine.current_state(), Role::Follower);
    }

    #[test]
    fn follower_cannot_jump_to_leader() {
        let mut machine = StateMachine::new();
        let err = machine.set_state(Role::Leader).unwrap_err();
        assert!(matches!(
            err,
            ConsensusError::IllegalTransition {
                from: Role::Follower,
                to: Role::Leader
            }
        ));
        assert_eq!(machine.current_state(), Role::Follower);
    }

    #[test]
    fn leader_cannot_campaign_directly() {
        let mut machine = StateMachine::new();
        machine.set_state(Role::Candidate).unwrap();
        machine.set_state(Role::Leader).unwrap();
        assert!(machine.set_state(Role::Candidate).is_err());
        assert!(machine.is_leader());
    }
}
