//! # Connection State Machine
//!
//! Pure transition function for a Block Node connection. The connection keeps
//! its state in an atomic and applies the returned effects after a successful
//! compare-and-set; nothing here performs I/O.
//!
//! ```text
//! UNINITIALIZED ──→ READY ──→ ACTIVE ──→ CLOSING ──→ CLOSED
//!       │             │                     ↑
//!       └─────────────┴─────────────────────┘
//! ```
//!
//! Any forward move is allowed. Moving backwards is an invariant violation.

use crate::domain::invariants::invariant_no_downgrade;
use crate::events::StateTransitionError;

/// Lifecycle state of a Block Node connection, in transition order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    /// Created, stream not yet opened.
    Uninitialized = 0,
    /// Stream open; standing by.
    Ready = 1,
    /// Publishing blocks.
    Active = 2,
    /// Close in progress.
    Closing = 3,
    /// Terminal.
    Closed = 4,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::Ready,
            2 => Self::Active,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Side effect the connection must run after a transition commits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionEffect {
    /// Start the drain-batch-send worker.
    StartWorker,
    /// Stop the worker.
    StopWorker,
    /// Arm the periodic stream reset timer.
    ScheduleStreamReset,
    /// Disarm the stream reset timer.
    CancelStreamReset,
}

/// Result of a legal transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub effects: Vec<ConnectionEffect>,
}

impl Transition {
    pub fn is_noop(&self) -> bool {
        self.from == self.to
    }
}

/// Computes the transition from `current` to `target`.
///
/// Re-entering the current state is accepted with no effects.
pub fn transition(
    current: ConnectionState,
    target: ConnectionState,
) -> Result<Transition, StateTransitionError> {
    if !invariant_no_downgrade(current, target) {
        return Err(StateTransitionError::Downgrade {
            from: current,
            to: target,
        });
    }

    let effects = if current == target {
        Vec::new()
    } else if target == ConnectionState::Active {
        vec![
            ConnectionEffect::ScheduleStreamReset,
            ConnectionEffect::StartWorker,
        ]
    } else if current == ConnectionState::Active {
        vec![
            ConnectionEffect::CancelStreamReset,
            ConnectionEffect::StopWorker,
        ]
    } else {
        vec![ConnectionEffect::CancelStreamReset]
    };

    Ok(Transition {
        from: current,
        to: target,
        effects,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    const ALL: [ConnectionState; 5] = [Uninitialized, Ready, Active, Closing, Closed];

    #[test]
    fn test_no_transition_moves_backwards() {
        for from in ALL {
            for to in ALL {
                let result = transition(from, to);
                if to < from {
                    assert_eq!(
                        result,
                        Err(StateTransitionError::Downgrade { from, to }),
                        "{from:?} -> {to:?} must be rejected"
                    );
                } else {
                    assert!(result.is_ok(), "{from:?} -> {to:?} must be accepted");
                }
            }
        }
    }

    #[test]
    fn test_entering_active_starts_worker_and_timer() {
        let t = transition(Ready, Active).unwrap();
        assert!(t.effects.contains(&ConnectionEffect::StartWorker));
        assert!(t.effects.contains(&ConnectionEffect::ScheduleStreamReset));
    }

    #[test]
    fn test_leaving_active_stops_worker_and_timer() {
        let t = transition(Active, Closing).unwrap();
        assert_eq!(
            t.effects,
            vec![
                ConnectionEffect::CancelStreamReset,
                ConnectionEffect::StopWorker
            ]
        );
    }

    #[test]
    fn test_same_state_is_noop() {
        let t = transition(Closed, Closed).unwrap();
        assert!(t.is_noop());
        assert!(t.effects.is_empty());
    }

    #[test]
    fn test_state_round_trips_through_u8() {
        for state in ALL {
            assert_eq!(ConnectionState::from_u8(state.as_u8()), state);
        }
        assert!(Closing.is_terminal());
        assert!(!Active.is_terminal());
    }

    #[test]
    fn test_random_walks_stay_monotonic() {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let mut state = Uninitialized;
            for _ in 0..20 {
                let target = ALL[rng.gen_range(0..ALL.len())];
                match transition(state, target) {
                    Ok(t) => {
                        assert!(t.to >= state);
                        state = t.to;
                    }
                    Err(_) => assert!(target < state),
                }
            }
        }
    }
}
