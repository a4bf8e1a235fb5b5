use crate::domain::attempt::AttemptState;
use crate::error::{PaymentError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Disposition reported by the operation control callback.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationResult {
    Success,
    Aborted,
    /// Failed with a retry date.
    Failure,
    /// Failed with nothing left to retry.
    Exception,
}

impl fmt::Display for OperationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "SUCCESS",
            Self::Aborted => "ABORTED",
            Self::Failure => "FAILURE",
            Self::Exception => "EXCEPTION",
        };
        f.write_str(name)
    }
}

/// The state a traversal rests in when a retry gets scheduled.
pub const RETRIED_STATE: AttemptState = AttemptState::Retried;

/// A RETRIED attempt is closed with this state once a retry traversal takes
/// over its key pair.
pub const SUPERSEDED_STATE: AttemptState = AttemptState::Failure;

const TRANSITIONS: &[(AttemptState, OperationResult, AttemptState)] = &[
    (AttemptState::Initiated, OperationResult::Success, AttemptState::Success),
    (AttemptState::Initiated, OperationResult::Aborted, AttemptState::Aborted),
    (AttemptState::Initiated, OperationResult::Failure, AttemptState::Retried),
    (AttemptState::Initiated, OperationResult::Exception, AttemptState::Failure),
    (AttemptState::Retried, OperationResult::Success, AttemptState::Success),
    (AttemptState::Retried, OperationResult::Aborted, AttemptState::Aborted),
    (AttemptState::Retried, OperationResult::Failure, AttemptState::Retried),
    (AttemptState::Retried, OperationResult::Exception, AttemptState::Failure),
];

/// Looks up the state reached from `from` on `event`.
pub fn next_state(from: AttemptState, event: OperationResult) -> Result<AttemptState> {
    TRANSITIONS
        .iter()
        .find(|(state, on, _)| *state == from && *on == event)
        .map(|(_, _, to)| *to)
        .ok_or(PaymentError::InvalidTransition { from, event })
}
