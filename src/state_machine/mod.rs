// Copyright (c) 2025 - Cowboy AI, Inc.
//! Finite State Machine Abstractions
//!
//! Transitions are pure functions of `(state, input)`. Persisting the new
//! state is the caller's job, which keeps the lifecycle rules testable
//! without a store.
//!
//! ```text
//! (State, Input) → Result<(State, Output), TransitionError>
//! ```
//!
//! The outbox record lifecycle ([`crate::outbox::OutboxStatus`]) is the
//! main implementor.

/// Result of a state transition
pub type TransitionResult<S> = Result<S, TransitionError>;

/// Errors that can occur during state transitions
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// Transition from current state to target state is not allowed
    #[error("Invalid transition from {from} on {input}")]
    InvalidTransition { from: String, input: String },

    /// The current state admits no further transitions
    #[error("State {0} is terminal")]
    Terminal(String),
}

/// Trait for finite state machines
pub trait StateMachine: Sized + Clone {
    /// Input type that triggers transitions
    type Input;

    /// Output type produced by transitions (use () if none)
    type Output;

    /// Attempt to transition to a new state given an input
    fn transition(&self, input: &Self::Input) -> TransitionResult<(Self, Self::Output)>;

    /// Check if a transition is valid without performing it
    fn can_transition(&self, input: &Self::Input) -> bool {
        self.transition(input).is_ok()
    }

    /// Whether no input leads out of this state
    fn is_terminal(&self) -> bool;
}
