//! Execution state domain types

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::EngineError;

/// Final state of a step's container process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitState {
    pub exit_code: i32,
    pub oom_killed: bool,
}

impl ExitState {
    pub fn exited(exit_code: i32) -> Self {
        Self {
            exit_code,
            oom_killed: false,
        }
    }

    pub fn oom(exit_code: i32) -> Self {
        Self {
            exit_code,
            oom_killed: true,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.oom_killed
    }
}

/// Pipeline execution status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    #[default]
    Idle,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Whether moving to `next` is a legal transition
    ///
    /// An idle pipeline may finish without running anything (empty pipeline,
    /// failed setup, cancellation before the first step). Terminal states
    /// never change.
    pub fn can_transition_to(&self, next: ExecutionState) -> bool {
        match self {
            Self::Idle => next != Self::Idle,
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }

    /// The terminal state implied by a pipeline's final result
    pub fn from_result(result: &Result<(), EngineError>) -> Self {
        match result {
            Ok(()) => Self::Succeeded,
            Err(EngineError::Cancelled) => Self::Cancelled,
            Err(_) => Self::Failed,
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Summary of a finished pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub state: ExecutionState,
    pub exit_code: i32,
    pub error: Option<EngineError>,
}

impl Outcome {
    /// Builds the outcome from the terminal result and the aggregate exit code
    ///
    /// The aggregate exit code (first non-zero step exit) wins over the
    /// conventional code of the error kind.
    pub fn new(result: Result<(), EngineError>, aggregate_exit_code: i32) -> Self {
        let state = ExecutionState::from_result(&result);
        match result {
            Ok(()) => Self {
                state,
                exit_code: 0,
                error: None,
            },
            Err(error) => Self {
                state,
                exit_code: match (&error, aggregate_exit_code) {
                    (EngineError::Cancelled, _) | (_, 0) => error.exit_code(),
                    (_, code) => code,
                },
                error: Some(error),
            },
        }
    }

    pub fn success(&self) -> bool {
        self.state == ExecutionState::Succeeded
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.to_string())
    }
}
