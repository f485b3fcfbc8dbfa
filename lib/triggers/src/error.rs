//! Error types for the trigger subsystem.
//!
//! - `TriggerError`: parsing/construction failures for a single trigger config.
//! - `ScheduleError`: failures parsing or evaluating a periodicity.
//! - `ListenerError`: failures from a listener's `listen`/`start`/`stop` contract.

use flowcore_core::{ErrorKind, TriggerId, WorkflowId};
use std::fmt;

/// Errors from trigger construction and the type registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerError {
    /// No constructor is registered for this type string.
    UnknownType { type_name: String },
    /// `cfg["type"]` did not match the listener's own type.
    TypeMismatch { expected: String, found: String },
    /// A required kind-specific field was missing or malformed.
    InvalidConfig { type_name: String, reason: String },
    /// The trigger referenced by id does not exist in the set.
    NotFound { id: TriggerId },
}

impl TriggerError {
    /// Maps this error onto the shared error taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownType { .. } | Self::TypeMismatch { .. } | Self::InvalidConfig { .. } => {
                ErrorKind::Validation
            }
            Self::NotFound { .. } => ErrorKind::NotFound,
        }
    }
}

impl fmt::Display for TriggerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownType { type_name } => {
                write!(f, "unknown trigger type: {type_name}")
            }
            Self::TypeMismatch { expected, found } => {
                write!(f, "trigger type mismatch: expected '{expected}', found '{found}'")
            }
            Self::InvalidConfig { type_name, reason } => {
                write!(f, "invalid '{type_name}' trigger config: {reason}")
            }
            Self::NotFound { id } => write!(f, "trigger not found: {id}"),
        }
    }
}

impl std::error::Error for TriggerError {}

/// Errors parsing or evaluating an ISO-8601 repeating interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// The string is not a recognised, strictly-positive ISO-8601 repeating interval.
    InvalidPeriodicity { raw: String },
}

impl ScheduleError {
    /// Maps this error onto the shared error taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPeriodicity { raw } => {
                write!(f, "invalid periodicity: '{raw}'")
            }
        }
    }
}

impl std::error::Error for ScheduleError {}

impl From<ScheduleError> for TriggerError {
    fn from(err: ScheduleError) -> Self {
        TriggerError::InvalidConfig {
            type_name: "cron".to_string(),
            reason: err.to_string(),
        }
    }
}

/// Errors from a listener's lifecycle and dispatch contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerError {
    /// `constructTrigger` rejected the configuration (wraps `TriggerError`).
    Trigger(TriggerError),
    /// A firing referenced a workflow this listener has no active triggers for.
    NoActiveTrigger { workflow_id: WorkflowId },
    /// `listen`/`start`/`stop` was called in an invalid order.
    InvalidState { reason: String },
}

impl ListenerError {
    /// Maps this error onto the shared error taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Trigger(inner) => inner.kind(),
            Self::NoActiveTrigger { .. } => ErrorKind::NotFound,
            Self::InvalidState { .. } => ErrorKind::Validation,
        }
    }
}

impl fmt::Display for ListenerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trigger(inner) => write!(f, "{inner}"),
            Self::NoActiveTrigger { workflow_id } => {
                write!(f, "no active trigger for workflow {workflow_id}")
            }
            Self::InvalidState { reason } => write!(f, "listener state error: {reason}"),
        }
    }
}

impl std::error::Error for ListenerError {}

impl From<TriggerError> for ListenerError {
    fn from(err: TriggerError) -> Self {
        ListenerError::Trigger(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_error_display_and_kind() {
        let err = TriggerError::UnknownType {
            type_name: "webhook".to_string(),
        };
        assert!(err.to_string().contains("unknown trigger type"));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn not_found_kind() {
        let err = TriggerError::NotFound { id: TriggerId::new() };
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn schedule_error_converts_into_trigger_error() {
        let sched_err = ScheduleError::InvalidPeriodicity {
            raw: "garbage".to_string(),
        };
        let trigger_err: TriggerError = sched_err.into();
        assert!(matches!(trigger_err, TriggerError::InvalidConfig { .. }));
    }

    #[test]
    fn listener_error_wraps_trigger_error() {
        let err: ListenerError = TriggerError::NotFound { id: TriggerId::new() }.into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
