//! Core domain types and utilities for the flowcore automation platform.
//!
//! This crate provides the foundational identifier types and error handling
//! plumbing shared by the trigger subsystem and the automation core.

pub mod error;
pub mod id;

pub use error::{ErrorKind, Result};
pub use id::{InitId, OwnerId, ParseIdError, TriggerId, WorkflowId, WorkflowRunId};
