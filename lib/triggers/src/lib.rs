//! Trigger subsystem for the flowcore automation platform.
//!
//! This crate provides:
//!
//! - **Trigger kinds**: the [`trigger::Trigger`] capability trait, its
//!   `runtime`/`cron` implementations, and the type-string-keyed
//!   [`trigger::TriggerRegistry`].
//! - **Periodicity**: ISO-8601 repeating-interval parsing for cron triggers.
//! - **Trigger sets**: the per-listener-kind active-trigger index.
//! - **Listeners**: the actors that turn firings into workflow-trigger events.

pub mod error;
pub mod listener;
pub mod schedule;
pub mod set;
pub mod trigger;

pub use error::{ListenerError, ScheduleError, TriggerError};
pub use listener::{CronListener, FiringRequest, Listener, RuntimeListener, TriggerEventPublisher};
pub use schedule::Periodicity;
pub use set::{TriggerSet, TriggerSource};
pub use trigger::{
    CRON_TRIGGER_TYPE, CronTrigger, ManualTrigger, RUNTIME_TRIGGER_TYPE, Trigger, TriggerConstructor, TriggerRegistry,
};
