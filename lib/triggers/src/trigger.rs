//! Polymorphic trigger kinds and the type-string-keyed constructor registry.
//!
//! A trigger is modelled as a tagged union behind a common capability trait
//! rather than a closed enum: the registry parses an open key/value map keyed
//! on `"type"` into a concrete kind, and round-trips it back to a map that
//! preserves every field, including ones this build doesn't recognise as
//! derived state (only the trigger's own fields, `"id"`, `"type"`, and
//! `"active"` are interpreted; everything else is carried verbatim so unknown
//! fields on a known type are rejected at construction rather than silently
//! dropped).

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

use flowcore_core::TriggerId;

use crate::error::TriggerError;
use crate::schedule::Periodicity;

/// The type string used by the manual/runtime trigger kind.
pub const RUNTIME_TRIGGER_TYPE: &str = "runtime";
/// The type string used by the cron trigger kind.
pub const CRON_TRIGGER_TYPE: &str = "cron";

/// Common capability set every trigger kind exposes.
///
/// Implementors must also be `Clone`-able through [`Trigger::clone_box`] so a
/// `Box<dyn Trigger>` can live in a [`crate::set::TriggerSet`] snapshot without
/// forcing every kind into a single enum.
pub trait Trigger: fmt::Debug + Send + Sync {
    /// The trigger's stable identity. Never regenerated after construction.
    fn id(&self) -> TriggerId;

    /// The type string that selects this trigger's constructor in the registry.
    fn kind(&self) -> &'static str;

    /// Whether this trigger currently produces firings.
    fn active(&self) -> bool;

    /// Sets the active flag.
    fn set_active(&mut self, active: bool);

    /// Called after a firing to update internal state (e.g. recompute a cron
    /// trigger's `nextRunStart`).
    fn advance(&mut self, now: DateTime<Utc>);

    /// Whether this trigger should fire on its own at `now`, without an
    /// external stimulus. Manual triggers never are; a cron trigger is once
    /// its `nextRunStart` is strictly in the past. Defaults to `false`.
    fn is_due(&self, _now: DateTime<Utc>) -> bool {
        false
    }

    /// Serializes the trigger's full state back to an open map, preserving
    /// `"id"`, `"type"`, `"active"`, and every kind-specific field.
    fn to_map(&self) -> Map<String, Value>;

    /// Clones this trigger behind a fresh box.
    fn clone_box(&self) -> Box<dyn Trigger>;
}

impl Clone for Box<dyn Trigger> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Reads `"id"` from a config map, minting a fresh [`TriggerId`] if absent so
/// a trigger configuration without an explicit id acquires one on construction.
fn read_or_mint_id(cfg: &Map<String, Value>) -> Result<TriggerId, TriggerError> {
    match cfg.get("id").and_then(Value::as_str) {
        Some(raw) => raw.parse().map_err(|_| TriggerError::InvalidConfig {
            type_name: cfg
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            reason: format!("invalid trigger id: {raw}"),
        }),
        None => Ok(TriggerId::new()),
    }
}

fn read_active(cfg: &Map<String, Value>) -> bool {
    cfg.get("active").and_then(Value::as_bool).unwrap_or(false)
}

/// Rejects `cfg` if it carries any key outside `allowed`, so an unknown field
/// on a known trigger type fails construction instead of being silently
/// dropped on the next `to_map` round trip.
fn reject_unknown_fields(cfg: &Map<String, Value>, type_name: &str, allowed: &[&str]) -> Result<(), TriggerError> {
    if let Some(unknown) = cfg.keys().find(|key| !allowed.contains(&key.as_str())) {
        return Err(TriggerError::InvalidConfig {
            type_name: type_name.to_string(),
            reason: format!("unrecognized field '{unknown}'"),
        });
    }
    Ok(())
}

/// State is an advance counter; fires on demand rather than on a schedule.
#[derive(Debug, Clone)]
pub struct ManualTrigger {
    id: TriggerId,
    active: bool,
    advance_count: u64,
}

impl ManualTrigger {
    /// Constructs a fresh manual trigger, inactive by default.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: TriggerId::new(),
            active: false,
            advance_count: 0,
        }
    }

    /// Number of times [`Trigger::advance`] has been called.
    #[must_use]
    pub fn advance_count(&self) -> u64 {
        self.advance_count
    }

    /// Parses a manual trigger from an open config map.
    ///
    /// # Errors
    ///
    /// Returns [`TriggerError::InvalidConfig`] if `"advanceCount"` is present
    /// but not a non-negative integer.
    pub fn construct(cfg: &Map<String, Value>) -> Result<Box<dyn Trigger>, TriggerError> {
        reject_unknown_fields(cfg, RUNTIME_TRIGGER_TYPE, &["id", "type", "active", "advanceCount"])?;
        let id = read_or_mint_id(cfg)?;
        let active = read_active(cfg);
        let advance_count = match cfg.get("advanceCount") {
            Some(value) => value.as_u64().ok_or_else(|| TriggerError::InvalidConfig {
                type_name: RUNTIME_TRIGGER_TYPE.to_string(),
                reason: "advanceCount must be a non-negative integer".to_string(),
            })?,
            None => 0,
        };
        Ok(Box::new(Self {
            id,
            active,
            advance_count,
        }))
    }
}

impl Default for ManualTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl Trigger for ManualTrigger {
    fn id(&self) -> TriggerId {
        self.id
    }

    fn kind(&self) -> &'static str {
        RUNTIME_TRIGGER_TYPE
    }

    fn active(&self) -> bool {
        self.active
    }

    fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    fn advance(&mut self, _now: DateTime<Utc>) {
        self.advance_count += 1;
    }

    fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("id".to_string(), Value::String(self.id.to_string()));
        map.insert("type".to_string(), Value::String(RUNTIME_TRIGGER_TYPE.to_string()));
        map.insert("active".to_string(), Value::Bool(self.active));
        map.insert("advanceCount".to_string(), Value::from(self.advance_count));
        map
    }

    fn clone_box(&self) -> Box<dyn Trigger> {
        Box::new(self.clone())
    }
}

/// State is an ISO-8601 repeating interval and the instant of the next run.
#[derive(Debug, Clone)]
pub struct CronTrigger {
    id: TriggerId,
    active: bool,
    periodicity: Periodicity,
    next_run_start: DateTime<Utc>,
}

impl CronTrigger {
    /// Constructs a fresh cron trigger, inactive by default, with
    /// `nextRunStart` seeded one period after `now`.
    #[must_use]
    pub fn new(periodicity: Periodicity, now: DateTime<Utc>) -> Self {
        Self {
            id: TriggerId::new(),
            active: false,
            next_run_start: periodicity.after(now),
            periodicity,
        }
    }

    /// The instant this trigger will next fire.
    #[must_use]
    pub fn next_run_start(&self) -> DateTime<Utc> {
        self.next_run_start
    }

    /// The configured repeat interval.
    #[must_use]
    pub fn periodicity(&self) -> Periodicity {
        self.periodicity
    }

    /// True if this trigger is due: `nextRunStart` is strictly before `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run_start < now
    }

    /// Parses a cron trigger from an open config map.
    ///
    /// # Errors
    ///
    /// Returns [`TriggerError::InvalidConfig`] if `"periodicity"` is missing
    /// or not a valid ISO-8601 repeating interval, or if `"nextRunStart"` is
    /// present but not a valid RFC3339 instant.
    pub fn construct(cfg: &Map<String, Value>, now: DateTime<Utc>) -> Result<Box<dyn Trigger>, TriggerError> {
        reject_unknown_fields(
            cfg,
            CRON_TRIGGER_TYPE,
            &["id", "type", "active", "periodicity", "nextRunStart"],
        )?;
        let id = read_or_mint_id(cfg)?;
        let active = read_active(cfg);
        let periodicity_raw = cfg
            .get("periodicity")
            .and_then(Value::as_str)
            .ok_or_else(|| TriggerError::InvalidConfig {
                type_name: CRON_TRIGGER_TYPE.to_string(),
                reason: "missing required field 'periodicity'".to_string(),
            })?;
        let periodicity = Periodicity::parse(periodicity_raw)?;
        let next_run_start = match cfg.get("nextRunStart").and_then(Value::as_str) {
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| TriggerError::InvalidConfig {
                    type_name: CRON_TRIGGER_TYPE.to_string(),
                    reason: format!("invalid nextRunStart: {e}"),
                })?,
            None => periodicity.after(now),
        };
        Ok(Box::new(CronTrigger {
            id,
            active,
            periodicity,
            next_run_start,
        }))
    }
}

impl Trigger for CronTrigger {
    fn id(&self) -> TriggerId {
        self.id
    }

    fn kind(&self) -> &'static str {
        CRON_TRIGGER_TYPE
    }

    fn active(&self) -> bool {
        self.active
    }

    fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    fn advance(&mut self, now: DateTime<Utc>) {
        self.next_run_start = self.periodicity.after(now);
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        CronTrigger::is_due(self, now)
    }

    fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("id".to_string(), Value::String(self.id.to_string()));
        map.insert("type".to_string(), Value::String(CRON_TRIGGER_TYPE.to_string()));
        map.insert("active".to_string(), Value::Bool(self.active));
        map.insert("periodicity".to_string(), Value::String(self.periodicity.to_string()));
        map.insert(
            "nextRunStart".to_string(),
            Value::String(self.next_run_start.to_rfc3339()),
        );
        map
    }

    fn clone_box(&self) -> Box<dyn Trigger> {
        Box::new(self.clone())
    }
}

/// A constructor that parses an open config map into a trigger of one kind.
///
/// Takes the current time so a fresh cron trigger without an explicit
/// `nextRunStart` can seed one; manual triggers ignore it.
pub type TriggerConstructor =
    Box<dyn Fn(&Map<String, Value>, DateTime<Utc>) -> Result<Box<dyn Trigger>, TriggerError> + Send + Sync>;

/// Maps a trigger-type string to its constructor.
///
/// The orchestrator uses this to reject saves whose triggers reference
/// unknown types and to normalize every trigger by round-tripping it through
/// its constructor on save.
pub struct TriggerRegistry {
    constructors: HashMap<String, TriggerConstructor>,
}

impl TriggerRegistry {
    /// An empty registry with no constructors.
    #[must_use]
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// A registry pre-populated with the two required kinds.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(RUNTIME_TRIGGER_TYPE, Box::new(|cfg, _now| ManualTrigger::construct(cfg)));
        registry.register(CRON_TRIGGER_TYPE, Box::new(CronTrigger::construct));
        registry
    }

    /// Registers a constructor for a trigger type, replacing any existing one.
    pub fn register(&mut self, type_name: impl Into<String>, ctor: TriggerConstructor) {
        self.constructors.insert(type_name.into(), ctor);
    }

    /// True if a constructor is registered for `type_name`.
    #[must_use]
    pub fn supports(&self, type_name: &str) -> bool {
        self.constructors.contains_key(type_name)
    }

    /// Parses `cfg` using the constructor for `cfg["type"]`.
    ///
    /// # Errors
    ///
    /// Returns [`TriggerError::InvalidConfig`] if `"type"` is missing or not
    /// a string, [`TriggerError::UnknownType`] if no constructor is
    /// registered for it, or whatever the constructor itself returns.
    pub fn construct(&self, cfg: &Map<String, Value>, now: DateTime<Utc>) -> Result<Box<dyn Trigger>, TriggerError> {
        let type_name = cfg
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| TriggerError::InvalidConfig {
                type_name: String::new(),
                reason: "missing required field 'type'".to_string(),
            })?;
        let ctor = self
            .constructors
            .get(type_name)
            .ok_or_else(|| TriggerError::UnknownType {
                type_name: type_name.to_string(),
            })?;
        ctor(cfg, now)
    }

    /// Parses `cfg` using the constructor for `kind`, first checking that
    /// `cfg["type"]` matches `kind` (the listener-level type-mismatch check).
    ///
    /// # Errors
    ///
    /// Returns [`TriggerError::TypeMismatch`] if `cfg["type"]` differs from
    /// `kind`, [`TriggerError::UnknownType`] if `kind` has no constructor, or
    /// whatever the constructor itself returns.
    pub fn construct_for_kind(
        &self,
        kind: &str,
        cfg: &Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<Box<dyn Trigger>, TriggerError> {
        let found = cfg.get("type").and_then(Value::as_str).unwrap_or_default();
        if found != kind {
            return Err(TriggerError::TypeMismatch {
                expected: kind.to_string(),
                found: found.to_string(),
            });
        }
        self.construct(cfg, now)
    }
}

impl Default for TriggerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 31, 0, 0, 0).unwrap()
    }

    #[test]
    fn manual_trigger_round_trips_through_map() {
        let mut trigger = ManualTrigger::new();
        trigger.set_active(true);
        trigger.advance(fixed_now());
        let map = trigger.to_map();

        let reconstructed = ManualTrigger::construct(&map).expect("constructs");
        assert_eq!(reconstructed.id(), trigger.id());
        assert!(reconstructed.active());
        assert_eq!(reconstructed.to_map(), trigger.to_map());
    }

    #[test]
    fn manual_trigger_without_id_mints_fresh_one() {
        let mut cfg = Map::new();
        cfg.insert("type".to_string(), Value::String(RUNTIME_TRIGGER_TYPE.to_string()));
        let trigger = ManualTrigger::construct(&cfg).expect("constructs");
        assert!(!trigger.id().is_nil());
    }

    #[test]
    fn manual_trigger_default_active_is_false() {
        let mut cfg = Map::new();
        cfg.insert("type".to_string(), Value::String(RUNTIME_TRIGGER_TYPE.to_string()));
        let trigger = ManualTrigger::construct(&cfg).expect("constructs");
        assert!(!trigger.active());
    }

    #[test]
    fn cron_trigger_advance_replaces_next_run_ignoring_missed_ticks() {
        let now = fixed_now();
        let periodicity = Periodicity::parse("R/PT1H").unwrap();
        let mut trigger = CronTrigger::new(periodicity, now);
        let far_future = now + chrono::Duration::days(3);
        trigger.advance(far_future);
        assert_eq!(trigger.next_run_start(), periodicity.after(far_future));
    }

    #[test]
    fn manual_trigger_rejects_unknown_field() {
        let mut cfg = Map::new();
        cfg.insert("type".to_string(), Value::String(RUNTIME_TRIGGER_TYPE.to_string()));
        cfg.insert("webhookUrl".to_string(), Value::String("https://example.com".to_string()));
        let err = ManualTrigger::construct(&cfg).unwrap_err();
        assert!(matches!(err, TriggerError::InvalidConfig { .. }));
    }

    #[test]
    fn cron_trigger_rejects_unknown_field() {
        let mut cfg = Map::new();
        cfg.insert("type".to_string(), Value::String(CRON_TRIGGER_TYPE.to_string()));
        cfg.insert("periodicity".to_string(), Value::String("R/PT1H".to_string()));
        cfg.insert("timezone".to_string(), Value::String("UTC".to_string()));
        let err = CronTrigger::construct(&cfg, fixed_now()).unwrap_err();
        assert!(matches!(err, TriggerError::InvalidConfig { .. }));
    }

    #[test]
    fn cron_trigger_requires_periodicity() {
        let mut cfg = Map::new();
        cfg.insert("type".to_string(), Value::String(CRON_TRIGGER_TYPE.to_string()));
        let err = CronTrigger::construct(&cfg, fixed_now()).unwrap_err();
        assert!(matches!(err, TriggerError::InvalidConfig { .. }));
    }

    #[test]
    fn registry_rejects_unknown_type() {
        let registry = TriggerRegistry::with_defaults();
        let mut cfg = Map::new();
        cfg.insert("type".to_string(), Value::String("webhook".to_string()));
        let err = registry.construct(&cfg, fixed_now()).unwrap_err();
        assert!(matches!(err, TriggerError::UnknownType { .. }));
    }

    #[test]
    fn registry_constructs_runtime_and_cron() {
        let registry = TriggerRegistry::with_defaults();

        let mut runtime_cfg = Map::new();
        runtime_cfg.insert("type".to_string(), Value::String(RUNTIME_TRIGGER_TYPE.to_string()));
        let runtime = registry.construct(&runtime_cfg, fixed_now()).expect("constructs");
        assert_eq!(runtime.kind(), RUNTIME_TRIGGER_TYPE);

        let mut cron_cfg = Map::new();
        cron_cfg.insert("type".to_string(), Value::String(CRON_TRIGGER_TYPE.to_string()));
        cron_cfg.insert("periodicity".to_string(), Value::String("R/PT1H".to_string()));
        let cron = registry.construct(&cron_cfg, fixed_now()).expect("constructs");
        assert_eq!(cron.kind(), CRON_TRIGGER_TYPE);
    }

    #[test]
    fn construct_for_kind_rejects_mismatched_type() {
        let registry = TriggerRegistry::with_defaults();
        let mut cfg = Map::new();
        cfg.insert("type".to_string(), Value::String(CRON_TRIGGER_TYPE.to_string()));
        let err = registry
            .construct_for_kind(RUNTIME_TRIGGER_TYPE, &cfg, fixed_now())
            .unwrap_err();
        assert!(matches!(err, TriggerError::TypeMismatch { .. }));
    }

    #[test]
    fn clone_box_preserves_state() {
        let trigger: Box<dyn Trigger> = Box::new(ManualTrigger::new());
        let cloned = trigger.clone();
        assert_eq!(trigger.id(), cloned.id());
    }
}
