//! Status conditions shared by every Forklift kind.
//!
//! An object is Ready when it carries no `Critical` or `Error` condition.
//! `lastTransitionTime` only moves when the observable content of a condition changes,
//! so reconciling twice with the same inputs produces an identical status.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition types used across kinds
pub mod types {
    /// Object is ready for use
    pub const READY: &str = "Ready";
    /// Plan or Migration is executing
    pub const EXECUTING: &str = "Executing";
    /// Migration (or last migration of a plan) succeeded
    pub const SUCCEEDED: &str = "Succeeded";
    /// Migration (or last migration of a plan) failed
    pub const FAILED: &str = "Failed";
    /// Migration (or last migration of a plan) was canceled
    pub const CANCELED: &str = "Canceled";
    /// Migration is waiting behind another migration of the same plan
    pub const BLOCKED: &str = "Blocked";
    /// Plan is archived
    pub const ARCHIVED: &str = "Archived";
}

/// Severity of a condition
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum Category {
    /// Required for the object to be considered ready (e.g. Ready itself)
    #[default]
    Required,
    /// Informational
    Advisory,
    /// Something the user should look at
    Warn,
    /// Blocks readiness
    Error,
    /// Blocks readiness
    Critical,
}

/// A single status condition
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (e.g. "Ready", "VMNotFound")
    #[serde(rename = "type")]
    pub type_: String,

    /// "True" or "False"
    pub status: String,

    /// Severity
    pub category: Category,

    /// Machine readable reason
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Last time the status, reason, category or message changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// A "True" condition with the given type, category, reason and message
    pub fn new(
        type_: impl Into<String>,
        category: Category,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status: "True".to_string(),
            category,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: None,
        }
    }

    /// The Ready condition
    pub fn ready(message: impl Into<String>) -> Self {
        Self::new(types::READY, Category::Required, "Ready", message)
    }

    /// Blocking condition (Critical category)
    pub fn critical(type_: impl Into<String>, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(type_, Category::Critical, reason, message)
    }

    /// Blocking condition (Error category)
    pub fn error(type_: impl Into<String>, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(type_, Category::Error, reason, message)
    }

    /// Non-blocking condition (Warn category)
    pub fn warn(type_: impl Into<String>, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(type_, Category::Warn, reason, message)
    }

    /// Non-blocking condition (Advisory category)
    pub fn advisory(type_: impl Into<String>, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(type_, Category::Advisory, reason, message)
    }

    /// True when this condition prevents readiness
    pub fn is_blocker(&self) -> bool {
        self.status == "True" && matches!(self.category, Category::Critical | Category::Error)
    }

    fn same_content(&self, other: &Condition) -> bool {
        self.status == other.status
            && self.reason == other.reason
            && self.category == other.category
            && self.message == other.message
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// True when a condition of the given type is present with status "True"
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == "True")
}

/// True when any condition blocks readiness
pub fn has_blocker(conditions: &[Condition]) -> bool {
    conditions.iter().any(Condition::is_blocker)
}

/// Insert or replace a condition, keeping `lastTransitionTime` when only unrelated fields changed
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition, now: DateTime<Utc>) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.same_content(&condition) {
                return;
            }
            condition.last_transition_time = Some(now);
            *existing = condition;
        }
        None => {
            condition.last_transition_time = Some(now);
            conditions.push(condition);
        }
    }
}

/// Remove a condition by type
pub fn delete_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

/// Replace the set of conditions with `desired`, preserving transition times of unchanged
/// entries and keeping any existing condition whose type is listed in `preserve`.
///
/// Output is sorted by type so that equal inputs serialize identically.
pub fn merge_conditions(
    current: &[Condition],
    desired: Vec<Condition>,
    preserve: &[&str],
    now: DateTime<Utc>,
) -> Vec<Condition> {
    let mut merged: Vec<Condition> = current
        .iter()
        .filter(|c| preserve.contains(&c.type_.as_str()))
        .cloned()
        .collect();

    for condition in desired {
        let previous = find_condition(current, &condition.type_);
        let mut condition = condition;
        condition.last_transition_time = match previous {
            Some(prev) if prev.same_content(&condition) => prev.last_transition_time,
            _ => Some(now),
        };
        merged.retain(|c| c.type_ != condition.type_);
        merged.push(condition);
    }

    merged.sort_by(|a, b| a.type_.cmp(&b.type_));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
    }

    #[test]
    fn test_set_condition_keeps_transition_time_when_unchanged() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, Condition::ready("ok"), t(10));
        set_condition(&mut conditions, Condition::ready("ok"), t(20));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, Some(t(10)));
    }

    #[test]
    fn test_set_condition_moves_transition_time_on_message_change() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, Condition::ready("ok"), t(10));
        set_condition(&mut conditions, Condition::ready("still ok"), t(20));
        assert_eq!(conditions[0].last_transition_time, Some(t(20)));
    }

    #[test]
    fn test_blockers() {
        let conditions = vec![
            Condition::warn("Slow", "Slow", "inventory is slow"),
            Condition::advisory("Note", "Note", ""),
        ];
        assert!(!has_blocker(&conditions));

        let conditions = vec![Condition::critical("VMNotFound", "NotFound", "vm-1")];
        assert!(has_blocker(&conditions));
    }

    #[test]
    fn test_merge_conditions_is_idempotent() {
        let desired = vec![
            Condition::critical("VMNotFound", "NotFound", "vm-7"),
            Condition::warn("Slow", "Slow", ""),
        ];
        let first = merge_conditions(&[], desired.clone(), &[], t(1));
        let second = merge_conditions(&first, desired, &[], t(2));
        assert_eq!(first, second);
    }

    #[test]
    fn test_merge_conditions_preserves_listed_types() {
        let current = vec![Condition::new(types::SUCCEEDED, Category::Advisory, "Completed", "")];
        let merged = merge_conditions(&current, vec![Condition::ready("")], &[types::SUCCEEDED], t(5));
        assert!(find_condition(&merged, types::SUCCEEDED).is_some());
        assert!(find_condition(&merged, types::READY).is_some());
    }

    #[test]
    fn test_merge_conditions_drops_stale_types() {
        let current = vec![Condition::critical("VMNotFound", "NotFound", "vm-1")];
        let merged = merge_conditions(&current, vec![Condition::ready("")], &[], t(5));
        assert!(find_condition(&merged, "VMNotFound").is_none());
    }
}
