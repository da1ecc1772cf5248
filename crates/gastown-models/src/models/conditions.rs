/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

//! Typed, timestamped status entries shared by every kind.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition types used across kinds
pub const READY: &str = "Ready";
pub const POD_CREATED: &str = "PodCreated";
pub const TERMINATED: &str = "Terminated";
pub const COMPLETE: &str = "Complete";
pub const WITHIN_PARALLELISM: &str = "WithinParallelism";
pub const SYNCED: &str = "Synced";

/// Tri-state condition status as used by Kubernetes
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    /// Stable machine-readable reason
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    pub fn new(
        condition_type: &str,
        status: impl Into<ConditionStatus>,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status: status.into(),
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: Utc::now(),
            observed_generation: None,
        }
    }

    pub fn with_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Inserts or replaces the condition of the same type.
///
/// `lastTransitionTime` is carried over from the existing entry unless the
/// status changed.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == condition.condition_type)
    {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions
        .iter()
        .find(|c| c.condition_type == condition_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_set_condition_appends_new_type() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, Condition::new(READY, true, "AllComponentsReady", ""));
        set_condition(&mut conditions, Condition::new(SYNCED, false, "Pending", ""));
        assert_eq!(conditions.len(), 2);
    }

    #[test]
    fn test_transition_time_kept_when_status_unchanged() {
        let mut first = Condition::new(READY, false, "WitnessNotReady", "waiting");
        first.last_transition_time = Utc::now() - Duration::hours(1);
        let original = first.last_transition_time;
        let mut conditions = vec![first];

        set_condition(&mut conditions, Condition::new(READY, false, "RefineryError", "failed"));

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].reason, "RefineryError");
        assert_eq!(conditions[0].last_transition_time, original);
    }

    #[test]
    fn test_transition_time_moves_when_status_changes() {
        let mut first = Condition::new(READY, false, "WitnessNotReady", "");
        first.last_transition_time = Utc::now() - Duration::hours(1);
        let original = first.last_transition_time;
        let mut conditions = vec![first];

        set_condition(&mut conditions, Condition::new(READY, true, "AllComponentsReady", ""));

        assert!(conditions[0].is_true());
        assert!(conditions[0].last_transition_time > original);
    }

    #[test]
    fn test_condition_wire_format() {
        let condition = Condition::new(READY, true, "AllComponentsReady", "ok").with_generation(Some(3));
        let json = serde_json::to_value(&condition).unwrap();
        assert_eq!(json["type"], "Ready");
        assert_eq!(json["status"], "True");
        assert_eq!(json["observedGeneration"], 3);
        assert!(json.get("lastTransitionTime").is_some());
    }
}
