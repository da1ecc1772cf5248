/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

//! # Refinery
//!
//! Per-rig merge queue. Branches of finished polecats are rebased onto the
//! target branch, validated and merged one after another.

use super::conditions::Condition;
use super::polecat::SecretRef;
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "gastown.gastown.io",
    version = "v1alpha1",
    kind = "Refinery",
    namespaced,
    status = "RefineryStatus",
    shortname = "ref",
    printcolumn = r#"{"name":"Rig","type":"string","jsonPath":".spec.rigRef"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Queue","type":"integer","jsonPath":".status.queueLength"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RefinerySpec {
    pub rig_ref: String,
    #[serde(default = "default_target_branch")]
    pub target_branch: String,
    /// Shell command run in the rebased checkout; non-zero exit fails the item
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_command: Option<String>,
    /// Items advanced per pass; 1 means strictly sequential
    #[serde(default = "default_parallelism")]
    pub parallelism: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_secret_ref: Option<SecretRef>,
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    #[serde(default)]
    pub conflict_resolution: ConflictResolution,
}

fn default_target_branch() -> String {
    "main".to_string()
}

fn default_parallelism() -> i32 {
    1
}

impl RefinerySpec {
    pub fn for_rig(rig: &str) -> Self {
        Self {
            rig_ref: rig.to_string(),
            target_branch: default_target_branch(),
            test_command: None,
            parallelism: default_parallelism(),
            git_secret_ref: None,
            merge_strategy: MergeStrategy::default(),
            conflict_resolution: ConflictResolution::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    Merge,
    #[default]
    Rebase,
    Squash,
}

/// How a rebase conflict is handled.
///
/// `theirs` and `ours` resolve every hunk mechanically and are meant for
/// append-only data files; they are trusted operator configuration.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConflictResolution {
    #[default]
    Manual,
    Theirs,
    Ours,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum RefineryPhase {
    #[default]
    Idle,
    Processing,
    Error,
}

impl RefineryPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefineryPhase::Idle => "Idle",
            RefineryPhase::Processing => "Processing",
            RefineryPhase::Error => "Error",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum QueueItemState {
    #[default]
    Pending,
    Merging,
    Merged,
    Conflict,
    Failed,
    Skipped,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub branch: String,
    /// Polecat that produced the branch
    pub polecat: String,
    #[serde(default)]
    pub state: QueueItemState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl QueueItem {
    pub fn pending(branch: &str, polecat: &str) -> Self {
        Self {
            branch: branch.to_string(),
            polecat: polecat.to_string(),
            state: QueueItemState::Pending,
            message: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MergesSummary {
    pub total: i32,
    pub succeeded: i32,
    pub failed: i32,
    pub pending: i32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefineryStatus {
    #[serde(default)]
    pub phase: RefineryPhase,
    #[serde(default)]
    pub queue_length: i32,
    /// Serialized as `null` when idle so a merge patch clears it
    #[serde(default)]
    pub current_merge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_merge_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub merges_summary: MergesSummary,
    #[serde(default)]
    pub queue: Vec<QueueItem>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refinery_defaults() {
        let spec: RefinerySpec =
            serde_json::from_value(serde_json::json!({"rigRef": "widgets"})).unwrap();
        assert_eq!(spec, RefinerySpec::for_rig("widgets"));
        assert_eq!(spec.parallelism, 1);
        assert_eq!(spec.conflict_resolution, ConflictResolution::Manual);
    }

    #[test]
    fn test_idle_status_clears_current_merge() {
        let status = RefineryStatus {
            current_merge: None,
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        let object = json.as_object().unwrap();
        assert!(object.contains_key("currentMerge"));
        assert!(object["currentMerge"].is_null());
    }

    #[test]
    fn test_enum_wire_values() {
        let spec: RefinerySpec = serde_json::from_value(serde_json::json!({
            "rigRef": "widgets",
            "mergeStrategy": "squash",
            "conflictResolution": "theirs"
        }))
        .unwrap();
        assert_eq!(spec.merge_strategy, MergeStrategy::Squash);
        assert_eq!(spec.conflict_resolution, ConflictResolution::Theirs);
    }
}
