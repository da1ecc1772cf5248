/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

//! # Polecat
//!
//! One ephemeral agent execution. A Polecat asked to work on a bead drives the
//! creation of exactly one Pod; its observed phase is always derived from that
//! Pod and never stored as an independent source of truth.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle --bead assigned--> Working --pod succeeded--> Done
//!                            |  \--pod failed-----> Failed
//!                            \--witness stuck-----> Stuck
//! any --desired Terminated and workspace clean--> Terminated
//! ```

use super::conditions::Condition;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ResourceRequirements;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const MAX_POD_NAME: usize = 63;
const POD_NAME_HASH_LEN: usize = 10;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "gastown.gastown.io",
    version = "v1alpha1",
    kind = "Polecat",
    namespaced,
    status = "PolecatStatus",
    shortname = "pc",
    printcolumn = r#"{"name":"Rig","type":"string","jsonPath":".spec.rig"}"#,
    printcolumn = r#"{"name":"Bead","type":"string","jsonPath":".spec.beadID"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Cleanup","type":"string","jsonPath":".status.cleanupStatus"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PolecatSpec {
    /// Name of the Rig this polecat works for
    pub rig: String,
    #[serde(default)]
    pub desired_state: DesiredState,
    /// Bead (task id) assigned to this polecat
    #[serde(rename = "beadID", default, skip_serializing_if = "Option::is_none")]
    pub bead_id: Option<String>,
    /// Free-text description embedded in the agent prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_description: Option<String>,
    #[serde(default)]
    pub agent_type: AgentType,
    pub kubernetes: KubernetesExecution,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesExecution {
    pub git_repository: String,
    /// Base branch the work branch is created from
    #[serde(default = "default_git_branch")]
    pub git_branch: String,
    /// Explicit work branch; derived from the bead id or polecat name when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_branch: Option<String>,
    /// Secret holding an SSH key under `ssh-privatekey` or `id_rsa`
    pub git_secret_ref: SecretRef,
    /// Secret holding an OAuth credential bundle for the agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude_creds_secret_ref: Option<SecretRef>,
    /// Secret key holding an API key for the agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_secret_ref: Option<SecretKeyRef>,
    /// Agent image override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Agent container resources; operator defaults apply when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    /// Hard wall-clock deadline for the whole pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,
}

fn default_git_branch() -> String {
    "main".to_string()
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct SecretRef {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum DesiredState {
    #[default]
    Idle,
    Working,
    Terminated,
}

/// Coding agent backend run by the main container
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    #[default]
    Claude,
    Codex,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub enum PolecatPhase {
    #[default]
    Idle,
    Working,
    Done,
    Stuck,
    Failed,
    Terminated,
}

impl PolecatPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolecatPhase::Idle => "Idle",
            PolecatPhase::Working => "Working",
            PolecatPhase::Done => "Done",
            PolecatPhase::Stuck => "Stuck",
            PolecatPhase::Failed => "Failed",
            PolecatPhase::Terminated => "Terminated",
        }
    }

    pub const ALL: [PolecatPhase; 6] = [
        PolecatPhase::Idle,
        PolecatPhase::Working,
        PolecatPhase::Done,
        PolecatPhase::Stuck,
        PolecatPhase::Failed,
        PolecatPhase::Terminated,
    ];
}

/// Git state of a polecat's workspace, checked before any destruction
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum CleanupStatus {
    #[serde(rename = "clean")]
    Clean,
    #[serde(rename = "has-uncommitted")]
    HasUncommitted,
    #[serde(rename = "has-unpushed")]
    HasUnpushed,
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
}

impl CleanupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupStatus::Clean => "clean",
            CleanupStatus::HasUncommitted => "has-uncommitted",
            CleanupStatus::HasUnpushed => "has-unpushed",
            CleanupStatus::Unknown => "unknown",
        }
    }

    /// Parses the marker written by the agent container on exit
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "clean" => CleanupStatus::Clean,
            "has-uncommitted" => CleanupStatus::HasUncommitted,
            "has-unpushed" => CleanupStatus::HasUnpushed,
            _ => CleanupStatus::Unknown,
        }
    }

    pub fn is_clean(&self) -> bool {
        *self == CleanupStatus::Clean
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolecatStatus {
    #[serde(default)]
    pub phase: PolecatPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_bead: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    /// Always sent, `null` included, so a stale report is cleared
    #[serde(default)]
    pub cleanup_status: Option<CleanupStatus>,
    /// Omitted when `None`: the Witness owns this field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Polecat {
    /// Deterministic pod name for a polecat, stable across retries.
    ///
    /// Names that do not fit in 63 characters keep a prefix and end in a
    /// hash of the full polecat name, so distinct polecats never share a pod.
    pub fn pod_name(polecat: &str) -> String {
        let name = format!("polecat-{}", polecat);
        if name.len() <= MAX_POD_NAME {
            return name;
        }
        let digest = format!("{:x}", Sha256::digest(polecat.as_bytes()));
        let hash = &digest[..POD_NAME_HASH_LEN];
        let mut prefix = name;
        prefix.truncate(MAX_POD_NAME - POD_NAME_HASH_LEN - 1);
        format!("{}-{}", prefix.trim_end_matches(|c| c == '-' || c == '.'), hash)
    }

    /// Work branch: explicit name, else derived from the bead, else from the polecat
    pub fn work_branch(&self, polecat: &str) -> String {
        if let Some(branch) = self.spec.kubernetes.work_branch.as_ref().filter(|b| !b.is_empty()) {
            return branch.clone();
        }
        match self.spec.bead_id.as_ref().filter(|b| !b.is_empty()) {
            Some(bead) => format!("polecat/{}", bead),
            None => format!("polecat/{}", polecat),
        }
    }

    pub fn phase(&self) -> PolecatPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn polecat(bead: Option<&str>, work_branch: Option<&str>) -> Polecat {
        let spec: PolecatSpec = serde_json::from_value(serde_json::json!({
            "rig": "widgets",
            "desiredState": "Working",
            "beadID": bead,
            "kubernetes": {
                "gitRepository": "git@github.com:acme/widgets.git",
                "workBranch": work_branch,
                "gitSecretRef": {"name": "git-creds"}
            }
        }))
        .unwrap();
        Polecat::new("furiosa", spec)
    }

    #[test]
    fn test_spec_defaults_and_wire_names() {
        let p = polecat(Some("wd-a1b2"), None);
        assert_eq!(p.spec.desired_state, DesiredState::Working);
        assert_eq!(p.spec.bead_id.as_deref(), Some("wd-a1b2"));
        assert_eq!(p.spec.kubernetes.git_branch, "main");
        assert_eq!(p.spec.agent_type, AgentType::Claude);

        let json = serde_json::to_value(&p.spec).unwrap();
        assert_eq!(json["beadID"], "wd-a1b2");
        assert_eq!(json["kubernetes"]["gitSecretRef"]["name"], "git-creds");
    }

    #[test]
    fn test_work_branch_precedence() {
        assert_eq!(polecat(Some("wd-1"), Some("feature/x")).work_branch("furiosa"), "feature/x");
        assert_eq!(polecat(Some("wd-1"), None).work_branch("furiosa"), "polecat/wd-1");
        assert_eq!(polecat(None, None).work_branch("furiosa"), "polecat/furiosa");
    }

    #[test]
    fn test_pod_name_is_deterministic_and_bounded() {
        assert_eq!(Polecat::pod_name("furiosa"), "polecat-furiosa");
        let long = "x".repeat(80);
        assert_eq!(Polecat::pod_name(&long).len(), 63);
        assert_eq!(Polecat::pod_name(&long), Polecat::pod_name(&long));
        assert_eq!(Polecat::pod_name(&"y".repeat(55)), format!("polecat-{}", "y".repeat(55)));
    }

    #[test]
    fn test_long_names_sharing_a_prefix_get_distinct_pods() {
        let stem = "x".repeat(60);
        let left = Polecat::pod_name(&format!("{}a", stem));
        let right = Polecat::pod_name(&format!("{}b", stem));
        assert_ne!(left, right);
        assert!(left.len() <= 63 && right.len() <= 63);
        assert!(left.starts_with("polecat-xxx"));
        assert!(!left.contains("--"));
    }

    #[test]
    fn test_cleared_cleanup_status_is_sent_as_null() {
        let status = PolecatStatus {
            phase: PolecatPhase::Working,
            cleanup_status: None,
            last_activity: None,
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert!(json["cleanupStatus"].is_null());
        assert!(json.as_object().unwrap().contains_key("cleanupStatus"));
        assert!(!json.as_object().unwrap().contains_key("lastActivity"));
    }

    #[test]
    fn test_cleanup_status_wire_format() {
        assert_eq!(
            serde_json::to_value(CleanupStatus::HasUnpushed).unwrap(),
            serde_json::json!("has-unpushed")
        );
        assert_eq!(CleanupStatus::parse("has-uncommitted\n"), CleanupStatus::HasUncommitted);
        assert_eq!(CleanupStatus::parse("garbage"), CleanupStatus::Unknown);
    }
}
