/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

//! # Rig
//!
//! Cluster-scoped project workspace. A Rig owns exactly one Witness and one
//! Refinery, which the operator provisions on first reconcile; its readiness is
//! always the aggregate of theirs.

use super::conditions::Condition;
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "gastown.gastown.io",
    version = "v1alpha1",
    kind = "Rig",
    status = "RigStatus",
    shortname = "rig",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Polecats","type":"integer","jsonPath":".status.polecatCount"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RigSpec {
    /// Repository the rig works on
    #[serde(rename = "gitURL")]
    pub git_url: String,
    /// Prefix of bead ids belonging to this rig (e.g. "gt")
    pub beads_prefix: String,
    /// Path of the rig checkout on the town filesystem
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    /// Namespace for the Witness and Refinery; operator default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub settings: RigSettings,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RigSettings {
    #[serde(default = "default_max_polecats")]
    pub max_polecats: i32,
    /// Theme used when naming new polecats
    #[serde(default = "default_name_pool_theme")]
    pub name_pool_theme: String,
}

impl Default for RigSettings {
    fn default() -> Self {
        Self {
            max_polecats: default_max_polecats(),
            name_pool_theme: default_name_pool_theme(),
        }
    }
}

fn default_max_polecats() -> i32 {
    8
}

fn default_name_pool_theme() -> String {
    "mad-max".to_string()
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum RigPhase {
    #[default]
    Pending,
    Ready,
    Degraded,
    Terminating,
}

impl RigPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RigPhase::Pending => "Pending",
            RigPhase::Ready => "Ready",
            RigPhase::Degraded => "Degraded",
            RigPhase::Terminating => "Terminating",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RigStatus {
    #[serde(default)]
    pub phase: RigPhase,
    /// Set once the rig's Witness has been created
    #[serde(default)]
    pub witness_created: bool,
    /// Set once the rig's Refinery has been created
    #[serde(default)]
    pub refinery_created: bool,
    #[serde(default)]
    pub polecat_count: i32,
    /// Polecats currently Working
    #[serde(default)]
    pub active_polecats: i32,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<DateTime<Utc>>,
}

impl Rig {
    /// Namespace that holds this rig's Witness and Refinery
    pub fn child_namespace<'a>(&'a self, default: &'a str) -> &'a str {
        self.spec.namespace.as_deref().unwrap_or(default)
    }

    /// Deterministic Witness name for a rig
    pub fn witness_name(rig: &str) -> String {
        format!("{}-witness", rig)
    }

    /// Deterministic Refinery name for a rig
    pub fn refinery_name(rig: &str) -> String {
        format!("{}-refinery", rig)
    }
}
