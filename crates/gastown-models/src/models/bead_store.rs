/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

use super::conditions::Condition;
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Sync configuration for the beads issue backend of one prefix.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "gastown.gastown.io",
    version = "v1alpha1",
    kind = "BeadStore",
    namespaced,
    status = "BeadStoreStatus",
    shortname = "bs",
    printcolumn = r#"{"name":"Prefix","type":"string","jsonPath":".spec.prefix"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BeadStoreSpec {
    pub prefix: String,
    #[serde(default = "default_sync_interval")]
    pub sync_interval: String,
    /// Remote the beads database is synced with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_remote: Option<String>,
    #[serde(default = "default_branch")]
    pub branch: String,
}

fn default_sync_interval() -> String {
    "5m".to_string()
}

fn default_branch() -> String {
    "beads-sync".to_string()
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum BeadStorePhase {
    #[default]
    Pending,
    Synced,
    Error,
}

impl BeadStorePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BeadStorePhase::Pending => "Pending",
            BeadStorePhase::Synced => "Synced",
            BeadStorePhase::Error => "Error",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BeadStoreStatus {
    #[serde(default)]
    pub phase: BeadStorePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
