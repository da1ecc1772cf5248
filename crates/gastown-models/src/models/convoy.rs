/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

//! # Convoy
//!
//! A batch of beads executed in parallel. Progress is derived from the
//! Polecats assigned to the tracked beads.

use super::conditions::Condition;
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "gastown.gastown.io",
    version = "v1alpha1",
    kind = "Convoy",
    namespaced,
    status = "ConvoyStatus",
    shortname = "cv",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Progress","type":"string","jsonPath":".status.progress"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ConvoySpec {
    pub description: String,
    /// Bead ids this convoy tracks
    pub tracked_beads: Vec<String>,
    /// Maximum number of beads worked on at once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<i32>,
    /// Mail address notified when the convoy completes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_on_complete: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ConvoyPhase {
    #[default]
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl ConvoyPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConvoyPhase::Pending => "Pending",
            ConvoyPhase::InProgress => "InProgress",
            ConvoyPhase::Complete => "Complete",
            ConvoyPhase::Failed => "Failed",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConvoyStatus {
    #[serde(default)]
    pub phase: ConvoyPhase,
    /// "completed/total"
    #[serde(default)]
    pub progress: String,
    #[serde(default)]
    pub completed_beads: Vec<String>,
    #[serde(default)]
    pub pending_beads: Vec<String>,
    #[serde(default)]
    pub failed_beads: Vec<String>,
    /// Beads with a Working polecat
    #[serde(default)]
    pub active_beads: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Sent as `null` once new work reopens a finished convoy
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
