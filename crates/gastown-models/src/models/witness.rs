/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

//! # Witness
//!
//! Per-rig health monitor. Auto-created with its Rig and deleted with it.

use super::conditions::Condition;
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "gastown.gastown.io",
    version = "v1alpha1",
    kind = "Witness",
    namespaced,
    status = "WitnessStatus",
    shortname = "wit",
    printcolumn = r#"{"name":"Rig","type":"string","jsonPath":".spec.rigRef"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WitnessSpec {
    /// Name of the Rig whose polecats are monitored
    pub rig_ref: String,
    /// Poll interval as a duration string (e.g. "30s")
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: String,
    /// Idle time after which a Working polecat counts as stuck (e.g. "15m")
    #[serde(default = "default_stuck_threshold")]
    pub stuck_threshold: String,
    /// Mail address for escalations; "none" records Kubernetes events only
    #[serde(default = "default_escalation_target")]
    pub escalation_target: String,
}

pub fn default_health_check_interval() -> String {
    "30s".to_string()
}

pub fn default_stuck_threshold() -> String {
    "15m".to_string()
}

pub fn default_escalation_target() -> String {
    "mayor".to_string()
}

impl WitnessSpec {
    pub fn for_rig(rig: &str) -> Self {
        Self {
            rig_ref: rig.to_string(),
            health_check_interval: default_health_check_interval(),
            stuck_threshold: default_stuck_threshold(),
            escalation_target: default_escalation_target(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum WitnessPhase {
    #[default]
    Pending,
    Active,
    Degraded,
}

impl WitnessPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            WitnessPhase::Pending => "Pending",
            WitnessPhase::Active => "Active",
            WitnessPhase::Degraded => "Degraded",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolecatsSummary {
    pub total: i32,
    pub running: i32,
    pub succeeded: i32,
    pub failed: i32,
    pub stuck: i32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WitnessStatus {
    #[serde(default)]
    pub phase: WitnessPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub polecats_summary: PolecatsSummary,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
