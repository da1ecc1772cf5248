/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

//! Resource types plus the label/annotation/finalizer names other
//! controllers and tooling rely on.

pub mod bead_store;
pub mod conditions;
pub mod convoy;
pub mod polecat;
pub mod refinery;
pub mod rig;
pub mod witness;

/// API group for every Gas Town kind
pub const API_GROUP: &str = "gastown.gastown.io";
/// API version for every Gas Town kind
pub const API_VERSION: &str = "v1alpha1";

/// Rig a synthesized Pod or provisioned child belongs to
pub static RIG_LABEL: &str = "gastown.gastown.io/rig";
/// Polecat a synthesized Pod executes
pub static POLECAT_LABEL: &str = "gastown.gastown.io/polecat";
/// Bead (task id) a synthesized Pod works on
pub static BEAD_LABEL: &str = "gastown.gastown.io/bead";
pub static MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub static MANAGED_BY_VALUE: &str = "gastown-operator";

/// Set by the Witness when a Polecat has been idle past its stuck threshold.
/// The value is the RFC 3339 time of the last observed activity.
pub static STUCK_ANNOTATION: &str = "gastown.gastown.io/stuck-since";
/// Operator action for a Refinery halted on a conflict: `retry` or `skip`
pub static CONFLICT_ACTION_ANNOTATION: &str = "gastown.gastown.io/conflict-action";

/// Finalizer on a Rig, released once its Witness and Refinery are gone
pub static RIG_FINALIZER: &str = "gastown.gastown.io/rig-cleanup";
/// Finalizer on auto-provisioned Witness and Refinery children
pub static CHILD_FINALIZER: &str = "gastown.gastown.io/cleanup";
/// Finalizer on a Polecat, released only when its workspace holds no unsaved work
pub static POLECAT_FINALIZER: &str = "gastown.gastown.io/polecat-cleanup";

/// Truncates and sanitizes a string into a valid label value
/// (at most 63 characters of `[A-Za-z0-9._-]`, alphanumeric at both ends).
pub fn label_value(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .take(63)
        .collect();
    cleaned
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}
