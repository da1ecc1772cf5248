/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

//! # Gas Town Models
//!
//! Custom resource definitions reconciled by the Gas Town operator, together
//! with the label, annotation and finalizer contract shared between the
//! controllers.
//!
//! | Kind        | Scope      | Role                                              |
//! |-------------|------------|---------------------------------------------------|
//! | `Rig`       | Cluster    | Project workspace; parent of Witness and Refinery |
//! | `Polecat`   | Namespaced | One ephemeral agent execution backed by a Pod     |
//! | `Convoy`    | Namespaced | A batch of beads tracked together                 |
//! | `Witness`   | Namespaced | Health monitor for the Polecats of a Rig          |
//! | `Refinery`  | Namespaced | Sequential merge queue for a Rig                  |
//! | `BeadStore` | Namespaced | Sync configuration for the beads issue backend    |

pub mod models;

pub use models::bead_store::{BeadStore, BeadStorePhase, BeadStoreSpec, BeadStoreStatus};
pub use models::conditions::{Condition, ConditionStatus};
pub use models::convoy::{Convoy, ConvoyPhase, ConvoySpec, ConvoyStatus};
pub use models::polecat::{
    AgentType, CleanupStatus, DesiredState, Polecat, PolecatPhase, PolecatSpec, PolecatStatus,
};
pub use models::refinery::{
    ConflictResolution, MergeStrategy, QueueItem, QueueItemState, Refinery, RefineryPhase,
    RefinerySpec, RefineryStatus,
};
pub use models::rig::{Rig, RigPhase, RigSpec, RigStatus};
pub use models::witness::{Witness, WitnessPhase, WitnessSpec, WitnessStatus};
