/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

//! # Gas Town Operator
//!
//! Kubernetes operator that runs Gas Town coding agents ("polecats") as
//! Pods and keeps the surrounding machinery of each rig in shape.
//!
//! ## Components
//!
//! | Module          | Role                                                            |
//! |-----------------|-----------------------------------------------------------------|
//! | [`controllers`] | One kube-runtime controller per custom resource kind            |
//! | [`pod`]         | Synthesizes the hardened Pod that executes a Polecat            |
//! | [`merge_queue`] | Rebase, validate, merge and push for the Refinery               |
//! | [`tools`]       | Bounded, timed invocations of `gt`, `git` and `bd`              |
//! | [`retry`]       | Per-object exponential requeue schedule                         |
//! | [`error`]       | Error taxonomy and the reason strings written to conditions     |
//! | [`health`]      | `/healthz`, `/readyz`, `/health` and `/metrics`                 |
//! | [`metrics`]     | Prometheus registry                                             |
//! | [`k8s`]         | Kubernetes API helpers                                          |
//! | [`cli`]         | `start` and `crds` subcommands                                  |
//!
//! ## Ownership
//!
//! ```text
//! Rig ──provisions──> Witness ──watches──> Polecat ──creates──> Pod
//!  └───provisions──> Refinery ──merges branches of Done──┘
//! Convoy ──tracks beads of──> Polecat
//! ```

pub mod cli;
pub mod controllers;
pub mod error;
pub mod health;
pub mod k8s;
pub mod merge_queue;
pub mod metrics;
pub mod pod;
pub mod retry;
pub mod tools;
