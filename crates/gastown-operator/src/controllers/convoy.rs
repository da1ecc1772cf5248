/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

//! # Convoy Controller
//!
//! Derives the progress of a batch of beads from the Polecats assigned to
//! them. A bead is completed once a Polecat working on it is Done, failed
//! once every Polecat that worked on it failed, and active while one is
//! Working or Stuck.

use super::{condition_for, error_policy, finish, maintain, publish, Context, ManagedResource};
use super::witness::mail_address;
use crate::error::Result;
use crate::k8s::api;
use crate::tools::ToolInvocation;
use futures::StreamExt;
use gastown_models::models::conditions::{self, COMPLETE, READY, WITHIN_PARALLELISM};
use gastown_models::{Condition, Convoy, ConvoyPhase, ConvoyStatus, Polecat, PolecatPhase};
use gastown_utils::telemetry::prelude::*;
use kube::api::ListParams;
use kube::runtime::controller::Action;
use kube::runtime::events::{EventType, Recorder};
use kube::runtime::{watcher, Controller};
use kube::{Api, Client, Resource, ResourceExt};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const PHASES: &[&str] = &["Pending", "InProgress", "Complete", "Failed"];

const PROGRESS_POLL: Duration = Duration::from_secs(30);

impl ManagedResource for Convoy {
    const KIND: &'static str = "Convoy";

    fn api(client: Client, obj: &Self) -> Api<Self> {
        Api::namespaced(client, &obj.namespace().unwrap_or_default())
    }

    fn conditions(&self) -> Vec<Condition> {
        self.status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default()
    }

    fn phase_label(&self) -> &'static str {
        self.status
            .as_ref()
            .map(|s| s.phase)
            .unwrap_or_default()
            .as_str()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeadState {
    Pending,
    Active,
    Completed,
    Failed,
}

fn bead_of(polecat: &Polecat) -> Option<&str> {
    polecat
        .status
        .as_ref()
        .and_then(|s| s.assigned_bead.as_deref())
        .filter(|b| !b.is_empty())
}

/// State of one bead given every Polecat assigned to it
pub fn bead_state(phases: &[PolecatPhase]) -> BeadState {
    if phases.contains(&PolecatPhase::Done) {
        BeadState::Completed
    } else if phases
        .iter()
        .any(|p| matches!(p, PolecatPhase::Working | PolecatPhase::Stuck))
    {
        BeadState::Active
    } else if !phases.is_empty() && phases.iter().all(|p| *p == PolecatPhase::Failed) {
        BeadState::Failed
    } else {
        BeadState::Pending
    }
}

/// Progress of a convoy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    pub completed: Vec<String>,
    pub pending: Vec<String>,
    pub failed: Vec<String>,
    pub active: i32,
    pub total: usize,
}

impl Progress {
    pub fn label(&self) -> String {
        format!("{}/{}", self.completed.len(), self.total)
    }

    pub fn phase(&self) -> ConvoyPhase {
        if self.total == 0 {
            ConvoyPhase::Pending
        } else if self.completed.len() == self.total {
            ConvoyPhase::Complete
        } else if !self.failed.is_empty() && self.completed.len() + self.failed.len() == self.total {
            ConvoyPhase::Failed
        } else if self.active > 0 || !self.completed.is_empty() || !self.failed.is_empty() {
            ConvoyPhase::InProgress
        } else {
            ConvoyPhase::Pending
        }
    }
}

/// Folds the Polecats into per-bead progress. Active beads stay in the
/// pending list until they finish.
pub fn progress(tracked: &[String], polecats: &[Polecat]) -> Progress {
    let mut out = Progress::default();
    let mut seen = std::collections::HashSet::new();
    for bead in tracked {
        if !seen.insert(bead.as_str()) {
            continue;
        }
        out.total += 1;
        let phases: Vec<PolecatPhase> = polecats
            .iter()
            .filter(|p| bead_of(p) == Some(bead.as_str()))
            .map(|p| p.phase())
            .collect();
        match bead_state(&phases) {
            BeadState::Completed => out.completed.push(bead.clone()),
            BeadState::Failed => out.failed.push(bead.clone()),
            BeadState::Active => {
                out.active += 1;
                out.pending.push(bead.clone());
            }
            BeadState::Pending => out.pending.push(bead.clone()),
        }
    }
    out
}

/// Parallelism check; unset means unlimited
pub fn within_parallelism(active: i32, limit: Option<i32>) -> (bool, &'static str, String) {
    match limit {
        None => (true, "Unlimited", format!("{} bead(s) active", active)),
        Some(limit) if active <= limit => (
            true,
            "WithinLimit",
            format!("{} of {} bead(s) active", active, limit),
        ),
        Some(limit) => (
            false,
            "ParallelismExceeded",
            format!("{} bead(s) active, limit {}", active, limit),
        ),
    }
}

async fn notify(convoy: &Convoy, target: &str, progress: &Progress, ctx: &Context) -> Result<()> {
    let Some(address) = mail_address(target) else {
        return Ok(());
    };
    let subject = format!("Convoy {} complete", convoy.name_any());
    let body = format!(
        "{}\n\ncompleted beads ({}): {}",
        convoy.spec.description,
        progress.label(),
        progress.completed.join(", ")
    );
    let invocation = ToolInvocation::new(
        ctx.settings.tools.gt_path.clone(),
        ["mail", "send", address.as_str(), "-s", subject.as_str(), "-m", body.as_str()],
    );
    ctx.tools.run(&invocation).await.map(|_| ())
}

async fn reconcile(convoy: Arc<Convoy>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let result = reconcile_inner(&convoy, &ctx).await;
    finish(convoy.as_ref(), ctx.as_ref(), started, result).await
}

#[instrument(skip_all, fields(convoy = %convoy.name_any()))]
async fn reconcile_inner(convoy: &Convoy, ctx: &Context) -> Result<Action> {
    let name = convoy.name_any();
    let convoys = Convoy::api(ctx.client.clone(), convoy);

    let polecats = Api::<Polecat>::all(ctx.client.clone())
        .list(&ListParams::default())
        .await?
        .items;
    let progress = progress(&convoy.spec.tracked_beads, &polecats);
    let phase = progress.phase();

    let previous = convoy.status.clone().unwrap_or_default();
    let now = super::now();
    let finished = matches!(phase, ConvoyPhase::Complete | ConvoyPhase::Failed);

    if phase == ConvoyPhase::Complete && previous.phase != ConvoyPhase::Complete {
        if let Some(target) = convoy.spec.notify_on_complete.as_deref() {
            notify(convoy, target, &progress, ctx).await?;
            info!("Notified {} of completed convoy {}", target, name);
        }
        let recorder = Recorder::new(
            ctx.client.clone(),
            ctx.reporter.clone(),
            convoy.object_ref(&()),
        );
        publish(
            &recorder,
            EventType::Normal,
            "ConvoyComplete",
            format!("all {} bead(s) completed", progress.total),
        )
        .await;
    }

    let mut status = ConvoyStatus {
        phase,
        progress: progress.label(),
        completed_beads: progress.completed.clone(),
        pending_beads: progress.pending.clone(),
        failed_beads: progress.failed.clone(),
        active_beads: progress.active,
        started_at: previous
            .started_at
            .or_else(|| (phase != ConvoyPhase::Pending).then_some(now)),
        completed_at: if finished {
            previous.completed_at.or(Some(now))
        } else {
            None
        },
        conditions: convoy.conditions(),
    };

    let complete = match phase {
        ConvoyPhase::Complete => condition_for(convoy, COMPLETE, true, "AllBeadsCompleted", progress.label()),
        ConvoyPhase::Failed => condition_for(
            convoy,
            COMPLETE,
            false,
            "BeadsFailed",
            format!("failed: {}", progress.failed.join(", ")),
        ),
        _ => condition_for(convoy, COMPLETE, false, "InProgress", progress.label()),
    };
    conditions::set_condition(&mut status.conditions, complete);

    let (ok, reason, message) = within_parallelism(progress.active, convoy.spec.parallelism);
    conditions::set_condition(
        &mut status.conditions,
        condition_for(convoy, WITHIN_PARALLELISM, ok, reason, message),
    );
    conditions::set_condition(
        &mut status.conditions,
        condition_for(convoy, READY, true, "ProgressTracked", progress.label()),
    );

    debug!("Convoy {} {} {}", name, phase.as_str(), status.progress);
    api::patch_status(&convoys, &name, &status).await?;
    Ok(if finished {
        Action::requeue(ctx.resync())
    } else {
        Action::requeue(PROGRESS_POLL)
    })
}

/// Runs the Convoy controller until shutdown.
pub async fn run(ctx: Arc<Context>) {
    let controller = Controller::new(
        Api::<Convoy>::all(ctx.client.clone()),
        watcher::Config::default(),
    )
    .shutdown_on_signal();
    let store = controller.store();
    tokio::spawn(maintain(store, ctx.clone(), PHASES));

    info!("Starting Convoy controller");
    controller
        .run(reconcile, error_policy::<Convoy, ()>, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => trace!("Reconciled convoy {}", obj.name),
                Err(e) => debug!("Convoy reconcile error: {}", e),
            }
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use gastown_models::{PolecatSpec, PolecatStatus};

    fn polecat(name: &str, bead: &str, phase: PolecatPhase) -> Polecat {
        let spec: PolecatSpec = serde_json::from_value(serde_json::json!({
            "rig": "widgets",
            "beadID": bead,
            "kubernetes": {
                "gitRepository": "git@github.com:acme/widgets.git",
                "gitSecretRef": {"name": "git"}
            }
        }))
        .unwrap();
        let mut p = Polecat::new(name, spec);
        p.status = Some(PolecatStatus {
            phase,
            assigned_bead: Some(bead.to_string()),
            ..Default::default()
        });
        p
    }

    fn beads(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_bead_state() {
        assert_eq!(bead_state(&[]), BeadState::Pending);
        assert_eq!(bead_state(&[PolecatPhase::Failed, PolecatPhase::Done]), BeadState::Completed);
        assert_eq!(bead_state(&[PolecatPhase::Failed, PolecatPhase::Working]), BeadState::Active);
        assert_eq!(bead_state(&[PolecatPhase::Stuck]), BeadState::Active);
        assert_eq!(bead_state(&[PolecatPhase::Failed]), BeadState::Failed);
        assert_eq!(bead_state(&[PolecatPhase::Idle]), BeadState::Pending);
    }

    #[test]
    fn test_progress_counts_tracked_beads_only() {
        let polecats = vec![
            polecat("a", "wd-1", PolecatPhase::Done),
            polecat("b", "wd-2", PolecatPhase::Working),
            polecat("c", "wd-9", PolecatPhase::Done),
        ];
        let p = progress(&beads(&["wd-1", "wd-2", "wd-3"]), &polecats);
        assert_eq!(p.label(), "1/3");
        assert_eq!(p.completed, beads(&["wd-1"]));
        assert_eq!(p.pending, beads(&["wd-2", "wd-3"]));
        assert_eq!(p.active, 1);
        assert_eq!(p.phase(), ConvoyPhase::InProgress);
    }

    #[test]
    fn test_progress_phases() {
        let none = progress(&beads(&["wd-1"]), &[]);
        assert_eq!(none.phase(), ConvoyPhase::Pending);

        let done = progress(&beads(&["wd-1"]), &[polecat("a", "wd-1", PolecatPhase::Done)]);
        assert_eq!(done.phase(), ConvoyPhase::Complete);
        assert_eq!(done.label(), "1/1");

        let failed = progress(
            &beads(&["wd-1", "wd-2"]),
            &[
                polecat("a", "wd-1", PolecatPhase::Done),
                polecat("b", "wd-2", PolecatPhase::Failed),
            ],
        );
        assert_eq!(failed.phase(), ConvoyPhase::Failed);

        assert_eq!(progress(&[], &[]).phase(), ConvoyPhase::Pending);
    }

    #[test]
    fn test_duplicate_tracked_beads_count_once() {
        let p = progress(&beads(&["wd-1", "wd-1"]), &[]);
        assert_eq!(p.total, 1);
    }

    #[test]
    fn test_within_parallelism() {
        assert!(within_parallelism(5, None).0);
        assert!(within_parallelism(2, Some(2)).0);
        let (ok, reason, _) = within_parallelism(3, Some(2));
        assert!(!ok);
        assert_eq!(reason, "ParallelismExceeded");
    }
}
