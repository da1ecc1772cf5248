/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

//! # Polecat Controller
//!
//! Drives one Polecat through its lifecycle. The observed phase is always
//! derived from the Pod (and the Witness stuck annotation); it is never
//! advanced on its own.
//!
//! Nothing that may hold unsaved work is ever deleted: both
//! `desiredState: Terminated` and deletion of the Polecat object first inspect
//! the workspace git state and only proceed when it is `clean`.

use super::{condition_for, error_policy, finish, maintain, publish, Context, ManagedResource};
use crate::error::Result;
use crate::k8s::api;
use crate::pod;
use crate::tools::ToolInvocation;
use futures::StreamExt;
use gastown_models::models::conditions::{self, POD_CREATED, READY, TERMINATED};
use gastown_models::models::{POLECAT_FINALIZER, MANAGED_BY_LABEL, MANAGED_BY_VALUE, STUCK_ANNOTATION};
use gastown_models::{CleanupStatus, Condition, DesiredState, Polecat, PolecatPhase, PolecatStatus};
use gastown_utils::telemetry::prelude::*;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;
use kube::runtime::events::{EventType, Recorder};
use kube::runtime::{watcher, Controller};
use kube::{Api, Client, Resource, ResourceExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;

pub const PHASES: &[&str] = &["Idle", "Working", "Done", "Stuck", "Failed", "Terminated"];

/// Reason used when termination is refused
pub const UNSAVED_WORK: &str = "UnsavedWork";

impl ManagedResource for Polecat {
    const KIND: &'static str = "Polecat";

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
        self.phase().as_str()
    }
}

fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.phase.as_deref())
}

/// True once the agent container can no longer change the workspace
pub fn pod_finished(pod: &Pod) -> bool {
    matches!(pod_phase(pod), Some("Succeeded") | Some("Failed")) || agent_termination(pod).is_some()
}

/// Termination message written by the agent container's exit trap
fn agent_termination(pod: &Pod) -> Option<String> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|c| c.name == pod::AGENT_CONTAINER)?
        .state
        .as_ref()?
        .terminated
        .as_ref()
        .map(|t| t.message.clone().unwrap_or_default())
}

/// Phase implied by the Pod and the stuck signal.
pub fn derive_phase(pod: Option<&Pod>, stuck: bool, current: PolecatPhase) -> PolecatPhase {
    if current == PolecatPhase::Terminated {
        return PolecatPhase::Terminated;
    }
    let Some(pod) = pod else {
        // A finished pod may have been garbage collected; keep the outcome
        return match current {
            PolecatPhase::Done | PolecatPhase::Failed => current,
            _ => PolecatPhase::Idle,
        };
    };
    match pod_phase(pod) {
        Some("Succeeded") => PolecatPhase::Done,
        Some("Failed") => PolecatPhase::Failed,
        _ if stuck => PolecatPhase::Stuck,
        _ => PolecatPhase::Working,
    }
}

/// What a reconcile pass should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Nothing to run; waiting for a bead or for work
    Wait,
    CreatePod,
    /// A pod exists; keep deriving status from it
    Observe,
    /// Workspace is clean; delete the pod and finish
    Terminate,
    RefuseTermination(CleanupStatus),
}

/// Decides the next step. `cleanup` is the inspected workspace state and is
/// only consulted for termination; an uninspected workspace is never destroyed.
pub fn next_step(
    desired: DesiredState,
    has_bead: bool,
    pod_exists: bool,
    phase: PolecatPhase,
    cleanup: Option<CleanupStatus>,
) -> Step {
    match desired {
        DesiredState::Terminated => match cleanup {
            Some(status) if status.is_clean() => Step::Terminate,
            Some(status) => Step::RefuseTermination(status),
            None => Step::RefuseTermination(CleanupStatus::Unknown),
        },
        DesiredState::Working if pod_exists => Step::Observe,
        DesiredState::Working
            if has_bead
                && !matches!(
                    phase,
                    PolecatPhase::Done | PolecatPhase::Failed | PolecatPhase::Terminated
                ) =>
        {
            Step::CreatePod
        }
        _ if pod_exists => Step::Observe,
        _ => Step::Wait,
    }
}

/// Where the workspace state has to come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupSource {
    /// No pod, so no workspace exists
    NoPod,
    /// The agent has exited and reported
    Reported(CleanupStatus),
    /// The workspace is live and must be inspected
    Live,
}

pub fn cleanup_source(pod: Option<&Pod>) -> CleanupSource {
    match pod {
        None => CleanupSource::NoPod,
        Some(pod) if pod_finished(pod) => CleanupSource::Reported(
            agent_termination(pod)
                .map(|m| CleanupStatus::parse(&m))
                .unwrap_or(CleanupStatus::Unknown),
        ),
        Some(_) => CleanupSource::Live,
    }
}

#[derive(Debug, Deserialize)]
struct GitStateReport {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    has_uncommitted: bool,
    #[serde(default)]
    has_unpushed: bool,
    #[serde(default)]
    clean: Option<bool>,
}

/// Parses `gt polecat git-state --json` output. A report that does not
/// positively say the workspace is clean is `unknown`.
pub fn parse_git_state(output: &str) -> CleanupStatus {
    match serde_json::from_str::<GitStateReport>(output.trim()) {
        Ok(GitStateReport {
            status: Some(status),
            ..
        }) => CleanupStatus::parse(&status),
        Ok(report) if report.has_uncommitted => CleanupStatus::HasUncommitted,
        Ok(report) if report.has_unpushed => CleanupStatus::HasUnpushed,
        Ok(report) if report.clean == Some(true) => CleanupStatus::Clean,
        Ok(_) | Err(_) => CleanupStatus::Unknown,
    }
}

async fn inspect_workspace(polecat: &Polecat, pod: Option<&Pod>, ctx: &Context) -> CleanupStatus {
    match cleanup_source(pod) {
        CleanupSource::NoPod => CleanupStatus::Clean,
        CleanupSource::Reported(status) => status,
        CleanupSource::Live => {
            let target = format!("{}/{}", polecat.spec.rig, polecat.name_any());
            let invocation = ToolInvocation::new(
                ctx.settings.tools.gt_path.clone(),
                ["polecat", "git-state", target.as_str(), "--json"],
            );
            match ctx.tools.run(&invocation).await {
                Ok(output) => parse_git_state(&output.stdout),
                Err(e) => {
                    warn!("Could not inspect workspace of {}: {}", target, e);
                    CleanupStatus::Unknown
                }
            }
        }
    }
}

/// Stored status as the starting point of this reconcile's patch.
fn carried_status(polecat: &Polecat) -> PolecatStatus {
    let mut status = PolecatStatus {
        conditions: polecat.conditions(),
        ..polecat.status.clone().unwrap_or_default()
    };
    // lastActivity is also written by the witness; never send a stale copy
    status.last_activity = None;
    // a report from an earlier termination request no longer applies
    if polecat.spec.desired_state != DesiredState::Terminated {
        status.cleanup_status = None;
    }
    status
}

fn ready_condition(polecat: &Polecat, phase: PolecatPhase) -> Condition {
    let (ok, reason, message) = match phase {
        PolecatPhase::Working => (true, "PodRunning", "agent pod is running"),
        PolecatPhase::Done => (true, "Completed", "agent finished successfully"),
        PolecatPhase::Idle => (false, "Idle", "no agent pod"),
        PolecatPhase::Stuck => (false, "Stuck", "witness reported no progress"),
        PolecatPhase::Failed => (false, "PodFailed", "agent pod failed"),
        PolecatPhase::Terminated => (false, "Terminated", "polecat terminated"),
    };
    condition_for(polecat, READY, ok, reason, message)
}

async fn reconcile(polecat: Arc<Polecat>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let result = reconcile_inner(&polecat, &ctx).await;
    finish(polecat.as_ref(), ctx.as_ref(), started, result).await
}

#[instrument(skip_all, fields(polecat = %polecat.name_any()))]
async fn reconcile_inner(polecat: &Polecat, ctx: &Context) -> Result<Action> {
    let name = polecat.name_any();
    let namespace = polecat.namespace().unwrap_or_default();
    let polecats: Api<Polecat> = Api::namespaced(ctx.client.clone(), &namespace);
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    let recorder = Recorder::new(
        ctx.client.clone(),
        ctx.reporter.clone(),
        polecat.object_ref(&()),
    );

    let pod_name = Polecat::pod_name(&name);
    // a same-named pod owned by someone else is never observed or deleted
    let pod = api::get_opt(&pods, &pod_name)
        .await?
        .filter(|p| api::controlled_by(p, polecat.uid().as_deref()));

    if polecat.meta().deletion_timestamp.is_some() {
        return finalize(polecat, pod.as_ref(), ctx, &polecats, &pods, &recorder).await;
    }
    api::add_finalizer(&polecats, polecat, POLECAT_FINALIZER).await?;

    let current = polecat.phase();
    let stuck = polecat.annotations().contains_key(STUCK_ANNOTATION);
    let has_bead = polecat.spec.bead_id.as_ref().is_some_and(|b| !b.is_empty());

    let cleanup = if polecat.spec.desired_state == DesiredState::Terminated {
        Some(inspect_workspace(polecat, pod.as_ref(), ctx).await)
    } else {
        None
    };

    let mut status = carried_status(polecat);

    let step = next_step(
        polecat.spec.desired_state,
        has_bead,
        pod.is_some(),
        current,
        cleanup,
    );
    debug!("Polecat {} phase {:?} step {:?}", name, current, step);

    let requeue = match step {
        Step::Wait => {
            status.phase = derive_phase(None, stuck, current);
            let reason = if has_bead { "NotRequested" } else { "NoBeadAssigned" };
            conditions::set_condition(
                &mut status.conditions,
                condition_for(polecat, POD_CREATED, false, reason, "no pod requested"),
            );
            Action::requeue(ctx.resync())
        }
        Step::CreatePod => {
            let desired = pod::build_pod(polecat, &ctx.settings.pod, &ctx.settings.ssh)?;
            let created = api::create_pod(&pods, &desired).await?;
            publish(
                &recorder,
                EventType::Normal,
                "PodCreated",
                format!("created pod {}", created.name_any()),
            )
            .await;
            status.phase = derive_phase(Some(&created), stuck, current);
            status.pod_name = Some(created.name_any());
            status.assigned_bead = polecat.spec.bead_id.clone();
            status.branch = Some(polecat.work_branch(&name));
            status.last_activity = Some(super::now());
            conditions::set_condition(
                &mut status.conditions,
                condition_for(polecat, POD_CREATED, true, "PodCreated", "agent pod created"),
            );
            Action::requeue(ctx.resync())
        }
        Step::Observe => {
            let phase = derive_phase(pod.as_ref(), stuck, current);
            if phase != current {
                info!("Polecat {} moved {} -> {}", name, current.as_str(), phase.as_str());
                status.last_activity = Some(super::now());
            }
            if phase == PolecatPhase::Failed && current != PolecatPhase::Failed {
                publish(&recorder, EventType::Warning, "PodFailed", format!("pod {} failed", pod_name))
                    .await;
            }
            status.phase = phase;
            status.pod_name = Some(pod_name.clone());
            if let Some(p) = pod.as_ref().filter(|p| pod_finished(p)) {
                if let CleanupSource::Reported(c) = cleanup_source(Some(p)) {
                    status.cleanup_status = Some(c);
                }
            }
            Action::requeue(ctx.resync())
        }
        Step::Terminate => {
            if pod.is_some() {
                api::delete_ignore_missing(&pods, &pod_name).await?;
                info!("Deleted pod {} of terminated polecat {}", pod_name, name);
            }
            status.phase = PolecatPhase::Terminated;
            status.cleanup_status = Some(CleanupStatus::Clean);
            conditions::set_condition(
                &mut status.conditions,
                condition_for(polecat, TERMINATED, true, "WorkspaceClean", "workspace clean; resources released"),
            );
            Action::await_change()
        }
        Step::RefuseTermination(cleanup) => {
            status.phase = derive_phase(pod.as_ref(), stuck, current);
            status.cleanup_status = Some(cleanup);
            let message = format!(
                "refusing to terminate: workspace is {}",
                cleanup.as_str()
            );
            if polecat
                .conditions()
                .iter()
                .find(|c| c.condition_type == TERMINATED)
                .map_or(true, |c| c.reason != UNSAVED_WORK)
            {
                publish(&recorder, EventType::Warning, UNSAVED_WORK, message.clone()).await;
            }
            conditions::set_condition(
                &mut status.conditions,
                condition_for(polecat, TERMINATED, false, UNSAVED_WORK, message),
            );
            Action::requeue(ctx.resync())
        }
    };

    conditions::set_condition(&mut status.conditions, ready_condition(polecat, status.phase));
    api::patch_status(&polecats, &name, &status).await?;
    Ok(requeue)
}

/// Deletion of the Polecat object follows the same rule as termination.
async fn finalize(
    polecat: &Polecat,
    pod: Option<&Pod>,
    ctx: &Context,
    polecats: &Api<Polecat>,
    pods: &Api<Pod>,
    recorder: &Recorder,
) -> Result<Action> {
    if !api::has_finalizer(polecat, POLECAT_FINALIZER) {
        return Ok(Action::await_change());
    }
    let name = polecat.name_any();
    let cleanup = inspect_workspace(polecat, pod, ctx).await;
    if !cleanup.is_clean() {
        let message = format!("deletion blocked: workspace is {}", cleanup.as_str());
        warn!("Polecat {} {}", name, message);
        publish(recorder, EventType::Warning, UNSAVED_WORK, message.clone()).await;
        let mut status = polecat.status.clone().unwrap_or_default();
        status.last_activity = None;
        status.cleanup_status = Some(cleanup);
        conditions::set_condition(
            &mut status.conditions,
            condition_for(polecat, TERMINATED, false, UNSAVED_WORK, message),
        );
        api::patch_status(polecats, &name, &status).await?;
        return Ok(Action::requeue(ctx.resync()));
    }
    if let Some(pod) = pod {
        api::delete_ignore_missing(pods, &pod.name_any()).await?;
    }
    api::remove_finalizer(polecats, polecat, POLECAT_FINALIZER).await?;
    info!("Released finalizer of polecat {}", name);
    Ok(Action::await_change())
}

/// Runs the Polecat controller until shutdown.
pub async fn run(ctx: Arc<Context>) {
    let polecats = Api::<Polecat>::all(ctx.client.clone());
    let pods = Api::<Pod>::all(ctx.client.clone());
    let pod_selector = format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE);

    let controller = Controller::new(polecats, watcher::Config::default())
        .owns(pods, watcher::Config::default().labels(&pod_selector))
        .shutdown_on_signal();
    let store = controller.store();
    tokio::spawn(maintain(store, ctx.clone(), PHASES));

    info!("Starting Polecat controller");
    controller
        .run(reconcile, error_policy::<Polecat, ()>, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => trace!("Reconciled polecat {}", obj.name),
                Err(e) => debug!("Polecat reconcile error: {}", e),
            }
        })
        .await;
}
