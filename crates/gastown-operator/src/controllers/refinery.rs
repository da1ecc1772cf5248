/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

//! # Refinery Controller
//!
//! Maintains the merge queue of one rig. Each pass:
//!
//! 1. applies a pending operator `retry`/`skip` action to a halted queue
//! 2. queues the branches of Done Polecats not seen before
//! 3. advances up to `parallelism` items through [`MergeProcessor`]
//! 4. writes the queue, counts and phase to status
//!
//! The checkout lives under `tools.workdir` and is removed with the Refinery.

use super::{condition_for, error_policy, finish, maintain, publish, Context, ManagedResource};
use crate::error::{OperatorError, Result};
use crate::k8s::api;
use crate::merge_queue::{
    self, apply_conflict_action, halted_at, next_batch, sync_queue, ConflictAction, GitCli, MergePolicy,
    MergeProcessor,
};
use crate::metrics;
use crate::pod::known_hosts::{self, HostVerification};
use futures::StreamExt;
use gastown_models::models::conditions::{self, READY};
use gastown_models::models::{CHILD_FINALIZER, CONFLICT_ACTION_ANNOTATION};
use gastown_models::{
    Condition, Polecat, QueueItemState, Refinery, RefineryPhase, RefineryStatus, Rig,
};
use gastown_utils::telemetry::prelude::*;
use k8s_openapi::api::core::v1::Secret;
use kube::api::ListParams;
use kube::runtime::controller::Action;
use kube::runtime::events::{EventType, Recorder};
use kube::runtime::{watcher, Controller};
use kube::{Api, Client, Resource, ResourceExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const PHASES: &[&str] = &["Idle", "Processing", "Error"];

/// Requeue interval for picking up newly finished Polecats
const QUEUE_POLL: Duration = Duration::from_secs(30);

/// Keys tried, in order, for the SSH key in the git secret
const SSH_KEY_FIELDS: [&str; 2] = ["ssh-privatekey", "id_rsa"];

impl ManagedResource for Refinery {
    const KIND: &'static str = "Refinery";

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

/// Queue phase: Error while halted on a conflict, Processing while items
/// wait, Idle otherwise.
pub fn refinery_phase(status: &RefineryStatus) -> RefineryPhase {
    if halted_at(&status.queue).is_some() {
        RefineryPhase::Error
    } else if status.queue_length > 0 {
        RefineryPhase::Processing
    } else {
        RefineryPhase::Idle
    }
}

/// Recomputes the derived counters of a status from its queue
pub fn refresh_counts(status: &mut RefineryStatus) {
    status.merges_summary = merge_queue::summarize(&status.queue);
    status.queue_length = status.merges_summary.pending;
    status.phase = refinery_phase(status);
}

fn checkout_dir(workdir: &str, refinery: &Refinery) -> PathBuf {
    Path::new(workdir).join(format!(
        "{}-{}",
        refinery.namespace().unwrap_or_default(),
        refinery.name_any()
    ))
}

fn ssh_dir(checkout: &Path) -> PathBuf {
    let mut dir = checkout.as_os_str().to_owned();
    dir.push(".ssh");
    PathBuf::from(dir)
}

async fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let io = |e: std::io::Error| {
        OperatorError::internal(format!("cannot write {}: {}", path.display(), e))
    };
    tokio::fs::write(path, contents).await.map_err(io)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(io)?;
    }
    Ok(())
}

/// Builds the git client for a refinery, materializing SSH material when a
/// git secret is configured.
async fn git_for(refinery: &Refinery, rig: &Rig, ctx: &Context) -> Result<GitCli> {
    let dir = checkout_dir(&ctx.settings.tools.workdir, refinery);
    let identity = (
        ctx.settings.pod.git_user_name.clone(),
        ctx.settings.pod.git_user_email.clone(),
    );
    let git = GitCli::new(
        ctx.tools.clone(),
        ctx.settings.tools.git_path.clone(),
        rig.spec.git_url.clone(),
        dir.clone(),
        identity,
    );
    let Some(secret_ref) = refinery.spec.git_secret_ref.as_ref() else {
        return Ok(git);
    };

    let lines = match known_hosts::resolve(&rig.spec.git_url, &ctx.settings.ssh.known_hosts) {
        HostVerification::Known { lines, .. } => lines,
        HostVerification::NotRequired => return Ok(git),
        HostVerification::Unknown { host } => {
            return Err(OperatorError::validation(format!(
                "no verified host key for {}; add it to ssh.known_hosts",
                host
            ))
            .with_context("refinery", refinery.name_any()));
        }
    };

    let secrets: Api<Secret> =
        Api::namespaced(ctx.client.clone(), &refinery.namespace().unwrap_or_default());
    let secret = api::get_opt(&secrets, &secret_ref.name)
        .await?
        .ok_or_else(|| OperatorError::not_found(format!("git secret {} not found", secret_ref.name)))?;
    let data = secret.data.unwrap_or_default();
    let key = SSH_KEY_FIELDS
        .iter()
        .find_map(|field| data.get(*field))
        .ok_or_else(|| {
            OperatorError::validation(format!(
                "git secret {} has neither ssh-privatekey nor id_rsa",
                secret_ref.name
            ))
        })?;

    let ssh = ssh_dir(&dir);
    tokio::fs::create_dir_all(&ssh)
        .await
        .map_err(|e| OperatorError::internal(format!("cannot create {}: {}", ssh.display(), e)))?;
    let key_path = ssh.join("id");
    let hosts_path = ssh.join("known_hosts");
    write_private(&key_path, &key.0).await?;
    write_private(&hosts_path, format!("{}\n", lines.join("\n")).as_bytes()).await?;
    Ok(git.with_ssh(&key_path, &hosts_path))
}

async fn remove_checkout(refinery: &Refinery, ctx: &Context) {
    let dir = checkout_dir(&ctx.settings.tools.workdir, refinery);
    for path in [ssh_dir(&dir), dir] {
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => debug!("Removed {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {}: {}", path.display(), e),
        }
    }
}

fn ready_condition(refinery: &Refinery, status: &RefineryStatus) -> Condition {
    match (status.phase, halted_at(&status.queue)) {
        (RefineryPhase::Error, Some(index)) => condition_for(
            refinery,
            READY,
            false,
            "MergeConflict",
            format!(
                "queue halted at {}; set {} to retry or skip",
                status.queue[index].branch, CONFLICT_ACTION_ANNOTATION
            ),
        ),
        (RefineryPhase::Processing, _) => condition_for(
            refinery,
            READY,
            true,
            "Processing",
            format!("{} item(s) queued", status.queue_length),
        ),
        _ => condition_for(refinery, READY, true, "QueueEmpty", "nothing to merge"),
    }
}

async fn reconcile(refinery: Arc<Refinery>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let result = reconcile_inner(&refinery, &ctx).await;
    finish(refinery.as_ref(), ctx.as_ref(), started, result).await
}

#[instrument(skip_all, fields(refinery = %refinery.name_any()))]
async fn reconcile_inner(refinery: &Refinery, ctx: &Context) -> Result<Action> {
    let name = refinery.name_any();
    let refineries = Refinery::api(ctx.client.clone(), refinery);
    let recorder = Recorder::new(
        ctx.client.clone(),
        ctx.reporter.clone(),
        refinery.object_ref(&()),
    );

    if refinery.meta().deletion_timestamp.is_some() {
        remove_checkout(refinery, ctx).await;
        metrics::merge_queue_depth().with_label_values(&[name.as_str()]).set(0.0);
        api::remove_finalizer(&refineries, refinery, CHILD_FINALIZER).await?;
        info!("Released refinery {}", name);
        return Ok(Action::await_change());
    }

    let mut status = RefineryStatus {
        conditions: refinery.conditions(),
        ..refinery.status.clone().unwrap_or_default()
    };

    if let Some(raw) = refinery.annotations().get(CONFLICT_ACTION_ANNOTATION) {
        match ConflictAction::parse(raw) {
            Some(action) if apply_conflict_action(&mut status.queue, action) => {
                info!("Applied {:?} to halted queue of {}", action, name);
                publish(
                    &recorder,
                    EventType::Normal,
                    "ConflictActionApplied",
                    format!("applied {}", raw),
                )
                .await;
            }
            Some(_) => debug!("Ignoring {} on {}: queue not halted", raw, name),
            None => {
                publish(
                    &recorder,
                    EventType::Warning,
                    "InvalidConflictAction",
                    format!("{} must be retry or skip, got {:?}", CONFLICT_ACTION_ANNOTATION, raw),
                )
                .await;
            }
        }
        api::patch_annotation(&refineries, &name, CONFLICT_ACTION_ANNOTATION, None).await?;
    }

    let rigs = Api::<Rig>::all(ctx.client.clone());
    let rig = api::get_opt(&rigs, &refinery.spec.rig_ref)
        .await?
        .ok_or_else(|| {
            OperatorError::not_found(format!("rig {} not found", refinery.spec.rig_ref))
        })?;

    let polecats: Vec<Polecat> = Api::<Polecat>::all(ctx.client.clone())
        .list(&ListParams::default())
        .await?
        .items
        .into_iter()
        .filter(|p| p.spec.rig == refinery.spec.rig_ref)
        .collect();
    let added = sync_queue(&mut status.queue, &polecats);
    if added > 0 {
        info!("Queued {} new branch(es) for {}", added, name);
    }

    let batch = next_batch(&status.queue, refinery.spec.parallelism);
    if !batch.is_empty() {
        let git = git_for(refinery, &rig, ctx).await?;
        let policy = MergePolicy {
            target_branch: refinery.spec.target_branch.clone(),
            test_command: refinery.spec.test_command.clone(),
            strategy: refinery.spec.merge_strategy,
            resolution: refinery.spec.conflict_resolution,
        };
        let processor = MergeProcessor::new(&git, &policy);

        for index in batch {
            let branch = status.queue[index].branch.clone();
            status.queue[index].state = QueueItemState::Merging;
            status.current_merge = Some(branch.clone());
            refresh_counts(&mut status);
            api::patch_status(&refineries, &name, &status).await?;

            let (state, message) = match processor.process(&status.queue[index]).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    status.queue[index].state = QueueItemState::Pending;
                    status.queue[index].message = Some(e.message.clone());
                    status.current_merge = None;
                    refresh_counts(&mut status);
                    api::patch_status(&refineries, &name, &status).await?;
                    return Err(e.with_context("branch", &branch));
                }
            };

            let result = match state {
                QueueItemState::Merged => {
                    status.last_merge_time = Some(super::now());
                    publish(&recorder, EventType::Normal, "Merged", format!("{}: {}", branch, message))
                        .await;
                    "merged"
                }
                QueueItemState::Conflict => {
                    metrics::merge_conflicts_total().inc();
                    publish(&recorder, EventType::Warning, "MergeConflict", format!("{}: {}", branch, message))
                        .await;
                    "conflict"
                }
                _ => {
                    publish(&recorder, EventType::Warning, "MergeFailed", format!("{}: {}", branch, message))
                        .await;
                    "failed"
                }
            };
            metrics::merge_attempts_total().with_label_values(&[result]).inc();
            info!("Refinery {} {} {}: {}", name, result, branch, message);

            status.queue[index].state = state;
            status.queue[index].message = Some(message);
            if state == QueueItemState::Conflict {
                break;
            }
        }
    }

    status.current_merge = None;
    refresh_counts(&mut status);
    metrics::merge_queue_depth()
        .with_label_values(&[name.as_str()])
        .set(status.queue_length as f64);
    let ready = ready_condition(refinery, &status);
    conditions::set_condition(&mut status.conditions, ready);
    api::patch_status(&refineries, &name, &status).await?;

    // a halted queue only moves on an operator action, which is a watch event
    Ok(match status.phase {
        RefineryPhase::Error => Action::requeue(ctx.resync()),
        _ => Action::requeue(QUEUE_POLL),
    })
}

/// Runs the Refinery controller until shutdown.
pub async fn run(ctx: Arc<Context>) {
    let controller = Controller::new(
        Api::<Refinery>::all(ctx.client.clone()),
        watcher::Config::default(),
    )
    .shutdown_on_signal();
    let store = controller.store();
    tokio::spawn(maintain(store, ctx.clone(), PHASES));

    info!("Starting Refinery controller");
    controller
        .run(reconcile, error_policy::<Refinery, ()>, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => trace!("Reconciled refinery {}", obj.name),
                Err(e) => debug!("Refinery reconcile error: {}", e),
            }
        })
        .await;
}
