/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

//! Periodic `bd sync` for each BeadStore.

use super::{condition_for, error_policy, finish, maintain, Context, ManagedResource};
use crate::error::{OperatorError, Result};
use crate::k8s::api;
use crate::tools::ToolInvocation;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use gastown_models::models::conditions::{self, READY, SYNCED};
use gastown_models::{BeadStore, BeadStorePhase, BeadStoreStatus, Condition};
use gastown_utils::telemetry::prelude::*;
use kube::runtime::controller::Action;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const PHASES: &[&str] = &["Pending", "Synced", "Error"];

impl ManagedResource for BeadStore {
    const KIND: &'static str = "BeadStore";

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

    fn failure_condition() -> &'static str {
        SYNCED
    }
}

/// Time left until the next sync, or `None` when one is due now
pub fn until_next_sync(
    last: Option<DateTime<Utc>>,
    interval: Duration,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let elapsed = (now - last?).to_std().unwrap_or_default();
    interval.checked_sub(elapsed).filter(|left| !left.is_zero())
}

/// `bd sync` arguments for a store
pub fn sync_args(store: &BeadStore) -> Vec<String> {
    let mut args = vec![
        "sync".to_string(),
        "--prefix".to_string(),
        store.spec.prefix.clone(),
        "--branch".to_string(),
        store.spec.branch.clone(),
    ];
    if let Some(remote) = store.spec.git_remote.as_ref().filter(|r| !r.is_empty()) {
        args.push("--remote".to_string());
        args.push(remote.clone());
    }
    args
}

async fn reconcile(store: Arc<BeadStore>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let result = reconcile_inner(&store, &ctx).await;
    finish(store.as_ref(), ctx.as_ref(), started, result).await
}

#[instrument(skip_all, fields(bead_store = %store.name_any()))]
async fn reconcile_inner(store: &BeadStore, ctx: &Context) -> Result<Action> {
    let name = store.name_any();
    let stores = BeadStore::api(ctx.client.clone(), store);
    let interval = humantime::parse_duration(&store.spec.sync_interval)
        .map_err(|e| OperatorError::from(e).with_context("field", "syncInterval"))?;

    let mut status = BeadStoreStatus {
        conditions: store.conditions(),
        ..store.status.clone().unwrap_or_default()
    };
    let now = super::now();
    if status.phase == BeadStorePhase::Synced {
        if let Some(left) = until_next_sync(status.last_sync_time, interval, now) {
            trace!("BeadStore {} next sync in {:?}", name, left);
            return Ok(Action::requeue(left));
        }
    }

    let invocation = ToolInvocation::new(ctx.settings.tools.bd_path.clone(), sync_args(store));
    match ctx.tools.run(&invocation).await {
        Ok(_) => {
            info!("Synced beads prefix {}", store.spec.prefix);
            status.phase = BeadStorePhase::Synced;
            status.last_sync_time = Some(now);
            conditions::set_condition(
                &mut status.conditions,
                condition_for(store, SYNCED, true, "SyncSucceeded", format!("synced {}", store.spec.branch)),
            );
            conditions::set_condition(
                &mut status.conditions,
                condition_for(store, READY, true, "SyncSucceeded", "beads store in sync"),
            );
            api::patch_status(&stores, &name, &status).await?;
            Ok(Action::requeue(interval))
        }
        Err(e) => {
            status.phase = BeadStorePhase::Error;
            conditions::set_condition(
                &mut status.conditions,
                condition_for(store, READY, false, e.reason(), &e.message),
            );
            api::patch_status(&stores, &name, &status).await?;
            Err(e.with_context("prefix", &store.spec.prefix))
        }
    }
}

/// Runs the BeadStore controller until shutdown.
pub async fn run(ctx: Arc<Context>) {
    let controller = Controller::new(
        Api::<BeadStore>::all(ctx.client.clone()),
        watcher::Config::default(),
    )
    .shutdown_on_signal();
    let store = controller.store();
    tokio::spawn(maintain(store, ctx.clone(), PHASES));

    info!("Starting BeadStore controller");
    controller
        .run(reconcile, error_policy::<BeadStore, ()>, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => trace!("Reconciled bead store {}", obj.name),
                Err(e) => debug!("BeadStore reconcile error: {}", e),
            }
        })
        .await;
}
