/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

//! # Rig Controller
//!
//! Keeps the per-rig Witness and Refinery in existence and aggregates their
//! readiness, together with polecat activity, into the Rig's `Ready`
//! condition.
//!
//! Children are linked by `rigRef`, the rig label and a finalizer; there are
//! no owner references. Deletion runs as an explicit sequence:
//!
//! ```text
//! MarkedForDeletion --delete children--> DeletingChildren --all gone--> ReleaseFinalizer
//! ```

use super::{condition_for, error_policy, finish, maintain, Context, ManagedResource};
use crate::error::{OperatorError, Result};
use crate::k8s::api;
use futures::StreamExt;
use gastown_models::models::conditions::{self, READY};
use gastown_models::models::{label_value, CHILD_FINALIZER, RIG_FINALIZER, RIG_LABEL};
use gastown_models::{
    Condition, Polecat, PolecatPhase, Refinery, RefineryPhase, RefinerySpec, Rig, RigPhase,
    RigStatus, Witness, WitnessPhase, WitnessSpec,
};
use gastown_utils::telemetry::prelude::*;
use kube::api::{ListParams, ObjectMeta, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client, Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const PHASES: &[&str] = &["Pending", "Ready", "Degraded", "Terminating"];

const DELETION_POLL: Duration = Duration::from_secs(5);

impl ManagedResource for Rig {
    const KIND: &'static str = "Rig";

    fn api(client: Client, _obj: &Self) -> Api<Self> {
        Api::all(client)
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

/// Aggregated readiness of a rig
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    pub ready: bool,
    pub reason: &'static str,
    pub message: String,
}

/// Folds child state into the rig's readiness. The first failing check wins:
/// Witness active, then Refinery healthy, then polecat activity.
pub fn aggregate_readiness(
    witness: Option<WitnessPhase>,
    refinery: Option<RefineryPhase>,
    polecats: &[PolecatPhase],
) -> Readiness {
    if witness != Some(WitnessPhase::Active) {
        return Readiness {
            ready: false,
            reason: "WitnessNotReady",
            message: match witness {
                None => "witness not found".to_string(),
                Some(phase) => format!("witness is {}", phase.as_str()),
            },
        };
    }
    match refinery {
        None => {
            return Readiness {
                ready: false,
                reason: "RefineryError",
                message: "refinery not found".to_string(),
            }
        }
        Some(RefineryPhase::Error) => {
            return Readiness {
                ready: false,
                reason: "RefineryError",
                message: "refinery is in Error".to_string(),
            }
        }
        Some(_) => {}
    }
    if !polecats
        .iter()
        .any(|p| matches!(p, PolecatPhase::Working | PolecatPhase::Done))
    {
        return Readiness {
            ready: false,
            reason: "NoPolecatActivity",
            message: "no polecat is working or done".to_string(),
        };
    }
    Readiness {
        ready: true,
        reason: "AllComponentsReady",
        message: "witness active, refinery healthy, polecats active".to_string(),
    }
}

/// Rig phase for a readiness result
pub fn rig_phase(readiness: &Readiness) -> RigPhase {
    match (readiness.ready, readiness.reason) {
        (true, _) => RigPhase::Ready,
        (false, "RefineryError") => RigPhase::Degraded,
        _ => RigPhase::Pending,
    }
}

/// Observed state of one child during deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Absent,
    Present,
    Deleting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionStage {
    /// Children still exist and have not been asked to go
    MarkedForDeletion,
    /// Children are finalizing
    DeletingChildren,
    /// All children gone; the rig finalizer may be removed
    ReleaseFinalizer,
}

pub fn deletion_stage(children: &[ChildState]) -> DeletionStage {
    if children.iter().all(|c| *c == ChildState::Absent) {
        DeletionStage::ReleaseFinalizer
    } else if children.iter().any(|c| *c == ChildState::Present) {
        DeletionStage::MarkedForDeletion
    } else {
        DeletionStage::DeletingChildren
    }
}

fn child_state<K: Resource>(obj: Option<&K>) -> ChildState {
    match obj {
        None => ChildState::Absent,
        Some(o) if o.meta().deletion_timestamp.is_some() => ChildState::Deleting,
        Some(_) => ChildState::Present,
    }
}

fn child_meta(rig: &str, name: String, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(namespace.to_string()),
        labels: Some(BTreeMap::from([(RIG_LABEL.to_string(), label_value(rig))])),
        finalizers: Some(vec![CHILD_FINALIZER.to_string()]),
        ..Default::default()
    }
}

/// Creates a child if absent; an `AlreadyExists` race counts as created.
async fn ensure_child<K>(children: &Api<K>, existing: Option<K>, desired: K) -> Result<K>
where
    K: Resource + Clone + serde::Serialize + serde::de::DeserializeOwned + std::fmt::Debug,
{
    if let Some(obj) = existing {
        return Ok(obj);
    }
    let name = desired.name_any();
    match children.create(&PostParams::default(), &desired).await {
        Ok(created) => {
            info!("Created {}", name);
            Ok(created)
        }
        Err(kube::Error::Api(resp)) if resp.code == 409 => api::get_opt(children, &name)
            .await?
            .ok_or_else(|| OperatorError::transient(format!("{} vanished after conflict", name))),
        Err(e) => Err(OperatorError::from(e).with_context("child", &name)),
    }
}

async fn reconcile(rig: Arc<Rig>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let result = reconcile_inner(&rig, &ctx).await;
    finish(rig.as_ref(), ctx.as_ref(), started, result).await
}

#[instrument(skip_all, fields(rig = %rig.name_any()))]
async fn reconcile_inner(rig: &Rig, ctx: &Context) -> Result<Action> {
    let name = rig.name_any();
    let namespace = rig
        .child_namespace(&ctx.settings.operator.rig_namespace)
        .to_string();
    let rigs: Api<Rig> = Api::all(ctx.client.clone());
    let witnesses: Api<Witness> = Api::namespaced(ctx.client.clone(), &namespace);
    let refineries: Api<Refinery> = Api::namespaced(ctx.client.clone(), &namespace);
    let witness_name = Rig::witness_name(&name);
    let refinery_name = Rig::refinery_name(&name);

    let witness = api::get_opt(&witnesses, &witness_name).await?;
    let refinery = api::get_opt(&refineries, &refinery_name).await?;

    if rig.meta().deletion_timestamp.is_some() {
        return delete_children(
            rig,
            &rigs,
            (&witnesses, witness.as_ref()),
            (&refineries, refinery.as_ref()),
        )
        .await;
    }
    api::add_finalizer(&rigs, rig, RIG_FINALIZER).await?;

    let witness = ensure_child(
        &witnesses,
        witness,
        Witness {
            metadata: child_meta(&name, witness_name, &namespace),
            spec: WitnessSpec::for_rig(&name),
            status: None,
        },
    )
    .await?;
    let refinery = ensure_child(
        &refineries,
        refinery,
        Refinery {
            metadata: child_meta(&name, refinery_name, &namespace),
            spec: RefinerySpec::for_rig(&name),
            status: None,
        },
    )
    .await?;

    let polecat_phases: Vec<PolecatPhase> = Api::<Polecat>::all(ctx.client.clone())
        .list(&ListParams::default())
        .await?
        .items
        .iter()
        .filter(|p| p.spec.rig == name)
        .map(|p| p.phase())
        .collect();

    let readiness = aggregate_readiness(
        witness.status.as_ref().map(|s| s.phase),
        refinery.status.as_ref().map(|s| s.phase),
        &polecat_phases,
    );
    let phase = rig_phase(&readiness);
    if rig.status.as_ref().map(|s| s.phase) != Some(phase) {
        info!("Rig {} is {} ({})", name, phase.as_str(), readiness.reason);
    }

    let mut status = RigStatus {
        phase,
        witness_created: true,
        refinery_created: true,
        polecat_count: polecat_phases.len() as i32,
        active_polecats: polecat_phases
            .iter()
            .filter(|p| **p == PolecatPhase::Working)
            .count() as i32,
        conditions: rig.conditions(),
        last_reconcile_time: Some(super::now()),
    };
    conditions::set_condition(
        &mut status.conditions,
        condition_for(rig, READY, readiness.ready, readiness.reason, readiness.message),
    );
    api::patch_status(&rigs, &name, &status).await?;

    Ok(Action::requeue(ctx.resync()))
}

async fn delete_children(
    rig: &Rig,
    rigs: &Api<Rig>,
    witness: (&Api<Witness>, Option<&Witness>),
    refinery: (&Api<Refinery>, Option<&Refinery>),
) -> Result<Action> {
    if !api::has_finalizer(rig, RIG_FINALIZER) {
        return Ok(Action::await_change());
    }
    let name = rig.name_any();
    let stage = deletion_stage(&[child_state(witness.1), child_state(refinery.1)]);
    debug!("Rig {} deletion stage {:?}", name, stage);

    match stage {
        DeletionStage::MarkedForDeletion => {
            if let Some(w) = witness.1 {
                api::delete_ignore_missing(witness.0, &w.name_any()).await?;
            }
            if let Some(r) = refinery.1 {
                api::delete_ignore_missing(refinery.0, &r.name_any()).await?;
            }
            let mut status = rig.status.clone().unwrap_or_default();
            status.phase = RigPhase::Terminating;
            status.last_reconcile_time = Some(super::now());
            conditions::set_condition(
                &mut status.conditions,
                condition_for(rig, READY, false, "Terminating", "deleting witness and refinery"),
            );
            api::patch_status(rigs, &name, &status).await?;
            info!("Rig {} marked for deletion; children deleting", name);
            Ok(Action::requeue(DELETION_POLL))
        }
        DeletionStage::DeletingChildren => Ok(Action::requeue(DELETION_POLL)),
        DeletionStage::ReleaseFinalizer => {
            api::remove_finalizer(rigs, rig, RIG_FINALIZER).await?;
            info!("Rig {} children gone; finalizer released", name);
            Ok(Action::await_change())
        }
    }
}

/// Runs the Rig controller until shutdown.
pub async fn run(ctx: Arc<Context>) {
    let client = ctx.client.clone();
    let controller = Controller::new(Api::<Rig>::all(client.clone()), watcher::Config::default())
        .watches(
            Api::<Witness>::all(client.clone()),
            watcher::Config::default(),
            |w| Some(ObjectRef::<Rig>::new(&w.spec.rig_ref)),
        )
        .watches(
            Api::<Refinery>::all(client.clone()),
            watcher::Config::default(),
            |r| Some(ObjectRef::<Rig>::new(&r.spec.rig_ref)),
        )
        .watches(
            Api::<Polecat>::all(client),
            watcher::Config::default(),
            |p| Some(ObjectRef::<Rig>::new(&p.spec.rig)),
        )
        .shutdown_on_signal();
    let store = controller.store();
    tokio::spawn(maintain(store, ctx.clone(), PHASES));

    info!("Starting Rig controller");
    controller
        .run(reconcile, error_policy::<Rig, ()>, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => trace!("Reconciled rig {}", obj.name),
                Err(e) => debug!("Rig reconcile error: {}", e),
            }
        })
        .await;
}
