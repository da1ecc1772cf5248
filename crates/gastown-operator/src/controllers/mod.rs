/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

//! # Controllers
//!
//! One kube-runtime `Controller` per resource kind. All of them share the
//! same outer shape:
//!
//! 1. `reconcile` reads the object, derives observed state from its children
//!    and writes status and conditions
//! 2. [`finish`] records metrics, resets the object's retry counter on
//!    success and writes a failure condition with the mapped reason on error
//! 3. [`error_policy`] requeues retryable errors after the backoff delay and
//!    waits for a change otherwise or once retries are exhausted
//! 4. [`maintain`] runs beside the controller, dropping backoff entries for
//!    deleted objects and refreshing the per-phase gauges

pub mod bead_store;
pub mod convoy;
pub mod polecat;
pub mod refinery;
pub mod rig;
pub mod witness;

use crate::error::{OperatorError, Result};
use crate::metrics;
use crate::retry::BackoffService;
use crate::tools::ToolRunner;
use chrono::Utc;
use gastown_models::models::conditions::{self, READY};
use gastown_models::{Condition, ConditionStatus};
use gastown_utils::telemetry::prelude::*;
use gastown_utils::Settings;
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::reflector::Store;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How often backoff entries are pruned and phase gauges refreshed
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

/// Event reporter name
pub const REPORTER: &str = "gastown-operator";

/// A custom resource managed by one of the controllers
pub trait ManagedResource:
    Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Serialize + Send + Sync + 'static
{
    const KIND: &'static str;

    /// Api handle able to address `obj` (namespaced or cluster scoped)
    fn api(client: Client, obj: &Self) -> Api<Self>;

    fn conditions(&self) -> Vec<Condition>;

    fn phase_label(&self) -> &'static str;

    /// Condition type used to surface reconcile failures
    fn failure_condition() -> &'static str {
        READY
    }
}

/// Retry-map key of an object: `namespace/name`, or `name` when cluster scoped
pub fn object_key<K: Resource>(obj: &K) -> String {
    match obj.meta().namespace.as_deref() {
        Some(ns) => format!("{}/{}", ns, obj.meta().name.as_deref().unwrap_or_default()),
        None => obj.meta().name.clone().unwrap_or_default(),
    }
}

/// State shared by the reconciles of one kind
pub struct Context<S = ()> {
    pub client: Client,
    pub settings: Arc<Settings>,
    pub tools: Arc<dyn ToolRunner>,
    pub backoff: BackoffService,
    pub reporter: Reporter,
    pub state: S,
}

impl<S> Context<S> {
    pub fn new(client: Client, settings: Arc<Settings>, tools: Arc<dyn ToolRunner>, state: S) -> Self {
        let backoff = BackoffService::from_settings(&settings.backoff);
        Self {
            client,
            settings,
            tools,
            backoff,
            reporter: Reporter {
                controller: REPORTER.to_string(),
                instance: std::env::var("POD_NAME").ok(),
            },
            state,
        }
    }

    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.settings.operator.resync_interval_seconds)
    }
}

/// Conditions after surfacing `err` on the failure condition
pub fn failure_conditions<K: ManagedResource>(obj: &K, err: &OperatorError) -> Vec<Condition> {
    let mut list = obj.conditions();
    conditions::set_condition(
        &mut list,
        Condition::new(
            K::failure_condition(),
            ConditionStatus::False,
            err.reason(),
            &err.message,
        )
        .with_generation(obj.meta().generation),
    );
    list
}

/// Wraps the outcome of one reconcile with metrics, retry bookkeeping and a
/// failure condition.
pub async fn finish<K, S>(
    obj: &K,
    ctx: &Context<S>,
    started: Instant,
    result: Result<Action>,
) -> Result<Action>
where
    K: ManagedResource,
{
    let key = object_key(obj);
    metrics::reconcile_duration_seconds()
        .with_label_values(&[K::KIND])
        .observe(started.elapsed().as_secs_f64());

    match result {
        Ok(action) => {
            metrics::reconcile_total()
                .with_label_values(&[K::KIND, "success"])
                .inc();
            ctx.backoff.reset_retries(&key);
            Ok(action)
        }
        Err(err) => {
            metrics::reconcile_total()
                .with_label_values(&[K::KIND, "error"])
                .inc();
            metrics::reconcile_errors_total()
                .with_label_values(&[K::KIND, err.reason()])
                .inc();
            warn!(
                kind = K::KIND,
                object = %key,
                reason = err.reason(),
                call_path = ?err.call_path,
                "Reconcile failed: {}",
                err
            );
            // Objects being deleted may already be gone
            if !err.is_not_found() {
                let api = K::api(ctx.client.clone(), obj);
                let conditions = failure_conditions(obj, &err);
                let status = serde_json::json!({ "conditions": conditions });
                if let Err(e) = crate::k8s::api::patch_status(&api, &obj.name_any(), &status).await {
                    debug!("Could not record failure condition on {}: {}", key, e);
                }
            }
            Err(err)
        }
    }
}

/// Requeue decision after a failed reconcile
pub fn error_policy<K, S>(obj: Arc<K>, err: &OperatorError, ctx: Arc<Context<S>>) -> Action
where
    K: ManagedResource,
{
    let key = object_key(obj.as_ref());
    if !err.retryable {
        info!("Not retrying {} {}: {}", K::KIND, key, err.reason());
        return Action::await_change();
    }
    if ctx.backoff.should_give_up(&key) {
        error!(
            "Giving up on {} {} after {} retries; waiting for a change",
            K::KIND,
            key,
            ctx.backoff.retry_count(&key)
        );
        return Action::await_change();
    }
    let backoff = ctx.backoff.get_backoff_result(&key);
    debug!(
        "Requeueing {} {} in {:?} (retry {})",
        K::KIND,
        key,
        backoff.delay,
        backoff.retry_count
    );
    Action::requeue(backoff.delay)
}

/// Counts objects per phase label
pub fn phase_counts<K: ManagedResource>(objects: &[Arc<K>]) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    for obj in objects {
        *counts.entry(obj.phase_label()).or_insert(0) += 1;
    }
    counts
}

/// Periodic housekeeping for one controller: backoff cleanup against the
/// reflector store and phase gauge refresh.
pub async fn maintain<K, S>(store: Store<K>, ctx: Arc<Context<S>>, phases: &'static [&'static str])
where
    K: ManagedResource + Clone,
    K::DynamicType: std::hash::Hash + Eq + Clone,
    S: Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
    loop {
        ticker.tick().await;
        let objects = store.state();
        let active: HashSet<String> = objects.iter().map(|o| object_key(o.as_ref())).collect();
        let removed = ctx.backoff.cleanup(&active);
        if removed > 0 {
            debug!("Dropped {} stale backoff entries for {}", removed, K::KIND);
        }

        let counts = phase_counts(&objects);
        for phase in phases {
            metrics::objects_by_phase()
                .with_label_values(&[K::KIND, *phase])
                .set(counts.get(phase).copied().unwrap_or(0) as f64);
        }
    }
}

/// Publishes an Event; failures are logged and otherwise ignored
pub async fn publish(recorder: &Recorder, type_: EventType, reason: &str, note: String) {
    let event = Event {
        type_,
        reason: reason.to_string(),
        note: Some(note),
        action: "Reconcile".to_string(),
        secondary: None,
    };
    if let Err(e) = recorder.publish(event).await {
        debug!("Failed to publish event {}: {}", reason, e);
    }
}

/// `Ready`-style condition stamped with the object's generation
pub fn condition_for<K: Resource>(
    obj: &K,
    condition_type: &str,
    status: bool,
    reason: &str,
    message: impl Into<String>,
) -> Condition {
    Condition::new(condition_type, ConditionStatus::from(status), reason, message)
        .with_generation(obj.meta().generation)
}

pub fn now() -> chrono::DateTime<Utc> {
    Utc::now()
}
