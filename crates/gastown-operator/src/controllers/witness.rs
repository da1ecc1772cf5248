/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

//! # Witness Controller
//!
//! Periodic health check over the Polecats of one rig.
//!
//! Each pass lists the rig's Polecats, reads workspace activity from the
//! telemetry sidecar (falling back to `status.lastActivity`) and classifies
//! every Polecat as running, succeeded, failed or stuck. A stuck Polecat is
//! marked with the stuck annotation, which the Polecat controller turns into
//! the `Stuck` phase; the annotation is removed as soon as activity resumes.
//!
//! Stuck and failed Polecats are escalated on a per-Polecat schedule:
//!
//! | Attempt | Delay after previous escalation |
//! |---------|---------------------------------|
//! | 1       | immediately                     |
//! | 2       | 1m                              |
//! | 3       | 2m                              |
//! | 4       | 4m                              |
//! | 5+      | 8m                              |
//!
//! The schedule restarts once the Polecat is healthy again.

use super::{condition_for, error_policy, finish, maintain, publish, Context, ManagedResource};
use crate::error::{OperatorError, Result};
use crate::k8s::api;
use crate::metrics;
use crate::tools::{ToolInvocation, ToolRunner};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use gastown_models::models::conditions::{self, READY};
use gastown_models::models::witness::PolecatsSummary;
use gastown_models::models::{CHILD_FINALIZER, STUCK_ANNOTATION};
use gastown_models::{Condition, Polecat, PolecatPhase, Witness, WitnessPhase, WitnessStatus};
use gastown_utils::telemetry::prelude::*;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::runtime::controller::Action;
use kube::runtime::events::{EventType, Recorder};
use kube::runtime::{watcher, Controller};
use kube::{Api, Client, Resource, ResourceExt};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const PHASES: &[&str] = &["Pending", "Active", "Degraded"];

/// Metric exposed by the telemetry sidecar
pub const ACTIVITY_METRIC: &str = "polecat_workspace_last_activity_timestamp";

/// Escalation target that records events only
pub const NO_ESCALATION: &str = "none";

const SCRAPE_TIMEOUT: Duration = Duration::from_secs(5);

const ESCALATION_DELAYS: [Duration; 5] = [
    Duration::from_secs(0),
    Duration::from_secs(60),
    Duration::from_secs(120),
    Duration::from_secs(240),
    Duration::from_secs(480),
];

impl ManagedResource for Witness {
    const KIND: &'static str = "Witness";

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

/// Delay required between escalation `attempts` and the next one
pub fn escalation_delay(attempts: u32) -> Duration {
    let index = (attempts as usize).min(ESCALATION_DELAYS.len() - 1);
    ESCALATION_DELAYS[index]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EscalationRecord {
    attempts: u32,
    last: DateTime<Utc>,
}

/// Escalation schedule per rig and Polecat.
#[derive(Debug, Default)]
pub struct EscalationTracker {
    rigs: HashMap<String, HashMap<String, EscalationRecord>>,
}

impl EscalationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an escalation at `now` if one is due and returns its attempt
    /// number.
    pub fn try_escalate(&mut self, rig: &str, polecat: &str, now: DateTime<Utc>) -> Option<u32> {
        let records = self.rigs.entry(rig.to_string()).or_default();
        match records.get_mut(polecat) {
            None => {
                records.insert(polecat.to_string(), EscalationRecord { attempts: 1, last: now });
                Some(1)
            }
            Some(record) => {
                let waited = (now - record.last).to_std().unwrap_or_default();
                if waited < escalation_delay(record.attempts) {
                    return None;
                }
                record.attempts += 1;
                record.last = now;
                Some(record.attempts)
            }
        }
    }

    /// Restarts the schedule for a healthy Polecat
    pub fn reset(&mut self, rig: &str, polecat: &str) {
        if let Some(records) = self.rigs.get_mut(rig) {
            records.remove(polecat);
        }
    }

    /// Drops every record of a rig
    pub fn forget_rig(&mut self, rig: &str) {
        self.rigs.remove(rig);
    }

    /// Keeps only the records of Polecats that still exist in the rig.
    pub fn retain(&mut self, rig: &str, live: &HashSet<String>) {
        if let Some(records) = self.rigs.get_mut(rig) {
            records.retain(|key, _| live.contains(key));
            if records.is_empty() {
                self.rigs.remove(rig);
            }
        }
    }

    pub fn tracked(&self, rig: &str) -> usize {
        self.rigs.get(rig).map_or(0, HashMap::len)
    }

    pub fn attempts(&self, rig: &str, polecat: &str) -> u32 {
        self.rigs
            .get(rig)
            .and_then(|r| r.get(polecat))
            .map_or(0, |r| r.attempts)
    }
}

/// Delivers escalations to a human or coordinating agent
#[async_trait]
pub trait Escalator: Send + Sync {
    async fn escalate(&self, target: &str, subject: &str, body: &str) -> Result<()>;
}

/// Mail address for an escalation target; `None` means events only
pub fn mail_address(target: &str) -> Option<String> {
    match target.trim() {
        "" | NO_ESCALATION => None,
        "mayor" => Some("mayor/".to_string()),
        other => Some(other.to_string()),
    }
}

/// Escalates through `gt mail send`
pub struct GtMailEscalator {
    tools: Arc<dyn ToolRunner>,
    gt_path: String,
}

impl GtMailEscalator {
    pub fn new(tools: Arc<dyn ToolRunner>, gt_path: impl Into<String>) -> Self {
        Self {
            tools,
            gt_path: gt_path.into(),
        }
    }
}

#[async_trait]
impl Escalator for GtMailEscalator {
    async fn escalate(&self, target: &str, subject: &str, body: &str) -> Result<()> {
        let Some(address) = mail_address(target) else {
            return Ok(());
        };
        let invocation = ToolInvocation::new(
            self.gt_path.clone(),
            ["mail", "send", address.as_str(), "-s", subject, "-m", body],
        );
        self.tools.run(&invocation).await.map(|_| ())
    }
}

/// State shared by Witness reconciles
pub struct WitnessState {
    pub tracker: Mutex<EscalationTracker>,
    pub escalator: Arc<dyn Escalator>,
    pub http: reqwest::Client,
}

impl WitnessState {
    pub fn new(escalator: Arc<dyn Escalator>) -> Self {
        Self {
            tracker: Mutex::new(EscalationTracker::new()),
            escalator,
            http: reqwest::Client::new(),
        }
    }

    fn tracker(&self) -> std::sync::MutexGuard<'_, EscalationTracker> {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Health of one Polecat as seen by a check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Running,
    Succeeded,
    Failed,
    Stuck,
    /// Idle or terminated; counted in the total only
    Inactive,
}

/// Classifies a Polecat. Only Working (or already Stuck) Polecats can be
/// stuck, and only when their last activity is known and older than the
/// threshold.
pub fn classify(
    phase: PolecatPhase,
    last_activity: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    threshold: Duration,
) -> Health {
    match phase {
        PolecatPhase::Done => Health::Succeeded,
        PolecatPhase::Failed => Health::Failed,
        PolecatPhase::Working | PolecatPhase::Stuck => match last_activity {
            Some(at) if (now - at).to_std().unwrap_or_default() > threshold => Health::Stuck,
            _ => Health::Running,
        },
        PolecatPhase::Idle | PolecatPhase::Terminated => Health::Inactive,
    }
}

pub fn summarize(health: &[Health]) -> PolecatsSummary {
    let count = |h: Health| health.iter().filter(|x| **x == h).count() as i32;
    PolecatsSummary {
        total: health.len() as i32,
        running: count(Health::Running),
        succeeded: count(Health::Succeeded),
        failed: count(Health::Failed),
        stuck: count(Health::Stuck),
    }
}

/// Extracts the activity timestamp (Unix seconds) from Prometheus text
pub fn parse_activity(body: &str) -> Option<DateTime<Utc>> {
    body.lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#'))
        .find_map(|line| {
            let (name, value) = line.split_once(char::is_whitespace)?;
            let name = name.split('{').next()?;
            if name != ACTIVITY_METRIC {
                return None;
            }
            let seconds: f64 = value.trim().split_whitespace().next()?.parse().ok()?;
            if !seconds.is_finite() || seconds <= 0.0 {
                return None;
            }
            Utc.timestamp_opt(seconds as i64, 0).single()
        })
}

async fn scrape_activity(http: &reqwest::Client, pod: &Pod, port: i32) -> Option<DateTime<Utc>> {
    let ip = pod.status.as_ref()?.pod_ip.as_deref()?;
    let url = format!("http://{}:{}/", ip, port);
    let response = http.get(&url).timeout(SCRAPE_TIMEOUT).send().await;
    match response {
        Ok(resp) => match resp.text().await {
            Ok(body) => parse_activity(&body),
            Err(e) => {
                debug!("Could not read activity from {}: {}", url, e);
                None
            }
        },
        Err(e) => {
            debug!("Activity endpoint {} unreachable: {}", url, e);
            None
        }
    }
}

/// Phase and readiness after a check
pub fn witness_phase(undelivered: usize) -> WitnessPhase {
    if undelivered == 0 {
        WitnessPhase::Active
    } else {
        WitnessPhase::Degraded
    }
}

fn escalation_subject(polecat: &Polecat, health: Health, attempt: u32) -> String {
    let what = match health {
        Health::Failed => "failed",
        _ => "stuck",
    };
    format!(
        "Polecat {}/{} {} (attempt {})",
        polecat.spec.rig,
        polecat.name_any(),
        what,
        attempt
    )
}

fn escalation_body(polecat: &Polecat, last_activity: Option<DateTime<Utc>>) -> String {
    let bead = polecat.spec.bead_id.as_deref().unwrap_or("unassigned");
    let activity = last_activity
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "unknown".to_string());
    format!(
        "polecat: {}\nnamespace: {}\nbead: {}\nlast activity: {}",
        polecat.name_any(),
        polecat.namespace().unwrap_or_default(),
        bead,
        activity
    )
}

async fn reconcile(witness: Arc<Witness>, ctx: Arc<Context<WitnessState>>) -> Result<Action> {
    let started = Instant::now();
    let result = reconcile_inner(&witness, &ctx).await;
    finish(witness.as_ref(), ctx.as_ref(), started, result).await
}

#[instrument(skip_all, fields(witness = %witness.name_any()))]
async fn reconcile_inner(witness: &Witness, ctx: &Context<WitnessState>) -> Result<Action> {
    let name = witness.name_any();
    let rig = witness.spec.rig_ref.clone();
    let witnesses = Witness::api(ctx.client.clone(), witness);

    if witness.meta().deletion_timestamp.is_some() {
        ctx.state.tracker().forget_rig(&rig);
        api::remove_finalizer(&witnesses, witness, CHILD_FINALIZER).await?;
        info!("Released witness {} of rig {}", name, rig);
        return Ok(Action::await_change());
    }

    let interval = humantime::parse_duration(&witness.spec.health_check_interval)
        .map_err(|e| OperatorError::from(e).with_context("field", "healthCheckInterval"))?;
    let threshold = humantime::parse_duration(&witness.spec.stuck_threshold)
        .map_err(|e| OperatorError::from(e).with_context("field", "stuckThreshold"))?;

    let all = Api::<Polecat>::all(ctx.client.clone());
    let polecats: Vec<Polecat> = all
        .list(&ListParams::default())
        .await?
        .items
        .into_iter()
        .filter(|p| p.spec.rig == rig)
        .collect();
    let live: HashSet<String> = polecats.iter().map(escalation_key).collect();
    ctx.state.tracker().retain(&rig, &live);

    let now = super::now();
    let mut health = Vec::with_capacity(polecats.len());
    let mut undelivered = 0;
    for polecat in &polecats {
        let (h, delivered) = check_polecat(witness, polecat, now, threshold, ctx).await?;
        health.push(h);
        if !delivered {
            undelivered += 1;
        }
    }

    let summary = summarize(&health);
    let phase = witness_phase(undelivered);
    debug!("Witness {} checked {} polecats: {:?}", name, summary.total, summary);

    let mut status = WitnessStatus {
        phase,
        last_check_time: Some(now),
        polecats_summary: summary,
        conditions: witness.conditions(),
    };
    let ready = match phase {
        WitnessPhase::Active => condition_for(witness, READY, true, "HealthCheckSucceeded", "monitoring polecats"),
        _ => condition_for(
            witness,
            READY,
            false,
            "EscalationFailed",
            format!("{} escalation(s) could not be delivered", undelivered),
        ),
    };
    conditions::set_condition(&mut status.conditions, ready);
    api::patch_status(&witnesses, &name, &status).await?;
    Ok(Action::requeue(interval))
}

fn escalation_key(polecat: &Polecat) -> String {
    format!("{}/{}", polecat.namespace().unwrap_or_default(), polecat.name_any())
}

/// Checks one Polecat. Returns its health and whether any escalation it
/// needed was delivered.
async fn check_polecat(
    witness: &Witness,
    polecat: &Polecat,
    now: DateTime<Utc>,
    threshold: Duration,
    ctx: &Context<WitnessState>,
) -> Result<(Health, bool)> {
    let name = polecat.name_any();
    let namespace = polecat.namespace().unwrap_or_default();
    let polecats: Api<Polecat> = Api::namespaced(ctx.client.clone(), &namespace);
    let key = escalation_key(polecat);
    let rig = &witness.spec.rig_ref;
    let phase = polecat.phase();
    let recorded = polecat.status.as_ref().and_then(|s| s.last_activity);

    let mut scraped = None;
    if matches!(phase, PolecatPhase::Working | PolecatPhase::Stuck) {
        let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
        let pod_name = polecat
            .status
            .as_ref()
            .and_then(|s| s.pod_name.clone())
            .unwrap_or_else(|| Polecat::pod_name(&name));
        if let Some(pod) = api::get_opt(&pods, &pod_name).await? {
            scraped = scrape_activity(&ctx.state.http, &pod, ctx.settings.pod.metrics_port).await;
        }
    }
    let last_activity = match (scraped, recorded) {
        (Some(s), Some(r)) => Some(s.max(r)),
        (s, r) => s.or(r),
    };
    if let Some(at) = scraped.filter(|s| recorded.map_or(true, |r| *s > r)) {
        let patch = serde_json::json!({ "lastActivity": at });
        api::patch_status(&polecats, &name, &patch).await?;
    }

    let health = classify(phase, last_activity, now, threshold);
    let marked = polecat.annotations().contains_key(STUCK_ANNOTATION);
    match health {
        Health::Stuck if !marked => {
            let since = last_activity.map(|t| t.to_rfc3339()).unwrap_or_default();
            api::patch_annotation(&polecats, &name, STUCK_ANNOTATION, Some(since.as_str())).await?;
            info!("Polecat {} idle since {}; marked stuck", key, since);
        }
        Health::Stuck => {}
        _ if marked => {
            api::patch_annotation(&polecats, &name, STUCK_ANNOTATION, None).await?;
            info!("Polecat {} active again; cleared stuck mark", key);
        }
        _ => {}
    }

    if !matches!(health, Health::Stuck | Health::Failed) {
        ctx.state.tracker().reset(rig, &key);
        return Ok((health, true));
    }

    let attempt = ctx.state.tracker().try_escalate(rig, &key, now);
    let Some(attempt) = attempt else {
        return Ok((health, true));
    };

    let subject = escalation_subject(polecat, health, attempt);
    let body = escalation_body(polecat, last_activity);
    let recorder = Recorder::new(
        ctx.client.clone(),
        ctx.reporter.clone(),
        polecat.object_ref(&()),
    );
    let reason = match health {
        Health::Failed => "PolecatFailed",
        _ => "PolecatStuck",
    };
    publish(&recorder, EventType::Warning, reason, subject.clone()).await;

    let target = witness.spec.escalation_target.as_str();
    metrics::escalations_total().with_label_values(&[target]).inc();
    match ctx.state.escalator.escalate(target, &subject, &body).await {
        Ok(()) => {
            info!("Escalated {} to {} (attempt {})", key, target, attempt);
            Ok((health, true))
        }
        Err(e) => {
            warn!("Escalation of {} to {} failed: {}", key, target, e);
            Ok((health, false))
        }
    }
}

/// Runs the Witness controller until shutdown.
pub async fn run(ctx: Arc<Context<WitnessState>>) {
    let controller = Controller::new(
        Api::<Witness>::all(ctx.client.clone()),
        watcher::Config::default(),
    )
    .shutdown_on_signal();
    let store = controller.store();
    tokio::spawn(maintain(store, ctx.clone(), PHASES));

    info!("Starting Witness controller");
    controller
        .run(reconcile, error_policy::<Witness, WitnessState>, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => trace!("Reconciled witness {}", obj.name),
                Err(e) => debug!("Witness reconcile error: {}", e),
            }
        })
        .await;
}
