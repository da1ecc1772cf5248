/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

//! # CLI Commands Module
//!
//! ## Startup Sequence
//!
//! ```text
//! load settings -> init telemetry -> connect to cluster -> register metrics
//!   -> serve /healthz /readyz /metrics -> run the six controllers
//! ```
//!
//! Every controller stops on SIGINT/SIGTERM; `start` returns once all of
//! them have drained, flushing pending traces on the way out.

use crate::controllers::{self, witness::GtMailEscalator, witness::WitnessState, Context};
use crate::health::{self, HealthState};
use crate::k8s;
use crate::metrics;
use crate::tools::{CommandRunner, ToolHealth, ToolRunner};
use gastown_models::{BeadStore, Convoy, Polecat, Refinery, Rig, Witness};
use gastown_utils::telemetry::{self, prelude::*};
use gastown_utils::Settings;
use kube::CustomResourceExt;
use std::sync::Arc;
use std::time::Duration;

pub async fn start(config_file: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let settings = Arc::new(Settings::new(config_file)?);
    telemetry::init(
        &settings.telemetry.for_operator(),
        &settings.log.level,
        &settings.log.format,
    )?;
    info!("Starting Gas Town operator");

    info!("Initializing Kubernetes client");
    let client = k8s::api::create_k8s_client(settings.operator.kubeconfig_path.as_deref()).await?;
    metrics::init();

    let tool_health = Arc::new(ToolHealth::new());
    let tools: Arc<dyn ToolRunner> = Arc::new(CommandRunner::new(
        Duration::from_secs(settings.tools.timeout_seconds),
        tool_health.clone(),
    ));

    let health_port = settings.operator.health_port;
    let health_state = HealthState::new(tool_health);
    tokio::spawn(async move {
        if let Err(e) = health::serve(health_state, health_port).await {
            error!("Health server failed: {}", e);
        }
    });

    let context = || Arc::new(Context::new(client.clone(), settings.clone(), tools.clone(), ()));
    let escalator = Arc::new(GtMailEscalator::new(
        tools.clone(),
        settings.tools.gt_path.clone(),
    ));
    let witness_ctx = Arc::new(Context::new(
        client.clone(),
        settings.clone(),
        tools.clone(),
        WitnessState::new(escalator),
    ));

    info!("Starting controllers");
    tokio::join!(
        controllers::rig::run(context()),
        controllers::polecat::run(context()),
        controllers::witness::run(witness_ctx),
        controllers::refinery::run(context()),
        controllers::convoy::run(context()),
        controllers::bead_store::run(context()),
    );

    info!("Controllers stopped; shutting down");
    telemetry::shutdown();
    Ok(())
}

/// Every CRD manifest as one multi-document YAML stream
pub fn crd_manifests() -> Result<String, serde_yaml::Error> {
    let docs = [
        serde_yaml::to_string(&Rig::crd())?,
        serde_yaml::to_string(&Polecat::crd())?,
        serde_yaml::to_string(&Convoy::crd())?,
        serde_yaml::to_string(&Witness::crd())?,
        serde_yaml::to_string(&Refinery::crd())?,
        serde_yaml::to_string(&BeadStore::crd())?,
    ];
    Ok(docs.join("---\n"))
}

pub fn crds() -> Result<(), Box<dyn std::error::Error>> {
    print!("{}", crd_manifests()?);
    Ok(())
}
