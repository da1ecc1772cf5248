/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

//! # Kubernetes API Module
//!
//! Thin helpers over `kube::Api` used by every controller.
//!
//! ## Client Creation
//! ```rust,ignore
//! pub async fn create_k8s_client(kubeconfig_path: Option<&str>) -> Result<Client, Box<dyn Error>>
//! ```
//! Creates a client from in-cluster config or the given kubeconfig and
//! verifies connectivity.
//!
//! ## Retries
//!
//! Individual API calls are retried inline with exponential backoff when the
//! failure is transient (429, 5xx, transport). Everything else is returned
//! to the reconciler, whose requeue schedule is owned by the
//! [`BackoffService`](crate::retry::BackoffService).
//!
//! ## Writes
//!
//! - Pod creation treats `409 AlreadyExists` as success
//! - deletes treat `404` as success
//! - status and metadata changes are JSON merge patches; finalizer patches
//!   carry the object's `resourceVersion` so concurrent writers conflict

use crate::error::{classify_kube, ErrorKind, OperatorError, Result};
use backoff::ExponentialBackoffBuilder;
use gastown_utils::telemetry::prelude::*;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::fmt::Debug;
use std::time::Duration;

/// Retry configuration for Kubernetes operations
pub struct RetryConfig {
    max_elapsed_time: Duration,
    initial_interval: Duration,
    max_interval: Duration,
    multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_elapsed_time: Duration::from_secs(30),
            initial_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

/// Determines if a Kubernetes error is worth retrying inline
fn is_retryable_error(error: &kube::Error) -> bool {
    classify_kube(error) == ErrorKind::Transient
}

/// Executes a Kubernetes operation with retries
pub async fn with_retries<F, Fut, T>(operation: F, config: RetryConfig) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, kube::Error>>,
{
    let backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(config.initial_interval)
        .with_max_interval(config.max_interval)
        .with_multiplier(config.multiplier)
        .with_max_elapsed_time(Some(config.max_elapsed_time))
        .build();

    let operation_with_backoff = || async {
        match operation().await {
            Ok(value) => Ok(value),
            Err(error) => {
                if is_retryable_error(&error) {
                    warn!("Retryable error encountered: {}", error);
                    Err(backoff::Error::Transient {
                        err: error,
                        retry_after: None,
                    })
                } else {
                    debug!("Non-retryable error encountered: {}", error);
                    Err(backoff::Error::Permanent(error))
                }
            }
        }
    };

    backoff::future::retry(backoff, operation_with_backoff)
        .await
        .map_err(OperatorError::from)
}

/// Creates a Kubernetes client, preferring an explicit kubeconfig path.
pub async fn create_k8s_client(
    kubeconfig_path: Option<&str>,
) -> std::result::Result<Client, Box<dyn std::error::Error>> {
    // Set KUBECONFIG environment variable if path is provided
    if let Some(path) = kubeconfig_path {
        std::env::set_var("KUBECONFIG", path);
    }

    let client = Client::try_default()
        .await
        .map_err(|e| format!("Failed to create Kubernetes client: {}", e))?;

    // Verify cluster connectivity by attempting to list namespaces
    let ns_api = Api::<Namespace>::all(client.clone());
    ns_api
        .list(&Default::default())
        .await
        .map_err(|e| format!("Failed to connect to Kubernetes cluster: {}", e))?;

    info!("Successfully connected to Kubernetes cluster");
    Ok(client)
}

/// Fetches an object, mapping 404 to `None`.
pub async fn get_opt<K>(api: &Api<K>, name: &str) -> Result<Option<K>>
where
    K: Clone + DeserializeOwned + Debug,
{
    let api = api.clone();
    let name = name.to_string();
    with_retries(
        move || {
            let api = api.clone();
            let name = name.clone();
            async move { api.get_opt(&name).await }
        },
        RetryConfig::default(),
    )
    .await
}

/// Creates a Pod. An existing Pod with the same name counts as success and
/// is returned instead.
pub async fn create_pod(api: &Api<Pod>, pod: &Pod) -> Result<Pod> {
    let name = pod.name_any();
    let create = {
        let api = api.clone();
        let pod = pod.clone();
        with_retries(
            move || {
                let api = api.clone();
                let pod = pod.clone();
                async move { api.create(&PostParams::default(), &pod).await }
            },
            RetryConfig::default(),
        )
        .await
    };
    match create {
        Ok(created) => {
            info!("Created pod {}", name);
            Ok(created)
        }
        Err(e) if e.is_conflict() => {
            debug!("Pod {} already exists", name);
            let existing = get_opt(api, &name)
                .await?
                .ok_or_else(|| OperatorError::transient(format!("pod {} vanished after conflict", name)))?;
            if !same_controller(&existing, pod) {
                return Err(OperatorError::permanent(format!(
                    "pod {} exists but is controlled by another object",
                    name
                )));
            }
            Ok(existing)
        }
        Err(e) => Err(e.with_context("pod", &name).at()),
    }
}

fn controller_uid(pod: &Pod) -> Option<&str> {
    pod.owner_references()
        .iter()
        .find(|o| o.controller == Some(true))
        .map(|o| o.uid.as_str())
}

/// True when both Pods name the same controlling owner
pub fn same_controller(existing: &Pod, desired: &Pod) -> bool {
    match (controller_uid(existing), controller_uid(desired)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// True when `pod` is controlled by the object with `uid`
pub fn controlled_by(pod: &Pod, uid: Option<&str>) -> bool {
    uid.is_some() && controller_uid(pod) == uid
}

/// Deletes an object; a missing object counts as deleted.
pub async fn delete_ignore_missing<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
        Err(e) => Err(OperatorError::from(e).with_context("name", name)),
    }
}

/// Merge-patches the status subresource.
pub async fn patch_status<K, S>(api: &Api<K>, name: &str, status: &S) -> Result<K>
where
    K: Clone + DeserializeOwned + Debug,
    S: Serialize,
{
    let patch = json!({ "status": status });
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|e| OperatorError::from(e).with_context("name", name))
}

/// Sets (`Some`) or removes (`None`) a single annotation.
pub async fn patch_annotation<K>(
    api: &Api<K>,
    name: &str,
    key: &str,
    value: Option<&str>,
) -> Result<K>
where
    K: Clone + DeserializeOwned + Debug,
{
    let patch = json!({ "metadata": { "annotations": { key: value } } });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|e| OperatorError::from(e).with_context("name", name))
}

async fn patch_finalizers<K>(api: &Api<K>, obj: &K, finalizers: Vec<String>) -> Result<K>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let name = obj.name_any();
    let patch = json!({
        "metadata": {
            "resourceVersion": obj.resource_version(),
            "finalizers": finalizers,
        }
    });
    api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|e| OperatorError::from(e).with_context("name", &name))
}

pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Adds a finalizer if missing. Returns the patched object when changed.
pub async fn add_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<Option<K>>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    if has_finalizer(obj, finalizer) {
        return Ok(None);
    }
    let mut finalizers = obj.finalizers().to_vec();
    finalizers.push(finalizer.to_string());
    patch_finalizers(api, obj, finalizers).await.map(Some)
}

/// Removes a finalizer if present. A 404 means the object is already gone.
pub async fn remove_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    if !has_finalizer(obj, finalizer) {
        return Ok(());
    }
    let finalizers: Vec<String> = obj
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != finalizer)
        .cloned()
        .collect();
    match patch_finalizers(api, obj, finalizers).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}
