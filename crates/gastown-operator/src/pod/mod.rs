/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

//! # Execution Environment Builder
//!
//! Synthesizes the single Pod that runs a Polecat:
//!
//! ```text
//! initContainers:
//!   git-init    clone repository, create work branch (fails on unknown SSH host)
//!   telemetry   native sidecar serving activity metrics on the metrics port
//! containers:
//!   agent       copy credentials, run the coding agent, report git state
//! ```
//!
//! [`build_pod`] is a pure function of the Polecat and operator settings so
//! that the result can be inspected in tests without a cluster.

pub mod agents;
pub mod known_hosts;
pub mod scripts;

use crate::error::{OperatorError, Result};
use agents::backend_for;
use gastown_models::models::{
    label_value, BEAD_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE, POLECAT_LABEL, RIG_LABEL,
};
use gastown_models::Polecat;
use gastown_utils::config::{PodDefaults, Ssh};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource, Pod,
    PodSecurityContext, PodSpec, ResourceRequirements, SeccompProfile, SecretKeySelector,
    SecretVolumeSource, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use known_hosts::HostVerification;
use kube::{Resource, ResourceExt};
use scripts::{
    AgentScript, InitScript, SidecarScript, AGENT_CREDS_DIR, GIT_SECRET_DIR, HOME_DIR,
    METRICS_DIR, WORKSPACE_DIR,
};
use std::collections::BTreeMap;

pub const INIT_CONTAINER: &str = "git-init";
pub const AGENT_CONTAINER: &str = "agent";
pub const SIDECAR_CONTAINER: &str = "telemetry";

const SIDECAR_INTERVAL_SECONDS: u32 = 15;
const UNASSIGNED_BEAD: &str = "unassigned";

/// Labels identifying a polecat pod
pub fn pod_labels(rig: &str, polecat: &str, bead: Option<&str>) -> BTreeMap<String, String> {
    BTreeMap::from([
        (RIG_LABEL.to_string(), label_value(rig)),
        (POLECAT_LABEL.to_string(), label_value(polecat)),
        (
            BEAD_LABEL.to_string(),
            bead.filter(|b| !b.is_empty())
                .map(label_value)
                .unwrap_or_else(|| UNASSIGNED_BEAD.to_string()),
        ),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
    ])
}

fn quantities(cpu: &str, memory: &str) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("cpu".to_string(), Quantity(cpu.to_string())),
        ("memory".to_string(), Quantity(memory.to_string())),
    ])
}

fn resources(requests: (&str, &str), limits: (&str, &str)) -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(quantities(requests.0, requests.1)),
        limits: Some(quantities(limits.0, limits.1)),
        ..Default::default()
    }
}

pub fn default_agent_resources() -> ResourceRequirements {
    resources(("500m", "1Gi"), ("2", "4Gi"))
}

pub fn default_init_resources() -> ResourceRequirements {
    resources(("100m", "128Mi"), ("500m", "512Mi"))
}

pub fn default_sidecar_resources() -> ResourceRequirements {
    resources(("10m", "16Mi"), ("50m", "32Mi"))
}

fn container_security() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        run_as_non_root: Some(true),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            add: None,
        }),
        ..Default::default()
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}

fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: read_only.then_some(true),
        ..Default::default()
    }
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn secret_volume(name: &str, secret: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            default_mode: Some(0o440),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Builds the Pod for a Polecat.
///
/// Fails with a validation error when the Polecat lacks the metadata an owner
/// reference needs or names no repository.
pub fn build_pod(polecat: &Polecat, defaults: &PodDefaults, ssh: &Ssh) -> Result<Pod> {
    let name = polecat.name_any();
    let namespace = polecat
        .namespace()
        .ok_or_else(|| OperatorError::validation(format!("polecat {} has no namespace", name)))?;
    let owner = polecat.controller_owner_ref(&()).ok_or_else(|| {
        OperatorError::validation(format!("polecat {} has no uid for an owner reference", name))
    })?;

    let spec = &polecat.spec;
    let k8s = &spec.kubernetes;
    if k8s.git_repository.trim().is_empty() {
        return Err(OperatorError::validation(format!(
            "polecat {} has an empty gitRepository",
            name
        )));
    }

    let backend = backend_for(spec.agent_type);
    let work_branch = polecat.work_branch(&name);
    let hosts = known_hosts::resolve(&k8s.git_repository, &ssh.known_hosts);
    let uses_ssh = matches!(hosts, HostVerification::Known { .. });
    let prompt = scripts::prompt_for(spec.bead_id.as_deref(), spec.task_description.as_deref());

    let init_script = scripts::init_script(&InitScript {
        repository: &k8s.git_repository,
        base_branch: &k8s.git_branch,
        work_branch: &work_branch,
        hosts: &hosts,
    });
    let agent_script = scripts::agent_script(&AgentScript {
        backend,
        prompt: &prompt,
        base_branch: &k8s.git_branch,
        work_branch: &work_branch,
        git_user_name: &defaults.git_user_name,
        git_user_email: &defaults.git_user_email,
    });
    let sidecar_script = scripts::sidecar_script(&SidecarScript {
        agent_binary: backend.binary(),
        port: defaults.metrics_port,
        interval_seconds: SIDECAR_INTERVAL_SECONDS,
    });

    let mut volumes = vec![
        empty_dir("workspace"),
        empty_dir("home"),
        empty_dir("metrics"),
        secret_volume("git-secret", &k8s.git_secret_ref.name),
    ];
    if let Some(creds) = &k8s.claude_creds_secret_ref {
        volumes.push(secret_volume("agent-creds", &creds.name));
    }

    let mut init_mounts = vec![
        mount("workspace", WORKSPACE_DIR, false),
        mount("home", HOME_DIR, false),
    ];
    if uses_ssh {
        init_mounts.push(mount("git-secret", GIT_SECRET_DIR, true));
    }

    let base_env = vec![
        env("HOME", HOME_DIR),
        env("GT_RIG", spec.rig.clone()),
        env("GT_POLECAT", name.clone()),
    ];

    let init = Container {
        name: INIT_CONTAINER.to_string(),
        image: Some(defaults.init_image.clone()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string(), init_script]),
        env: Some(base_env.clone()),
        volume_mounts: Some(init_mounts),
        resources: Some(default_init_resources()),
        security_context: Some(container_security()),
        ..Default::default()
    };

    let sidecar = Container {
        name: SIDECAR_CONTAINER.to_string(),
        image: Some(defaults.sidecar_image.clone()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string(), sidecar_script]),
        restart_policy: Some("Always".to_string()),
        ports: Some(vec![ContainerPort {
            name: Some("metrics".to_string()),
            container_port: defaults.metrics_port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![
            mount("workspace", WORKSPACE_DIR, true),
            mount("metrics", METRICS_DIR, false),
        ]),
        resources: Some(default_sidecar_resources()),
        security_context: Some(container_security()),
        ..Default::default()
    };

    let mut agent_env = base_env;
    if let Some(bead) = spec.bead_id.as_deref() {
        agent_env.push(env("GT_BEAD", bead));
    }
    if let Some(key_ref) = &k8s.api_key_secret_ref {
        agent_env.push(EnvVar {
            name: backend.api_key_env().to_string(),
            value: None,
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: key_ref.name.clone(),
                    key: key_ref.key.clone(),
                    optional: Some(false),
                }),
                ..Default::default()
            }),
        });
    }

    let mut agent_mounts = vec![
        mount("workspace", WORKSPACE_DIR, false),
        mount("home", HOME_DIR, false),
    ];
    if k8s.claude_creds_secret_ref.is_some() {
        agent_mounts.push(mount("agent-creds", AGENT_CREDS_DIR, true));
    }

    let agent = Container {
        name: AGENT_CONTAINER.to_string(),
        image: Some(k8s.image.clone().unwrap_or_else(|| defaults.agent_image.clone())),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string(), agent_script]),
        working_dir: Some(scripts::REPO_DIR.to_string()),
        env: Some(agent_env),
        volume_mounts: Some(agent_mounts),
        resources: Some(k8s.resources.clone().unwrap_or_else(default_agent_resources)),
        security_context: Some(container_security()),
        termination_message_path: Some(scripts::TERMINATION_LOG.to_string()),
        termination_message_policy: Some("File".to_string()),
        ..Default::default()
    };

    let annotations = BTreeMap::from([
        ("prometheus.io/scrape".to_string(), "true".to_string()),
        ("prometheus.io/port".to_string(), defaults.metrics_port.to_string()),
    ]);

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(Polecat::pod_name(&name)),
            namespace: Some(namespace),
            labels: Some(pod_labels(&spec.rig, &name, spec.bead_id.as_deref())),
            annotations: Some(annotations),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            share_process_namespace: Some(true),
            active_deadline_seconds: Some(
                k8s.active_deadline_seconds
                    .unwrap_or(defaults.active_deadline_seconds),
            ),
            security_context: Some(PodSecurityContext {
                run_as_non_root: Some(true),
                run_as_user: Some(defaults.run_as_user),
                run_as_group: Some(defaults.run_as_group),
                fs_group: Some(defaults.fs_group),
                seccomp_profile: Some(SeccompProfile {
                    type_: "RuntimeDefault".to_string(),
                    localhost_profile: None,
                }),
                ..Default::default()
            }),
            init_containers: Some(vec![init, sidecar]),
            containers: vec![agent],
            volumes: Some(volumes),
            ..Default::default()
        }),
        status: None,
    })
}
