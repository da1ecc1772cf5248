/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

//! # Gas Town Config Module
//! This module provides the configuration framework shared by the operator crates.
//!
//! # Variable Naming Convention
//!
//! - Struct fields use snake_case (e.g., `operator`, `health_port`)
//! - Environment variables use SCREAMING_SNAKE_CASE and are prefixed with "GASTOWN__"
//!   (e.g., `GASTOWN__OPERATOR__HEALTH_PORT`)
//! - Configuration file keys use snake_case (e.g., `operator.health_port`, `log.level`)
//!
//! # Configuration Overriding
//!
//! Values are loaded in the following order (later sources take precedence):
//!
//! 1. Default values from the embedded `default.toml` file
//! 2. Values from an optional external configuration file (if provided)
//! 3. Environment variables
//!
//! # Available Environment Variables
//!
//! - `GASTOWN__LOG__LEVEL`: log level ("trace", "debug", "info", "warn", "error").
//!   Default: "info"
//! - `GASTOWN__LOG__FORMAT`: "text" or "json". Default: "text"
//! - `GASTOWN__OPERATOR__HEALTH_PORT`: port for `/healthz`, `/readyz` and `/metrics`.
//!   Default: 8080
//! - `GASTOWN__OPERATOR__RESYNC_INTERVAL_SECONDS`: periodic requeue of healthy objects.
//!   Default: 300
//! - `GASTOWN__OPERATOR__RIG_NAMESPACE`: namespace for auto-provisioned Witness and
//!   Refinery objects when a Rig does not name one. Default: "gastown-system"
//! - `GASTOWN__BACKOFF__BASE_SECONDS`, `GASTOWN__BACKOFF__MAX_SECONDS`,
//!   `GASTOWN__BACKOFF__MAX_RETRIES`: reconcile retry schedule. Defaults: 5, 300, 10
//! - `GASTOWN__POD__AGENT_IMAGE`, `GASTOWN__POD__INIT_IMAGE`, `GASTOWN__POD__SIDECAR_IMAGE`:
//!   container images for synthesized Polecat pods
//! - `GASTOWN__SSH__KNOWN_HOSTS`: `;`-separated known_hosts lines that take precedence
//!   over the built-in verified host table
//! - `GASTOWN__TOOLS__TIMEOUT_SECONDS`: bound on every external command. Default: 60

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

// Include the default settings file as a string constant
const DEFAULT_SETTINGS: &str = include_str!("../default.toml");

/// Represents the main settings structure for the operator
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Logging configuration
    pub log: Log,
    /// Telemetry configuration
    pub telemetry: Telemetry,
    /// Operator process configuration
    pub operator: Operator,
    /// Reconcile retry schedule
    pub backoff: Backoff,
    /// Polecat pod synthesis defaults
    pub pod: PodDefaults,
    /// SSH host verification
    pub ssh: Ssh,
    /// External command-line tools
    pub tools: Tools,
}

/// Represents the logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Log {
    /// Log level (e.g., "info", "debug", "warn", "error")
    pub level: String,
    /// Log format: "text" for human-readable, "json" for structured JSON
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Represents the telemetry (OpenTelemetry) configuration with operator overrides
#[derive(Debug, Deserialize, Clone)]
pub struct Telemetry {
    /// Whether telemetry is enabled (base default)
    #[serde(default)]
    pub enabled: bool,
    /// OTLP endpoint for trace export (gRPC)
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,
    /// Service name for traces
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Sampling rate (0.0 to 1.0)
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: f64,
    /// Operator-specific overrides
    #[serde(default)]
    pub operator: TelemetryOverride,
}

/// Component-specific telemetry overrides (all fields optional)
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TelemetryOverride {
    pub enabled: Option<bool>,
    pub otlp_endpoint: Option<String>,
    pub service_name: Option<String>,
    pub sampling_rate: Option<f64>,
}

/// Resolved telemetry configuration after merging base with overrides
#[derive(Debug, Clone)]
pub struct ResolvedTelemetry {
    pub enabled: bool,
    pub otlp_endpoint: String,
    pub service_name: String,
    pub sampling_rate: f64,
}

impl Telemetry {
    /// Get resolved telemetry config for the operator (base merged with operator overrides)
    pub fn for_operator(&self) -> ResolvedTelemetry {
        ResolvedTelemetry {
            enabled: self.operator.enabled.unwrap_or(self.enabled),
            otlp_endpoint: self
                .operator
                .otlp_endpoint
                .clone()
                .unwrap_or_else(|| self.otlp_endpoint.clone()),
            service_name: self
                .operator
                .service_name
                .clone()
                .unwrap_or_else(|| self.service_name.clone()),
            sampling_rate: self.operator.sampling_rate.unwrap_or(self.sampling_rate),
        }
    }
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "gastown".to_string()
}

fn default_sampling_rate() -> f64 {
    0.1
}

/// Represents the operator process configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Operator {
    /// Health check and metrics HTTP server port
    pub health_port: u16,
    /// Requeue interval for healthy objects in seconds
    pub resync_interval_seconds: u64,
    /// Namespace for Witness and Refinery children of cluster-scoped Rigs
    pub rig_namespace: String,
    /// Optional kubeconfig path (in-cluster config is used when unset)
    pub kubeconfig_path: Option<String>,
}

/// Represents the reconcile retry schedule
#[derive(Debug, Deserialize, Clone)]
pub struct Backoff {
    /// Delay for the first retry in seconds
    pub base_seconds: u64,
    /// Upper bound for any retry delay in seconds
    pub max_seconds: u64,
    /// Retries after which a resource is left in its degraded state
    pub max_retries: u32,
}

/// Represents the defaults for synthesized Polecat pods
#[derive(Debug, Deserialize, Clone)]
pub struct PodDefaults {
    /// Image for the git clone init container
    pub init_image: String,
    /// Image for the agent container when the Polecat does not name one
    pub agent_image: String,
    /// Image for the telemetry sidecar
    pub sidecar_image: String,
    pub run_as_user: i64,
    pub run_as_group: i64,
    pub fs_group: i64,
    /// Wall-clock bound on a whole pod when the Polecat does not set one
    pub active_deadline_seconds: i64,
    /// Port served by the telemetry sidecar
    pub metrics_port: i32,
    pub git_user_name: String,
    pub git_user_email: String,
}

/// Represents SSH host verification settings
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Ssh {
    /// Operator-supplied known_hosts lines. Entries for a host replace the
    /// built-in verified table for that host.
    #[serde(default)]
    pub known_hosts: Vec<String>,
}

/// Represents the external tools invoked by reconcilers
#[derive(Debug, Deserialize, Clone)]
pub struct Tools {
    /// Path to the `gt` CLI
    pub gt_path: String,
    /// Path to `git`
    pub git_path: String,
    /// Path to the `bd` beads CLI
    pub bd_path: String,
    /// Timeout applied to every external command in seconds
    pub timeout_seconds: u64,
    /// Scratch directory for Refinery clones
    pub workdir: String,
}

impl Settings {
    /// Creates a new `Settings` instance
    ///
    /// # Arguments
    ///
    /// * `file` - An optional path to a configuration file
    ///
    /// # Returns
    ///
    /// Returns a `Result` containing the `Settings` instance or a `ConfigError`
    pub fn new(file: Option<String>) -> Result<Self, ConfigError> {
        // Start with default settings from the embedded TOML file
        let mut s = Config::builder()
            .add_source(File::from_str(DEFAULT_SETTINGS, config::FileFormat::Toml));

        // If a configuration file is provided, add it as a source
        s = match file {
            Some(x) => s.add_source(File::with_name(x.as_str())),
            None => s,
        };

        // Add environment variables as a source, prefixed with "GASTOWN" and using "__" as a separator
        s = s.add_source(
            Environment::with_prefix("GASTOWN")
                .separator("__")
                .try_parsing(true)
                .list_separator(";")
                .with_list_parse_key("ssh.known_hosts"),
        );

        s.build()?.try_deserialize()
    }
}
