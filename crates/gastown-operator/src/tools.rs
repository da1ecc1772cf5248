/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

//! # External Tool Runner
//!
//! Reconcilers shell out to `gt`, `git` and `bd`. Every invocation goes
//! through a [`ToolRunner`] so it is bounded by a timeout, timed into
//! `gastown_tool_call_duration_seconds` and reflected in [`ToolHealth`],
//! which backs the `/readyz` endpoint.

use crate::error::{OperatorError, Result};
use crate::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gastown_utils::telemetry::prelude::*;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Tool observations older than this no longer influence readiness
pub const HEALTH_STALENESS: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ToolInvocation {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Short tool name used as a metric label
    pub fn tool_name(&self) -> String {
        self.program
            .rsplit('/')
            .next()
            .unwrap_or(&self.program)
            .to_string()
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Runs the invocation. Non-zero exit and timeout are `ExternalTool` errors.
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput>;
}

/// Last observed health of the external tools
#[derive(Debug, Default)]
pub struct ToolHealth {
    last: RwLock<Option<(DateTime<Utc>, bool)>>,
}

impl ToolHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, healthy: bool) {
        self.record_at(Utc::now(), healthy);
    }

    pub fn record_at(&self, at: DateTime<Utc>, healthy: bool) {
        let mut last = self.last.write().unwrap_or_else(|p| p.into_inner());
        *last = Some((at, healthy));
    }

    pub fn last_observation(&self) -> Option<(DateTime<Utc>, bool)> {
        *self.last.read().unwrap_or_else(|p| p.into_inner())
    }

    /// Ready unless a recent observation reported the tools unhealthy.
    pub fn is_ready_at(&self, now: DateTime<Utc>) -> bool {
        match self.last_observation() {
            None => true,
            Some((at, healthy)) => {
                let age = now.signed_duration_since(at).to_std().unwrap_or_default();
                age > HEALTH_STALENESS || healthy
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready_at(Utc::now())
    }
}

/// Runs tools as child processes under a timeout
#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Duration,
    health: Arc<ToolHealth>,
}

impl CommandRunner {
    pub fn new(timeout: Duration, health: Arc<ToolHealth>) -> Self {
        Self { timeout, health }
    }

    pub fn health(&self) -> Arc<ToolHealth> {
        self.health.clone()
    }

    /// A non-zero exit still proves the tool is reachable; only timeouts
    /// and spawn failures count against readiness.
    fn observe(&self, tool: &str, result: &str, started: Instant) {
        metrics::tool_call_duration_seconds()
            .with_label_values(&[tool, result])
            .observe(started.elapsed().as_secs_f64());
        self.health.record(matches!(result, "success" | "failed"));
    }
}

#[async_trait]
impl ToolRunner for CommandRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput> {
        let tool = invocation.tool_name();
        let mut command = Command::new(&invocation.program);
        command.args(&invocation.args).kill_on_drop(true);
        if let Some(dir) = &invocation.cwd {
            command.current_dir(dir);
        }
        for (key, value) in &invocation.env {
            command.env(key, value);
        }

        debug!("Running {}", invocation.display());
        let started = Instant::now();
        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Err(_) => {
                self.observe(&tool, "timeout", started);
                return Err(OperatorError::external_tool(format!(
                    "{} timed out after {}s",
                    tool,
                    self.timeout.as_secs()
                ))
                .with_context("tool", &tool));
            }
            Ok(Err(e)) => {
                self.observe(&tool, "spawn_error", started);
                return Err(OperatorError::external_tool(format!(
                    "failed to start {}: {}",
                    tool, e
                ))
                .with_context("tool", &tool)
                .with_source(e));
            }
            Ok(Ok(output)) => output,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            self.observe(&tool, "failed", started);
            warn!("{} exited with {}: {}", tool, output.status, stderr.trim());
            return Err(OperatorError::external_tool(format!(
                "{} exited with {}: {}",
                tool,
                output.status,
                stderr.trim()
            ))
            .with_context("tool", &tool)
            .with_context("args", invocation.args.join(" ")));
        }

        self.observe(&tool, "success", started);
        Ok(ToolOutput { stdout, stderr })
    }
}
