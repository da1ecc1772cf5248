/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

//! Coding agent backends runnable in the `agent` container.

use gastown_models::AgentType;

/// What the agent container needs to know about a backend
pub trait AgentBackend: Send + Sync {
    /// Executable looked up on `PATH`
    fn binary(&self) -> &'static str;

    /// Arguments placed between the binary and the prompt
    fn launch_args(&self) -> &'static [&'static str];

    /// Environment variable the API key secret is exposed as
    fn api_key_env(&self) -> &'static str;

    /// Directory under `$HOME` the OAuth credential bundle is copied into
    fn credentials_dir(&self) -> &'static str;
}

pub struct Claude;

impl AgentBackend for Claude {
    fn binary(&self) -> &'static str {
        "claude"
    }

    fn launch_args(&self) -> &'static [&'static str] {
        &["--dangerously-skip-permissions", "--print"]
    }

    fn api_key_env(&self) -> &'static str {
        "ANTHROPIC_API_KEY"
    }

    fn credentials_dir(&self) -> &'static str {
        ".claude"
    }
}

pub struct Codex;

impl AgentBackend for Codex {
    fn binary(&self) -> &'static str {
        "codex"
    }

    fn launch_args(&self) -> &'static [&'static str] {
        &["exec", "--dangerously-bypass-approvals-and-sandbox"]
    }

    fn api_key_env(&self) -> &'static str {
        "OPENAI_API_KEY"
    }

    fn credentials_dir(&self) -> &'static str {
        ".codex"
    }
}

pub fn backend_for(agent: AgentType) -> &'static dyn AgentBackend {
    match agent {
        AgentType::Claude => &Claude,
        AgentType::Codex => &Codex,
    }
}
