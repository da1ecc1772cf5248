/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

//! # Merge Queue
//!
//! Queue bookkeeping and the per-item merge procedure used by the Refinery
//! controller.
//!
//! ## Item Flow
//!
//! ```text
//! 1. Refresh the checkout of the target branch
//! 2. Rebase the work branch onto it
//! 3. Run the validation command, if any
//! 4. Merge with the configured strategy
//! 5. Push the target branch
//! ```
//!
//! A rebase conflict under `manual` resolution halts the queue at that item
//! until an operator asks for `retry` or `skip`. `theirs` and `ours` retry
//! the rebase once with the matching `-X` strategy option.
//!
//! All git access goes through [`GitOps`]; [`GitCli`] implements it on top of
//! the [`ToolRunner`].

use crate::error::{ErrorKind, OperatorError, Result};
use crate::tools::{ToolInvocation, ToolRunner};
use async_trait::async_trait;
use gastown_models::models::refinery::MergesSummary;
use gastown_models::{
    ConflictResolution, MergeStrategy, Polecat, PolecatPhase, QueueItem, QueueItemState,
};
use gastown_utils::telemetry::prelude::*;
use kube::ResourceExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Result of rebasing a work branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebaseOutcome {
    Rebased,
    /// Rebase stopped on conflicts in these paths and was aborted
    Conflict(Vec<String>),
}

/// Result of the validation command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    Passed,
    Failed(String),
}

#[async_trait]
pub trait GitOps: Send + Sync {
    /// Brings the local checkout of `target` up to date with the remote
    async fn prepare(&self, target: &str) -> Result<()>;

    /// Rebases `branch` onto the remote `target`, optionally with a
    /// strategy option (`theirs`/`ours`)
    async fn rebase(&self, branch: &str, target: &str, option: Option<&str>) -> Result<RebaseOutcome>;

    /// Runs `command` in the rebased checkout
    async fn test(&self, command: &str) -> Result<TestOutcome>;

    /// Merges the rebased `branch` into `target`
    async fn merge(&self, branch: &str, target: &str, strategy: MergeStrategy) -> Result<()>;

    async fn push(&self, target: &str) -> Result<()>;
}

/// Operator action on a halted queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictAction {
    Retry,
    Skip,
}

impl ConflictAction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "retry" => Some(ConflictAction::Retry),
            "skip" => Some(ConflictAction::Skip),
            _ => None,
        }
    }
}

/// Index of the conflicted item blocking the queue, if any
pub fn halted_at(queue: &[QueueItem]) -> Option<usize> {
    queue.iter().position(|i| i.state == QueueItemState::Conflict)
}

/// Applies an operator action to the blocking item. Returns false when the
/// queue was not halted.
pub fn apply_conflict_action(queue: &mut [QueueItem], action: ConflictAction) -> bool {
    let Some(index) = halted_at(queue) else {
        return false;
    };
    let item = &mut queue[index];
    match action {
        ConflictAction::Retry => {
            item.state = QueueItemState::Pending;
            item.message = Some("retry requested".to_string());
        }
        ConflictAction::Skip => {
            item.state = QueueItemState::Skipped;
            item.message = Some("skipped by operator".to_string());
        }
    }
    true
}

/// Adds a Pending item for every Done Polecat with a branch that is not yet
/// queued, and drops finished items whose Polecat no longer exists.
pub fn sync_queue(queue: &mut Vec<QueueItem>, polecats: &[Polecat]) -> usize {
    queue.retain(|item| {
        !is_finished(item.state) || polecats.iter().any(|p| p.name_any() == item.polecat)
    });

    let mut done: Vec<(&Polecat, &str)> = polecats
        .iter()
        .filter(|p| p.phase() == PolecatPhase::Done)
        .filter_map(|p| {
            let branch = p.status.as_ref()?.branch.as_deref()?;
            (!branch.is_empty()).then_some((p, branch))
        })
        .collect();
    done.sort_by_key(|(p, _)| (p.status.as_ref().and_then(|s| s.last_activity), p.name_any()));

    let mut added = 0;
    for (polecat, branch) in done {
        if queue.iter().any(|i| i.branch == branch) {
            continue;
        }
        queue.push(QueueItem::pending(branch, &polecat.name_any()));
        added += 1;
    }
    added
}

fn is_finished(state: QueueItemState) -> bool {
    matches!(
        state,
        QueueItemState::Merged | QueueItemState::Failed | QueueItemState::Skipped
    )
}

/// Items to advance in this pass: up to `parallelism` Pending items, none
/// while the queue is halted.
pub fn next_batch(queue: &[QueueItem], parallelism: i32) -> Vec<usize> {
    if halted_at(queue).is_some() {
        return Vec::new();
    }
    queue
        .iter()
        .enumerate()
        .filter(|(_, i)| matches!(i.state, QueueItemState::Pending | QueueItemState::Merging))
        .map(|(index, _)| index)
        .take(parallelism.max(1) as usize)
        .collect()
}

pub fn summarize(queue: &[QueueItem]) -> MergesSummary {
    let count = |f: &dyn Fn(QueueItemState) -> bool| queue.iter().filter(|i| f(i.state)).count() as i32;
    MergesSummary {
        total: queue.len() as i32,
        succeeded: count(&|s| s == QueueItemState::Merged),
        failed: count(&|s| s == QueueItemState::Failed),
        pending: count(&|s| {
            matches!(
                s,
                QueueItemState::Pending | QueueItemState::Merging | QueueItemState::Conflict
            )
        }),
    }
}

/// Settings for one merge
#[derive(Debug, Clone)]
pub struct MergePolicy {
    pub target_branch: String,
    pub test_command: Option<String>,
    pub strategy: MergeStrategy,
    pub resolution: ConflictResolution,
}

/// Runs the merge procedure for queue items.
pub struct MergeProcessor<'a> {
    git: &'a dyn GitOps,
    policy: &'a MergePolicy,
}

impl<'a> MergeProcessor<'a> {
    pub fn new(git: &'a dyn GitOps, policy: &'a MergePolicy) -> Self {
        Self { git, policy }
    }

    /// Processes one item and returns its final state and message.
    ///
    /// Errors from git plumbing (fetch, push, transport) are returned as
    /// errors and leave the item Pending for the next pass.
    pub async fn process(&self, item: &QueueItem) -> Result<(QueueItemState, String)> {
        let target = self.policy.target_branch.as_str();
        self.git.prepare(target).await?;

        match self.git.rebase(&item.branch, target, None).await? {
            RebaseOutcome::Rebased => {}
            RebaseOutcome::Conflict(paths) => {
                let option = match self.policy.resolution {
                    ConflictResolution::Manual => {
                        return Ok((QueueItemState::Conflict, conflict_message(&paths)));
                    }
                    ConflictResolution::Theirs => "theirs",
                    ConflictResolution::Ours => "ours",
                };
                info!("Retrying rebase of {} with -X {}", item.branch, option);
                self.git.prepare(target).await?;
                if let RebaseOutcome::Conflict(paths) =
                    self.git.rebase(&item.branch, target, Some(option)).await?
                {
                    return Ok((QueueItemState::Conflict, conflict_message(&paths)));
                }
            }
        }

        if let Some(command) = self.policy.test_command.as_deref().filter(|c| !c.trim().is_empty()) {
            if let TestOutcome::Failed(output) = self.git.test(command).await? {
                return Ok((QueueItemState::Failed, format!("validation failed: {}", output)));
            }
        }

        match self.git.merge(&item.branch, target, self.policy.strategy).await {
            Ok(()) => {}
            Err(e) if e.kind == ErrorKind::ExternalTool => {
                return Ok((QueueItemState::Failed, format!("merge failed: {}", e.message)));
            }
            Err(e) => return Err(e),
        }
        self.git.push(target).await?;
        Ok((QueueItemState::Merged, format!("merged into {}", target)))
    }
}

fn conflict_message(paths: &[String]) -> String {
    if paths.is_empty() {
        "rebase conflict".to_string()
    } else {
        format!("rebase conflict in {}", paths.join(", "))
    }
}

/// [`GitOps`] over the `git` CLI in a per-refinery checkout.
pub struct GitCli {
    tools: Arc<dyn ToolRunner>,
    git: String,
    remote: String,
    dir: PathBuf,
    identity: (String, String),
    ssh_command: Option<String>,
}

impl GitCli {
    pub fn new(
        tools: Arc<dyn ToolRunner>,
        git: impl Into<String>,
        remote: impl Into<String>,
        dir: impl Into<PathBuf>,
        identity: (String, String),
    ) -> Self {
        Self {
            tools,
            git: git.into(),
            remote: remote.into(),
            dir: dir.into(),
            identity,
            ssh_command: None,
        }
    }

    /// Uses `ssh` with this key and known_hosts file, host keys enforced
    pub fn with_ssh(mut self, key: &Path, known_hosts: &Path) -> Self {
        self.ssh_command = Some(format!(
            "ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=yes -o UserKnownHostsFile={}",
            key.display(),
            known_hosts.display()
        ));
        self
    }

    fn invocation<I, S>(&self, args: I) -> ToolInvocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut all = vec![
            "-c".to_string(),
            format!("user.name={}", self.identity.0),
            "-c".to_string(),
            format!("user.email={}", self.identity.1),
        ];
        all.extend(args.into_iter().map(Into::into));
        let mut invocation = ToolInvocation::new(self.git.clone(), all)
            .in_dir(&self.dir)
            .env("GIT_TERMINAL_PROMPT", "0");
        if let Some(ssh) = &self.ssh_command {
            invocation = invocation.env("GIT_SSH_COMMAND", ssh.clone());
        }
        invocation
    }

    async fn git<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let output = self.tools.run(&self.invocation(args)).await?;
        Ok(output.stdout)
    }

    async fn conflicted_paths(&self) -> Vec<String> {
        match self.git(["diff", "--name-only", "--diff-filter=U"]).await {
            Ok(out) => out
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl GitOps for GitCli {
    async fn prepare(&self, target: &str) -> Result<()> {
        if !self.dir.join(".git").exists() {
            if let Some(parent) = self.dir.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    OperatorError::internal(format!(
                        "cannot create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
            let mut clone = ToolInvocation::new(
                self.git.clone(),
                [
                    "clone".to_string(),
                    self.remote.clone(),
                    self.dir.display().to_string(),
                ],
            )
            .env("GIT_TERMINAL_PROMPT", "0");
            if let Some(ssh) = &self.ssh_command {
                clone = clone.env("GIT_SSH_COMMAND", ssh.clone());
            }
            self.tools.run(&clone).await?;
            info!("Cloned {} into {}", self.remote, self.dir.display());
        }
        self.git(["fetch", "origin", "--prune"]).await?;
        let upstream = format!("origin/{}", target);
        self.git(["checkout", "-B", target, upstream.as_str()]).await?;
        self.git(["reset", "--hard", upstream.as_str()]).await?;
        self.git(["clean", "-fdx"]).await?;
        Ok(())
    }

    async fn rebase(&self, branch: &str, target: &str, option: Option<&str>) -> Result<RebaseOutcome> {
        let upstream = format!("origin/{}", branch);
        self.git(["checkout", "-B", branch, upstream.as_str()]).await?;

        let onto = format!("origin/{}", target);
        let mut args = vec!["rebase".to_string()];
        if let Some(option) = option {
            args.push("-X".to_string());
            args.push(option.to_string());
        }
        args.push(onto);
        match self.git(args).await {
            Ok(_) => Ok(RebaseOutcome::Rebased),
            Err(e) => {
                let paths = self.conflicted_paths().await;
                if let Err(abort) = self.git(["rebase", "--abort"]).await {
                    debug!("rebase --abort: {}", abort);
                }
                if paths.is_empty() {
                    Err(e)
                } else {
                    Ok(RebaseOutcome::Conflict(paths))
                }
            }
        }
    }

    async fn test(&self, command: &str) -> Result<TestOutcome> {
        let invocation = ToolInvocation::new("sh", ["-c", command]).in_dir(&self.dir);
        match self.tools.run(&invocation).await {
            Ok(_) => Ok(TestOutcome::Passed),
            Err(e) if e.kind == ErrorKind::ExternalTool => Ok(TestOutcome::Failed(e.message)),
            Err(e) => Err(e),
        }
    }

    async fn merge(&self, branch: &str, target: &str, strategy: MergeStrategy) -> Result<()> {
        self.git(["checkout", target]).await?;
        match strategy {
            MergeStrategy::Rebase => {
                self.git(["merge", "--ff-only", branch]).await?;
            }
            MergeStrategy::Merge => {
                let message = format!("Merge branch '{}'", branch);
                self.git(["merge", "--no-ff", "-m", message.as_str(), branch]).await?;
            }
            MergeStrategy::Squash => {
                self.git(["merge", "--squash", branch]).await?;
                let message = format!("Squash merge of '{}'", branch);
                self.git(["commit", "-m", message.as_str()]).await?;
            }
        }
        Ok(())
    }

    async fn push(&self, target: &str) -> Result<()> {
        self.git(["push", "origin", target]).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolOutput;
    use gastown_models::{PolecatSpec, PolecatStatus};
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeGit {
        conflicts: HashSet<String>,
        /// Branches that still conflict with a strategy option
        hard_conflicts: HashSet<String>,
        failing_tests: bool,
        calls: Mutex<Vec<String>>,
    }

    impl FakeGit {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl GitOps for FakeGit {
        async fn prepare(&self, target: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("prepare {}", target));
            Ok(())
        }

        async fn rebase(&self, branch: &str, _target: &str, option: Option<&str>) -> Result<RebaseOutcome> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("rebase {} {:?}", branch, option));
            let conflicted = match option {
                None => self.conflicts.contains(branch),
                Some(_) => self.hard_conflicts.contains(branch),
            };
            if conflicted {
                Ok(RebaseOutcome::Conflict(vec!["README.md".to_string()]))
            } else {
                Ok(RebaseOutcome::Rebased)
            }
        }

        async fn test(&self, command: &str) -> Result<TestOutcome> {
            self.calls.lock().unwrap().push(format!("test {}", command));
            if self.failing_tests {
                Ok(TestOutcome::Failed("1 failed".to_string()))
            } else {
                Ok(TestOutcome::Passed)
            }
        }

        async fn merge(&self, branch: &str, _target: &str, strategy: MergeStrategy) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("merge {} {:?}", branch, strategy));
            Ok(())
        }

        async fn push(&self, target: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("push {}", target));
            Ok(())
        }
    }

    fn policy(resolution: ConflictResolution, test_command: Option<&str>) -> MergePolicy {
        MergePolicy {
            target_branch: "main".to_string(),
            test_command: test_command.map(str::to_string),
            strategy: MergeStrategy::Rebase,
            resolution,
        }
    }

    fn item(branch: &str, state: QueueItemState) -> QueueItem {
        QueueItem {
            state,
            ..QueueItem::pending(branch, branch.trim_start_matches("polecat/"))
        }
    }

    #[tokio::test]
    async fn test_clean_item_is_merged_and_pushed() {
        let git = FakeGit::default();
        let policy = policy(ConflictResolution::Manual, Some("make test"));
        let (state, _) = MergeProcessor::new(&git, &policy)
            .process(&item("polecat/a", QueueItemState::Pending))
            .await
            .unwrap();
        assert_eq!(state, QueueItemState::Merged);
        assert_eq!(
            git.calls(),
            vec![
                "prepare main",
                "rebase polecat/a None",
                "test make test",
                "merge polecat/a Rebase",
                "push main"
            ]
        );
    }

    #[tokio::test]
    async fn test_manual_conflict_stops_before_merge() {
        let git = FakeGit {
            conflicts: HashSet::from(["polecat/a".to_string()]),
            ..Default::default()
        };
        let policy = policy(ConflictResolution::Manual, None);
        let (state, message) = MergeProcessor::new(&git, &policy)
            .process(&item("polecat/a", QueueItemState::Pending))
            .await
            .unwrap();
        assert_eq!(state, QueueItemState::Conflict);
        assert!(message.contains("README.md"));
        assert!(!git.calls().iter().any(|c| c.starts_with("merge") || c.starts_with("push")));
    }

    #[tokio::test]
    async fn test_theirs_retries_with_strategy_option() {
        let git = FakeGit {
            conflicts: HashSet::from(["polecat/a".to_string()]),
            ..Default::default()
        };
        let policy = policy(ConflictResolution::Theirs, None);
        let (state, _) = MergeProcessor::new(&git, &policy)
            .process(&item("polecat/a", QueueItemState::Pending))
            .await
            .unwrap();
        assert_eq!(state, QueueItemState::Merged);
        assert!(git.calls().contains(&"rebase polecat/a Some(\"theirs\")".to_string()));
    }

    #[tokio::test]
    async fn test_ours_still_conflicting_becomes_conflict() {
        let git = FakeGit {
            conflicts: HashSet::from(["polecat/a".to_string()]),
            hard_conflicts: HashSet::from(["polecat/a".to_string()]),
            ..Default::default()
        };
        let policy = policy(ConflictResolution::Ours, None);
        let (state, _) = MergeProcessor::new(&git, &policy)
            .process(&item("polecat/a", QueueItemState::Pending))
            .await
            .unwrap();
        assert_eq!(state, QueueItemState::Conflict);
    }

    #[tokio::test]
    async fn test_failed_validation_fails_item() {
        let git = FakeGit {
            failing_tests: true,
            ..Default::default()
        };
        let policy = policy(ConflictResolution::Manual, Some("cargo test"));
        let (state, message) = MergeProcessor::new(&git, &policy)
            .process(&item("polecat/a", QueueItemState::Pending))
            .await
            .unwrap();
        assert_eq!(state, QueueItemState::Failed);
        assert!(message.contains("1 failed"));
        assert!(!git.calls().iter().any(|c| c.starts_with("push")));
    }

    #[test]
    fn test_halted_queue_yields_no_batch() {
        let queue = vec![
            item("polecat/a", QueueItemState::Merged),
            item("polecat/b", QueueItemState::Conflict),
            item("polecat/c", QueueItemState::Pending),
        ];
        assert_eq!(halted_at(&queue), Some(1));
        assert!(next_batch(&queue, 3).is_empty());
    }

    #[test]
    fn test_batch_respects_parallelism() {
        let queue = vec![
            item("polecat/a", QueueItemState::Merged),
            item("polecat/b", QueueItemState::Pending),
            item("polecat/c", QueueItemState::Pending),
            item("polecat/d", QueueItemState::Pending),
        ];
        assert_eq!(next_batch(&queue, 1), vec![1]);
        assert_eq!(next_batch(&queue, 2), vec![1, 2]);
        assert_eq!(next_batch(&queue, 0), vec![1]);
    }

    #[test]
    fn test_conflict_actions() {
        let mut queue = vec![
            item("polecat/a", QueueItemState::Conflict),
            item("polecat/b", QueueItemState::Pending),
        ];
        assert!(apply_conflict_action(&mut queue, ConflictAction::Skip));
        assert_eq!(queue[0].state, QueueItemState::Skipped);
        assert_eq!(next_batch(&queue, 1), vec![1]);

        queue[0].state = QueueItemState::Conflict;
        assert!(apply_conflict_action(&mut queue, ConflictAction::Retry));
        assert_eq!(queue[0].state, QueueItemState::Pending);
        assert!(!apply_conflict_action(&mut queue, ConflictAction::Retry));

        assert_eq!(ConflictAction::parse(" Retry "), Some(ConflictAction::Retry));
        assert_eq!(ConflictAction::parse("force"), None);
    }

    fn polecat(name: &str, phase: PolecatPhase, branch: Option<&str>) -> Polecat {
        let spec: PolecatSpec = serde_json::from_value(serde_json::json!({
            "rig": "widgets",
            "kubernetes": {
                "gitRepository": "git@github.com:acme/widgets.git",
                "gitSecretRef": {"name": "git"}
            }
        }))
        .unwrap();
        let mut p = Polecat::new(name, spec);
        p.status = Some(PolecatStatus {
            phase,
            branch: branch.map(str::to_string),
            ..Default::default()
        });
        p
    }

    #[test]
    fn test_sync_queue_discovers_done_branches_once() {
        let polecats = vec![
            polecat("a", PolecatPhase::Done, Some("polecat/a")),
            polecat("b", PolecatPhase::Working, Some("polecat/b")),
            polecat("c", PolecatPhase::Done, None),
        ];
        let mut queue = Vec::new();
        assert_eq!(sync_queue(&mut queue, &polecats), 1);
        assert_eq!(queue[0].branch, "polecat/a");
        assert_eq!(sync_queue(&mut queue, &polecats), 0);

        queue[0].state = QueueItemState::Merged;
        assert_eq!(sync_queue(&mut queue, &polecats), 0);
        assert_eq!(queue.len(), 1);
        sync_queue(&mut queue, &[]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_summary_counts() {
        let queue = vec![
            item("polecat/a", QueueItemState::Merged),
            item("polecat/b", QueueItemState::Failed),
            item("polecat/c", QueueItemState::Conflict),
            item("polecat/d", QueueItemState::Pending),
            item("polecat/e", QueueItemState::Skipped),
        ];
        let summary = summarize(&queue);
        assert_eq!(summary.total, 5);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.pending, 2);
    }

    struct ScriptedRunner {
        calls: Mutex<Vec<ToolInvocation>>,
        fail_on: &'static str,
        diff_output: &'static str,
    }

    #[async_trait]
    impl ToolRunner for ScriptedRunner {
        async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput> {
            self.calls.lock().unwrap().push(invocation.clone());
            if invocation.args.iter().any(|a| a == "--diff-filter=U") {
                return Ok(ToolOutput {
                    stdout: self.diff_output.to_string(),
                    stderr: String::new(),
                });
            }
            if invocation.args.iter().any(|a| a == self.fail_on) {
                return Err(OperatorError::external_tool("git exited 1"));
            }
            Ok(ToolOutput::default())
        }
    }

    #[tokio::test]
    async fn test_git_cli_detects_rebase_conflict() {
        let runner = Arc::new(ScriptedRunner {
            calls: Mutex::new(Vec::new()),
            fail_on: "rebase",
            diff_output: "src/lib.rs\n",
        });
        let git = GitCli::new(
            runner.clone(),
            "git",
            "git@github.com:acme/widgets.git",
            "/tmp/refinery",
            ("Refinery".to_string(), "refinery@example.com".to_string()),
        )
        .with_ssh(Path::new("/tmp/key"), Path::new("/tmp/known_hosts"));

        let outcome = git.rebase("polecat/a", "main", Some("ours")).await.unwrap();
        assert_eq!(outcome, RebaseOutcome::Conflict(vec!["src/lib.rs".to_string()]));

        let calls = runner.calls.lock().unwrap();
        let rebase = calls
            .iter()
            .find(|c| c.args.iter().any(|a| a == "-X"))
            .unwrap();
        assert!(rebase.args.ends_with(&["-X".to_string(), "ours".to_string(), "origin/main".to_string()]));
        assert!(rebase
            .env
            .iter()
            .any(|(k, v)| k == "GIT_SSH_COMMAND" && v.contains("StrictHostKeyChecking=yes")));
        assert!(calls.iter().any(|c| c.args.ends_with(&["rebase".to_string(), "--abort".to_string()])));
    }

    #[tokio::test]
    async fn test_git_cli_rebase_failure_without_conflict_is_error() {
        let runner = Arc::new(ScriptedRunner {
            calls: Mutex::new(Vec::new()),
            fail_on: "rebase",
            diff_output: "",
        });
        let git = GitCli::new(
            runner,
            "git",
            "https://github.com/acme/widgets.git",
            "/tmp/refinery",
            ("Refinery".to_string(), "refinery@example.com".to_string()),
        );
        assert!(git.rebase("polecat/a", "main", None).await.is_err());
    }
}
