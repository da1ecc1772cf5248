/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

use async_trait::async_trait;
use gastown_operator::error::Result;
use gastown_operator::merge_queue::{
    apply_conflict_action, next_batch, ConflictAction, GitOps, MergePolicy, MergeProcessor,
    RebaseOutcome, TestOutcome,
};
use gastown_models::{ConflictResolution, MergeStrategy, QueueItem, QueueItemState};
use std::sync::Mutex;

/// Git double whose rebase always conflicts on the listed branches
#[derive(Default)]
struct ConflictingGit {
    conflicted: Vec<String>,
    pushes: Mutex<u32>,
}

#[async_trait]
impl GitOps for ConflictingGit {
    async fn prepare(&self, _target: &str) -> Result<()> {
        Ok(())
    }

    async fn rebase(&self, branch: &str, _target: &str, _option: Option<&str>) -> Result<RebaseOutcome> {
        if self.conflicted.iter().any(|b| b == branch) {
            Ok(RebaseOutcome::Conflict(vec!["src/lib.rs".to_string()]))
        } else {
            Ok(RebaseOutcome::Rebased)
        }
    }

    async fn test(&self, _command: &str) -> Result<TestOutcome> {
        Ok(TestOutcome::Passed)
    }

    async fn merge(&self, _branch: &str, _target: &str, _strategy: MergeStrategy) -> Result<()> {
        Ok(())
    }

    async fn push(&self, _target: &str) -> Result<()> {
        *self.pushes.lock().unwrap() += 1;
        Ok(())
    }
}

fn policy() -> MergePolicy {
    MergePolicy {
        target_branch: "main".to_string(),
        test_command: None,
        strategy: MergeStrategy::Rebase,
        resolution: ConflictResolution::Manual,
    }
}

/// Processes the queue the way the Refinery does: batch after batch until
/// nothing is left to advance.
async fn drain(git: &ConflictingGit, queue: &mut [QueueItem]) {
    let policy = policy();
    let processor = MergeProcessor::new(git, &policy);
    loop {
        let batch = next_batch(queue, 1);
        if batch.is_empty() {
            return;
        }
        for index in batch {
            let (state, message) = processor.process(&queue[index]).await.unwrap();
            queue[index].state = state;
            queue[index].message = Some(message);
        }
    }
}

#[tokio::test]
async fn test_manual_conflict_halts_queue() {
    let git = ConflictingGit {
        conflicted: vec!["polecat/nux".to_string()],
        ..Default::default()
    };
    let mut queue = vec![
        QueueItem::pending("polecat/furiosa", "furiosa"),
        QueueItem::pending("polecat/nux", "nux"),
        QueueItem::pending("polecat/slit", "slit"),
    ];

    drain(&git, &mut queue).await;

    assert_eq!(queue[0].state, QueueItemState::Merged);
    assert_eq!(queue[1].state, QueueItemState::Conflict);
    assert_eq!(queue[2].state, QueueItemState::Pending);
    assert_eq!(*git.pushes.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_skip_resumes_queue() {
    let git = ConflictingGit {
        conflicted: vec!["polecat/nux".to_string()],
        ..Default::default()
    };
    let mut queue = vec![
        QueueItem::pending("polecat/nux", "nux"),
        QueueItem::pending("polecat/slit", "slit"),
    ];
    drain(&git, &mut queue).await;
    assert_eq!(queue[1].state, QueueItemState::Pending);

    assert!(apply_conflict_action(&mut queue, ConflictAction::Skip));
    drain(&git, &mut queue).await;

    assert_eq!(queue[0].state, QueueItemState::Skipped);
    assert_eq!(queue[1].state, QueueItemState::Merged);
}

#[tokio::test]
async fn test_retry_conflicts_again_while_unresolved() {
    let git = ConflictingGit {
        conflicted: vec!["polecat/nux".to_string()],
        ..Default::default()
    };
    let mut queue = vec![QueueItem::pending("polecat/nux", "nux")];
    drain(&git, &mut queue).await;

    assert!(apply_conflict_action(&mut queue, ConflictAction::Retry));
    assert_eq!(queue[0].state, QueueItemState::Pending);
    drain(&git, &mut queue).await;
    assert_eq!(queue[0].state, QueueItemState::Conflict);
    assert_eq!(*git.pushes.lock().unwrap(), 0);
}
