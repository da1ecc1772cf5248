/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

use gastown_operator::controllers::polecat::{next_step, parse_git_state, Step};
use gastown_models::{CleanupStatus, DesiredState, PolecatPhase};

const PHASES: [PolecatPhase; 6] = [
    PolecatPhase::Idle,
    PolecatPhase::Working,
    PolecatPhase::Done,
    PolecatPhase::Stuck,
    PolecatPhase::Failed,
    PolecatPhase::Terminated,
];

#[test]
fn test_termination_only_with_clean_workspace() {
    let cleanups = [
        None,
        Some(CleanupStatus::Clean),
        Some(CleanupStatus::HasUncommitted),
        Some(CleanupStatus::HasUnpushed),
        Some(CleanupStatus::Unknown),
    ];
    for desired in [DesiredState::Idle, DesiredState::Working, DesiredState::Terminated] {
        for phase in PHASES {
            for pod_exists in [false, true] {
                for has_bead in [false, true] {
                    for cleanup in cleanups {
                        let step = next_step(desired, has_bead, pod_exists, phase, cleanup);
                        if step == Step::Terminate {
                            assert_eq!(desired, DesiredState::Terminated);
                            assert_eq!(cleanup, Some(CleanupStatus::Clean));
                        }
                    }
                }
            }
        }
    }
}

#[test]
fn test_refused_termination_reports_status() {
    assert_eq!(
        next_step(DesiredState::Terminated, true, true, PolecatPhase::Working, None),
        Step::RefuseTermination(CleanupStatus::Unknown)
    );
    assert_eq!(
        next_step(
            DesiredState::Terminated,
            true,
            true,
            PolecatPhase::Done,
            Some(CleanupStatus::HasUnpushed)
        ),
        Step::RefuseTermination(CleanupStatus::HasUnpushed)
    );
}

#[test]
fn test_finished_polecat_is_not_restarted() {
    for phase in [PolecatPhase::Done, PolecatPhase::Failed, PolecatPhase::Terminated] {
        assert_eq!(
            next_step(DesiredState::Working, true, false, phase, None),
            Step::Wait
        );
    }
    assert_eq!(
        next_step(DesiredState::Working, true, false, PolecatPhase::Idle, None),
        Step::CreatePod
    );
}

#[test]
fn test_git_state_must_positively_report_clean() {
    assert_eq!(parse_git_state(r#"{"clean": true}"#), CleanupStatus::Clean);
    assert_eq!(parse_git_state(r#"{}"#), CleanupStatus::Unknown);
    assert_eq!(parse_git_state("not json"), CleanupStatus::Unknown);
    assert_eq!(
        parse_git_state(r#"{"has_uncommitted": true, "clean": true}"#),
        CleanupStatus::HasUncommitted
    );
}
