/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

use gastown_operator::controllers::rig::{aggregate_readiness, rig_phase};
use gastown_models::{PolecatPhase, RefineryPhase, RigPhase, WitnessPhase};

#[test]
fn test_first_failing_check_wins() {
    let r = aggregate_readiness(Some(WitnessPhase::Pending), Some(RefineryPhase::Error), &[]);
    assert_eq!(r.reason, "WitnessNotReady");
    assert_eq!(rig_phase(&r), RigPhase::Pending);

    let r = aggregate_readiness(Some(WitnessPhase::Active), Some(RefineryPhase::Error), &[]);
    assert_eq!(r.reason, "RefineryError");
    assert_eq!(rig_phase(&r), RigPhase::Degraded);

    let r = aggregate_readiness(
        Some(WitnessPhase::Active),
        Some(RefineryPhase::Idle),
        &[PolecatPhase::Idle, PolecatPhase::Stuck],
    );
    assert_eq!(r.reason, "NoPolecatActivity");
    assert_eq!(rig_phase(&r), RigPhase::Pending);
}

#[test]
fn test_ready_with_active_components() {
    let r = aggregate_readiness(
        Some(WitnessPhase::Active),
        Some(RefineryPhase::Processing),
        &[PolecatPhase::Failed, PolecatPhase::Done],
    );
    assert!(r.ready);
    assert_eq!(r.reason, "AllComponentsReady");
    assert_eq!(rig_phase(&r), RigPhase::Ready);
}

#[test]
fn test_missing_children_are_not_ready() {
    let r = aggregate_readiness(None, None, &[PolecatPhase::Working]);
    assert_eq!(r.reason, "WitnessNotReady");
    let r = aggregate_readiness(Some(WitnessPhase::Active), None, &[PolecatPhase::Working]);
    assert_eq!(r.reason, "RefineryError");
}
