/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

use chrono::{Duration, TimeZone, Utc};
use gastown_operator::controllers::witness::EscalationTracker;
use std::collections::HashSet;

#[test]
fn test_escalations_back_off_then_cap() {
    let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let mut tracker = EscalationTracker::new();
    let mut fired = Vec::new();
    // one check every 30 seconds for an hour
    for tick in 0..120 {
        let now = start + Duration::seconds(tick * 30);
        if tracker.try_escalate("widgets", "furiosa", now).is_some() {
            fired.push((now - start).num_seconds());
        }
    }
    assert_eq!(&fired[..6], &[0, 60, 180, 420, 900, 1380]);
    assert!(fired.windows(2).skip(4).all(|w| w[1] - w[0] == 480));
}

#[test]
fn test_recovery_restarts_schedule() {
    let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let mut tracker = EscalationTracker::new();
    assert_eq!(tracker.try_escalate("widgets", "furiosa", start), Some(1));
    assert_eq!(tracker.try_escalate("widgets", "furiosa", start + Duration::seconds(60)), Some(2));

    tracker.reset("widgets", "furiosa");
    let later = start + Duration::seconds(90);
    assert_eq!(tracker.try_escalate("widgets", "furiosa", later), Some(1));
    assert_eq!(tracker.try_escalate("widgets", "furiosa", later + Duration::seconds(30)), None);
}

#[test]
fn test_rigs_are_tracked_separately() {
    let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let mut tracker = EscalationTracker::new();
    tracker.try_escalate("widgets", "furiosa", now);
    tracker.try_escalate("gadgets", "furiosa", now);
    tracker.forget_rig("widgets");
    assert_eq!(tracker.attempts("widgets", "furiosa"), 0);
    assert_eq!(tracker.attempts("gadgets", "furiosa"), 1);
}

#[test]
fn test_deleted_polecats_are_pruned_between_passes() {
    let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let mut tracker = EscalationTracker::new();
    // a stuck polecat escalates, then is deleted before it recovers
    assert_eq!(tracker.try_escalate("widgets", "gastown/furiosa", start), Some(1));
    assert_eq!(tracker.try_escalate("widgets", "gastown/nux", start), Some(1));

    let live: HashSet<String> = ["gastown/nux".to_string()].into_iter().collect();
    tracker.retain("widgets", &live);
    assert_eq!(tracker.tracked("widgets"), 1);
    assert_eq!(tracker.attempts("widgets", "gastown/furiosa"), 0);

    // a new polecat reusing the name starts a fresh schedule
    let later = start + Duration::seconds(30);
    assert_eq!(tracker.try_escalate("widgets", "gastown/furiosa", later), Some(1));
}
