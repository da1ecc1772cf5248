/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

use gastown_operator::retry::BackoffService;
use std::collections::HashSet;
use std::time::Duration;

fn service() -> BackoffService {
    BackoffService::new(Duration::from_secs(5), Duration::from_secs(300), 10)
}

#[test]
fn test_delays_grow_and_cap() {
    let backoff = service();
    let delays: Vec<u64> = (0..9)
        .map(|_| backoff.get_backoff_result("gastown/furiosa").delay.as_secs())
        .collect();
    assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 300, 300, 300]);
}

#[test]
fn test_reset_starts_over() {
    let backoff = service();
    for _ in 0..4 {
        backoff.get_backoff_result("gastown/furiosa");
    }
    backoff.reset_retries("gastown/furiosa");
    let next = backoff.get_backoff_result("gastown/furiosa");
    assert_eq!(next.retry_count, 0);
    assert_eq!(next.delay, Duration::from_secs(5));
}

#[test]
fn test_gives_up_after_max_retries() {
    let backoff = service();
    for _ in 0..9 {
        backoff.get_backoff_result("gastown/nux");
    }
    assert!(!backoff.should_give_up("gastown/nux"));
    backoff.get_backoff_result("gastown/nux");
    assert!(backoff.should_give_up("gastown/nux"));
}

#[test]
fn test_cleanup_drops_deleted_objects() {
    let backoff = service();
    backoff.get_backoff_result("gastown/furiosa");
    backoff.get_backoff_result("gastown/nux");
    let active: HashSet<String> = ["gastown/nux".to_string()].into_iter().collect();
    assert_eq!(backoff.cleanup(&active), 1);
    assert_eq!(backoff.retry_count("gastown/furiosa"), 0);
    assert_eq!(backoff.retry_count("gastown/nux"), 1);
}

#[test]
fn test_keys_are_independent_across_threads() {
    let backoff = std::sync::Arc::new(service());
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let backoff = backoff.clone();
            std::thread::spawn(move || {
                for _ in 0..3 {
                    backoff.get_backoff_result(&format!("gastown/p{}", i));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(backoff.len(), 4);
    for i in 0..4 {
        assert_eq!(backoff.retry_count(&format!("gastown/p{}", i)), 3);
    }
}
